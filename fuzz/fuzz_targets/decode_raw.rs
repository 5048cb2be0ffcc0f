#![no_main]
#![feature(allocator_api)]

use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

use fastwire::arena::Arena;
use fastwire::decoding::{decode, DecodeOptions};
use fastwire::message::Object;
use fastwire::tables::{Cardinality, FieldInfo, FieldKind, Layout, LayoutBuilder};

fn fuzz_layout() -> &'static Layout {
    static LAYOUT: OnceLock<&'static Layout> = OnceLock::new();
    LAYOUT.get_or_init(|| {
        let field = |number, kind, card, offset, hasbit| FieldInfo {
            number,
            offset,
            case_offset: 0,
            hasbit,
            submsg: 0,
            kind,
            card,
        };
        let child = LayoutBuilder::new(32)
            .field(field(1, FieldKind::Varint64, Cardinality::Singular, 8, 0))
            .field(field(2, FieldKind::Bytes, Cardinality::Repeated, 16, 0))
            .build();
        LayoutBuilder::new(96)
            .field(field(1, FieldKind::Varint32, Cardinality::Singular, 8, 0))
            .field(field(2, FieldKind::Zigzag64, Cardinality::Singular, 16, 1))
            .field(field(3, FieldKind::Fixed32, Cardinality::Packed, 24, 0))
            .field(field(4, FieldKind::Bytes, Cardinality::Singular, 32, 2))
            .field(field(5, FieldKind::Message, Cardinality::Repeated, 48, 0))
            .field(field(16, FieldKind::Fixed64, Cardinality::Repeated, 56, 0))
            .field(field(17, FieldKind::Bool, Cardinality::Singular, 64, 3))
            .submsg(child)
            .build()
    })
}

fuzz_target!(|data: &[u8]| {
    // Malformed input of any shape must error out, never crash.
    let layout = fuzz_layout();
    let mut arena = Arena::new(&std::alloc::Global);
    if let Some(msg) = Object::create(layout, &mut arena) {
        let _ = decode(data, msg, layout, &mut arena, DecodeOptions::default());
    }
});
