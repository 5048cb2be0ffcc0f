#![no_main]
#![feature(allocator_api)]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

use fastwire::arena::Arena;
use fastwire::decoding::{decode, DecodeOptions};
use fastwire::message::Object;
use fastwire::tables::{Cardinality, FieldInfo, FieldKind, Layout, LayoutBuilder};

#[derive(Arbitrary, Debug)]
struct AliasInput {
    data: Vec<u8>,
    alias: bool,
    depth_limit: u8,
}

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
        let leaf = LayoutBuilder::new(24)
            .field(field(1, FieldKind::Bytes, Cardinality::Repeated, 8, 0))
            .build();
        LayoutBuilder::new(64)
            .field(field(1, FieldKind::Bytes, Cardinality::Repeated, 8, 0))
            .field(field(2, FieldKind::Bytes, Cardinality::Singular, 16, 0))
            .field(field(3, FieldKind::Message, Cardinality::Singular, 32, 0))
            .field(field(4, FieldKind::Varint64, Cardinality::Repeated, 40, 0))
            .submsg(leaf)
            .build()
    })
}

fuzz_target!(|input: AliasInput| {
    // Alias and copy modes must both survive arbitrary input; alias views
    // are only read while `input.data` is alive.
    let layout = fuzz_layout();
    let mut arena = Arena::new(&std::alloc::Global);
    let Some(msg) = Object::create(layout, &mut arena) else {
        return;
    };
    let options = DecodeOptions {
        alias: input.alias,
        depth_limit: input.depth_limit.max(1) as u32,
    };
    let _ = decode(&input.data, msg, layout, &mut arena, options);
});
