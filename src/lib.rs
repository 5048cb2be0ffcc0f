//! A table-dispatched fast-path decoder for length-prefixed binary wire
//! formats: varint integers, little-endian fixed-width numbers,
//! length-delimited bytes and nested sub-records.
//!
//! Decoding is driven by a per-message [`tables::Layout`]: a 32-slot jump
//! table translating the first tag byte into a field-shape-specialised
//! parser, with a generic fallback for everything outside the fast matrix.
//! Decoded messages are arena-backed, opaque [`message::Object`] records
//! addressed through the offsets the layout carries.

#![feature(allocator_api)]
#![feature(likely_unlikely)]

pub mod arena;
pub mod array;
pub mod decoding;
pub mod fastdecode;
pub mod message;
pub mod tables;
pub mod wire;

pub use decoding::{decode, DecodeError, DecodeOptions};

use arena::Arena;
use message::Object;
use tables::Layout;

/// A message type with a static layout. Implementations are `#[repr(C)]`
/// structs whose leading field is the presence word and whose field offsets
/// the layout encodes.
pub trait Decodable {
    fn layout() -> &'static Layout;

    fn as_object(&self) -> &Object {
        unsafe { &*(self as *const Self as *const Object) }
    }

    fn as_object_mut(&mut self) -> &mut Object {
        unsafe { &mut *(self as *mut Self as *mut Object) }
    }
}

/// Decodes one flat buffer into `msg`, copying string data into the arena.
pub fn parse_flat<T: Decodable>(
    msg: &mut T,
    buf: &[u8],
    arena: &mut Arena<'_>,
) -> Result<(), DecodeError> {
    decoding::decode(
        buf,
        msg.as_object_mut(),
        T::layout(),
        arena,
        DecodeOptions::default(),
    )
}

/// Zero-copy variant: decoded string views reference `buf` directly.
///
/// # Safety
///
/// The caller must keep `buf` alive and unmoved for as long as the decoded
/// message (or anything built from its string views) is in use.
pub unsafe fn parse_flat_aliased<T: Decodable>(
    msg: &mut T,
    buf: &[u8],
    arena: &mut Arena<'_>,
) -> Result<(), DecodeError> {
    decoding::decode(
        buf,
        msg.as_object_mut(),
        T::layout(),
        arena,
        DecodeOptions {
            alias: true,
            ..Default::default()
        },
    )
}

/// Buffers a reader to the end and decodes it.
pub fn parse_from_read<T: Decodable>(
    msg: &mut T,
    reader: &mut impl std::io::Read,
    arena: &mut Arena<'_>,
) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    parse_flat(msg, &buf, arena)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::RepeatedArray;
    use crate::message::StrView;
    use crate::tables::{Cardinality, FieldInfo, FieldKind, LayoutBuilder};
    use std::alloc::Global;
    use std::mem::offset_of;
    use std::sync::OnceLock;

    #[repr(C)]
    #[derive(Debug)]
    struct Test {
        has_bits: [u32; 1],
        x: u32,
        y: u64,
        z: StrView,
        child: *mut Object,
        values: *mut RepeatedArray,
    }

    impl Default for Test {
        fn default() -> Self {
            Test {
                has_bits: [0],
                x: 0,
                y: 0,
                z: StrView::default(),
                child: std::ptr::null_mut(),
                values: std::ptr::null_mut(),
            }
        }
    }

    impl Test {
        fn child(&self) -> Option<&Test> {
            if self.child.is_null() {
                None
            } else {
                Some(unsafe { &*(self.child as *const Test) })
            }
        }

        fn values(&self) -> &[u64] {
            if self.values.is_null() {
                &[]
            } else {
                unsafe { (*self.values).as_slice() }
            }
        }
    }

    impl Decodable for Test {
        fn layout() -> &'static Layout {
            static LAYOUT: OnceLock<&'static Layout> = OnceLock::new();
            LAYOUT.get_or_init(|| {
                let builder = LayoutBuilder::new(std::mem::size_of::<Test>() as u16)
                    .field(FieldInfo {
                        number: 1,
                        offset: offset_of!(Test, x) as u16,
                        case_offset: 0,
                        hasbit: 0,
                        submsg: 0,
                        kind: FieldKind::Varint32,
                        card: Cardinality::Singular,
                    })
                    .field(FieldInfo {
                        number: 2,
                        offset: offset_of!(Test, y) as u16,
                        case_offset: 0,
                        hasbit: 1,
                        submsg: 0,
                        kind: FieldKind::Fixed64,
                        card: Cardinality::Singular,
                    })
                    .field(FieldInfo {
                        number: 3,
                        offset: offset_of!(Test, z) as u16,
                        case_offset: 0,
                        hasbit: 2,
                        submsg: 0,
                        kind: FieldKind::Bytes,
                        card: Cardinality::Singular,
                    })
                    .field(FieldInfo {
                        number: 5,
                        offset: offset_of!(Test, values) as u16,
                        case_offset: 0,
                        hasbit: 0,
                        submsg: 0,
                        kind: FieldKind::Varint64,
                        card: Cardinality::Repeated,
                    });
                // The child record reuses the Test shape but only needs
                // field 1 declared.
                let child = LayoutBuilder::new(std::mem::size_of::<Test>() as u16)
                    .field(FieldInfo {
                        number: 1,
                        offset: offset_of!(Test, x) as u16,
                        case_offset: 0,
                        hasbit: 0,
                        submsg: 0,
                        kind: FieldKind::Varint32,
                        card: Cardinality::Singular,
                    })
                    .build();
                builder
                    .field(FieldInfo {
                        number: 4,
                        offset: offset_of!(Test, child) as u16,
                        case_offset: 0,
                        hasbit: 0,
                        submsg: 0,
                        kind: FieldKind::Message,
                        card: Cardinality::Singular,
                    })
                    .submsg(child)
                    .build()
            })
        }
    }

    const BUFFER: [u8; 38] = [
        // x: varint, field 1
        0o10, 1, // y: fixed64, field 2
        0o21, 2, 0, 0, 0, 0, 0, 0, 0, // z: length-delimited, field 3
        0o32, 21, b'H', b'e', b'l', b'l', b'o', b' ', b'W', b'o', b'r', b'l', b'd', b'!', b'1',
        b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', // child: length-delimited, field 4
        0o42, 2, 0o10, 2,
    ];

    #[test]
    fn parse_flat_roundtrip() {
        let mut arena = Arena::new(&Global);
        let mut test = Test::default();

        parse_flat(&mut test, &BUFFER, &mut arena).unwrap();

        assert_eq!(test.x, 1);
        assert!(test.as_object().has_bit(0));
        assert_eq!(test.y, 2);
        assert_eq!(test.z.as_bytes(), b"Hello World!123456789");
        let child = test.child().expect("child decoded");
        assert_eq!(child.x, 2);
    }

    #[test]
    fn parse_repeated_through_trait() {
        let mut arena = Arena::new(&Global);
        let mut test = Test::default();
        let buf = [0o50, 7, 0o50, 8, 0o50, 9];

        parse_flat(&mut test, &buf, &mut arena).unwrap();
        assert_eq!(test.values(), &[7, 8, 9]);
    }

    #[test]
    fn parse_from_read_buffers() {
        let mut arena = Arena::new(&Global);
        let mut test = Test::default();
        let mut reader = std::io::Cursor::new(BUFFER.to_vec());

        parse_from_read(&mut test, &mut reader, &mut arena).unwrap();
        assert_eq!(test.y, 2);
    }

    #[test]
    fn parse_error_propagates() {
        let mut arena = Arena::new(&Global);
        let mut test = Test::default();
        // Field 3 claims 100 bytes of payload but only a few follow.
        let buf = [0o32, 100, b'x', b'y'];

        let err = parse_flat(&mut test, &buf, &mut arena).unwrap_err();
        assert_eq!(err, DecodeError::BoundsExceeded);
    }
}
