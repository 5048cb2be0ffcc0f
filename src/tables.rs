//! Layout descriptors. A `Layout` is the per-message dispatch table the
//! decoder consumes: a 32-slot fasttable of specialised parser entry points
//! keyed by the first tag byte, a slow-path field list for the generic
//! fallback, and the child layouts of sub-message fields.
//!
//! `field_data` packs everything a specialised parser needs:
//!
//! ```text
//! bits  0..16  expected tag bytes (mismatch detection by XOR)
//! bits 16..24  sub-message layout index
//! bits 24..32  presence-bit index (singular) or field number (oneof)
//! bits 32..48  oneof-case offset inside the message
//! bits 48..64  field offset inside the message
//! ```

use crate::decoding::{decode_generic, DecodeState};
use crate::fastdecode as fp;
use crate::message::Object;

/// The uniform signature of every field parser in the fasttable.
pub type FieldParser = for<'a, 'b, 'c, 'd> unsafe fn(
    &'c mut DecodeState<'a, 'b>,
    *const u8,
    *mut Object,
    &'d Layout,
    u64,
    u64,
) -> *const u8;

#[derive(Clone, Copy)]
#[repr(C)]
pub struct FastEntry {
    pub parser: FieldParser,
    pub data: u64,
}

#[repr(C)]
pub struct Layout {
    /// Message record size in bytes, header excluded.
    pub size: u16,
    pub submsgs: &'static [*const Layout],
    pub fields: &'static [FieldInfo],
    pub fasttable: [FastEntry; 32],
}

unsafe impl Send for Layout {}
unsafe impl Sync for Layout {}

impl Layout {
    #[inline(always)]
    pub(crate) fn find_field(&self, number: u32) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.number == number)
    }

    pub(crate) unsafe fn submsg_layout(&self, idx: usize) -> &Layout {
        debug_assert!(idx < self.submsgs.len());
        &*self.submsgs[idx]
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldKind {
    Bool,
    Varint32,
    Varint64,
    Zigzag32,
    Zigzag64,
    Fixed32,
    Fixed64,
    Bytes,
    Message,
}

impl FieldKind {
    /// Wire type of the unpacked encoding.
    pub(crate) fn wire_type(self) -> u32 {
        match self {
            FieldKind::Bool
            | FieldKind::Varint32
            | FieldKind::Varint64
            | FieldKind::Zigzag32
            | FieldKind::Zigzag64 => 0,
            FieldKind::Fixed64 => 1,
            FieldKind::Fixed32 => 5,
            FieldKind::Bytes | FieldKind::Message => 2,
        }
    }

    pub(crate) fn is_numeric(self) -> bool {
        !matches!(self, FieldKind::Bytes | FieldKind::Message)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cardinality {
    Singular,
    Oneof,
    Repeated,
    Packed,
}

/// One field of a message, as the generic fallback sees it. Also the input
/// to `LayoutBuilder`.
#[derive(Clone, Copy, Debug)]
pub struct FieldInfo {
    pub number: u32,
    pub offset: u16,
    /// Oneof cardinality only.
    pub case_offset: u16,
    /// Singular cardinality only; must be below 32.
    pub hasbit: u8,
    /// Message kind only: index into `Layout::submsgs`.
    pub submsg: u8,
    pub kind: FieldKind,
    pub card: Cardinality,
}

pub(crate) fn pack_field_data(
    expected_tag: u16,
    submsg_idx: u8,
    hasbit_or_number: u8,
    case_offset: u16,
    offset: u16,
) -> u64 {
    expected_tag as u64
        | (submsg_idx as u64) << 16
        | (hasbit_or_number as u64) << 24
        | (case_offset as u64) << 32
        | (offset as u64) << 48
}

/// Encodes the one- or two-byte wire tag for `number`/`wire_type`. Numbers
/// 16..=31 take two bytes; the second byte is always 0x01, which is what
/// lets the dispatch core treat the continuation bit as a data bit.
pub(crate) fn encode_tag(number: u32, wire_type: u32) -> (u16, usize) {
    debug_assert!((1..=31).contains(&number));
    let tag = number << 3 | wire_type;
    if tag < 0x80 {
        (tag as u16, 1)
    } else {
        let b0 = (tag & 0x7f) as u16 | 0x80;
        let b1 = (tag >> 7) as u16;
        debug_assert_eq!(b1, 1);
        (b0 | b1 << 8, 2)
    }
}

// Parser selection tables, indexed by [cardinality][type][tagbytes - 1].
// Cardinality order matches the CARD_* constants: s, o, r, p.

const VARINT_PARSERS: [[[FieldParser; 2]; 5]; 4] = [
    [
        [fp::psb1_1bt, fp::psb1_2bt],
        [fp::psv4_1bt, fp::psv4_2bt],
        [fp::psv8_1bt, fp::psv8_2bt],
        [fp::psz4_1bt, fp::psz4_2bt],
        [fp::psz8_1bt, fp::psz8_2bt],
    ],
    [
        [fp::pob1_1bt, fp::pob1_2bt],
        [fp::pov4_1bt, fp::pov4_2bt],
        [fp::pov8_1bt, fp::pov8_2bt],
        [fp::poz4_1bt, fp::poz4_2bt],
        [fp::poz8_1bt, fp::poz8_2bt],
    ],
    [
        [fp::prb1_1bt, fp::prb1_2bt],
        [fp::prv4_1bt, fp::prv4_2bt],
        [fp::prv8_1bt, fp::prv8_2bt],
        [fp::prz4_1bt, fp::prz4_2bt],
        [fp::prz8_1bt, fp::prz8_2bt],
    ],
    [
        [fp::ppb1_1bt, fp::ppb1_2bt],
        [fp::ppv4_1bt, fp::ppv4_2bt],
        [fp::ppv8_1bt, fp::ppv8_2bt],
        [fp::ppz4_1bt, fp::ppz4_2bt],
        [fp::ppz8_1bt, fp::ppz8_2bt],
    ],
];

const FIXED_PARSERS: [[[FieldParser; 2]; 2]; 4] = [
    [[fp::psf4_1bt, fp::psf4_2bt], [fp::psf8_1bt, fp::psf8_2bt]],
    [[fp::pof4_1bt, fp::pof4_2bt], [fp::pof8_1bt, fp::pof8_2bt]],
    [[fp::prf4_1bt, fp::prf4_2bt], [fp::prf8_1bt, fp::prf8_2bt]],
    [[fp::ppf4_1bt, fp::ppf4_2bt], [fp::ppf8_1bt, fp::ppf8_2bt]],
];

const STRING_PARSERS: [[FieldParser; 2]; 3] = [
    [fp::pss_1bt, fp::pss_2bt],
    [fp::pos_1bt, fp::pos_2bt],
    [fp::prs_1bt, fp::prs_2bt],
];

const SUBMSG_PARSERS: [[[FieldParser; 5]; 2]; 3] = [
    [
        [
            fp::psm_1bt_max64b,
            fp::psm_1bt_max128b,
            fp::psm_1bt_max192b,
            fp::psm_1bt_max256b,
            fp::psm_1bt_maxmaxb,
        ],
        [
            fp::psm_2bt_max64b,
            fp::psm_2bt_max128b,
            fp::psm_2bt_max192b,
            fp::psm_2bt_max256b,
            fp::psm_2bt_maxmaxb,
        ],
    ],
    [
        [
            fp::pom_1bt_max64b,
            fp::pom_1bt_max128b,
            fp::pom_1bt_max192b,
            fp::pom_1bt_max256b,
            fp::pom_1bt_maxmaxb,
        ],
        [
            fp::pom_2bt_max64b,
            fp::pom_2bt_max128b,
            fp::pom_2bt_max192b,
            fp::pom_2bt_max256b,
            fp::pom_2bt_maxmaxb,
        ],
    ],
    [
        [
            fp::prm_1bt_max64b,
            fp::prm_1bt_max128b,
            fp::prm_1bt_max192b,
            fp::prm_1bt_max256b,
            fp::prm_1bt_maxmaxb,
        ],
        [
            fp::prm_2bt_max64b,
            fp::prm_2bt_max128b,
            fp::prm_2bt_max192b,
            fp::prm_2bt_max256b,
            fp::prm_2bt_maxmaxb,
        ],
    ],
];

fn card_index(card: Cardinality) -> usize {
    match card {
        Cardinality::Singular => 0,
        Cardinality::Oneof => 1,
        Cardinality::Repeated => 2,
        Cardinality::Packed => 3,
    }
}

/// Compiles a `Layout` from a field list. Produces a leaked `'static`
/// layout, matching how generated code materialises its tables.
pub struct LayoutBuilder {
    size: u16,
    fields: Vec<FieldInfo>,
    submsgs: Vec<*const Layout>,
}

impl LayoutBuilder {
    pub fn new(size: u16) -> Self {
        LayoutBuilder {
            size,
            fields: Vec::new(),
            submsgs: Vec::new(),
        }
    }

    pub fn field(mut self, f: FieldInfo) -> Self {
        if f.card == Cardinality::Singular {
            assert!(f.hasbit < 32, "presence bits live in the leading word");
        }
        if f.card == Cardinality::Packed {
            assert!(f.kind.is_numeric(), "only numeric fields can be packed");
        }
        self.fields.push(f);
        self
    }

    /// Registers a child layout; fields refer to it by index.
    pub fn submsg(mut self, layout: &'static Layout) -> Self {
        self.submsgs.push(layout);
        self
    }

    pub fn build(self) -> &'static Layout {
        let mut fasttable = [FastEntry {
            parser: decode_generic,
            data: 0,
        }; 32];

        for f in &self.fields {
            if !(1..=31).contains(&f.number) {
                continue; // generic fallback only
            }
            let wire_type = if f.card == Cardinality::Packed {
                2
            } else {
                f.kind.wire_type()
            };
            let (expected, tagbytes) = encode_tag(f.number, wire_type);
            // Five bits of field number, straight off the first tag byte.
            let slot = ((expected as u8 & 0xf8) >> 3) as usize;

            let card = card_index(f.card);
            let parser = match f.kind {
                FieldKind::Bool => VARINT_PARSERS[card][0][tagbytes - 1],
                FieldKind::Varint32 => VARINT_PARSERS[card][1][tagbytes - 1],
                FieldKind::Varint64 => VARINT_PARSERS[card][2][tagbytes - 1],
                FieldKind::Zigzag32 => VARINT_PARSERS[card][3][tagbytes - 1],
                FieldKind::Zigzag64 => VARINT_PARSERS[card][4][tagbytes - 1],
                FieldKind::Fixed32 => FIXED_PARSERS[card][0][tagbytes - 1],
                FieldKind::Fixed64 => FIXED_PARSERS[card][1][tagbytes - 1],
                FieldKind::Bytes => {
                    assert!(f.card != Cardinality::Packed);
                    STRING_PARSERS[card][tagbytes - 1]
                }
                FieldKind::Message => {
                    assert!(f.card != Cardinality::Packed);
                    let child = unsafe { &*self.submsgs[f.submsg as usize] };
                    let ceil = Self::ceil_index(Object::alloc_size(child));
                    SUBMSG_PARSERS[card][tagbytes - 1][ceil]
                }
            };

            let hasbit_or_number = match f.card {
                Cardinality::Oneof => f.number as u8,
                _ => f.hasbit,
            };
            let data = pack_field_data(
                expected,
                f.submsg,
                hasbit_or_number,
                f.case_offset,
                f.offset,
            );
            fasttable[slot] = FastEntry { parser, data };
        }

        Box::leak(Box::new(Layout {
            size: self.size,
            submsgs: Vec::leak(self.submsgs),
            fields: Vec::leak(self.fields),
            fasttable,
        }))
    }

    /// Tightest generated ceiling that covers `alloc_size`, or the
    /// unbounded variant.
    fn ceil_index(alloc_size: usize) -> usize {
        match alloc_size {
            0..=64 => 0,
            65..=128 => 1,
            129..=192 => 2,
            193..=256 => 3,
            _ => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_encoding_widths() {
        assert_eq!(encode_tag(1, 0), (0x08, 1));
        assert_eq!(encode_tag(15, 2), (0x7a, 1));
        assert_eq!(encode_tag(16, 0), (0x0180, 2));
        assert_eq!(encode_tag(31, 5), (0x01fd, 2));
    }

    #[test]
    fn field_data_bit_allocation() {
        let data = pack_field_data(0x0180, 3, 7, 0x20, 0x48);
        assert_eq!(data & 0xffff, 0x0180);
        assert_eq!((data >> 16) & 0xff, 3);
        assert_eq!((data >> 24) & 0xff, 7);
        assert_eq!((data >> 32) & 0xffff, 0x20);
        assert_eq!(data >> 48, 0x48);
    }

    /// Dispatch stability: for every field number and kind that fits the
    /// fast path, the installed slot's data XORed with the wire tag is zero
    /// in its low tag bytes.
    #[test]
    fn dispatch_slots_match_tags() {
        for number in 1..=31u32 {
            for (kind, hasbit) in [
                (FieldKind::Varint64, 0u8),
                (FieldKind::Fixed32, 1),
                (FieldKind::Bytes, 2),
            ] {
                let layout = LayoutBuilder::new(64)
                    .field(FieldInfo {
                        number,
                        offset: 8,
                        case_offset: 0,
                        hasbit,
                        submsg: 0,
                        kind,
                        card: Cardinality::Singular,
                    })
                    .build();
                let (expected, tagbytes) = encode_tag(number, kind.wire_type());
                let slot = ((expected as u8 & 0xf8) >> 3) as usize;
                let data = layout.fasttable[slot].data ^ expected as u64;
                if tagbytes == 1 {
                    assert_eq!(data & 0xff, 0);
                } else {
                    assert_eq!(data & 0xffff, 0);
                }
            }
        }
    }

    #[test]
    fn ceiling_selection_is_tight() {
        assert_eq!(LayoutBuilder::ceil_index(24), 0);
        assert_eq!(LayoutBuilder::ceil_index(64), 0);
        assert_eq!(LayoutBuilder::ceil_index(65), 1);
        assert_eq!(LayoutBuilder::ceil_index(192), 2);
        assert_eq!(LayoutBuilder::ceil_index(200), 3);
        assert_eq!(LayoutBuilder::ceil_index(1000), 4);
    }
}
