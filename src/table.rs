//! Per-message dispatch tables.
//!
//! A [`MessageLayout`] is immutable once built. Its 32-entry fast table is
//! indexed by the low five bits of the first tag byte; each entry names a
//! specialist and carries a packed 64-bit data word describing the field.
//! Fields the fast table cannot carry (tag-slot collisions, field numbers
//! past the two-byte tag range, oneof members with large field numbers) are
//! still listed in the complete field list and decoded by the generic slow
//! path.
//!
//! Data word packing:
//!
//! | bits  | meaning                                            |
//! |-------|----------------------------------------------------|
//! | 0-15  | expected tag pattern (upper byte zero for 1-byte)  |
//! | 16-23 | sub-message index                                  |
//! | 24-31 | hasbit index (singular) or field number (oneof)    |
//! | 32-47 | oneof case offset within the record                |
//! | 48-63 | field value offset within the record               |

use std::sync::Arc;

use crate::record::{StrView, RECORD_HEADER};
use crate::wire::{WT_DELIMITED, WT_FIXED32, WT_FIXED64, WT_VARINT};

pub(crate) const FASTTABLE_SIZE: usize = 32;

/// Highest field number that still encodes as a two-byte tag.
const MAX_FAST_FIELD: u32 = 2047;

/// Highest field number a oneof member may have and stay on the fast path;
/// the data word stores it in a single byte.
const MAX_FAST_ONEOF_FIELD: u32 = 255;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Card {
    Singular,
    Oneof,
    Repeated,
    Packed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TagWidth {
    One,
    Two,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VarintKind {
    Bool,
    Bits32,
    Bits64,
    ZigZag32,
    ZigZag64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FixedWidth {
    Four,
    Eight,
}

/// Allocation ceiling bucket for sub-message records. When the arena's
/// current chunk has at least this much head room, a child record can be
/// carved out with a plain head bump instead of a full allocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SizeCeiling {
    Max64,
    Max128,
    Max192,
    Max256,
    Unbounded,
}

impl SizeCeiling {
    pub(crate) fn bytes(self) -> Option<usize> {
        match self {
            SizeCeiling::Max64 => Some(64),
            SizeCeiling::Max128 => Some(128),
            SizeCeiling::Max192 => Some(192),
            SizeCeiling::Max256 => Some(256),
            SizeCeiling::Unbounded => None,
        }
    }

    fn for_record(total: usize) -> SizeCeiling {
        match total {
            0..=64 => SizeCeiling::Max64,
            65..=128 => SizeCeiling::Max128,
            129..=192 => SizeCeiling::Max192,
            193..=256 => SizeCeiling::Max256,
            _ => SizeCeiling::Unbounded,
        }
    }
}

/// Closed set of specialist identifiers. The dispatch table is pure data;
/// one dispatcher matches on these and runs the corresponding parser.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldParser {
    Generic,
    Varint { card: Card, kind: VarintKind, tag: TagWidth },
    Fixed { card: Card, width: FixedWidth, tag: TagWidth },
    Str { card: Card, tag: TagWidth },
    Message { card: Card, tag: TagWidth, ceil: SizeCeiling },
}

#[derive(Clone, Copy)]
pub struct FastTableEntry {
    pub parser: FieldParser,
    pub data: u64,
}

const GENERIC_ENTRY: FastTableEntry = FastTableEntry {
    parser: FieldParser::Generic,
    data: 0,
};

/// Field kinds of the wire format's scalar and compound value space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldKind {
    Bool,
    Int32,
    Int64,
    UInt32,
    UInt64,
    SInt32,
    SInt64,
    Fixed32,
    Fixed64,
    SFixed32,
    SFixed64,
    Float,
    Double,
    Bytes,
    String,
    Message,
}

impl FieldKind {
    /// Wire type of an unpacked value of this kind.
    pub(crate) fn wire_type(self) -> u8 {
        use FieldKind::*;
        match self {
            Bool | Int32 | Int64 | UInt32 | UInt64 | SInt32 | SInt64 => WT_VARINT,
            Fixed64 | SFixed64 | Double => WT_FIXED64,
            Bytes | String | Message => WT_DELIMITED,
            Fixed32 | SFixed32 | Float => WT_FIXED32,
        }
    }

    /// Bytes of record storage one value occupies.
    pub(crate) fn valbytes(self) -> usize {
        use FieldKind::*;
        match self {
            Bool => 1,
            Int32 | UInt32 | SInt32 | Fixed32 | SFixed32 | Float => 4,
            Int64 | UInt64 | SInt64 | Fixed64 | SFixed64 | Double => 8,
            Bytes | String => std::mem::size_of::<StrView>(),
            Message => std::mem::size_of::<*mut u8>(),
        }
    }

    pub(crate) fn is_packable(self) -> bool {
        !matches!(self, FieldKind::Bytes | FieldKind::String | FieldKind::Message)
    }

    pub(crate) fn zigzag(self) -> bool {
        matches!(self, FieldKind::SInt32 | FieldKind::SInt64)
    }

    fn varint_kind(self) -> Option<VarintKind> {
        use FieldKind::*;
        match self {
            Bool => Some(VarintKind::Bool),
            Int32 | UInt32 => Some(VarintKind::Bits32),
            Int64 | UInt64 => Some(VarintKind::Bits64),
            SInt32 => Some(VarintKind::ZigZag32),
            SInt64 => Some(VarintKind::ZigZag64),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cardinality {
    Singular,
    Oneof,
    Repeated { packed: bool },
}

/// One field of a message, as the slow path and the accessors see it.
#[derive(Clone, Copy, Debug)]
pub struct FieldSpec {
    pub number: u32,
    pub kind: FieldKind,
    pub card: Cardinality,
    /// Byte offset of the value slot within the record.
    pub offset: u16,
    /// Hasbit index for singular fields; unused otherwise.
    pub hasbit: u8,
    /// Byte offset of the oneof case slot; unused outside oneofs.
    pub case_offset: u16,
    /// Index into [`MessageLayout::submsgs`] for message fields.
    pub submsg: u8,
}

pub struct MessageLayout {
    /// Record byte size, excluding the internal header.
    pub size: u32,
    pub fasttable: [FastTableEntry; FASTTABLE_SIZE],
    pub submsgs: Vec<Arc<MessageLayout>>,
    pub fields: Vec<FieldSpec>,
}

impl MessageLayout {
    pub fn field(&self, number: u32) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.number == number)
    }

    /// Total arena footprint of one record, header included.
    pub(crate) fn record_total(&self) -> usize {
        self.size as usize + RECORD_HEADER
    }
}

// Data word packing and unpacking.

pub(crate) fn pack_field_data(
    tag_pattern: u16,
    submsg: u8,
    hasbit_or_field: u8,
    case_offset: u16,
    value_offset: u16,
) -> u64 {
    tag_pattern as u64
        | (submsg as u64) << 16
        | (hasbit_or_field as u64) << 24
        | (case_offset as u64) << 32
        | (value_offset as u64) << 48
}

#[inline(always)]
pub(crate) fn data_hasbit(data: u64) -> u32 {
    ((data >> 24) & 0xFF) as u32
}

#[inline(always)]
pub(crate) fn data_oneof_field(data: u64) -> u32 {
    ((data >> 24) & 0xFF) as u32
}

#[inline(always)]
pub(crate) fn data_case_offset(data: u64) -> usize {
    ((data >> 32) & 0xFFFF) as usize
}

#[inline(always)]
pub(crate) fn data_value_offset(data: u64) -> usize {
    (data >> 48) as usize
}

#[inline(always)]
pub(crate) fn data_submsg_index(data: u64) -> usize {
    ((data >> 16) & 0xFF) as usize
}

/// Expected-tag check after the dispatch xor: a match leaves the low tag
/// bytes zero.
#[inline(always)]
pub(crate) fn check_tag(data: u64, tagbytes: usize) -> bool {
    if tagbytes == 1 {
        data & 0xFF == 0
    } else {
        data & 0xFFFF == 0
    }
}

/// Raw-tag comparison for repeated hot loops, where `data` holds the tag of
/// the previous occurrence rather than an xor residue.
#[inline(always)]
pub(crate) fn tag_matches(tag: u16, data: u64, tagbytes: usize) -> bool {
    if tagbytes == 1 {
        tag as u8 == data as u8
    } else {
        tag == data as u16
    }
}

/// Toggle bit 0x2 of the expected tag and re-check. This converts between
/// the varint element encoding (wire type 0) and the packed encoding (wire
/// type 2) in place. Fixed-width elements differ from the packed form in
/// more than one bit, so for them the flip misses and the generic decoder
/// picks up the mixed encoding.
#[inline(always)]
pub(crate) fn flip_packed(data: &mut u64, tagbytes: usize) -> bool {
    *data ^= 0x2;
    check_tag(*data, tagbytes)
}

/// Varint encoding of a tag value that fits two bytes, returned as the
/// little-endian expected pattern plus the slot index and width.
fn encode_tag(tag: u32) -> (u16, usize, TagWidth) {
    if tag < 0x80 {
        (tag as u16, ((tag as usize) & 0xF8) >> 3, TagWidth::One)
    } else {
        debug_assert!(tag < 1 << 14);
        let b0 = (tag & 0x7F) as u16 | 0x80;
        let b1 = (tag >> 7) as u16;
        (b0 | b1 << 8, ((b0 as usize) & 0xF8) >> 3, TagWidth::Two)
    }
}

// Layout construction.

struct Decl {
    number: u32,
    kind: FieldKind,
    card: Cardinality,
    submsg: Option<u8>,
    /// Index of the oneof group this member belongs to.
    oneof: Option<u16>,
}

/// One member of a oneof declaration.
pub struct OneofMember {
    number: u32,
    kind: FieldKind,
    submsg: Option<Arc<MessageLayout>>,
}

impl OneofMember {
    pub fn scalar(number: u32, kind: FieldKind) -> Self {
        assert!(kind != FieldKind::Message, "use OneofMember::message");
        OneofMember { number, kind, submsg: None }
    }

    pub fn message(number: u32, child: Arc<MessageLayout>) -> Self {
        OneofMember { number, kind: FieldKind::Message, submsg: Some(child) }
    }
}

/// Builds [`MessageLayout`] values. This is the seam an external schema
/// compiler targets; tests drive it directly.
///
/// Storage is assigned automatically: the hasbits word first, then one case
/// slot per oneof, then field slots ordered by decreasing alignment.
#[derive(Default)]
pub struct LayoutBuilder {
    decls: Vec<Decl>,
    submsgs: Vec<Arc<MessageLayout>>,
    oneof_count: u16,
}

impl LayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A singular scalar, string, or bytes field.
    pub fn scalar(mut self, number: u32, kind: FieldKind) -> Self {
        assert!(kind != FieldKind::Message, "use LayoutBuilder::message");
        self.push(number, kind, Cardinality::Singular, None, None);
        self
    }

    /// An unpacked repeated field.
    pub fn repeated(mut self, number: u32, kind: FieldKind) -> Self {
        assert!(kind != FieldKind::Message, "use LayoutBuilder::repeated_message");
        self.push(number, kind, Cardinality::Repeated { packed: false }, None, None);
        self
    }

    /// A packed repeated primitive field.
    pub fn packed(mut self, number: u32, kind: FieldKind) -> Self {
        assert!(kind.is_packable(), "strings, bytes and messages cannot be packed");
        self.push(number, kind, Cardinality::Repeated { packed: true }, None, None);
        self
    }

    /// A singular sub-message field.
    pub fn message(mut self, number: u32, child: Arc<MessageLayout>) -> Self {
        let idx = self.intern_submsg(child);
        self.push(number, FieldKind::Message, Cardinality::Singular, Some(idx), None);
        self
    }

    /// A repeated sub-message field.
    pub fn repeated_message(mut self, number: u32, child: Arc<MessageLayout>) -> Self {
        let idx = self.intern_submsg(child);
        self.push(
            number,
            FieldKind::Message,
            Cardinality::Repeated { packed: false },
            Some(idx),
            None,
        );
        self
    }

    /// A oneof: all members share one storage slot plus a case slot that
    /// records the field number of the arm written last.
    pub fn oneof(mut self, members: Vec<OneofMember>) -> Self {
        assert!(!members.is_empty());
        let group = self.oneof_count;
        self.oneof_count += 1;
        for m in members {
            let submsg = m.submsg.map(|child| self.intern_submsg(child));
            self.push(m.number, m.kind, Cardinality::Oneof, submsg, Some(group));
        }
        self
    }

    fn intern_submsg(&mut self, child: Arc<MessageLayout>) -> u8 {
        let idx = self.submsgs.len();
        assert!(idx <= u8::MAX as usize, "too many sub-message fields");
        self.submsgs.push(child);
        idx as u8
    }

    fn push(
        &mut self,
        number: u32,
        kind: FieldKind,
        card: Cardinality,
        submsg: Option<u8>,
        oneof: Option<u16>,
    ) {
        assert!(number >= 1 && number < 1 << 29, "field number out of range");
        assert!(
            self.decls.iter().all(|d| d.number != number),
            "duplicate field number {number}"
        );
        self.decls.push(Decl { number, kind, card, submsg, oneof });
    }

    pub fn finish(self) -> Arc<MessageLayout> {
        // Hasbit indices, declaration order. A record carries one 32-bit
        // hasbits word, so at most 32 tracked singular fields.
        let mut hasbits = 0u8;
        let mut hasbit_of: Vec<u8> = Vec::with_capacity(self.decls.len());
        for d in &self.decls {
            if matches!(d.card, Cardinality::Singular) {
                assert!(hasbits < 32, "more than 32 singular fields in one message");
                hasbit_of.push(hasbits);
                hasbits += 1;
            } else {
                hasbit_of.push(0);
            }
        }

        // Storage assignment. Hasbits word, then one u32 case slot per
        // oneof, then value slots by decreasing alignment so no padding is
        // wasted between same-width runs.
        let mut offset: usize = 4;
        let mut case_offsets: Vec<u16> = Vec::with_capacity(self.oneof_count as usize);
        for _ in 0..self.oneof_count {
            case_offsets.push(offset as u16);
            offset += 4;
        }

        let slot_bytes = |i: usize| -> usize {
            let d = &self.decls[i];
            match d.card {
                Cardinality::Repeated { .. } => std::mem::size_of::<*mut u8>(),
                _ => d.kind.valbytes(),
            }
        };

        // One shared slot per oneof group, one slot per plain field.
        let mut slot_of: Vec<usize> = vec![usize::MAX; self.decls.len()];
        let mut oneof_slot: Vec<usize> = vec![usize::MAX; self.oneof_count as usize];
        let mut order: Vec<usize> = (0..self.decls.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(slot_bytes(i).min(8)));
        for &i in &order {
            let d = &self.decls[i];
            if let Some(group) = d.oneof {
                let group = group as usize;
                if oneof_slot[group] == usize::MAX {
                    // The widest member sorts first, so the shared slot is
                    // sized by the first member seen.
                    let widest = self
                        .decls
                        .iter()
                        .enumerate()
                        .filter(|(_, m)| m.oneof == d.oneof)
                        .map(|(j, _)| slot_bytes(j))
                        .max()
                        .unwrap_or(0);
                    let align = widest.min(8);
                    offset = (offset + align - 1) & !(align - 1);
                    oneof_slot[group] = offset;
                    offset += widest;
                }
                slot_of[i] = oneof_slot[group];
            } else {
                let bytes = slot_bytes(i);
                let align = bytes.min(8);
                offset = (offset + align - 1) & !(align - 1);
                slot_of[i] = offset;
                offset += bytes;
            }
        }
        let size = (offset + 7) & !7;
        assert!(size <= u16::MAX as usize, "record too large");

        let mut fields: Vec<FieldSpec> = Vec::with_capacity(self.decls.len());
        for (i, d) in self.decls.iter().enumerate() {
            fields.push(FieldSpec {
                number: d.number,
                kind: d.kind,
                card: d.card,
                offset: slot_of[i] as u16,
                hasbit: hasbit_of[i],
                case_offset: d.oneof.map(|g| case_offsets[g as usize]).unwrap_or(0),
                submsg: d.submsg.unwrap_or(0),
            });
        }

        let mut fasttable = [GENERIC_ENTRY; FASTTABLE_SIZE];
        for (i, d) in self.decls.iter().enumerate() {
            let spec = &fields[i];
            if let Some(entry) = self.fast_entry(d, spec) {
                let (_, slot, _) = encode_tag(tag_value(d));
                // Slot zero stays generic; first claimant wins a contested
                // slot and later fields fall back to the slow path.
                if slot != 0 && fasttable[slot].parser == FieldParser::Generic {
                    fasttable[slot] = entry;
                }
            }
        }

        Arc::new(MessageLayout {
            size: size as u32,
            fasttable,
            submsgs: self.submsgs,
            fields,
        })
    }

    fn fast_entry(&self, d: &Decl, spec: &FieldSpec) -> Option<FastTableEntry> {
        if d.number > MAX_FAST_FIELD {
            return None;
        }
        let (card, hasbit_or_field) = match d.card {
            Cardinality::Singular => (Card::Singular, spec.hasbit),
            Cardinality::Oneof => {
                if d.number > MAX_FAST_ONEOF_FIELD {
                    return None;
                }
                (Card::Oneof, d.number as u8)
            }
            Cardinality::Repeated { packed: false } => (Card::Repeated, 0),
            Cardinality::Repeated { packed: true } => (Card::Packed, 0),
        };
        let (pattern, _, tag) = encode_tag(tag_value(d));
        let parser = match d.kind {
            FieldKind::Message => {
                let child = &self.submsgs[spec.submsg as usize];
                FieldParser::Message {
                    card,
                    tag,
                    ceil: SizeCeiling::for_record(child.record_total()),
                }
            }
            FieldKind::Bytes | FieldKind::String => FieldParser::Str { card, tag },
            FieldKind::Fixed32 | FieldKind::SFixed32 | FieldKind::Float => {
                FieldParser::Fixed { card, width: FixedWidth::Four, tag }
            }
            FieldKind::Fixed64 | FieldKind::SFixed64 | FieldKind::Double => {
                FieldParser::Fixed { card, width: FixedWidth::Eight, tag }
            }
            _ => FieldParser::Varint { card, kind: d.kind.varint_kind()?, tag },
        };
        Some(FastTableEntry {
            parser,
            data: pack_field_data(
                pattern,
                spec.submsg,
                hasbit_or_field,
                spec.case_offset,
                spec.offset,
            ),
        })
    }
}

/// Wire tag value a field's table entry expects: packed repeated fields
/// expect the length-delimited form, everything else its element form.
fn tag_value(d: &Decl) -> u32 {
    let wt = match d.card {
        Cardinality::Repeated { packed: true } => WT_DELIMITED,
        _ => d.kind.wire_type(),
    };
    d.number << 3 | wt as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_word_round_trip() {
        let data = pack_field_data(0x0108, 3, 17, 0x0010, 0x0020);
        assert_eq!(data & 0xFFFF, 0x0108);
        assert_eq!(data_submsg_index(data), 3);
        assert_eq!(data_hasbit(data), 17);
        assert_eq!(data_case_offset(data), 0x10);
        assert_eq!(data_value_offset(data), 0x20);
    }

    #[test]
    fn xor_match_is_a_zero_test() {
        let (pattern, _, _) = encode_tag(1 << 3 | WT_VARINT as u32);
        let data = pack_field_data(pattern, 0, 0, 0, 8);
        assert!(check_tag(data ^ 0x0008, 1));
        assert!(!check_tag(data ^ 0x0010, 1));
        // High junk byte is ignored for one-byte tags.
        assert!(check_tag(data ^ 0x2A08, 1));
    }

    #[test]
    fn two_byte_tags_land_in_high_slots() {
        let (pattern, slot, width) = encode_tag(300 << 3 | WT_VARINT as u32);
        assert_eq!(width, TagWidth::Two);
        assert!((16..32).contains(&slot));
        assert_eq!(pattern & 0x80, 0x80);
        // The pattern is the little-endian varint of the tag.
        assert_eq!(pattern, 0x12E0);
    }

    #[test]
    fn packed_flip_toggles_wire_type() {
        let (pattern, _, _) = encode_tag(4 << 3 | WT_DELIMITED as u32);
        let unpacked_tag = 4 << 3 | WT_FIXED32 as u32;
        // fixed32 differs from length-delimited in more than one bit, so the
        // flip must not match.
        let mut data = pack_field_data(pattern, 0, 0, 0, 8) ^ unpacked_tag as u64;
        assert!(!check_tag(data, 1));
        assert!(!flip_packed(&mut data, 1));

        let (pattern, _, _) = encode_tag(4 << 3 | WT_DELIMITED as u32);
        let varint_tag = 4 << 3 | WT_VARINT as u32;
        let mut data = pack_field_data(pattern, 0, 0, 0, 8) ^ varint_tag as u64;
        assert!(!check_tag(data, 1));
        assert!(flip_packed(&mut data, 1));
    }

    #[test]
    fn builder_routes_collisions_to_generic() {
        // Two-byte tags hash to slot 16 + (number mod 16), so fields 16 and
        // 32 contend for slot 16. The first declaration wins; the loser is
        // reachable only through the field list.
        let layout = LayoutBuilder::new()
            .scalar(16, FieldKind::Int32)
            .scalar(32, FieldKind::Int32)
            .finish();
        let slot = &layout.fasttable[16];
        assert!(matches!(slot.parser, FieldParser::Varint { .. }));
        // Field 16, wire type 0 encodes as the two-byte varint 80 01.
        assert_eq!(slot.data & 0xFFFF, 0x0180);
        assert!(layout.field(32).is_some());
    }

    #[test]
    fn slot_zero_stays_generic() {
        // Only field number zero could hash to slot 0, and field numbers
        // start at one, so the generic entry there is never displaced.
        let layout = LayoutBuilder::new().scalar(1, FieldKind::Int32).finish();
        assert_eq!(layout.fasttable[0].parser, FieldParser::Generic);
    }

    #[test]
    fn builder_assigns_distinct_aligned_offsets() {
        let layout = LayoutBuilder::new()
            .scalar(1, FieldKind::Bool)
            .scalar(2, FieldKind::Double)
            .scalar(3, FieldKind::Int32)
            .scalar(4, FieldKind::String)
            .finish();
        let b = layout.field(1).unwrap();
        let d = layout.field(2).unwrap();
        let i = layout.field(3).unwrap();
        let s = layout.field(4).unwrap();
        assert_eq!(d.offset % 8, 0);
        assert_eq!(s.offset % 8, 0);
        assert_eq!(i.offset % 4, 0);
        let mut offsets = [
            (b.offset as usize, 1),
            (d.offset as usize, 8),
            (i.offset as usize, 4),
            (s.offset as usize, 16),
        ];
        offsets.sort();
        for w in offsets.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0, "slots overlap: {offsets:?}");
        }
        assert!(layout.size as usize >= 4 + 1 + 8 + 4 + 16);
    }

    #[test]
    fn oneof_members_share_storage() {
        let layout = LayoutBuilder::new()
            .oneof(vec![
                OneofMember::scalar(5, FieldKind::Int64),
                OneofMember::scalar(6, FieldKind::String),
            ])
            .finish();
        let a = layout.field(5).unwrap();
        let b = layout.field(6).unwrap();
        assert_eq!(a.offset, b.offset);
        assert_eq!(a.case_offset, b.case_offset);
        assert_ne!(a.offset, a.case_offset);
    }

    #[test]
    fn message_ceiling_tracks_child_size() {
        let small = LayoutBuilder::new().scalar(1, FieldKind::Int32).finish();
        let layout = LayoutBuilder::new().message(1, small).finish();
        match layout.fasttable[1].parser {
            FieldParser::Message { ceil, .. } => assert_eq!(ceil, SizeCeiling::Max64),
            other => panic!("expected message parser, got {other:?}"),
        }
    }
}
