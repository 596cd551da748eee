//! Decoded storage: message records, repeated arrays, string views, and the
//! accessor the specialists use to resolve a field's destination.
//!
//! A message record is raw arena memory laid out by its `MessageLayout`: a
//! 32-bit hasbits word first, then value slots at fixed offsets. An internal
//! header of [`RECORD_HEADER`] bytes is prepended in the arena; every record
//! pointer in this module already points past it.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::arena::Arena;
use crate::error::{out_of_memory, DecodeError};
use crate::table::{
    data_case_offset, data_hasbit, data_oneof_field, data_value_offset, tag_matches, Card,
    Cardinality, MessageLayout,
};
use crate::wire;
use crate::Decoder;

pub(crate) const RECORD_HEADER: usize = 8;

const INITIAL_CAPACITY: u32 = 8;

/// Backing record of a repeated field. `len <= cap` always; capacity is a
/// power of two no smaller than [`INITIAL_CAPACITY`] and grows by doubling.
#[repr(C)]
pub(crate) struct ArrayRecord {
    pub(crate) data: *mut u8,
    pub(crate) len: u32,
    pub(crate) cap: u32,
    pub(crate) elem_lg2: u32,
    _pad: u32,
}

/// Where a string view's bytes live.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StrOrigin {
    /// Borrowed from the input buffer.
    Aliased,
    /// Owned by the arena.
    Copied,
}

/// A decoded string or bytes value: a pointer, a length under 2 GiB, and an
/// explicit ownership tag. Sixteen bytes, so repeated string storage keeps a
/// power-of-two element size.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct StrView {
    data: *const u8,
    len: u32,
    origin: u32,
}

impl StrView {
    pub(crate) fn aliased(data: *const u8, len: usize) -> Self {
        StrView { data, len: len as u32, origin: StrOrigin::Aliased as u32 }
    }

    pub(crate) fn copied(data: *const u8, len: usize) -> Self {
        StrView { data, len: len as u32, origin: StrOrigin::Copied as u32 }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn origin(&self) -> StrOrigin {
        if self.origin == StrOrigin::Copied as u32 {
            StrOrigin::Copied
        } else {
            StrOrigin::Aliased
        }
    }

    /// The viewed bytes. Valid for as long as the arena (and, for aliased
    /// views, the input buffer) that the decode ran against.
    pub fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data, self.len as usize) }
    }

    /// Start pointer, for provenance checks.
    pub fn as_ptr(&self) -> *const u8 {
        self.data
    }
}

impl PartialEq for StrView {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

/// Allocate a zeroed record for `layout`. `ceil` is the allocation ceiling
/// bucket: when the arena's current chunk has that much head room the record
/// is carved out with a plain head bump, skipping the general allocator.
pub(crate) fn new_message(
    arena: &Arena,
    layout: &MessageLayout,
    ceil: Option<usize>,
) -> Result<NonNull<u8>, DecodeError> {
    let total = layout.record_total();
    let base = match ceil {
        Some(c) if total <= c && arena.head_room() >= c => {
            let p = arena.head_ptr();
            arena.bump_head(total);
            // Head-room was just checked, so the head is non-null.
            unsafe { NonNull::new_unchecked(p) }
        }
        _ => arena.alloc(total).ok_or_else(out_of_memory)?,
    };
    unsafe {
        std::ptr::write_bytes(base.as_ptr(), 0, total);
        Ok(NonNull::new_unchecked(base.as_ptr().add(RECORD_HEADER)))
    }
}

/// Merge accumulated hasbits into the record's hasbits word.
#[inline(always)]
pub(crate) fn sync_hasbits(msg: NonNull<u8>, hasbits: u64) {
    unsafe {
        let word = msg.as_ptr() as *mut u32;
        *word |= hasbits as u32;
    }
}

/// Repeated-field cursor a specialist carries through its hot loop.
pub(crate) struct FieldArr {
    pub(crate) arr: *mut ArrayRecord,
    pub(crate) end: *mut u8,
}

impl Default for FieldArr {
    fn default() -> Self {
        FieldArr { arr: std::ptr::null_mut(), end: std::ptr::null_mut() }
    }
}

pub(crate) enum Next {
    SameField,
    OtherField,
    AtLimit,
}

pub(crate) struct NextRet {
    pub(crate) dst: *mut u8,
    pub(crate) next: Next,
}

fn array_new(arena: &Arena, cap: u32, elem_lg2: u32) -> Result<*mut ArrayRecord, DecodeError> {
    let rec = arena
        .alloc(std::mem::size_of::<ArrayRecord>())
        .ok_or_else(out_of_memory)?
        .as_ptr() as *mut ArrayRecord;
    let data = arena
        .alloc((cap as usize) << elem_lg2)
        .ok_or_else(out_of_memory)?
        .as_ptr();
    unsafe {
        rec.write(ArrayRecord { data, len: 0, cap, elem_lg2, _pad: 0 });
    }
    Ok(rec)
}

/// Resolve the destination slot for one field occurrence.
///
/// Singular: set the hasbit. Oneof: record the arm in the case slot.
/// Repeated: flush accumulated hasbits, load or create the array, point the
/// caller's cursor at the first unused element, and replace `data` with the
/// tag just read so the hot loop can match repeats against it.
#[inline(always)]
pub(crate) fn get_field(
    d: &Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    data: &mut u64,
    hasbits: &mut u64,
    farr: &mut FieldArr,
    valbytes: usize,
    card: Card,
) -> Result<*mut u8, DecodeError> {
    match card {
        Card::Singular => {
            *hasbits |= 1u64 << data_hasbit(*data);
            Ok(unsafe { msg.as_ptr().add(data_value_offset(*data)) })
        }
        Card::Oneof => {
            unsafe {
                let case = msg.as_ptr().add(data_case_offset(*data)) as *mut u32;
                case.write_unaligned(data_oneof_field(*data));
                Ok(msg.as_ptr().add(data_value_offset(*data)))
            }
        }
        Card::Repeated | Card::Packed => {
            sync_hasbits(msg, *hasbits);
            *hasbits = 0;
            let elem_lg2 = valbytes.trailing_zeros();
            let arr_p =
                unsafe { msg.as_ptr().add(data_value_offset(*data)) } as *mut *mut ArrayRecord;
            let mut arr = unsafe { *arr_p };
            if arr.is_null() {
                arr = array_new(d.arena, INITIAL_CAPACITY, elem_lg2)?;
                unsafe { *arr_p = arr };
            }
            farr.arr = arr;
            let a = unsafe { &*arr };
            debug_assert_eq!(a.elem_lg2, elem_lg2);
            farr.end = unsafe { a.data.add((a.cap as usize) * valbytes) };
            *data = wire::load_tag(d.buf, ptr) as u64;
            Ok(unsafe { a.data.add((a.len as usize) * valbytes) })
        }
    }
}

/// Double the array when the hot-loop cursor has reached its end.
#[inline(always)]
pub(crate) fn resize_arr(
    arena: &Arena,
    dst: *mut u8,
    farr: &mut FieldArr,
    valbytes: usize,
) -> Result<*mut u8, DecodeError> {
    if dst != farr.end {
        return Ok(dst);
    }
    let a = unsafe { &mut *farr.arr };
    let old_cap = a.cap as usize;
    let new_cap = old_cap * 2;
    let data = unsafe { NonNull::new_unchecked(a.data) };
    let fresh = arena
        .realloc(data, old_cap * valbytes, new_cap * valbytes)
        .ok_or_else(out_of_memory)?
        .as_ptr();
    a.data = fresh;
    a.cap = new_cap as u32;
    farr.end = unsafe { fresh.add(new_cap * valbytes) };
    Ok(unsafe { fresh.add(old_cap * valbytes) })
}

/// Record the array length implied by a cursor one past the last written
/// element.
#[inline(always)]
pub(crate) fn commit_arr(dst_past: *mut u8, farr: &FieldArr, valbytes: usize) {
    let a = unsafe { &mut *farr.arr };
    a.len = ((dst_past as usize - a.data as usize) / valbytes) as u32;
}

/// Decide how a repeated hot loop continues after writing one element.
#[inline(always)]
pub(crate) fn next_repeated(
    d: &Decoder<'_>,
    dst: *mut u8,
    ptr: usize,
    farr: &FieldArr,
    data: u64,
    tagbytes: usize,
    valbytes: usize,
) -> NextRet {
    let dst = unsafe { dst.add(valbytes) };
    if !d.is_done(ptr) {
        let tag = wire::load_tag(d.buf, ptr);
        if tag_matches(tag, data, tagbytes) {
            return NextRet { dst, next: Next::SameField };
        }
        commit_arr(dst, farr, valbytes);
        NextRet { dst, next: Next::OtherField }
    } else {
        commit_arr(dst, farr, valbytes);
        NextRet { dst, next: Next::AtLimit }
    }
}

/// Ensure a repeated field's array has room for `additional` more elements
/// past its current length, preserving the power-of-two capacity
/// discipline. Used by the packed fixed-width bulk path, which knows the
/// element count up front.
pub(crate) fn reserve_additional(
    arena: &Arena,
    msg: NonNull<u8>,
    offset: usize,
    valbytes: usize,
    additional: usize,
) -> Result<*mut ArrayRecord, DecodeError> {
    let elem_lg2 = valbytes.trailing_zeros();
    let arr_p = unsafe { msg.as_ptr().add(offset) } as *mut *mut ArrayRecord;
    let arr = unsafe { *arr_p };
    if arr.is_null() {
        let cap = (additional.next_power_of_two() as u32).max(INITIAL_CAPACITY);
        let fresh = array_new(arena, cap, elem_lg2)?;
        unsafe { *arr_p = fresh };
        return Ok(fresh);
    }
    let a = unsafe { &mut *arr };
    let needed = ((a.len as usize + additional).next_power_of_two() as u32).max(INITIAL_CAPACITY);
    if a.cap < needed {
        let data = unsafe { NonNull::new_unchecked(a.data) };
        let fresh = arena
            .realloc(data, (a.cap as usize) * valbytes, needed as usize * valbytes)
            .ok_or_else(out_of_memory)?
            .as_ptr();
        a.data = fresh;
        a.cap = needed;
    }
    Ok(arr)
}

/// Append one element slot to a repeated field, growing as needed. The slow
/// path's equivalent of the specialists' array hot loop.
pub(crate) fn repeated_push(
    arena: &Arena,
    msg: NonNull<u8>,
    offset: usize,
    valbytes: usize,
) -> Result<*mut u8, DecodeError> {
    let elem_lg2 = valbytes.trailing_zeros();
    let arr_p = unsafe { msg.as_ptr().add(offset) } as *mut *mut ArrayRecord;
    let mut arr = unsafe { *arr_p };
    if arr.is_null() {
        arr = array_new(arena, INITIAL_CAPACITY, elem_lg2)?;
        unsafe { *arr_p = arr };
    }
    let a = unsafe { &mut *arr };
    if a.len == a.cap {
        let new_cap = (a.cap as usize) * 2;
        let data = unsafe { NonNull::new_unchecked(a.data) };
        let fresh = arena
            .realloc(data, (a.cap as usize) * valbytes, new_cap * valbytes)
            .ok_or_else(out_of_memory)?
            .as_ptr();
        a.data = fresh;
        a.cap = new_cap as u32;
    }
    let slot = unsafe { a.data.add((a.len as usize) * valbytes) };
    a.len += 1;
    Ok(slot)
}

// Reading decoded records.

/// Value types readable straight out of a record slot.
pub trait Scalar: Copy {
    #[doc(hidden)]
    unsafe fn load(p: *const u8) -> Self;
}

macro_rules! pod_scalar {
    ($($ty:ty),*) => {
        $(impl Scalar for $ty {
            unsafe fn load(p: *const u8) -> Self {
                (p as *const $ty).read_unaligned()
            }
        })*
    };
}

pod_scalar!(u32, i32, u64, i64, f32, f64);

impl Scalar for bool {
    unsafe fn load(p: *const u8) -> Self {
        *p != 0
    }
}

impl Scalar for StrView {
    unsafe fn load(p: *const u8) -> Self {
        (p as *const StrView).read_unaligned()
    }
}

/// A decoded message record. Copyable; borrows the arena (and the input
/// buffer, when string aliasing was enabled) for `'a`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MessageRef<'a> {
    ptr: NonNull<u8>,
    _lives: PhantomData<&'a ()>,
}

impl<'a> MessageRef<'a> {
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        MessageRef { ptr, _lives: PhantomData }
    }

    fn spec<'l>(layout: &'l MessageLayout, number: u32) -> &'l crate::table::FieldSpec {
        match layout.field(number) {
            Some(spec) => spec,
            None => panic!("field {number} is not part of this layout"),
        }
    }

    fn slot(&self, offset: u16) -> *const u8 {
        unsafe { self.ptr.as_ptr().add(offset as usize) }
    }

    /// The raw hasbits word.
    pub fn hasbits(&self) -> u32 {
        unsafe { (self.ptr.as_ptr() as *const u32).read() }
    }

    /// Whether a singular field was seen during the decode.
    pub fn has(&self, layout: &MessageLayout, number: u32) -> bool {
        let spec = Self::spec(layout, number);
        debug_assert!(matches!(spec.card, Cardinality::Singular));
        self.hasbits() & (1 << spec.hasbit) != 0
    }

    /// Field number of the oneof arm written last, or zero. `number` may be
    /// any member of the oneof.
    pub fn oneof_case(&self, layout: &MessageLayout, number: u32) -> u32 {
        let spec = Self::spec(layout, number);
        debug_assert!(matches!(spec.card, Cardinality::Oneof));
        unsafe { (self.slot(spec.case_offset) as *const u32).read_unaligned() }
    }

    /// A scalar field's value. Absent fields read as zero.
    pub fn scalar<T: Scalar>(&self, layout: &MessageLayout, number: u32) -> T {
        let spec = Self::spec(layout, number);
        debug_assert_eq!(std::mem::size_of::<T>(), spec.kind.valbytes());
        unsafe { T::load(self.slot(spec.offset)) }
    }

    /// A string or bytes field's contents. Absent fields read as empty.
    pub fn bytes(&self, layout: &MessageLayout, number: u32) -> &'a [u8] {
        let view: StrView = self.scalar(layout, number);
        if view.len == 0 {
            return &[];
        }
        // The view points into the arena or the input buffer, both alive
        // for 'a.
        unsafe { std::slice::from_raw_parts(view.data, view.len as usize) }
    }

    /// The raw view of a string or bytes field, including its origin tag.
    pub fn str_view(&self, layout: &MessageLayout, number: u32) -> StrView {
        self.scalar(layout, number)
    }

    /// A singular sub-message, if one was decoded.
    pub fn message(&self, layout: &MessageLayout, number: u32) -> Option<MessageRef<'a>> {
        let spec = Self::spec(layout, number);
        let p = unsafe { (self.slot(spec.offset) as *const *mut u8).read_unaligned() };
        NonNull::new(p).map(MessageRef::new)
    }

    /// The elements of a repeated scalar field.
    pub fn repeated<T: Scalar>(&self, layout: &MessageLayout, number: u32) -> &'a [T] {
        let spec = Self::spec(layout, number);
        debug_assert!(matches!(spec.card, Cardinality::Repeated { .. }));
        debug_assert_eq!(std::mem::size_of::<T>(), spec.kind.valbytes());
        let arr = unsafe { (self.slot(spec.offset) as *const *const ArrayRecord).read_unaligned() };
        if arr.is_null() {
            return &[];
        }
        let a = unsafe { &*arr };
        unsafe { std::slice::from_raw_parts(a.data as *const T, a.len as usize) }
    }

    /// The views of a repeated string or bytes field.
    pub fn repeated_str(&self, layout: &MessageLayout, number: u32) -> &'a [StrView] {
        self.repeated(layout, number)
    }

    /// The elements of a repeated sub-message field.
    pub fn repeated_message(&self, layout: &MessageLayout, number: u32) -> Vec<MessageRef<'a>> {
        let spec = Self::spec(layout, number);
        let arr = unsafe { (self.slot(spec.offset) as *const *const ArrayRecord).read_unaligned() };
        if arr.is_null() {
            return Vec::new();
        }
        let a = unsafe { &*arr };
        let ptrs = unsafe { std::slice::from_raw_parts(a.data as *const *mut u8, a.len as usize) };
        ptrs.iter()
            .filter_map(|&p| NonNull::new(p).map(MessageRef::new))
            .collect()
    }

    /// Capacity of a repeated field's backing array, in elements.
    pub fn repeated_capacity(&self, layout: &MessageLayout, number: u32) -> usize {
        let spec = Self::spec(layout, number);
        let arr = unsafe { (self.slot(spec.offset) as *const *const ArrayRecord).read_unaligned() };
        if arr.is_null() {
            return 0;
        }
        unsafe { (*arr).cap as usize }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{FieldKind, LayoutBuilder};

    #[test]
    fn array_growth_doubles_and_stays_power_of_two() {
        let arena = Arena::new();
        let layout = LayoutBuilder::new().repeated(1, FieldKind::UInt32).finish();
        let msg = new_message(&arena, &layout, None).unwrap();
        let offset = layout.field(1).unwrap().offset as usize;
        let mut caps = Vec::new();
        for i in 0..40u32 {
            let slot = repeated_push(&arena, msg, offset, 4).unwrap();
            unsafe { (slot as *mut u32).write_unaligned(i) };
            let arr = unsafe { *(msg.as_ptr().add(offset) as *const *const ArrayRecord) };
            caps.push(unsafe { (*arr).cap });
        }
        let view = MessageRef::new(msg);
        let elems: &[u32] = view.repeated(&layout, 1);
        assert_eq!(elems.len(), 40);
        assert_eq!(elems[0], 0);
        assert_eq!(elems[39], 39);
        for w in caps.windows(2) {
            assert!(w[1] >= w[0], "capacity shrank");
        }
        for &c in &caps {
            assert!(c >= 8 && c.is_power_of_two(), "bad capacity {c}");
        }
        assert_eq!(*caps.last().unwrap(), 64);
    }

    #[test]
    fn reserve_rounds_capacity_up_past_the_tail() {
        let arena = Arena::new();
        let layout = LayoutBuilder::new().packed(1, FieldKind::Fixed32).finish();
        let msg = new_message(&arena, &layout, None).unwrap();
        let offset = layout.field(1).unwrap().offset as usize;
        let arr = reserve_additional(&arena, msg, offset, 4, 3).unwrap();
        assert_eq!(unsafe { (*arr).cap }, 8);
        unsafe { (*arr).len = 3 };
        let arr = reserve_additional(&arena, msg, offset, 4, 21).unwrap();
        assert_eq!(unsafe { (*arr).cap }, 32);
        assert_eq!(unsafe { (*arr).len }, 3);
    }

    #[test]
    fn records_start_zeroed() {
        let arena = Arena::new();
        let layout = LayoutBuilder::new()
            .scalar(1, FieldKind::Int64)
            .scalar(2, FieldKind::String)
            .finish();
        // Dirty the arena head first so the bump path cannot hand back
        // obviously fresh memory.
        let scratch = arena.alloc(64).unwrap();
        unsafe { scratch.as_ptr().write_bytes(0xAA, 64) };
        let msg = new_message(&arena, &layout, Some(128)).unwrap();
        let view = MessageRef::new(msg);
        assert_eq!(view.hasbits(), 0);
        assert_eq!(view.scalar::<i64>(&layout, 1), 0);
        assert!(view.bytes(&layout, 2).is_empty());
    }

    #[test]
    fn str_view_tags_origin() {
        let input = b"abc";
        let aliased = StrView::aliased(input.as_ptr(), 3);
        assert_eq!(aliased.origin(), StrOrigin::Aliased);
        assert_eq!(aliased.as_bytes(), b"abc");
        let copied = StrView::copied(input.as_ptr(), 3);
        assert_eq!(copied.origin(), StrOrigin::Copied);
        assert_eq!(aliased, copied, "views compare by contents");
    }
}
