//! Varint and fixed-width field specialists.
//!
//! One monomorphized body exists per (tag width, value width, zigzag)
//! combination; cardinality stays a runtime parameter and is branched on
//! exactly where the behavior diverges. A specialist consumes one field
//! occurrence, or a whole same-tag run for repeated fields, then hands the
//! cursor back to the dispatch loop.

use std::ptr::NonNull;

use crate::error::{buffer_underrun, malformed_varint, malformed_wire, DecodeError};
use crate::record::{
    commit_arr, get_field, next_repeated, reserve_additional, resize_arr, FieldArr, Next,
};
use crate::table::{
    check_tag, data_value_offset, flip_packed, Card, FixedWidth, MessageLayout, TagWidth,
    VarintKind,
};
use crate::{delimited, generic, wire, Control, Decoder};

pub(crate) fn varint(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    data: u64,
    card: Card,
    kind: VarintKind,
    tag: TagWidth,
) -> Result<Control, DecodeError> {
    use TagWidth::*;
    use VarintKind::*;
    match (kind, tag) {
        (Bool, One) => varint_entry::<1, 1, false>(d, ptr, msg, table, hasbits, data, card),
        (Bool, Two) => varint_entry::<2, 1, false>(d, ptr, msg, table, hasbits, data, card),
        (Bits32, One) => varint_entry::<1, 4, false>(d, ptr, msg, table, hasbits, data, card),
        (Bits32, Two) => varint_entry::<2, 4, false>(d, ptr, msg, table, hasbits, data, card),
        (Bits64, One) => varint_entry::<1, 8, false>(d, ptr, msg, table, hasbits, data, card),
        (Bits64, Two) => varint_entry::<2, 8, false>(d, ptr, msg, table, hasbits, data, card),
        (ZigZag32, One) => varint_entry::<1, 4, true>(d, ptr, msg, table, hasbits, data, card),
        (ZigZag32, Two) => varint_entry::<2, 4, true>(d, ptr, msg, table, hasbits, data, card),
        (ZigZag64, One) => varint_entry::<1, 8, true>(d, ptr, msg, table, hasbits, data, card),
        (ZigZag64, Two) => varint_entry::<2, 8, true>(d, ptr, msg, table, hasbits, data, card),
    }
}

#[inline(always)]
fn varint_entry<const TAGBYTES: usize, const VALBYTES: usize, const ZIGZAG: bool>(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    data: u64,
    card: Card,
) -> Result<Control, DecodeError> {
    if card == Card::Packed {
        packed_varint::<TAGBYTES, VALBYTES, ZIGZAG>(d, ptr, msg, table, hasbits, data)
    } else {
        unpacked_varint::<TAGBYTES, VALBYTES, ZIGZAG>(d, ptr, msg, table, hasbits, data, card)
    }
}

#[inline(always)]
fn unpacked_varint<const TAGBYTES: usize, const VALBYTES: usize, const ZIGZAG: bool>(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    mut data: u64,
    card: Card,
) -> Result<Control, DecodeError> {
    if !check_tag(data, TAGBYTES) {
        // A repeated field may arrive in its packed encoding; one bit flip
        // of the expected tag tells.
        if card == Card::Repeated && flip_packed(&mut data, TAGBYTES) {
            return packed_varint::<TAGBYTES, VALBYTES, ZIGZAG>(d, ptr, msg, table, hasbits, data);
        }
        return generic::fallback(d, ptr, msg, table, hasbits);
    }

    let mut farr = FieldArr::default();
    let mut dst = get_field(d, ptr, msg, &mut data, hasbits, &mut farr, VALBYTES, card)?;
    loop {
        if card == Card::Repeated {
            dst = resize_arr(d.arena, dst, &mut farr, VALBYTES)?;
        }
        ptr += TAGBYTES;
        let (next, raw) = wire::read_varint(d.buf, ptr).ok_or_else(malformed_varint)?;
        ptr = next;
        write_varint_value::<VALBYTES, ZIGZAG>(dst, raw);
        if card != Card::Repeated {
            break;
        }
        let ret = next_repeated(d, dst, ptr, &farr, data, TAGBYTES, VALBYTES);
        match ret.next {
            Next::SameField => dst = ret.dst,
            Next::OtherField | Next::AtLimit => return Ok(Control::Continue(ptr)),
        }
    }
    Ok(Control::Continue(ptr))
}

#[inline(always)]
fn packed_varint<const TAGBYTES: usize, const VALBYTES: usize, const ZIGZAG: bool>(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    mut data: u64,
) -> Result<Control, DecodeError> {
    if !check_tag(data, TAGBYTES) {
        if flip_packed(&mut data, TAGBYTES) {
            return unpacked_varint::<TAGBYTES, VALBYTES, ZIGZAG>(
                d,
                ptr,
                msg,
                table,
                hasbits,
                data,
                Card::Repeated,
            );
        }
        return generic::fallback(d, ptr, msg, table, hasbits);
    }

    let mut farr = FieldArr::default();
    let mut dst = get_field(d, ptr, msg, &mut data, hasbits, &mut farr, VALBYTES, Card::Packed)?;
    ptr += TAGBYTES;
    let end = delimited(d, ptr, |d, mut p| {
        while !d.is_done(p) {
            dst = resize_arr(d.arena, dst, &mut farr, VALBYTES)?;
            let (next, raw) = wire::read_varint(d.buf, p).ok_or_else(malformed_varint)?;
            p = next;
            write_varint_value::<VALBYTES, ZIGZAG>(dst, raw);
            dst = unsafe { dst.add(VALBYTES) };
        }
        // The last varint must land exactly on the region edge.
        d.check_frame_end(p)?;
        Ok(p)
    })?;
    commit_arr(dst, &farr, VALBYTES);
    Ok(Control::Continue(end))
}

#[inline(always)]
fn write_varint_value<const VALBYTES: usize, const ZIGZAG: bool>(dst: *mut u8, raw: u64) {
    let val = wire::munge(raw, VALBYTES, ZIGZAG);
    // The slot is VALBYTES wide by layout construction.
    unsafe {
        match VALBYTES {
            1 => *dst = val as u8,
            4 => (dst as *mut u32).write_unaligned(val as u32),
            8 => (dst as *mut u64).write_unaligned(val),
            _ => unreachable!(),
        }
    }
}

pub(crate) fn fixed(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    data: u64,
    card: Card,
    width: FixedWidth,
    tag: TagWidth,
) -> Result<Control, DecodeError> {
    match (width, tag) {
        (FixedWidth::Four, TagWidth::One) => {
            fixed_entry::<1, 4>(d, ptr, msg, table, hasbits, data, card)
        }
        (FixedWidth::Four, TagWidth::Two) => {
            fixed_entry::<2, 4>(d, ptr, msg, table, hasbits, data, card)
        }
        (FixedWidth::Eight, TagWidth::One) => {
            fixed_entry::<1, 8>(d, ptr, msg, table, hasbits, data, card)
        }
        (FixedWidth::Eight, TagWidth::Two) => {
            fixed_entry::<2, 8>(d, ptr, msg, table, hasbits, data, card)
        }
    }
}

#[inline(always)]
fn fixed_entry<const TAGBYTES: usize, const VALBYTES: usize>(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    data: u64,
    card: Card,
) -> Result<Control, DecodeError> {
    if card == Card::Packed {
        packed_fixed::<TAGBYTES, VALBYTES>(d, ptr, msg, table, hasbits, data)
    } else {
        unpacked_fixed::<TAGBYTES, VALBYTES>(d, ptr, msg, table, hasbits, data, card)
    }
}

#[inline(always)]
fn unpacked_fixed<const TAGBYTES: usize, const VALBYTES: usize>(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    mut data: u64,
    card: Card,
) -> Result<Control, DecodeError> {
    if !check_tag(data, TAGBYTES) {
        // Fixed elements differ from the packed wire type in more than one
        // bit, so the flip never lands; mixed encodings go generic.
        if card == Card::Repeated && flip_packed(&mut data, TAGBYTES) {
            return packed_fixed::<TAGBYTES, VALBYTES>(d, ptr, msg, table, hasbits, data);
        }
        return generic::fallback(d, ptr, msg, table, hasbits);
    }

    let mut farr = FieldArr::default();
    let mut dst = get_field(d, ptr, msg, &mut data, hasbits, &mut farr, VALBYTES, card)?;
    loop {
        if card == Card::Repeated {
            dst = resize_arr(d.arena, dst, &mut farr, VALBYTES)?;
        }
        ptr += TAGBYTES;
        ptr = read_fixed_into::<VALBYTES>(d.buf, ptr, dst)?;
        if card != Card::Repeated {
            break;
        }
        let ret = next_repeated(d, dst, ptr, &farr, data, TAGBYTES, VALBYTES);
        match ret.next {
            Next::SameField => dst = ret.dst,
            Next::OtherField | Next::AtLimit => return Ok(Control::Continue(ptr)),
        }
    }
    Ok(Control::Continue(ptr))
}

#[inline(always)]
fn packed_fixed<const TAGBYTES: usize, const VALBYTES: usize>(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    mut data: u64,
) -> Result<Control, DecodeError> {
    if !check_tag(data, TAGBYTES) {
        if flip_packed(&mut data, TAGBYTES) {
            return unpacked_fixed::<TAGBYTES, VALBYTES>(
                d,
                ptr,
                msg,
                table,
                hasbits,
                data,
                Card::Repeated,
            );
        }
        return generic::fallback(d, ptr, msg, table, hasbits);
    }

    ptr += TAGBYTES;
    let (next, size) = wire::read_size(d.buf, ptr)?;
    ptr = next;
    let size = size as usize;
    if !wire::fits(ptr, size, d.limit_ptr) {
        return Err(buffer_underrun());
    }
    if size % VALBYTES != 0 {
        return Err(malformed_wire());
    }
    let elems = size / VALBYTES;
    let arr = reserve_additional(d.arena, msg, data_value_offset(data), VALBYTES, elems)?;
    let a = unsafe { &mut *arr };
    let tail = unsafe { a.data.add(a.len as usize * VALBYTES) };
    copy_packed_run::<VALBYTES>(d.buf, ptr, elems, tail);
    a.len += elems as u32;
    Ok(Control::Continue(ptr + size))
}

/// Copy one packed run of fixed-width little-endian values into array
/// storage in a single pass.
#[inline(always)]
fn copy_packed_run<const VALBYTES: usize>(buf: &[u8], pos: usize, elems: usize, dst: *mut u8) {
    #[cfg(target_endian = "little")]
    unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr().add(pos), dst, elems * VALBYTES);
    }
    #[cfg(target_endian = "big")]
    for i in 0..elems {
        let p = pos + i * VALBYTES;
        unsafe {
            match VALBYTES {
                4 => {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&buf[p..p + 4]);
                    (dst.add(i * 4) as *mut u32).write_unaligned(u32::from_le_bytes(raw));
                }
                8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&buf[p..p + 8]);
                    (dst.add(i * 8) as *mut u64).write_unaligned(u64::from_le_bytes(raw));
                }
                _ => unreachable!(),
            }
        }
    }
}

#[inline(always)]
fn read_fixed_into<const VALBYTES: usize>(
    buf: &[u8],
    pos: usize,
    dst: *mut u8,
) -> Result<usize, DecodeError> {
    match VALBYTES {
        4 => {
            let (next, v) = wire::read_fixed32(buf, pos).ok_or_else(buffer_underrun)?;
            unsafe { (dst as *mut u32).write_unaligned(v) };
            Ok(next)
        }
        8 => {
            let (next, v) = wire::read_fixed64(buf, pos).ok_or_else(buffer_underrun)?;
            unsafe { (dst as *mut u64).write_unaligned(v) };
            Ok(next)
        }
        _ => unreachable!(),
    }
}
