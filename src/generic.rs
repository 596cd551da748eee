//! Generic slow path.
//!
//! Everything the fast table cannot place lands here: tags whose slot
//! missed or collided, fields past the two-byte tag range, wrong-wire-type
//! arrivals, unknown fields, and group delimiters. Known fields are looked
//! up in the layout's complete field list and decoded table-driven; unknown
//! fields are skipped by wire type.

use std::ptr::NonNull;

use tracing::trace;

use crate::error::{
    buffer_underrun, group_mismatch, malformed_varint, malformed_wire, out_of_memory,
    recursion_too_deep, DecodeError,
};
use crate::record::{new_message, repeated_push, sync_hasbits, StrView};
use crate::table::{Cardinality, FieldKind, FieldSpec, MessageLayout};
use crate::wire::{
    self, WT_DELIMITED, WT_END_GROUP, WT_FIXED32, WT_FIXED64, WT_START_GROUP, WT_VARINT,
};
use crate::{dispatch, Control, Decoder};

#[inline(never)]
pub(crate) fn fallback(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
) -> Result<Control, DecodeError> {
    let (next, tag) = wire::read_varint(d.buf, ptr).ok_or_else(malformed_varint)?;
    if tag > u32::MAX as u64 {
        return Err(malformed_wire());
    }
    let field_number = (tag >> 3) as u32;
    let wire_type = (tag & 7) as u8;
    if field_number == 0 {
        return Err(malformed_wire());
    }
    if wire_type == WT_END_GROUP {
        d.end_group = field_number;
        return Ok(Control::FrameEnd(next));
    }
    if wire_type > WT_FIXED32 {
        return Err(malformed_wire());
    }
    match table.field(field_number) {
        Some(spec) => {
            decode_known(d, next, msg, table, hasbits, spec, wire_type).map(Control::Continue)
        }
        None => {
            trace!(field = field_number, wire_type, "skipping unknown field");
            skip_unknown(d, next, wire_type, field_number).map(Control::Continue)
        }
    }
}

fn decode_known(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    spec: &FieldSpec,
    wire_type: u8,
) -> Result<usize, DecodeError> {
    use FieldKind::*;
    let repeated = matches!(spec.card, Cardinality::Repeated { .. });
    match spec.kind {
        Bool | Int32 | Int64 | UInt32 | UInt64 | SInt32 | SInt64 => {
            if wire_type == WT_VARINT {
                let (next, raw) = wire::read_varint(d.buf, ptr).ok_or_else(malformed_varint)?;
                let val = wire::munge(raw, spec.kind.valbytes(), spec.kind.zigzag());
                store_scalar(d, msg, spec, hasbits, val)?;
                Ok(next)
            } else if wire_type == WT_DELIMITED && repeated {
                // Packed run; parsers accept either encoding for any
                // repeated primitive.
                let (next, size) = wire::read_size(d.buf, ptr)?;
                ptr = next;
                let size = size as usize;
                if !wire::fits(ptr, size, d.limit_ptr) {
                    return Err(buffer_underrun());
                }
                let run_end = ptr + size;
                while ptr < run_end {
                    let (next, raw) =
                        wire::read_varint(d.buf, ptr).ok_or_else(malformed_varint)?;
                    ptr = next;
                    let val = wire::munge(raw, spec.kind.valbytes(), spec.kind.zigzag());
                    store_scalar(d, msg, spec, hasbits, val)?;
                }
                if ptr != run_end {
                    return Err(malformed_varint());
                }
                Ok(ptr)
            } else {
                skip_unknown(d, ptr, wire_type, spec.number)
            }
        }
        Fixed32 | SFixed32 | Float => {
            fixed_known::<4>(d, ptr, msg, spec, hasbits, wire_type, WT_FIXED32)
        }
        Fixed64 | SFixed64 | Double => {
            fixed_known::<8>(d, ptr, msg, spec, hasbits, wire_type, WT_FIXED64)
        }
        Bytes | String => {
            if wire_type == WT_DELIMITED {
                string_known(d, ptr, msg, spec, hasbits)
            } else {
                skip_unknown(d, ptr, wire_type, spec.number)
            }
        }
        Message => {
            if wire_type == WT_DELIMITED {
                message_known(d, ptr, msg, table, spec, hasbits)
            } else {
                skip_unknown(d, ptr, wire_type, spec.number)
            }
        }
    }
}

fn fixed_known<const VALBYTES: usize>(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    msg: NonNull<u8>,
    spec: &FieldSpec,
    hasbits: &mut u64,
    wire_type: u8,
    expect: u8,
) -> Result<usize, DecodeError> {
    let repeated = matches!(spec.card, Cardinality::Repeated { .. });
    if wire_type == expect {
        let (next, val) = read_fixed::<VALBYTES>(d.buf, ptr)?;
        store_scalar(d, msg, spec, hasbits, val)?;
        Ok(next)
    } else if wire_type == WT_DELIMITED && repeated {
        let (next, size) = wire::read_size(d.buf, ptr)?;
        ptr = next;
        let size = size as usize;
        if !wire::fits(ptr, size, d.limit_ptr) {
            return Err(buffer_underrun());
        }
        if size % VALBYTES != 0 {
            return Err(malformed_wire());
        }
        let run_end = ptr + size;
        while ptr < run_end {
            let (next, val) = read_fixed::<VALBYTES>(d.buf, ptr)?;
            ptr = next;
            store_scalar(d, msg, spec, hasbits, val)?;
        }
        Ok(ptr)
    } else {
        skip_unknown(d, ptr, wire_type, spec.number)
    }
}

fn read_fixed<const VALBYTES: usize>(
    buf: &[u8],
    pos: usize,
) -> Result<(usize, u64), DecodeError> {
    match VALBYTES {
        4 => wire::read_fixed32(buf, pos)
            .map(|(p, v)| (p, v as u64))
            .ok_or_else(buffer_underrun),
        8 => wire::read_fixed64(buf, pos).ok_or_else(buffer_underrun),
        _ => unreachable!(),
    }
}

fn string_known(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    spec: &FieldSpec,
    hasbits: &mut u64,
) -> Result<usize, DecodeError> {
    let (next, size) = wire::read_size(d.buf, ptr)?;
    let size = size as usize;
    if !wire::fits(next, size, d.end) {
        return Err(buffer_underrun());
    }
    let view = if d.alias {
        StrView::aliased(unsafe { d.buf.as_ptr().add(next) }, size)
    } else {
        let copy = d.arena.alloc(size).ok_or_else(out_of_memory)?;
        unsafe {
            std::ptr::copy_nonoverlapping(d.buf.as_ptr().add(next), copy.as_ptr(), size);
        }
        StrView::copied(copy.as_ptr(), size)
    };
    store_view(d, msg, spec, hasbits, view)?;
    Ok(next + size)
}

fn message_known(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    spec: &FieldSpec,
    hasbits: &mut u64,
) -> Result<usize, DecodeError> {
    if d.depth == 0 {
        return Err(recursion_too_deep());
    }
    d.depth -= 1;
    let result = message_known_inner(d, ptr, msg, table, spec, hasbits);
    d.depth += 1;
    result
}

fn message_known_inner(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    spec: &FieldSpec,
    hasbits: &mut u64,
) -> Result<usize, DecodeError> {
    let child_layout: &MessageLayout = &table.submsgs[spec.submsg as usize];
    let slot = match spec.card {
        Cardinality::Singular => {
            *hasbits |= 1u64 << spec.hasbit;
            sync_hasbits(msg, *hasbits);
            *hasbits = 0;
            unsafe { msg.as_ptr().add(spec.offset as usize) as *mut *mut u8 }
        }
        Cardinality::Oneof => unsafe {
            let case = msg.as_ptr().add(spec.case_offset as usize) as *mut u32;
            let stale_arm = case.read_unaligned() != spec.number;
            case.write_unaligned(spec.number);
            let slot = msg.as_ptr().add(spec.offset as usize) as *mut *mut u8;
            if stale_arm {
                // Whatever the previous arm stored is not a child record.
                *slot = std::ptr::null_mut();
            }
            slot
        },
        Cardinality::Repeated { .. } => {
            repeated_push(d.arena, msg, spec.offset as usize, std::mem::size_of::<*mut u8>())?
                as *mut *mut u8
        }
    };
    let mut child = unsafe { *slot };
    if child.is_null() {
        child = new_message(d.arena, child_layout, None)?.as_ptr();
        unsafe { *slot = child };
    }
    let child_nn = unsafe { NonNull::new_unchecked(child) };
    let end = crate::delimited(d, ptr, |d, p| dispatch(d, p, child_nn, child_layout, 0))?;
    if d.end_group != 0 {
        return Err(group_mismatch());
    }
    Ok(end)
}

fn store_scalar(
    d: &Decoder<'_>,
    msg: NonNull<u8>,
    spec: &FieldSpec,
    hasbits: &mut u64,
    val: u64,
) -> Result<(), DecodeError> {
    let valbytes = spec.kind.valbytes();
    let slot = field_slot(d, msg, spec, hasbits, valbytes)?;
    unsafe {
        match valbytes {
            1 => *slot = val as u8,
            4 => (slot as *mut u32).write_unaligned(val as u32),
            8 => (slot as *mut u64).write_unaligned(val),
            _ => unreachable!(),
        }
    }
    Ok(())
}

fn store_view(
    d: &Decoder<'_>,
    msg: NonNull<u8>,
    spec: &FieldSpec,
    hasbits: &mut u64,
    view: StrView,
) -> Result<(), DecodeError> {
    let slot = field_slot(d, msg, spec, hasbits, std::mem::size_of::<StrView>())?;
    unsafe { (slot as *mut StrView).write_unaligned(view) };
    Ok(())
}

fn field_slot(
    d: &Decoder<'_>,
    msg: NonNull<u8>,
    spec: &FieldSpec,
    hasbits: &mut u64,
    valbytes: usize,
) -> Result<*mut u8, DecodeError> {
    match spec.card {
        Cardinality::Singular => {
            *hasbits |= 1u64 << spec.hasbit;
            Ok(unsafe { msg.as_ptr().add(spec.offset as usize) })
        }
        Cardinality::Oneof => unsafe {
            let case = msg.as_ptr().add(spec.case_offset as usize) as *mut u32;
            case.write_unaligned(spec.number);
            Ok(msg.as_ptr().add(spec.offset as usize))
        },
        Cardinality::Repeated { .. } => {
            repeated_push(d.arena, msg, spec.offset as usize, valbytes)
        }
    }
}

fn skip_unknown(
    d: &mut Decoder<'_>,
    ptr: usize,
    wire_type: u8,
    field_number: u32,
) -> Result<usize, DecodeError> {
    match wire_type {
        WT_VARINT => {
            let (next, _) = wire::read_varint(d.buf, ptr).ok_or_else(malformed_varint)?;
            Ok(next)
        }
        WT_FIXED64 => {
            if !wire::fits(ptr, 8, d.limit_ptr) {
                return Err(buffer_underrun());
            }
            Ok(ptr + 8)
        }
        WT_DELIMITED => {
            let (next, size) = wire::read_size(d.buf, ptr)?;
            let size = size as usize;
            if !wire::fits(next, size, d.limit_ptr) {
                return Err(buffer_underrun());
            }
            Ok(next + size)
        }
        WT_START_GROUP => skip_group(d, ptr, field_number),
        WT_FIXED32 => {
            if !wire::fits(ptr, 4, d.limit_ptr) {
                return Err(buffer_underrun());
            }
            Ok(ptr + 4)
        }
        _ => Err(malformed_wire()),
    }
}

/// Skip a group whose start tag (field `opening`) was already consumed,
/// including arbitrarily nested inner groups. End tags must close groups in
/// strict nesting order.
fn skip_group(d: &mut Decoder<'_>, mut ptr: usize, opening: u32) -> Result<usize, DecodeError> {
    let mut stack: Vec<u32> = vec![opening];
    while let Some(&expect) = stack.last() {
        if d.is_done(ptr) {
            return Err(buffer_underrun());
        }
        let (next, tag) = wire::read_varint(d.buf, ptr).ok_or_else(malformed_varint)?;
        if tag > u32::MAX as u64 {
            return Err(malformed_wire());
        }
        ptr = next;
        let number = (tag >> 3) as u32;
        let wt = (tag & 7) as u8;
        if number == 0 {
            return Err(malformed_wire());
        }
        match wt {
            WT_END_GROUP => {
                if number != expect {
                    return Err(group_mismatch());
                }
                stack.pop();
            }
            WT_START_GROUP => {
                if stack.len() >= d.depth as usize + 1 {
                    return Err(recursion_too_deep());
                }
                stack.push(number);
            }
            _ => ptr = skip_unknown(d, ptr, wt, number)?,
        }
    }
    Ok(ptr)
}
