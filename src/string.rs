//! String and bytes field specialists.
//!
//! Two bodies exist per tag width: an alias specialist that points views
//! straight into the input buffer, and a copy specialist that lands them in
//! the arena through size-bucketed reservations. The dispatch table always
//! routes to the alias entry; it delegates to the copy body whenever the
//! decode did not enable aliasing. Values with multi-byte length prefixes,
//! and values the fast checks cannot place, go through the out-of-line long
//! path.

use std::ptr::NonNull;

use crate::error::{buffer_underrun, malformed_varint, out_of_memory, DecodeError};
use crate::record::{
    commit_arr, get_field, next_repeated, resize_arr, FieldArr, Next, StrView,
};
use crate::table::{check_tag, Card, MessageLayout, TagWidth};
use crate::{generic, wire, Control, Decoder};

const VIEWBYTES: usize = std::mem::size_of::<StrView>();

pub(crate) fn string(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    data: u64,
    card: Card,
    tag: TagWidth,
) -> Result<Control, DecodeError> {
    match tag {
        TagWidth::One => string_entry::<1>(d, ptr, msg, table, hasbits, data, card),
        TagWidth::Two => string_entry::<2>(d, ptr, msg, table, hasbits, data, card),
    }
}

#[inline(always)]
fn string_entry<const TAGBYTES: usize>(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    data: u64,
    card: Card,
) -> Result<Control, DecodeError> {
    if !check_tag(data, TAGBYTES) || card == Card::Packed {
        return generic::fallback(d, ptr, msg, table, hasbits);
    }
    if !d.alias {
        return copy_string::<TAGBYTES>(d, ptr, msg, table, hasbits, data, card);
    }
    alias_string::<TAGBYTES>(d, ptr, msg, table, hasbits, data, card)
}

#[inline(always)]
fn alias_string<const TAGBYTES: usize>(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    msg: NonNull<u8>,
    _table: &MessageLayout,
    hasbits: &mut u64,
    mut data: u64,
    card: Card,
) -> Result<Control, DecodeError> {
    let mut farr = FieldArr::default();
    let mut dst =
        get_field(d, ptr, msg, &mut data, hasbits, &mut farr, VIEWBYTES, card)? as *mut StrView;
    loop {
        if card == Card::Repeated {
            dst = resize_arr(d.arena, dst as *mut u8, &mut farr, VIEWBYTES)? as *mut StrView;
        }
        let size = *d.buf.get(ptr + TAGBYTES).ok_or_else(malformed_varint)? as usize;
        ptr += TAGBYTES + 1;
        if size < 0x80 && wire::fits(ptr, size, d.end) {
            unsafe { dst.write_unaligned(StrView::aliased(d.buf.as_ptr().add(ptr), size)) };
            ptr += size;
        } else {
            if card == Card::Repeated {
                // Count the slot the long path is about to fill.
                commit_arr(unsafe { (dst as *mut u8).add(VIEWBYTES) }, &farr, VIEWBYTES);
            }
            ptr -= 1;
            return longstring(d, ptr, dst).map(Control::Continue);
        }
        if card != Card::Repeated {
            break;
        }
        let ret = next_repeated(d, dst as *mut u8, ptr, &farr, data, TAGBYTES, VIEWBYTES);
        match ret.next {
            Next::SameField => {
                dst = ret.dst as *mut StrView;
                if !d.alias {
                    // Aliasing stopped mid-run; commit what we have and let
                    // dispatch select the copy specialist for the rest.
                    commit_arr(ret.dst, &farr, VIEWBYTES);
                    return Ok(Control::Continue(ptr));
                }
            }
            Next::OtherField | Next::AtLimit => return Ok(Control::Continue(ptr)),
        }
    }
    Ok(Control::Continue(ptr))
}

#[inline(always)]
fn copy_string<const TAGBYTES: usize>(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    msg: NonNull<u8>,
    _table: &MessageLayout,
    hasbits: &mut u64,
    mut data: u64,
    card: Card,
) -> Result<Control, DecodeError> {
    debug_assert!(!d.alias);
    let mut farr = FieldArr::default();
    let mut dst =
        get_field(d, ptr, msg, &mut data, hasbits, &mut farr, VIEWBYTES, card)? as *mut StrView;
    loop {
        if card == Card::Repeated {
            dst = resize_arr(d.arena, dst as *mut u8, &mut farr, VIEWBYTES)? as *mut StrView;
        }
        let size = *d.buf.get(ptr + TAGBYTES).ok_or_else(malformed_varint)? as usize;
        ptr += TAGBYTES + 1;
        // Buckets reserve 16, 32, 64 or 128 arena bytes in one bump; the
        // copy itself is exact. The first bucket budgets for the tag and
        // length prefix the way the record's neighbors were sized.
        let bucket = if size <= 15 - TAGBYTES {
            16
        } else if size <= 32 {
            32
        } else if size <= 64 {
            64
        } else if size <= 128 {
            128
        } else {
            0
        };
        if size < 0x80 && bucket != 0 && d.arena.head_room() >= bucket
            && wire::fits(ptr, size, d.end)
        {
            let copy = d.arena.head_ptr();
            d.arena.bump_head(bucket);
            unsafe {
                std::ptr::copy_nonoverlapping(d.buf.as_ptr().add(ptr), copy, size);
                dst.write_unaligned(StrView::copied(copy, size));
            }
            ptr += size;
        } else {
            if card == Card::Repeated {
                commit_arr(unsafe { (dst as *mut u8).add(VIEWBYTES) }, &farr, VIEWBYTES);
            }
            ptr -= 1;
            return longstring(d, ptr, dst).map(Control::Continue);
        }
        if card != Card::Repeated {
            break;
        }
        let ret = next_repeated(d, dst as *mut u8, ptr, &farr, data, TAGBYTES, VIEWBYTES);
        match ret.next {
            Next::SameField => dst = ret.dst as *mut StrView,
            Next::OtherField | Next::AtLimit => return Ok(Control::Continue(ptr)),
        }
    }
    Ok(Control::Continue(ptr))
}

/// Long-string path: a full length prefix, an exact bounds check, then an
/// alias or an exact arena copy. The cursor sits on the size prefix.
#[inline(never)]
fn longstring(
    d: &mut Decoder<'_>,
    ptr: usize,
    dst: *mut StrView,
) -> Result<usize, DecodeError> {
    let (next, size) = wire::read_size(d.buf, ptr)?;
    let size = size as usize;
    if !wire::fits(next, size, d.end) {
        return Err(buffer_underrun());
    }
    if d.alias {
        unsafe { dst.write_unaligned(StrView::aliased(d.buf.as_ptr().add(next), size)) };
    } else {
        let copy = d.arena.alloc(size).ok_or_else(out_of_memory)?;
        unsafe {
            std::ptr::copy_nonoverlapping(d.buf.as_ptr().add(next), copy.as_ptr(), size);
            dst.write_unaligned(StrView::copied(copy.as_ptr(), size));
        }
    }
    Ok(next + size)
}
