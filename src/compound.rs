//! Sub-message field specialists: recursive descent with a depth budget,
//! ceiling-sized child allocation, and the delimited window discipline.

use std::ptr::NonNull;

use crate::error::{group_mismatch, recursion_too_deep, DecodeError};
use crate::record::{get_field, new_message, next_repeated, resize_arr, sync_hasbits, FieldArr, Next};
use crate::table::{
    check_tag, data_case_offset, data_oneof_field, data_submsg_index, Card, MessageLayout,
    SizeCeiling, TagWidth,
};
use crate::{delimited, dispatch, generic, Control, Decoder};

const PTRBYTES: usize = std::mem::size_of::<*mut u8>();

#[allow(clippy::too_many_arguments)]
pub(crate) fn message(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    data: u64,
    card: Card,
    tag: TagWidth,
    ceil: SizeCeiling,
) -> Result<Control, DecodeError> {
    match tag {
        TagWidth::One => message_entry::<1>(d, ptr, msg, table, hasbits, data, card, ceil),
        TagWidth::Two => message_entry::<2>(d, ptr, msg, table, hasbits, data, card, ceil),
    }
}

#[inline(always)]
#[allow(clippy::too_many_arguments)]
fn message_entry<const TAGBYTES: usize>(
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    mut data: u64,
    card: Card,
    ceil: SizeCeiling,
) -> Result<Control, DecodeError> {
    if !check_tag(data, TAGBYTES) || card == Card::Packed {
        return generic::fallback(d, ptr, msg, table, hasbits);
    }
    if d.depth == 0 {
        return Err(recursion_too_deep());
    }
    d.depth -= 1;

    // Read everything the xor residue encodes before get_field clobbers
    // `data` on the repeated path.
    let child_layout: &MessageLayout = &table.submsgs[data_submsg_index(data)];
    // Storage left behind by a different oneof arm is junk, not a child
    // record; the case slot still holds the previous arm here.
    let fresh_oneof = card == Card::Oneof && {
        let case =
            unsafe { (msg.as_ptr().add(data_case_offset(data)) as *const u32).read_unaligned() };
        case != data_oneof_field(data)
    };

    let mut farr = FieldArr::default();
    let dst_result = get_field(d, ptr, msg, &mut data, hasbits, &mut farr, PTRBYTES, card);
    let result = match dst_result {
        Ok(dst) => {
            if card == Card::Singular {
                sync_hasbits(msg, *hasbits);
                *hasbits = 0;
            }
            run_submsg::<TAGBYTES>(
                d,
                ptr,
                dst as *mut *mut u8,
                child_layout,
                card,
                ceil,
                fresh_oneof,
                &mut farr,
                data,
            )
        }
        Err(err) => Err(err),
    };
    // The budget is restored on every exit path, error or not.
    d.depth += 1;
    result.map(Control::Continue)
}

#[inline(always)]
#[allow(clippy::too_many_arguments)]
fn run_submsg<const TAGBYTES: usize>(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    mut dst: *mut *mut u8,
    child_layout: &MessageLayout,
    card: Card,
    ceil: SizeCeiling,
    fresh_oneof: bool,
    farr: &mut FieldArr,
    data: u64,
) -> Result<usize, DecodeError> {
    loop {
        if card == Card::Repeated {
            dst = resize_arr(d.arena, dst as *mut u8, farr, PTRBYTES)? as *mut *mut u8;
        }
        let mut child = unsafe { *dst };
        if card == Card::Repeated || child.is_null() || fresh_oneof {
            child = new_message(d.arena, child_layout, ceil.bytes())?.as_ptr();
            unsafe { *dst = child };
        }
        ptr += TAGBYTES;
        let child_nn = unsafe { NonNull::new_unchecked(child) };
        ptr = delimited(d, ptr, |d, p| dispatch(d, p, child_nn, child_layout, 0))?;
        if d.end_group != 0 {
            return Err(group_mismatch());
        }
        if card != Card::Repeated {
            return Ok(ptr);
        }
        let ret = next_repeated(d, dst as *mut u8, ptr, farr, data, TAGBYTES, PTRBYTES);
        match ret.next {
            Next::SameField => dst = ret.dst as *mut *mut u8,
            Next::OtherField | Next::AtLimit => return Ok(ptr),
        }
    }
}
