//! Fast-path decoder for tag-prefixed, length-delimited wire data.
//!
//! Each message type carries a 32-entry dispatch table indexed by the low
//! five bits of the first tag byte. Every entry names a parser specialized
//! for one field shape (wire type, cardinality, tag width, value width), so
//! decoding a well-formed stream is a tight loop of table lookups and
//! specialist runs writing straight into preallocated arena records. Inputs
//! the table cannot handle fall back to a generic slow path.
//!
//! ```
//! use fastwire::{decode, Arena, FieldKind, LayoutBuilder};
//!
//! let layout = LayoutBuilder::new().scalar(1, FieldKind::Int32).finish();
//! let arena = Arena::new();
//! let msg = decode(&[0x08, 0x2A], &layout, &arena).unwrap();
//! assert_eq!(msg.scalar::<i32>(&layout, 1), 42);
//! ```

mod arena;
mod compound;
mod error;
mod generic;
mod record;
mod scalar;
mod string;
mod table;
mod wire;

pub use arena::Arena;
pub use error::DecodeError;
pub use record::{MessageRef, Scalar, StrOrigin, StrView};
pub use table::{
    Card, Cardinality, FastTableEntry, FieldKind, FieldParser, FieldSpec, FixedWidth,
    LayoutBuilder, MessageLayout, OneofMember, SizeCeiling, TagWidth, VarintKind,
};

use std::ptr::NonNull;

use tracing::debug;

use error::{buffer_underrun, group_mismatch, malformed_varint};
use record::sync_hasbits;

#[derive(Clone, Copy, Debug)]
pub struct DecodeOptions {
    /// Let string and bytes fields point straight into the input buffer
    /// instead of copying into the arena. The views then borrow the input.
    pub alias_strings: bool,
    /// Sub-message nesting budget.
    pub depth_limit: u16,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions { alias_strings: false, depth_limit: 100 }
    }
}

/// Decode one message with default options.
pub fn decode<'a>(
    buf: &'a [u8],
    layout: &MessageLayout,
    arena: &'a Arena,
) -> Result<MessageRef<'a>, DecodeError> {
    decode_with_options(buf, layout, arena, DecodeOptions::default())
}

/// Decode one message. The record and everything it points at live in the
/// arena; with [`DecodeOptions::alias_strings`] set, string views borrow
/// from `buf` as well.
pub fn decode_with_options<'a>(
    buf: &'a [u8],
    layout: &MessageLayout,
    arena: &'a Arena,
    options: DecodeOptions,
) -> Result<MessageRef<'a>, DecodeError> {
    let mut d = Decoder {
        buf,
        arena,
        end: buf.len(),
        limit: 0,
        limit_ptr: buf.len(),
        depth: options.depth_limit,
        alias: options.alias_strings,
        end_group: 0,
    };
    let msg = record::new_message(arena, layout, None)?;
    let result = dispatch(&mut d, 0, msg, layout, 0).and_then(|ptr| {
        debug_assert_eq!(ptr, buf.len());
        if d.end_group != 0 {
            Err(group_mismatch())
        } else {
            Ok(())
        }
    });
    match result {
        Ok(()) => Ok(MessageRef::new(msg)),
        Err(err) => {
            debug!(error = %err, "wire decode failed");
            Err(err)
        }
    }
}

/// State owned by one decode. Single-threaded and non-reentrant: the
/// specialists thread `(d, ptr, msg, table, hasbits, data)` through every
/// call and nothing else touches the arena while a decode runs.
pub(crate) struct Decoder<'a> {
    pub(crate) buf: &'a [u8],
    pub(crate) arena: &'a Arena,
    /// One past the last valid input byte.
    pub(crate) end: usize,
    /// Offset from `end` at which the current (sub-)message ends. Zero or
    /// negative while decoding a single buffer.
    pub(crate) limit: isize,
    /// `end + min(0, limit)`, kept current so the dispatch loop bound is one
    /// comparison.
    pub(crate) limit_ptr: usize,
    pub(crate) depth: u16,
    pub(crate) alias: bool,
    /// Field number an end-group delimiter closed, or zero.
    pub(crate) end_group: u32,
}

impl<'a> Decoder<'a> {
    #[inline(always)]
    pub(crate) fn is_done(&self, ptr: usize) -> bool {
        ptr >= self.limit_ptr
    }

    #[inline(always)]
    fn recompute_limit_ptr(&mut self) {
        self.limit_ptr = (self.end as isize + self.limit.min(0)) as usize;
    }

    /// Narrow the window to end at `ptr + len`. Returns the cookie that
    /// [`Decoder::pop_limit`] takes to restore the enclosing window.
    #[inline(always)]
    pub(crate) fn push_limit(&mut self, ptr: usize, len: usize) -> isize {
        let new_limit = ptr as isize + len as isize - self.end as isize;
        let delta = self.limit - new_limit;
        debug_assert!(delta >= 0);
        self.limit = new_limit;
        self.recompute_limit_ptr();
        delta
    }

    #[inline(always)]
    pub(crate) fn pop_limit(&mut self, delta: isize) {
        self.limit += delta;
        self.recompute_limit_ptr();
    }

    /// Whether `len` bytes at `ptr` stay inside the current window.
    #[inline(always)]
    pub(crate) fn region_fits(&self, ptr: usize, len: usize) -> bool {
        ptr as isize + len as isize - self.end as isize <= self.limit
    }

    /// The current frame must end exactly at `ptr`.
    #[inline(always)]
    pub(crate) fn check_frame_end(&self, ptr: usize) -> Result<(), DecodeError> {
        if ptr as isize - self.end as isize == self.limit {
            Ok(())
        } else {
            Err(buffer_underrun())
        }
    }
}

/// What a specialist tells the dispatch loop to do next.
pub(crate) enum Control {
    /// Keep dispatching at this cursor.
    Continue(usize),
    /// An end-group delimiter closed the current frame at this cursor.
    FrameEnd(usize),
}

/// The dispatch loop: bound check, two-byte tag load, table index, xor with
/// the expected tag, specialist run. Specialists return here after each
/// field (or each same-tag run), so the six-tuple of state stays in one
/// frame instead of chaining tail calls.
pub(crate) fn dispatch(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    mut hasbits: u64,
) -> Result<usize, DecodeError> {
    loop {
        if d.is_done(ptr) {
            let overrun = ptr as isize - d.end as isize;
            if overrun == d.limit {
                sync_hasbits(msg, hasbits);
                return Ok(ptr);
            }
            return refill_or_done(overrun);
        }
        let tag = wire::load_tag(d.buf, ptr);
        let idx = ((tag & 0xF8) >> 3) as usize;
        let entry = table.fasttable[idx];
        let data = entry.data ^ tag as u64;
        match run_parser(entry.parser, d, ptr, msg, table, &mut hasbits, data)? {
            Control::Continue(next) => ptr = next,
            Control::FrameEnd(next) => {
                sync_hasbits(msg, hasbits);
                return Ok(next);
            }
        }
    }
}

#[inline(always)]
fn run_parser(
    parser: FieldParser,
    d: &mut Decoder<'_>,
    ptr: usize,
    msg: NonNull<u8>,
    table: &MessageLayout,
    hasbits: &mut u64,
    data: u64,
) -> Result<Control, DecodeError> {
    match parser {
        FieldParser::Generic => generic::fallback(d, ptr, msg, table, hasbits),
        FieldParser::Varint { card, kind, tag } => {
            scalar::varint(d, ptr, msg, table, hasbits, data, card, kind, tag)
        }
        FieldParser::Fixed { card, width, tag } => {
            scalar::fixed(d, ptr, msg, table, hasbits, data, card, width, tag)
        }
        FieldParser::Str { card, tag } => {
            string::string(d, ptr, msg, table, hasbits, data, card, tag)
        }
        FieldParser::Message { card, tag, ceil } => {
            compound::message(d, ptr, msg, table, hasbits, data, card, tag, ceil)
        }
    }
}

/// Boundary handler for a cursor that crossed the window edge without
/// landing on it. A streaming build would refill the input here; this
/// decoder owns a single buffer, so the refill arm always terminates the
/// decode.
#[cold]
#[inline(never)]
fn refill_or_done(_overrun: isize) -> Result<usize, DecodeError> {
    Err(buffer_underrun())
}

/// Read a length prefix at `ptr`, run `body` inside the region's window,
/// and restore the enclosing window on every exit path. Returns the cursor
/// `body` finished at.
pub(crate) fn delimited<F>(
    d: &mut Decoder<'_>,
    mut ptr: usize,
    body: F,
) -> Result<usize, DecodeError>
where
    F: FnOnce(&mut Decoder<'_>, usize) -> Result<usize, DecodeError>,
{
    let b0 = *d.buf.get(ptr).ok_or_else(malformed_varint)? as usize;
    ptr += 1;
    if b0 < 0x80 && wire::fits(ptr, b0, d.limit_ptr) {
        // Short region inside the current window: the limits can be saved
        // and restored verbatim.
        let saved_limit = d.limit;
        let saved_limit_ptr = d.limit_ptr;
        d.limit_ptr = ptr + b0;
        d.limit = (ptr + b0) as isize - d.end as isize;
        debug_assert_eq!(d.limit_ptr, (d.end as isize + d.limit.min(0)) as usize);
        let ret = body(d, ptr);
        d.limit = saved_limit;
        d.limit_ptr = saved_limit_ptr;
        ret
    } else {
        let len = if b0 & 0x80 != 0 {
            let (next, len) = wire::read_longsize(d.buf, ptr, b0 as u32)?;
            ptr = next;
            len as usize
        } else {
            b0
        };
        if !d.region_fits(ptr, len) {
            return Err(buffer_underrun());
        }
        let delta = d.push_limit(ptr, len);
        let ret = body(d, ptr);
        d.pop_limit(delta);
        ret
    }
}
