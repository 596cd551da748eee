//! Decode failures. Every kind is fatal to the decode that raised it.
//!
//! Constructors are `#[cold]` so the error paths stay out of the dispatch
//! hot loop.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A varint ran past ten bytes, or its tenth byte carried more than one
    /// significant bit.
    #[error("malformed varint")]
    MalformedVarint,

    /// Structurally invalid wire data: a bad wire type, a field number of
    /// zero, or a packed fixed-width run whose length is not a multiple of
    /// the element width.
    #[error("malformed wire data")]
    MalformedWire,

    /// A length prefix of 2 GiB or more.
    #[error("length prefix exceeds 2 GiB")]
    SizeOverflow,

    /// A declared region extends past the current input limit.
    #[error("declared region exceeds input")]
    BufferUnderrun,

    /// Sub-message nesting exhausted the depth budget.
    #[error("message nesting exceeds depth limit")]
    RecursionTooDeep,

    /// A group delimiter closed a frame that was not opened by a matching
    /// start tag.
    #[error("unbalanced group delimiters")]
    GroupMismatch,

    /// The arena refused an allocation.
    #[error("arena allocation failed")]
    OutOfMemory,
}

#[cold]
pub(crate) fn malformed_varint() -> DecodeError {
    DecodeError::MalformedVarint
}

#[cold]
pub(crate) fn malformed_wire() -> DecodeError {
    DecodeError::MalformedWire
}

#[cold]
pub(crate) fn size_overflow() -> DecodeError {
    DecodeError::SizeOverflow
}

#[cold]
pub(crate) fn buffer_underrun() -> DecodeError {
    DecodeError::BufferUnderrun
}

#[cold]
pub(crate) fn recursion_too_deep() -> DecodeError {
    DecodeError::RecursionTooDeep
}

#[cold]
pub(crate) fn group_mismatch() -> DecodeError {
    DecodeError::GroupMismatch
}

#[cold]
pub(crate) fn out_of_memory() -> DecodeError {
    DecodeError::OutOfMemory
}
