use thiserror::Error;

/// Errors returned by buffer operations.
///
/// Except for `AllocationFailure`, these are local and recoverable: the operation returns without
///  modifying the buffer, and the caller decides how to proceed. `AllocationFailure` must be
///  propagated to the owner of the connection, which is expected to tear the connection down.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum BufferError {
    /// the slot for this packet is already occupied, or the packet is behind the ACK cursor
    #[error("duplicate data at offset {offset}")]
    DuplicateData { offset: i32 },

    /// backpressure: there is no room for the data right now
    #[error("buffer is full ({capacity} packets)")]
    BufferFull { capacity: usize },

    #[error("failed to allocate storage for {requested} additional blocks")]
    AllocationFailure { requested: usize },

    /// an offset or count beyond the buffered range
    #[error("offset {offset} is outside the valid range 0..{limit}")]
    InvalidOffset { offset: usize, limit: usize },

    #[error("buffer was closed")]
    Closed,
}
