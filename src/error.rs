//! The recoverable error type shared by all allocators of this crate.
//!
//! Only "expected" failures are reported through [`Error`]. Structural
//! corruption of the managed memory is never returned to the caller, but
//! reported by a panic instead.
use thiserror::Error;

/// A recoverable failure of an allocator operation.
///
/// None of the operations returning this error modify the allocator state when
/// failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The arguments are unusable, e.g. a zero-sized request or a memory
    /// region, that cannot hold a single block.
    #[error("invalid argument")]
    InvalidArgument,
    /// There is not enough (suitably aligned) memory to satisfy the request.
    #[error("resource exhausted")]
    ResourceExhausted,
    /// The request exceeds what the block or allocator could ever provide, or
    /// a pointer lies outside of the managed memory region.
    #[error("out of range")]
    OutOfRange,
    /// The block is not in the state required by the operation, e.g. it is
    /// already in use.
    #[error("failed precondition")]
    FailedPrecondition,
    /// The pointer does not belong to any allocation of this allocator.
    #[error("not found")]
    NotFound,
    /// The allocator does not support the requested query.
    #[error("unimplemented")]
    Unimplemented,
}
