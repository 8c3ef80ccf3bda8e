//! Error Types
//!
//! Recoverable outcomes only. Resource exhaustion and I/O failure travel
//! as ordinary `Result` values; broken invariants (double free, unlock of
//! a lock not held, double busy, pin underflow, duplicate page-cache key,
//! arena coverage break) panic at the point of detection.

use thiserror::Error;

/// VM operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// No free page frame or heap memory; wait on memory pressure and retry
    #[error("out of memory")]
    NoMemory,
    /// The pager failed to read or write the page
    #[error("pager I/O error")]
    Io,
    /// Nothing backs the requested key
    #[error("not found")]
    NotFound,
    /// Address not mapped, or access not permitted
    #[error("bad address or access")]
    Fault,
    /// Invalid argument
    #[error("invalid argument")]
    InvalidArgument,
}

/// Wait operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// Timeout expired before a wakeup
    #[error("wait timed out")]
    TimedOut,
    /// Woken by an interrupt request
    #[error("wait interrupted")]
    Interrupted,
    /// The keyed value no longer matched when the waiter registered
    #[error("value changed")]
    ValueChanged,
    /// The key does not name valid memory
    #[error("bad wait address")]
    Fault,
}

/// Address-interval allocator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// No free run is large enough
    #[error("no space in arena")]
    NoSpace,
    /// The requested fixed range is not entirely free
    #[error("range not free")]
    NotFree,
    /// Zero size, bad alignment, or a range that wraps around
    #[error("invalid arena request")]
    InvalidArgument,
}

/// Pager errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PagerError {
    /// Backing store I/O failed
    #[error("backing store I/O error")]
    Io,
    /// The pager has nothing for this key
    #[error("no backing for key")]
    NotFound,
    /// The pager does not implement the operation
    #[error("operation not supported by pager")]
    Unsupported,
}

impl From<PagerError> for VmError {
    fn from(err: PagerError) -> Self {
        match err {
            PagerError::Io | PagerError::Unsupported => VmError::Io,
            PagerError::NotFound => VmError::NotFound,
        }
    }
}

impl From<ArenaError> for VmError {
    fn from(err: ArenaError) -> Self {
        match err {
            ArenaError::NoSpace => VmError::NoMemory,
            ArenaError::NotFree | ArenaError::InvalidArgument => VmError::InvalidArgument,
        }
    }
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;
