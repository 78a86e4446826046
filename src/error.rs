//! # Error Types
//!
//! Two layers of error reporting:
//!
//! - [`LookupError`]: structural identifier and name errors raised by the
//!   object registry. Always detected synchronously and never retried.
//! - [`Status`]: status codes handed back to API layers and, through the
//!   wait record, to threads woken up by someone else.
//!
//! Protocol violations (claiming a claimed wait record, running a life
//! action with undrained wait-lock requests, removing a home scheduler
//! node) are assertion failures and have no error value.

use core::fmt;

/// Result type of the thread and registry operations.
pub type KernelResult<T> = Result<T, Status>;

// ---------------------------------------------------------------------------
// Registry lookup errors
// ---------------------------------------------------------------------------

/// Error raised by identifier and name lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// The name is the null name or no published object carries it.
    InvalidName,
    /// Malformed identifier: wrong API or class, or index out of range.
    InvalidId,
    /// The requested cluster node does not exist.
    InvalidNode,
    /// Valid index, but the slot is currently not published.
    Unpublished,
}

impl LookupError {
    /// API layers report both structural and empty-slot failures as
    /// "object not found".
    pub const fn is_not_found(&self) -> bool {
        matches!(self, LookupError::InvalidId | LookupError::Unpublished)
    }
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LookupError::InvalidName => "invalid object name",
            LookupError::InvalidId => "invalid object id",
            LookupError::InvalidNode => "invalid node",
            LookupError::Unpublished => "object not published",
        };
        f.write_str(text)
    }
}

impl core::error::Error for LookupError {}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Status codes of thread and thread queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Successful,
    /// A timed wait expired before the event arrived.
    Timeout,
    /// The request could not be satisfied right now.
    Unsatisfied,
    /// No free slot in the object class.
    TooMany,
    InvalidId,
    InvalidName,
    InvalidNode,
    InvalidPriority,
    /// Invalid count or processor set.
    InvalidNumber,
    /// The object is in the wrong state for the request.
    IncorrectState,
    ResourceInUse,
    /// A thread tried to wait for itself.
    Deadlock,
    /// The object waited on was deleted.
    ObjectWasDeleted,
    NoMemory,
    /// The waiting thread was restarted.
    Restarted,
    /// The waiting thread was terminated.
    Terminated,
}

impl Status {
    pub const fn is_successful(&self) -> bool {
        matches!(self, Status::Successful)
    }
}

impl From<LookupError> for Status {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::InvalidName => Status::InvalidName,
            LookupError::InvalidId | LookupError::Unpublished => Status::InvalidId,
            LookupError::InvalidNode => Status::InvalidNode,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Successful => "successful",
            Status::Timeout => "timeout",
            Status::Unsatisfied => "unsatisfied",
            Status::TooMany => "too many objects",
            Status::InvalidId => "invalid id",
            Status::InvalidName => "invalid name",
            Status::InvalidNode => "invalid node",
            Status::InvalidPriority => "invalid priority",
            Status::InvalidNumber => "invalid number",
            Status::IncorrectState => "incorrect state",
            Status::ResourceInUse => "resource in use",
            Status::Deadlock => "deadlock",
            Status::ObjectWasDeleted => "object was deleted",
            Status::NoMemory => "no memory",
            Status::Restarted => "restarted",
            Status::Terminated => "terminated",
        };
        f.write_str(text)
    }
}

impl core::error::Error for Status {}
