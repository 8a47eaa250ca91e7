//! The result taxonomy shared by every hub operation.

use thiserror::Error;

/// What can go wrong at the hub's public surface.
///
/// These are deliberately flat codes rather than nested error chains;
/// callers branch on them, and the interesting context goes to the log at
/// the point of failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// The destination buffer is too small for the value.
    #[error("destination buffer too small")]
    Overflow,

    /// Nothing lives at the given path (or under the given base).
    #[error("not found")]
    NotFound,

    /// A malformed path, a type mismatch, or an operation applied to an
    /// entry of the wrong kind.
    #[error("bad parameter")]
    BadParameter,

    /// A configured capacity was exhausted. The operation rolled back.
    #[error("out of memory")]
    NoMemory,

    /// A configuration update window is open; the push was coalesced and
    /// will be applied when the window closes.
    #[error("update in progress")]
    InProgress,

    /// Anything else.
    #[error("internal fault")]
    Fault,
}

pub type Result<T> = std::result::Result<T, Error>;
