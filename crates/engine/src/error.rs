//! Engine Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Each variant names the subsystem
//! that failed; the underlying cause (a depot error, an I/O error, ...) is
//! kept as a child in the error tree.

use derive_more::{Display, Error};

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A remote operation failed with an error that retrying cannot fix.
    #[display("remote operation `{_0}` failed")]
    Remote(#[error(not(source))] String),
    /// A remote operation kept failing transiently until retries ran out.
    #[display("remote operation `{operation}` failed after {attempts} attempts")]
    RetriesExhausted {
        #[error(not(source))]
        operation: String,
        #[error(not(source))]
        attempts: u32,
    },
    /// Building a snapshot from depot metadata failed.
    Snapshot,
    /// Reading or writing a persisted `.revisions`/`.reconcile` artifact failed.
    Artifact,
    /// Walking or reading the local working copy failed.
    LocalFiles,
    /// Packaging or unpackaging a changeset failed.
    Package,
    /// Applying a reconcile plan failed.
    Reconcile,
    /// A changelist housekeeping step could not complete.
    #[display("changelist {_0}: {_1}")]
    Changelist(#[error(not(source))] u32, #[error(not(source))] String),
    /// Caller supplied something the engine cannot work with.
    #[display("invalid input: {_0}")]
    Invalid(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    ///
    /// Always `false`: transient remote failures are already retried by the
    /// [`RetryingExecutor`](crate::RetryingExecutor) before they surface here.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
