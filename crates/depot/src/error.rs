//! Depot Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! The split between transient and permanent failures matters more here than
//! anywhere else in the workspace: the retrying executor in `depotsync-engine`
//! consults [`ErrorKind::is_retryable`] and nothing else when deciding whether
//! to reconnect and try again.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::time::Duration;

/// A depot error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for depot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The connection to the server dropped mid-command.
    #[display("session dropped: {_0}")]
    SessionDropped(#[error(not(source))] String),
    /// Server refused the command because it is overloaded.
    #[display("server busy: {_0}")]
    ServerBusy(#[error(not(source))] String),
    /// The command did not finish within its deadline.
    #[display("command timed out after {}ms", _0.as_millis())]
    TimedOut(#[error(not(source))] Duration),
    /// Underlying I/O error (local files touched by the depot client).
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Credentials rejected or ticket expired.
    #[display("unauthorized: {_0}")]
    Unauthorized(#[error(not(source))] String),
    /// The server rejected the request as malformed.
    #[display("invalid request: {_0}")]
    InvalidRequest(#[error(not(source))] String),
    /// File, changelist or label does not exist.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Depot path is malformed or contains reserved characters.
    #[display("invalid depot path: {_0}")]
    InvalidPath(#[error(not(source))] String),
    /// A command was issued before a session was established.
    #[display("not connected")]
    NotConnected,
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying (after re-establishing the session) might
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SessionDropped(_) | Self::ServerBusy(_) | Self::TimedOut(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::SessionDropped("reset by peer".into()), true)]
    #[case(ErrorKind::ServerBusy("too many clients".into()), true)]
    #[case(ErrorKind::TimedOut(Duration::from_secs(2)), true)]
    #[case(ErrorKind::Io(IoError::other("broken pipe")), true)]
    #[case(ErrorKind::Unauthorized("ticket expired".into()), false)]
    #[case(ErrorKind::InvalidRequest("bad spec".into()), false)]
    #[case(ErrorKind::NotFound("//depot/missing".into()), false)]
    #[case(ErrorKind::InvalidPath("//depot/a@b".into()), false)]
    #[case(ErrorKind::NotConnected, false)]
    fn test_retryable_classification(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(kind.is_retryable(), expected);
    }

    #[test]
    fn test_timeout_display() {
        let kind = ErrorKind::TimedOut(Duration::from_millis(2500));
        assert_eq!(kind.to_string(), "command timed out after 2500ms");
    }
}
