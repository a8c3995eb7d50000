//! Error types for the [`package`](super) module.
//!
//! Inner functions raise these; the public entry points wrap them in
//! [`crate::error::ErrorKind::Package`] so callers see one engine error with
//! the packaging cause kept as a child.

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A remote step (describe, sync, workspace mapping) failed.
    Depot,
    /// Reading or writing the zip archive failed.
    Archive,
    /// A required archive entry is absent.
    #[display("archive has no `{_0}` entry")]
    MissingEntry(#[error(not(source))] String),
    /// `.metadata` could not be written or parsed.
    Metadata,
    /// A transfer script template failed to compile or render.
    Template,
    /// Reading a workspace file or preparing the output path failed.
    Io,
    #[display("changelist {_0} has no files under the branch root")]
    Empty(#[error(not(source))] u32),
}
