//! Remote depot trait and implementations.
//!
//! This module defines the [`Depot`] trait: the opaque RPC surface of a
//! remote versioned file store. Nothing in this workspace speaks the store's
//! wire protocol directly; a concrete client implements this trait and every
//! call is routed through the retrying executor in `depotsync-engine`.

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use self::mock::MockDepot;
use crate::error::Result;
use crate::models::{ChangelistDescription, ChangelistQuery, ChangelistSummary, Credentials, FileRecord, FileSpec};
use crate::models::LabelSummary;
use async_trait::async_trait;
use std::path::PathBuf;

/// Unified interface for a remote depot.
///
/// All operations are asynchronous so that the caller can bound each one with
/// a deadline. Implementations hold a single session; callers must not issue
/// two commands concurrently against the same handle.
///
/// # Path Handling
/// File arguments are full depot paths (`//depot/branch/file`). Metadata and
/// directory queries additionally accept the `*` (one level) and `...` (all
/// levels) wildcards in the final segment of a [`FileSpec`].
///
/// # Examples
///
/// ```
/// use depotsync_depot::{Depot, FileSpec, Revision, error::Result};
///
/// async fn head_size(depot: &dyn Depot, path: &str) -> Result<Option<u64>> {
///     let records = depot.get_metadata(&[FileSpec::new(path, Revision::Head)]).await?;
///     Ok(records.first().and_then(|r| r.size))
/// }
/// ```
#[async_trait]
pub trait Depot: Send + Sync {
    /// Name of the depot connection (used for logging only).
    fn name(&self) -> &str;

    /// Establish (or re-establish) an authenticated session.
    async fn connect(&self, credentials: &Credentials) -> Result<()>;

    /// Select the workspace (client) that subsequent commands operate on.
    async fn set_working_set(&self, name: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Fetch file metadata for every file matched by `specs`.
    ///
    /// Files that do not exist at the requested revision are simply absent
    /// from the result. Files deleted at the requested revision are returned
    /// with [`size`](FileRecord::size) set to `None`.
    async fn get_metadata(&self, specs: &[FileSpec]) -> Result<Vec<FileRecord>>;

    /// List the immediate subdirectories matched by a `dir/*` spec.
    ///
    /// Directories whose every file is deleted at the revision are only
    /// returned when `include_deleted` is set.
    async fn list_subdirectories(&self, spec: &FileSpec, include_deleted: bool) -> Result<Vec<String>>;

    /// Bring the workspace to the given revisions, returning the depot paths
    /// that were updated. `force` ignores the workspace's have-state and
    /// rewrites files even if they are believed to be current.
    async fn sync_files(&self, specs: &[FileSpec], force: bool) -> Result<Vec<String>>;

    /// Create a pending changelist, returning its id.
    async fn create_changelist(&self, description: &str) -> Result<u32>;

    /// Move opened files into another pending changelist, returning the paths
    /// that were moved.
    async fn reopen_files(&self, paths: &[String], changelist: u32) -> Result<Vec<String>>;

    async fn add_files(&self, paths: &[String], changelist: u32) -> Result<Vec<String>>;

    async fn edit_files(&self, paths: &[String], changelist: u32) -> Result<Vec<String>>;

    async fn delete_files(&self, paths: &[String], changelist: u32) -> Result<Vec<String>>;

    /// Submit a pending changelist, returning the submitted changelist id.
    async fn submit_changelist(&self, changelist: u32) -> Result<u32>;

    /// Files opened in the current workspace, optionally restricted to a
    /// path list and/or a single changelist.
    async fn get_opened_files(&self, paths: &[String], changelist: Option<u32>) -> Result<Vec<FileRecord>>;

    async fn list_labels(&self, filter: Option<&str>) -> Result<Vec<LabelSummary>>;

    async fn list_changelists(&self, query: &ChangelistQuery) -> Result<Vec<ChangelistSummary>>;

    /// Full details of one changelist, including every file it touches.
    async fn describe_changelist(&self, changelist: u32) -> Result<ChangelistDescription>;

    /// Delete an empty pending changelist.
    async fn delete_changelist(&self, changelist: u32) -> Result<()>;

    /// Discard the shelved files of a pending changelist.
    async fn delete_shelved_files(&self, changelist: u32) -> Result<()>;

    /// Map a depot path onto the workspace's local filesystem.
    async fn map_to_local(&self, depot_path: &str) -> Result<PathBuf>;
}
