//! Resilient synchronization and reconciliation against a remote depot.
//!
//! The building blocks are pure: [`Snapshot`]s of a file set are compared
//! with [`diff`](diff::diff) and large path lists are split by the
//! [batch planner](batch::plan). Every remote call goes through a
//! [`RetryingExecutor`], which owns the one [`Session`] of a depot
//! connection and re-establishes it between attempts.
//!
//! The use cases built on top of them ([`sync`], [`package`], [`split`],
//! [`consistency`], [`reconcile`], [`changelist`]) ask a [`Confirm`]
//! implementation before changing anything in bulk.

pub mod batch;
pub mod changelist;
pub mod checksum;
pub mod confirm;
pub mod consistency;
pub mod diff;
pub mod error;
pub mod labels;
pub mod package;
pub mod reconcile;
pub mod retry;
pub mod snapshot;
pub mod split;
pub mod sync;

pub use crate::batch::{Batch, BatchLimits};
pub use crate::confirm::{AutoConfirm, Confirm, Decline, Outcome, Scripted};
pub use crate::diff::{Diff, diff};
pub use crate::reconcile::ReconcilePlan;
pub use crate::retry::{Attempt, RetryPolicy, RetryingExecutor, Session};
pub use crate::snapshot::{Snapshot, SnapshotBuilder};
use depotsync_config::Config;
use std::fmt;
use std::path::PathBuf;

/// Engine-wide knobs shared by every use case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Directory depth at which discovery switches from `*` to `...`.
    pub recursion_depth: usize,
    /// Batch bounds; `max_count` is also the metadata query page size.
    pub limits: BatchLimits,
    /// How many changelists to list when browsing history or pending work.
    pub changes_to_receive: usize,
    /// Where `.revisions` and `.reconcile` artifacts are written. `None`
    /// disables writing them.
    pub settings_dir: Option<PathBuf>,
}
impl Default for Options {
    fn default() -> Self {
        Self { recursion_depth: 2, limits: BatchLimits::default(), changes_to_receive: 300, settings_dir: None }
    }
}
impl From<&Config> for Options {
    fn from(config: &Config) -> Self {
        Self {
            recursion_depth: config.folder_recursion_depth,
            limits: BatchLimits { max_count: config.max_files_per_chunk, max_size_kb: config.max_chunk_size_kb },
            changes_to_receive: config.changes_to_receive,
            settings_dir: Some(config.settings_dir()),
        }
    }
}

/// An item left out of an operation because a local precondition failed
/// (missing source file, unreadable file, unmappable name, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub path: String,
    pub reason: String,
}
impl Skipped {
    pub fn new(path: impl Into<String>, reason: impl fmt::Display) -> Self {
        let skipped = Self { path: path.into(), reason: reason.to_string() };
        tracing::warn!(path = %skipped.path, reason = %skipped.reason, "Skipping");
        skipped
    }
}
