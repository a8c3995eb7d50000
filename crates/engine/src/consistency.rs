//! Local working copy against depot consistency checks.
//!
//! Every local file under a branch's local root is matched to the depot
//! record at the same relative path and compared with record equality,
//! after kind-aware normalization (see [`checksum`](crate::checksum)).
//! Drift is classified, never treated as an error; fixing it is a separate,
//! confirmed [`remediate`] step.

use crate::batch::{self, no_size};
use crate::checksum;
use crate::confirm::Confirm;
use crate::error::{ErrorKind, Result};
use crate::retry::RetryingExecutor;
use crate::snapshot::{Snapshot, SnapshotBuilder};
use crate::{Options, Skipped};
use depotsync_depot::path::{depot_path_for, is_valid_file_name};
use depotsync_depot::{FileSpec, Revision};
use derive_more::Display;
use exn::ResultExt;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::instrument;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Classification {
    #[display("good")]
    Good,
    #[display("missing")]
    Missing,
    #[display("corrupt")]
    Corrupt,
    /// Differs, but the depot file type allows local modification.
    #[display("writable")]
    WritableOverride,
    #[display("extra")]
    Extra,
}

/// Depot paths per [`Classification`], each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub branch_root: String,
    pub local_root: PathBuf,
    pub good: Vec<String>,
    pub missing: Vec<String>,
    pub corrupt: Vec<String>,
    pub writable_override: Vec<String>,
    /// Local files with no live depot counterpart, named by the depot path
    /// they would have.
    pub extra: Vec<String>,
    pub skipped: Vec<Skipped>,
}
impl ConsistencyReport {
    pub fn bucket(&self, classification: Classification) -> &[String] {
        match classification {
            Classification::Good => &self.good,
            Classification::Missing => &self.missing,
            Classification::Corrupt => &self.corrupt,
            Classification::WritableOverride => &self.writable_override,
            Classification::Extra => &self.extra,
        }
    }

    pub fn classification(&self, depot_path: &str) -> Option<Classification> {
        [
            Classification::Good,
            Classification::Missing,
            Classification::Corrupt,
            Classification::WritableOverride,
            Classification::Extra,
        ]
        .into_iter()
        .find(|c| self.bucket(*c).iter().any(|p| p == depot_path))
    }

    /// `true` when nothing is missing, corrupt or extra.
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty() && self.extra.is_empty()
    }

    fn push(&mut self, classification: Classification, depot_path: String) {
        tracing::debug!(path = %depot_path, %classification, "Classified");
        match classification {
            Classification::Good => self.good.push(depot_path),
            Classification::Missing => self.missing.push(depot_path),
            Classification::Corrupt => self.corrupt.push(depot_path),
            Classification::WritableOverride => self.writable_override.push(depot_path),
            Classification::Extra => self.extra.push(depot_path),
        }
    }
}

/// Every regular file under `root`, with its path relative to `root`.
/// Files whose names the depot cannot express are skipped. A missing root
/// holds no files.
pub(crate) fn walk_local(root: &Path, skipped: &mut Vec<Skipped>) -> Result<Vec<(PathBuf, PathBuf)>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                skipped.push(Skipped::new(path, e));
                continue;
            },
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).or_raise(|| ErrorKind::LocalFiles)?.to_path_buf();
        let expressible = relative.components().all(|c| c.as_os_str().to_str().is_some_and(is_valid_file_name));
        if !expressible {
            skipped.push(Skipped::new(relative.display().to_string(), "name contains a depot wildcard character"));
            continue;
        }
        files.push((entry.into_path(), relative));
    }
    Ok(files)
}

/// Classify the local tree at `local_root` against `snapshot`, offline.
///
/// Without `checksums` only normalized sizes are compared: the local record
/// borrows the depot digest. Deleted depot records never count as missing.
pub fn classify_tree(snapshot: &Snapshot, local_root: impl AsRef<Path>, checksums: bool) -> Result<ConsistencyReport> {
    let local_root = local_root.as_ref();
    let mut report = ConsistencyReport {
        branch_root: snapshot.branch_root.clone(),
        local_root: local_root.to_path_buf(),
        ..Default::default()
    };
    let mut seen = BTreeSet::new();
    let mut skipped = Vec::new();
    for (local, relative) in walk_local(local_root, &mut skipped)? {
        let Some(depot_path) = depot_path_for(&snapshot.branch_root, &relative) else {
            skipped.push(Skipped::new(relative.display().to_string(), "not expressible as a depot path"));
            continue;
        };
        let Some(record) = snapshot.get(&depot_path).filter(|r| r.is_live()) else {
            report.push(Classification::Extra, depot_path);
            continue;
        };
        seen.insert(depot_path.clone());
        let mut measured = match checksum::local_record(&local, depot_path.as_str(), record.file_type.clone(), checksums)
        {
            Ok(measured) => measured,
            Err(e) => {
                skipped.push(Skipped::new(depot_path, &*e));
                continue;
            },
        };
        if !checksums {
            measured.digest.clone_from(&record.digest);
        }
        let classification = match (measured == *record, record.file_type.is_writable()) {
            (true, _) => Classification::Good,
            (false, true) => Classification::WritableOverride,
            (false, false) => Classification::Corrupt,
        };
        report.push(classification, depot_path);
    }
    for record in snapshot.records().filter(|r| r.is_live() && !seen.contains(&r.depot_path)) {
        report.push(Classification::Missing, record.depot_path.clone());
    }
    for bucket in [
        &mut report.good,
        &mut report.missing,
        &mut report.corrupt,
        &mut report.writable_override,
        &mut report.extra,
    ] {
        bucket.sort();
    }
    report.skipped = skipped;
    tracing::info!(
        branch = %report.branch_root,
        good = report.good.len(),
        missing = report.missing.len(),
        corrupt = report.corrupt.len(),
        writable = report.writable_override.len(),
        extra = report.extra.len(),
        skipped = report.skipped.len(),
        "Checked consistency"
    );
    Ok(report)
}

/// Snapshot `branch_root` at `revision` (deleted folders included) and
/// classify the workspace's local copy of it.
#[instrument(skip_all, fields(branch = branch_root, revision = %revision))]
pub async fn check(
    executor: &RetryingExecutor,
    options: &Options,
    branch_root: &str,
    revision: &Revision,
    checksums: bool,
) -> Result<ConsistencyReport> {
    let snapshot = SnapshotBuilder::new(executor, options)
        .include_deleted(true)
        .discover(branch_root, revision, "consistency check")
        .await?;
    let root = snapshot.branch_root.as_str();
    let local_root =
        executor.execute("map_to_local", |depot, _| async move { depot.map_to_local(root).await }).await?;
    classify_tree(&snapshot, local_root, checksums)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum Remediation {
    #[default]
    #[display("do nothing")]
    Nothing,
    /// Force-sync the workspace's own revision over the local copy.
    #[display("force refresh")]
    ForceRefresh,
    /// Open the files for edit in a new changelist, keeping local content.
    #[display("mark for edit")]
    MarkForEdit,
}

/// What to do about each bucket of a [`ConsistencyReport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemediationPlan {
    pub corrupt: Remediation,
    pub missing: Remediation,
    pub extra: Remediation,
    pub writable_override: Remediation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemediationReport {
    pub refreshed: Vec<String>,
    pub opened: Vec<String>,
    pub changelists: Vec<u32>,
    /// Buckets whose remediation was declined.
    pub declined: Vec<Classification>,
    pub skipped: Vec<Skipped>,
    /// Why remediation stopped early, when it did so after creating a
    /// changelist. The changelists stay pending.
    pub interrupted: Option<String>,
}

/// Apply `plan` to the buckets of `report`, confirming each bucket
/// separately. A declined bucket is left alone and the next one is asked.
///
/// A depot failure before any changelist was created is raised. After
/// that, remediation stops and the failure is recorded in
/// [`RemediationReport::interrupted`] next to the pending changelists.
#[instrument(skip_all, fields(branch = %report.branch_root))]
pub async fn remediate(
    executor: &RetryingExecutor,
    options: &Options,
    report: &ConsistencyReport,
    plan: &RemediationPlan,
    confirm: &dyn Confirm,
) -> Result<RemediationReport> {
    let mut result = RemediationReport::default();
    let buckets = [
        (Classification::Corrupt, plan.corrupt),
        (Classification::Missing, plan.missing),
        (Classification::WritableOverride, plan.writable_override),
        (Classification::Extra, plan.extra),
    ];
    for (classification, remediation) in buckets {
        let paths = report.bucket(classification);
        if paths.is_empty() || remediation == Remediation::Nothing {
            continue;
        }
        if classification == Classification::Extra {
            // Local-only files have nothing in the depot to refresh or edit.
            result.skipped.extend(paths.iter().map(|p| Skipped::new(p.as_str(), "local-only file")));
            continue;
        }
        let prompt = format!("{remediation} {} {classification} files under {}?", paths.len(), report.branch_root);
        if !confirm.confirm(&prompt) {
            tracing::info!(%classification, "Remediation declined");
            result.declined.push(classification);
            continue;
        }
        if let Err(e) = remediate_bucket(executor, options, classification, remediation, paths, &mut result).await {
            if result.changelists.is_empty() {
                return Err(e);
            }
            tracing::error!(
                changelists = ?result.changelists,
                error = %&*e,
                "Remediation interrupted; changelists left pending"
            );
            result.interrupted = Some((*e).to_string());
            break;
        }
    }
    Ok(result)
}

async fn remediate_bucket(
    executor: &RetryingExecutor,
    options: &Options,
    classification: Classification,
    remediation: Remediation,
    paths: &[String],
    result: &mut RemediationReport,
) -> Result<()> {
    match remediation {
        Remediation::Nothing => {},
        Remediation::ForceRefresh => {
            for chunk in batch::plan(paths, no_size, options.limits) {
                let specs = FileSpec::all(chunk.paths, &Revision::Have);
                let specs = &specs;
                let refreshed = executor
                    .execute_sync("sync_files", |depot, _| async move { depot.sync_files(specs, true).await })
                    .await?;
                result.refreshed.extend(refreshed);
            }
        },
        Remediation::MarkForEdit => {
            let description = format!("Consistency check: {} {classification} files", paths.len());
            let description = description.as_str();
            let changelist = executor
                .execute("create_changelist", |depot, _| async move { depot.create_changelist(description).await })
                .await?;
            result.changelists.push(changelist);
            for chunk in batch::plan(paths, no_size, options.limits) {
                let files = &chunk.paths;
                let opened = executor
                    .execute("edit_files", |depot, _| async move { depot.edit_files(files, changelist).await })
                    .await?;
                result.opened.extend(opened);
            }
        },
    }
    Ok(())
}
