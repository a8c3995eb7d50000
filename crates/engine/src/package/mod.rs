//! Portable changeset packages.
//!
//! A package is a zip archive holding:
//!
//! - the content of every file a changelist adds or edits, under its path
//!   relative to the branch root;
//! - a `.metadata` entry: the [`Snapshot`] of exactly that changelist, sized
//!   and hashed from the archived bytes;
//! - `unpackage.bat` and `unpackage.bash`, which replay the change on a
//!   machine without this tool (see [`script`]).
//!
//! [`package_changelist`] builds one; [`unpackage`] replays one against a
//! destination branch that may differ from the one it was packaged from.

pub mod error;
pub mod script;
mod unpack;

pub use self::script::{ScriptGenerator, ScriptKind};
pub use self::unpack::{ArchiveSource, PackageContents, classify, open, unpackage};

use crate::batch::{self, no_size};
use crate::checksum;
use crate::error::{ErrorKind as EngineErrorKind, Result as EngineResult};
use crate::package::error::{ErrorKind, Result};
use crate::retry::RetryingExecutor;
use crate::snapshot::Snapshot;
use crate::{Options, Skipped};
use depotsync_depot::path::{branch_root, local_path_for, relative};
use depotsync_depot::{FileSpec, Revision};
use exn::ResultExt;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::instrument;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const METADATA_ENTRY: &str = ".metadata";
pub const BAT_ENTRY: &str = "unpackage.bat";
pub const BASH_ENTRY: &str = "unpackage.bash";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReport {
    pub archive: PathBuf,
    pub changelist: u32,
    /// Depot paths whose content is in the archive.
    pub archived: Vec<String>,
    /// Depot paths the changelist deletes; recorded in `.metadata` only.
    pub removed: Vec<String>,
    pub skipped: Vec<Skipped>,
}

/// Package changelist `changelist` of `branch_root` into a zip at `output`,
/// replacing any file already there.
///
/// A submitted changelist is synced first so the workspace holds exactly the
/// revisions it created.
///
/// # Errors
/// Returns [`EngineErrorKind::Package`] raised from an inner
/// [`package::error::ErrorKind`](ErrorKind).
pub async fn package_changelist(
    executor: &RetryingExecutor,
    options: &Options,
    changelist: u32,
    branch_root: &str,
    output: impl AsRef<Path>,
) -> EngineResult<PackageReport> {
    package_inner(executor, options, changelist, branch_root, output.as_ref())
        .await
        .or_raise(|| EngineErrorKind::Package)
}

#[instrument(skip_all, fields(changelist = changelist, branch = root, output = %output.display()))]
async fn package_inner(
    executor: &RetryingExecutor,
    options: &Options,
    changelist: u32,
    root: &str,
    output: &Path,
) -> Result<PackageReport> {
    let root = branch_root(root);
    let description = executor
        .execute("describe_changelist", |depot, _| async move { depot.describe_changelist(changelist).await })
        .await
        .or_raise(|| ErrorKind::Depot)?;

    let mut skipped = Vec::new();
    let mut records = Vec::new();
    for record in description.files {
        match relative(&record.depot_path, &root) {
            Some(_) => records.push(record),
            None => skipped.push(Skipped::new(record.depot_path, "outside the branch root")),
        }
    }
    if records.is_empty() {
        exn::bail!(ErrorKind::Empty(changelist));
    }

    if !description.summary.is_pending() {
        let revisions: BTreeMap<&str, Revision> = records
            .iter()
            .map(|r| {
                let revision = r.have_revision.map(Revision::Number).unwrap_or(Revision::Changelist(changelist));
                (r.depot_path.as_str(), revision)
            })
            .collect();
        let paths: Vec<String> = revisions.keys().map(|p| p.to_string()).collect();
        for chunk in batch::plan(&paths, no_size, options.limits) {
            let specs: Vec<FileSpec> =
                chunk.paths.iter().map(|p| FileSpec::new(p.clone(), revisions[p.as_str()].clone())).collect();
            let specs = &specs;
            executor
                .execute_sync("sync_files", |depot, _| async move { depot.sync_files(specs, false).await })
                .await
                .or_raise(|| ErrorKind::Depot)?;
        }
        tracing::info!(files = paths.len(), "Synced workspace to the submitted changelist");
    }

    let local_root = {
        let root = root.as_str();
        executor
            .execute("map_to_local", |depot, _| async move { depot.map_to_local(root).await })
            .await
            .or_raise(|| ErrorKind::Depot)?
    };

    if output.exists() {
        std::fs::remove_file(output).or_raise(|| ErrorKind::Io)?;
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).or_raise(|| ErrorKind::Io)?;
    }
    let file = File::create(output).or_raise(|| ErrorKind::Io)?;
    let mut zip = ZipWriter::new(file);
    let entry_options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut snapshot = Snapshot::new(&root, &Revision::Changelist(changelist), description.summary.description);
    let mut archived = Vec::new();
    let mut removed = Vec::new();
    for record in records {
        let Some(entry) = relative(&record.depot_path, &root).map(str::to_string) else {
            continue;
        };
        if record.head_action.removes_content() {
            tracing::info!(path = %record.depot_path, action = ?record.head_action, "Not archiving removed file");
            removed.push(record.depot_path.clone());
            snapshot.insert(record);
            continue;
        }
        let content = match std::fs::read(local_path_for(&local_root, &entry)) {
            Ok(content) => content,
            Err(e) => {
                skipped.push(Skipped::new(record.depot_path, e));
                continue;
            },
        };
        zip.start_file(entry.as_str(), entry_options).or_raise(|| ErrorKind::Archive)?;
        zip.write_all(&content).or_raise(|| ErrorKind::Archive)?;
        let (size, digest) = checksum::measure(record.kind(), &content, true);
        tracing::debug!(path = %record.depot_path, size, "Archived");
        archived.push(record.depot_path.clone());
        snapshot.insert(record.with_size(size).with_digest(digest));
    }

    let metadata = serde_json::to_vec_pretty(&snapshot).or_raise(|| ErrorKind::Metadata)?;
    zip.start_file(METADATA_ENTRY, entry_options).or_raise(|| ErrorKind::Archive)?;
    zip.write_all(&metadata).or_raise(|| ErrorKind::Archive)?;

    // The scripts assume nothing about the destination.
    let plan = classify(&snapshot, &Snapshot::new(&root, &Revision::Have, ""), true);
    let scripts = ScriptGenerator::new()?;
    for kind in [ScriptKind::Bat, ScriptKind::Bash] {
        let script = scripts.render(kind, &plan)?;
        zip.start_file(kind.entry_name(), entry_options).or_raise(|| ErrorKind::Archive)?;
        zip.write_all(script.as_bytes()).or_raise(|| ErrorKind::Archive)?;
    }
    zip.finish().or_raise(|| ErrorKind::Archive)?;

    tracing::info!(archived = archived.len(), removed = removed.len(), skipped = skipped.len(), "Packaged changelist");
    Ok(PackageReport { archive: output.to_path_buf(), changelist, archived, removed, skipped })
}
