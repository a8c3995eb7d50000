//! Reconcile plans and their application.
//!
//! A [`ReconcilePlan`] lists the depot paths to add, edit and delete so
//! that a branch matches some content source: a local folder
//! ([`reconcile_folder`]) or a changeset package
//! ([`unpackage`](crate::package::unpackage)). [`apply_plan`] opens all of
//! them in one new changelist, copying content in from a [`ContentSource`].

use crate::batch::{self, no_size};
use crate::checksum;
use crate::confirm::{Confirm, Outcome};
use crate::consistency::walk_local;
use crate::error::{ErrorKind, Result};
use crate::retry::RetryingExecutor;
use crate::snapshot::{Snapshot, SnapshotBuilder, ticks};
use crate::{Options, Skipped};
use depotsync_depot::Revision;
use depotsync_depot::path::{branch_root, depot_path_for, flatten, local_path_for, relative};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::instrument;

pub const RECONCILE_EXTENSION: &str = "reconcile";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePlan {
    pub branch_root: String,
    /// Where the content to reconcile with comes from.
    pub local_folder: PathBuf,
    pub files_to_add: Vec<String>,
    pub files_to_delete: Vec<String>,
    pub files_to_edit: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Local files left out of the plan.
    #[serde(skip)]
    pub skipped: Vec<Skipped>,
}

impl ReconcilePlan {
    pub fn new(root: impl AsRef<str>, local_folder: impl Into<PathBuf>) -> Self {
        Self {
            branch_root: branch_root(root),
            local_folder: local_folder.into(),
            files_to_add: Vec::new(),
            files_to_delete: Vec::new(),
            files_to_edit: Vec::new(),
            timestamp: OffsetDateTime::now_utc(),
            skipped: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files_to_add.is_empty() && self.files_to_delete.is_empty() && self.files_to_edit.is_empty()
    }

    /// `<branch root with slashes as dashes>-<ticks>.reconcile`
    pub fn file_name(&self) -> String {
        format!("{}-{}.{RECONCILE_EXTENSION}", flatten(&self.branch_root), ticks(self.timestamp))
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).or_raise(|| ErrorKind::Artifact)?;
        let path = dir.join(self.file_name());
        let json = serde_json::to_vec_pretty(self).or_raise(|| ErrorKind::Artifact)?;
        std::fs::write(&path, json).or_raise(|| ErrorKind::Artifact)?;
        tracing::info!(path = %path.display(), "Saved reconcile plan");
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).or_raise(|| ErrorKind::Artifact)?;
        serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Artifact)
    }

    /// The question asked before the plan is applied.
    pub fn confirmation(&self) -> String {
        let counts: Vec<String> = [
            ("checkout", self.files_to_edit.len()),
            ("add", self.files_to_add.len()),
            ("delete", self.files_to_delete.len()),
        ]
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(verb, count)| format!("{verb} {count} files"))
        .collect();
        format!(
            "This will create a new pending changelist, then {} under '{}...' to that changelist. Continue?",
            counts.join(", "),
            self.branch_root
        )
    }

    fn sort(&mut self) {
        self.files_to_add.sort();
        self.files_to_delete.sort();
        self.files_to_edit.sort();
    }
}

/// Plan reconciling the branch of `head` with the files in `folder`.
///
/// - Local files the depot doesn't have, or has deleted, are added.
/// - Local files that differ from a live depot file are edited.
/// - Live depot files with no local counterpart are deleted.
pub fn plan_folder(head: &Snapshot, folder: impl AsRef<Path>) -> Result<ReconcilePlan> {
    let folder = folder.as_ref();
    let mut plan = ReconcilePlan::new(&head.branch_root, folder);
    let mut seen = BTreeSet::new();
    for (local, relative) in walk_local(folder, &mut plan.skipped)? {
        let Some(depot_path) = depot_path_for(&plan.branch_root, &relative) else {
            plan.skipped.push(Skipped::new(relative.display().to_string(), "not expressible as a depot path"));
            continue;
        };
        match head.get(&depot_path).filter(|r| r.is_live()) {
            None => plan.files_to_add.push(depot_path),
            Some(record) => {
                seen.insert(depot_path.clone());
                match checksum::local_record(&local, depot_path.as_str(), record.file_type.clone(), true) {
                    Ok(measured) if measured == *record => {},
                    Ok(_) => plan.files_to_edit.push(depot_path),
                    Err(e) => plan.skipped.push(Skipped::new(depot_path, &*e)),
                }
            },
        }
    }
    plan.files_to_delete =
        head.records().filter(|r| r.is_live() && !seen.contains(&r.depot_path)).map(|r| r.depot_path.clone()).collect();
    plan.sort();
    tracing::info!(
        branch = %plan.branch_root,
        add = plan.files_to_add.len(),
        edit = plan.files_to_edit.len(),
        delete = plan.files_to_delete.len(),
        "Planned reconcile"
    );
    Ok(plan)
}

/// Somewhere file content can be copied into the workspace from.
pub trait ContentSource {
    /// Copy the file at `relative` (a path below the branch root) over
    /// `dest`. Returns `Ok(false)` when the source has no such file.
    fn copy_to(&mut self, relative: &str, dest: &Path) -> Result<bool>;
}

/// Content from a plain local folder.
pub struct FolderSource {
    root: PathBuf,
}
impl FolderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}
impl ContentSource for FolderSource {
    fn copy_to(&mut self, relative: &str, dest: &Path) -> Result<bool> {
        let source = local_path_for(&self.root, relative);
        if !source.is_file() {
            return Ok(false);
        }
        let content = std::fs::read(&source).or_raise(|| ErrorKind::LocalFiles)?;
        write_over(dest, &content)?;
        Ok(true)
    }
}

/// Write `content` to `dest`, creating parent directories and clearing a
/// read-only flag left by the depot client.
#[allow(clippy::permissions_set_readonly_false)]
pub(crate) fn write_over(dest: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).or_raise(|| ErrorKind::LocalFiles)?;
    }
    if let Ok(metadata) = std::fs::metadata(dest)
        && metadata.permissions().readonly()
    {
        let mut permissions = metadata.permissions();
        permissions.set_readonly(false);
        std::fs::set_permissions(dest, permissions).or_raise(|| ErrorKind::LocalFiles)?;
    }
    std::fs::write(dest, content).or_raise(|| ErrorKind::LocalFiles)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub changelist: u32,
    pub deleted: Vec<String>,
    pub added: Vec<String>,
    pub edited: Vec<String>,
    pub skipped: Vec<Skipped>,
}

/// Confirm `plan`, then open every file in it in a new changelist.
///
/// Deletions are marked first so that a delete and an add in the same
/// directory cannot collide. Additions are copied in and then marked; edits
/// are marked and then copied over. A file the source can't provide is
/// skipped.
///
/// Once the changelist exists, a failing depot call no longer raises:
/// the result is [`Outcome::Interrupted`] with the changelist and the files
/// already opened in it.
#[instrument(skip_all, fields(branch = %plan.branch_root))]
pub async fn apply_plan(
    executor: &RetryingExecutor,
    options: &Options,
    plan: &ReconcilePlan,
    source: &mut dyn ContentSource,
    description: &str,
    confirm: &dyn Confirm,
) -> Result<Outcome<ApplyReport>> {
    if plan.is_empty() {
        tracing::info!("Nothing to reconcile");
        return Ok(Outcome::NothingToDo);
    }
    if !confirm.confirm(&plan.confirmation()) {
        return Ok(Outcome::Declined { changelist: None });
    }

    let root = plan.branch_root.as_str();
    let local_root =
        executor.execute("map_to_local", |depot, _| async move { depot.map_to_local(root).await }).await?;
    let changelist = executor
        .execute("create_changelist", |depot, _| async move { depot.create_changelist(description).await })
        .await?;
    tracing::info!(changelist, "Created changelist");
    let mut report = ApplyReport { changelist, ..Default::default() };

    if let Err(e) = open_files(executor, options, plan, source, &local_root, &mut report).await {
        tracing::error!(
            changelist,
            deleted = report.deleted.len(),
            added = report.added.len(),
            edited = report.edited.len(),
            error = %&*e,
            "Reconcile interrupted; changelist left pending"
        );
        return Ok(Outcome::Interrupted { partial: report, reason: (*e).to_string() });
    }

    tracing::info!(
        changelist,
        deleted = report.deleted.len(),
        added = report.added.len(),
        edited = report.edited.len(),
        skipped = report.skipped.len(),
        "Applied reconcile plan"
    );
    Ok(Outcome::Applied(report))
}

async fn open_files(
    executor: &RetryingExecutor,
    options: &Options,
    plan: &ReconcilePlan,
    source: &mut dyn ContentSource,
    local_root: &Path,
    report: &mut ApplyReport,
) -> Result<()> {
    let root = plan.branch_root.as_str();
    let changelist = report.changelist;
    for chunk in batch::plan(&plan.files_to_delete, no_size, options.limits) {
        let files = &chunk.paths;
        let deleted = executor
            .execute("delete_files", |depot, _| async move { depot.delete_files(files, changelist).await })
            .await?;
        report.deleted.extend(deleted);
    }

    let mut copied = Vec::new();
    for path in &plan.files_to_add {
        if copy_in(source, root, local_root, path, &mut report.skipped) {
            copied.push(path.clone());
        }
    }
    for chunk in batch::plan(&copied, no_size, options.limits) {
        let files = &chunk.paths;
        let added =
            executor.execute("add_files", |depot, _| async move { depot.add_files(files, changelist).await }).await?;
        report.added.extend(added);
    }

    for chunk in batch::plan(&plan.files_to_edit, no_size, options.limits) {
        let files = &chunk.paths;
        let edited =
            executor.execute("edit_files", |depot, _| async move { depot.edit_files(files, changelist).await }).await?;
        report.edited.extend(edited);
    }
    for path in &plan.files_to_edit {
        copy_in(source, root, local_root, path, &mut report.skipped);
    }
    Ok(())
}

fn copy_in(
    source: &mut dyn ContentSource,
    root: &str,
    local_root: &Path,
    depot_path: &str,
    skipped: &mut Vec<Skipped>,
) -> bool {
    let Some(relative) = relative(depot_path, root) else {
        skipped.push(Skipped::new(depot_path, "outside the branch root"));
        return false;
    };
    match source.copy_to(relative, &local_path_for(local_root, relative)) {
        Ok(true) => true,
        Ok(false) => {
            skipped.push(Skipped::new(depot_path, "missing from the content source"));
            false
        },
        Err(e) => {
            skipped.push(Skipped::new(depot_path, &*e));
            false
        },
    }
}

/// Reconcile `branch_root` at head with the content of `folder`.
///
/// The plan is saved as a `.reconcile` artifact before confirmation is
/// asked, so a declined reconcile still leaves a record of the drift.
#[instrument(skip_all, fields(branch = branch_root, folder = %folder.as_ref().display()))]
pub async fn reconcile_folder(
    executor: &RetryingExecutor,
    options: &Options,
    branch_root: &str,
    folder: impl AsRef<Path>,
    confirm: &dyn Confirm,
) -> Result<Outcome<ApplyReport>> {
    let folder = folder.as_ref();
    let head = SnapshotBuilder::new(executor, options)
        .include_deleted(true)
        .discover(branch_root, &Revision::Head, "reconcile")
        .await?;
    let plan = plan_folder(&head, folder)?;
    if let Some(dir) = &options.settings_dir
        && !plan.is_empty()
    {
        plan.save(dir)?;
    }
    let description = format!("Reconcile {} with {}", plan.branch_root, folder.display());
    apply_plan(executor, options, &plan, &mut FolderSource::new(folder), &description, confirm).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::{AutoConfirm, Decline};
    use crate::testing::connected;
    use depotsync_depot::error::ErrorKind as DepotErrorKind;
    use depotsync_depot::remote::MockDepot;
    use depotsync_depot::{FileAction, FileKind, FileRecord};
    use std::sync::Arc;

    fn depot(local: &Path) -> MockDepot {
        MockDepot::default()
            .with_workspace("ws", "//depot/main/", local)
            .with_change(
                "import",
                [
                    ("//depot/main/a.txt", FileKind::Text, Some(&b"a\n"[..])),
                    ("//depot/main/b.txt", FileKind::Text, Some(&b"b\n"[..])),
                    ("//depot/main/sub/d.txt", FileKind::Text, Some(&b"d\n"[..])),
                    ("//depot/main/gone.txt", FileKind::Text, Some(&b"gone\n"[..])),
                ],
            )
            .with_change("remove", [("//depot/main/gone.txt", FileKind::Text, None)])
            .with_synced("//depot/main/")
    }

    fn source_folder(dir: &Path) {
        std::fs::write(dir.join("a.txt"), b"a\r\n").unwrap();
        std::fs::write(dir.join("b.txt"), b"changed\n").unwrap();
        std::fs::write(dir.join("gone.txt"), b"back\n").unwrap();
        std::fs::create_dir_all(dir.join("new")).unwrap();
        std::fs::write(dir.join("new/file.bin"), b"\x00\xFF").unwrap();
    }

    #[test]
    fn test_plan_folder_classification() {
        let folder = tempfile::tempdir().unwrap();
        source_folder(folder.path());
        let head = Snapshot::new("//depot/main/", &Revision::Head, "").with_records([
            FileRecord::new("//depot/main/a.txt", FileKind::Text).with_size(2).with_digest(checksum::digest(b"a\n")),
            FileRecord::new("//depot/main/b.txt", FileKind::Text).with_size(2).with_digest(checksum::digest(b"b\n")),
            FileRecord::new("//depot/main/sub/d.txt", FileKind::Text).with_size(2).with_digest("D"),
            FileRecord::new("//depot/main/gone.txt", FileKind::Text).with_action(FileAction::Delete),
        ]);
        let plan = plan_folder(&head, folder.path()).unwrap();
        assert_eq!(plan.files_to_add, vec!["//depot/main/gone.txt", "//depot/main/new/file.bin"]);
        assert_eq!(plan.files_to_edit, vec!["//depot/main/b.txt"]);
        assert_eq!(plan.files_to_delete, vec!["//depot/main/sub/d.txt"]);
    }

    #[test]
    fn test_plan_artifact_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = ReconcilePlan::new("//depot/main", "/src/folder");
        plan.timestamp = OffsetDateTime::UNIX_EPOCH;
        plan.files_to_add.push("//depot/main/a.txt".to_string());
        let path = plan.save(dir.path()).unwrap();
        assert!(path.ends_with("--depot-main--621355968000000000.reconcile"));

        let json = std::fs::read_to_string(&path).unwrap();
        for key in ["branchRoot", "localFolder", "filesToAdd", "filesToDelete", "filesToEdit", "timestamp"] {
            assert!(json.contains(key), "missing {key}");
        }
        assert_eq!(ReconcilePlan::load(&path).unwrap(), plan);
    }

    #[test]
    fn test_confirmation_lists_non_empty_operations() {
        let mut plan = ReconcilePlan::new("//depot/main", "");
        plan.files_to_add = vec!["//depot/main/a".to_string(), "//depot/main/b".to_string()];
        plan.files_to_delete = vec!["//depot/main/c".to_string()];
        assert_eq!(
            plan.confirmation(),
            "This will create a new pending changelist, then add 2 files, delete 1 files under '//depot/main/...' to \
             that changelist. Continue?"
        );
    }

    #[test]
    fn test_write_over_clears_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("deep/ro.txt");
        write_over(&dest, b"first").unwrap();
        let mut permissions = std::fs::metadata(&dest).unwrap().permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(&dest, permissions).unwrap();

        write_over(&dest, b"second").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"second");
        assert!(!std::fs::metadata(&dest).unwrap().permissions().readonly());
    }

    #[tokio::test]
    async fn test_reconcile_folder_applies_plan() {
        let workspace = tempfile::tempdir().unwrap();
        let folder = tempfile::tempdir().unwrap();
        let settings = tempfile::tempdir().unwrap();
        source_folder(folder.path());
        let depot = Arc::new(depot(workspace.path()));
        let executor = connected(depot.clone()).await;
        let options = Options { settings_dir: Some(settings.path().to_path_buf()), ..Options::default() };

        let outcome = reconcile_folder(&executor, &options, "//depot/main/", folder.path(), &AutoConfirm).await.unwrap();
        let report = outcome.applied().unwrap();
        assert_eq!(report.deleted, vec!["//depot/main/sub/d.txt"]);
        assert_eq!(report.added, vec!["//depot/main/gone.txt", "//depot/main/new/file.bin"]);
        assert_eq!(report.edited, vec!["//depot/main/b.txt"]);
        assert!(report.skipped.is_empty());

        assert_eq!(std::fs::read(workspace.path().join("b.txt")).unwrap(), b"changed\n");
        assert_eq!(std::fs::read(workspace.path().join("new/file.bin")).unwrap(), b"\x00\xFF");
        assert!(!workspace.path().join("sub/d.txt").exists());
        assert_eq!(depot.opened_in(report.changelist).await.len(), 4);

        let saved: Vec<_> = std::fs::read_dir(settings.path()).unwrap().collect();
        assert_eq!(saved.len(), 1);
    }

    #[tokio::test]
    async fn test_declined_reconcile_still_saves_plan() {
        let workspace = tempfile::tempdir().unwrap();
        let folder = tempfile::tempdir().unwrap();
        let settings = tempfile::tempdir().unwrap();
        source_folder(folder.path());
        let depot = Arc::new(depot(workspace.path()));
        let executor = connected(depot.clone()).await;
        let options = Options { settings_dir: Some(settings.path().to_path_buf()), ..Options::default() };

        let outcome = reconcile_folder(&executor, &options, "//depot/main/", folder.path(), &Decline).await.unwrap();
        assert_eq!(outcome, Outcome::Declined { changelist: None });
        assert!(!depot.calls().await.contains(&"create_changelist".to_string()));
        assert_eq!(std::fs::read_dir(settings.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_file_is_skipped() {
        let workspace = tempfile::tempdir().unwrap();
        let depot = Arc::new(depot(workspace.path()));
        let executor = connected(depot.clone()).await;
        let mut plan = ReconcilePlan::new("//depot/main/", "/nowhere");
        plan.files_to_add.push("//depot/main/absent.txt".to_string());
        plan.files_to_edit.push("//depot/main/a.txt".to_string());

        let outcome = apply_plan(
            &executor,
            &Options::default(),
            &plan,
            &mut FolderSource::new("/nowhere"),
            "test",
            &AutoConfirm,
        )
        .await
        .unwrap();
        let report = outcome.applied().unwrap();
        assert!(report.added.is_empty());
        assert_eq!(report.edited, vec!["//depot/main/a.txt"]);
        let skipped: Vec<_> = report.skipped.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(skipped, vec!["//depot/main/absent.txt", "//depot/main/a.txt"]);
    }

    #[tokio::test]
    async fn test_failure_after_changelist_reports_it() {
        let workspace = tempfile::tempdir().unwrap();
        let folder = tempfile::tempdir().unwrap();
        source_folder(folder.path());
        let depot = Arc::new(depot(workspace.path()));
        let executor = connected(depot.clone()).await;
        depot.fail_on("add_files", DepotErrorKind::Unauthorized("ticket expired".into())).await;

        let outcome =
            reconcile_folder(&executor, &Options::default(), "//depot/main/", folder.path(), &AutoConfirm).await.unwrap();
        let Outcome::Interrupted { partial, reason } = outcome else {
            panic!("expected an interrupted reconcile");
        };
        assert!(reason.contains("add_files"), "{reason}");
        assert_eq!(partial.deleted, vec!["//depot/main/sub/d.txt"]);
        assert!(partial.added.is_empty());
        assert!(partial.edited.is_empty());
        assert_eq!(
            depot.opened_in(partial.changelist).await,
            vec![("//depot/main/sub/d.txt".to_string(), FileAction::Delete)]
        );
        let calls = depot.calls().await;
        assert_eq!(calls[calls.len() - 3..], ["create_changelist", "delete_files", "add_files"]);
    }
}
