use crate::confirm::{Confirm, Outcome};
use crate::error::{ErrorKind as EngineErrorKind, Result as EngineResult};
use crate::package::error::{ErrorKind, Result};
use crate::package::{BASH_ENTRY, BAT_ENTRY, METADATA_ENTRY};
use crate::reconcile::{ApplyReport, ContentSource, ReconcilePlan, apply_plan, write_over};
use crate::retry::RetryingExecutor;
use crate::snapshot::{Snapshot, SnapshotBuilder};
use crate::{Options, Skipped};
use depotsync_depot::path::{branch_root, remap};
use depotsync_depot::{ActionClass, Revision};
use exn::{OptionExt, ResultExt};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::instrument;
use zip::ZipArchive;
use zip::result::ZipError;

/// Everything [`open`] reads out of a package.
#[derive(Debug, Clone)]
pub struct PackageContents {
    pub snapshot: Snapshot,
    /// Content entries (relative paths), sorted.
    pub entries: Vec<String>,
    pub bat: Option<String>,
    pub bash: Option<String>,
}

/// Read the metadata, scripts and entry list of a package.
pub fn open(archive: impl AsRef<Path>) -> EngineResult<PackageContents> {
    open_inner(archive.as_ref()).or_raise(|| EngineErrorKind::Package)
}

fn open_inner(archive: &Path) -> Result<PackageContents> {
    let mut zip = ZipArchive::new(File::open(archive).or_raise(|| ErrorKind::Archive)?).or_raise(|| ErrorKind::Archive)?;
    let metadata =
        read_entry(&mut zip, METADATA_ENTRY)?.ok_or_raise(|| ErrorKind::MissingEntry(METADATA_ENTRY.to_string()))?;
    let snapshot = Snapshot::from_slice(&metadata).or_raise(|| ErrorKind::Metadata)?;
    let text = |bytes: Vec<u8>| String::from_utf8_lossy(&bytes).into_owned();
    let bat = read_entry(&mut zip, BAT_ENTRY)?.map(text);
    let bash = read_entry(&mut zip, BASH_ENTRY)?.map(text);
    let mut entries: Vec<String> = zip
        .file_names()
        .filter(|name| ![METADATA_ENTRY, BAT_ENTRY, BASH_ENTRY].contains(name))
        .map(str::to_string)
        .collect();
    entries.sort();
    Ok(PackageContents { snapshot, entries, bat, bash })
}

/// The bytes of entry `name`, or `None` when the archive has no such entry.
fn read_entry(zip: &mut ZipArchive<File>, name: &str) -> Result<Option<Vec<u8>>> {
    match zip.by_name(name) {
        Ok(mut entry) => {
            let mut content = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut content).or_raise(|| ErrorKind::Archive)?;
            Ok(Some(content))
        },
        Err(ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e).or_raise(|| ErrorKind::Archive),
    }
}

/// Package content, looked up by path below the branch root.
pub struct ArchiveSource {
    zip: ZipArchive<File>,
}
impl ArchiveSource {
    pub fn open(archive: impl AsRef<Path>) -> EngineResult<Self> {
        let file = File::open(archive.as_ref()).or_raise(|| EngineErrorKind::Package)?;
        let zip = ZipArchive::new(file).or_raise(|| EngineErrorKind::Package)?;
        Ok(Self { zip })
    }
}
impl ContentSource for ArchiveSource {
    fn copy_to(&mut self, relative: &str, dest: &Path) -> EngineResult<bool> {
        match read_entry(&mut self.zip, relative).or_raise(|| EngineErrorKind::Package)? {
            Some(content) => write_over(dest, &content).map(|()| true),
            None => Ok(false),
        }
    }
}

/// Decide what replaying `packaged` onto the branch of `destination` takes.
///
/// `destination` holds the workspace's `#have` records of the remapped
/// paths. Without `force`:
///
/// - deletes apply only to files still live at the destination;
/// - adds apply only to files absent (or deleted) there;
/// - edits are skipped when the destination already holds the packaged
///   content, and become adds when the destination lacks the file.
///
/// With `force` every file is planned by its action alone.
pub fn classify(packaged: &Snapshot, destination: &Snapshot, force: bool) -> ReconcilePlan {
    let mut plan = ReconcilePlan::new(&destination.branch_root, "");
    for record in packaged.records() {
        let Some(path) = remap(&record.depot_path, &packaged.branch_root, &destination.branch_root) else {
            plan.skipped.push(Skipped::new(record.depot_path.as_str(), "outside the packaged branch root"));
            continue;
        };
        let existing = destination.get(&path).filter(|r| r.is_live());
        match record.head_action.class() {
            ActionClass::Delete if force || existing.is_some() => plan.files_to_delete.push(path),
            ActionClass::Add if force || existing.is_none() => plan.files_to_add.push(path),
            ActionClass::Edit if force => plan.files_to_edit.push(path),
            ActionClass::Edit => match existing {
                None => plan.files_to_add.push(path),
                Some(current) if current == record => {},
                Some(_) => plan.files_to_edit.push(path),
            },
            ActionClass::Unhandled => {
                let reason = format!("unhandled action {:?}", record.head_action);
                plan.skipped.push(Skipped::new(record.depot_path.as_str(), reason));
            },
            ActionClass::Delete | ActionClass::Add => {},
        }
    }
    plan
}

/// Replay the package at `archive` onto `destination_root`.
///
/// The plan is confirmed before anything changes. Entries missing from the
/// archive are skipped, not fatal.
#[instrument(skip_all, fields(archive = %archive.as_ref().display(), branch = destination_root, force = force))]
pub async fn unpackage(
    executor: &RetryingExecutor,
    options: &Options,
    archive: impl AsRef<Path>,
    destination_root: &str,
    force: bool,
    confirm: &dyn Confirm,
) -> EngineResult<Outcome<ApplyReport>> {
    let archive = archive.as_ref();
    let contents = open(archive)?;
    let root = branch_root(destination_root);
    let remapped = contents.snapshot.remap(&root);
    let paths: Vec<String> = remapped.paths().cloned().collect();
    let destination = SnapshotBuilder::new(executor, options)
        .persist_to(None)
        .for_paths(&root, &paths, &Revision::Have)
        .await?;

    let mut plan = classify(&contents.snapshot, &destination, force);
    plan.local_folder = archive.to_path_buf();
    tracing::info!(
        add = plan.files_to_add.len(),
        edit = plan.files_to_edit.len(),
        delete = plan.files_to_delete.len(),
        "Planned unpackage"
    );
    let name = archive.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let description = format!("Unpackaged changelist from file '{name}'");
    let mut source = ArchiveSource::open(archive)?;
    apply_plan(executor, options, &plan, &mut source, &description, confirm).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::{AutoConfirm, Decline};
    use crate::package::package_changelist;
    use crate::testing::connected;
    use depotsync_depot::remote::MockDepot;
    use depotsync_depot::{FileAction, FileKind, FileRecord};
    use std::sync::Arc;

    /// Change 1 imports both branches; change 2 edits, deletes and adds under
    /// `//depot/main/`.
    fn depot(local: &Path) -> MockDepot {
        MockDepot::default()
            .with_workspace("ws", "//depot/", local)
            .with_change(
                "import",
                [
                    ("//depot/main/a.txt", FileKind::Text, Some(&b"a\n"[..])),
                    ("//depot/main/old.txt", FileKind::Text, Some(&b"old\n"[..])),
                    ("//depot/rel/a.txt", FileKind::Text, Some(&b"a\n"[..])),
                    ("//depot/rel/old.txt", FileKind::Text, Some(&b"old\n"[..])),
                ],
            )
            .with_change(
                "work",
                [
                    ("//depot/main/a.txt", FileKind::Text, Some(&b"a2\n"[..])),
                    ("//depot/main/old.txt", FileKind::Text, None),
                    ("//depot/main/sub/new.bin", FileKind::Binary, Some(&b"\x00\x01"[..])),
                ],
            )
            .with_synced("//depot/")
    }

    fn record(path: &str, action: FileAction, content: &[u8]) -> FileRecord {
        FileRecord::new(path, FileKind::Text)
            .with_action(action)
            .with_size(content.len() as u64)
            .with_digest(crate::checksum::digest(content))
    }

    #[test]
    fn test_classify_against_destination() {
        let packaged = Snapshot::new("//depot/main/", &Revision::Changelist(2), "").with_records([
            record("//depot/main/del-live.txt", FileAction::Delete, b""),
            record("//depot/main/del-gone.txt", FileAction::Delete, b""),
            record("//depot/main/add-new.txt", FileAction::Add, b"n"),
            record("//depot/main/add-exists.txt", FileAction::Branch, b"n"),
            record("//depot/main/edit-same.txt", FileAction::Edit, b"same"),
            record("//depot/main/edit-diff.txt", FileAction::Integrate, b"new"),
            record("//depot/main/edit-absent.txt", FileAction::Edit, b"x"),
            record("//depot/main/purged.txt", FileAction::Purge, b""),
        ]);
        let destination = Snapshot::new("//depot/rel/", &Revision::Have, "").with_records([
            record("//depot/rel/del-live.txt", FileAction::Add, b"x"),
            record("//depot/rel/add-exists.txt", FileAction::Add, b"n"),
            record("//depot/rel/edit-same.txt", FileAction::Edit, b"same"),
            record("//depot/rel/edit-diff.txt", FileAction::Edit, b"old"),
        ]);

        let plan = classify(&packaged, &destination, false);
        assert_eq!(plan.branch_root, "//depot/rel/");
        assert_eq!(plan.files_to_delete, vec!["//depot/rel/del-live.txt"]);
        assert_eq!(plan.files_to_add, vec!["//depot/rel/add-new.txt", "//depot/rel/edit-absent.txt"]);
        assert_eq!(plan.files_to_edit, vec!["//depot/rel/edit-diff.txt"]);
        assert_eq!(plan.skipped.len(), 1);

        let forced = classify(&packaged, &destination, true);
        assert_eq!(forced.files_to_delete.len(), 2);
        assert_eq!(forced.files_to_add.len(), 2);
        assert_eq!(forced.files_to_edit.len(), 3);
    }

    #[tokio::test]
    async fn test_package_contents() {
        let workspace = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("nested/change.zip");
        let depot = Arc::new(depot(workspace.path()));
        let executor = connected(depot.clone()).await;
        std::fs::create_dir_all(archive.parent().unwrap()).unwrap();
        std::fs::write(&archive, b"stale").unwrap();

        let report = package_changelist(&executor, &Options::default(), 2, "//depot/main", &archive).await.unwrap();
        assert_eq!(report.archived, vec!["//depot/main/a.txt", "//depot/main/sub/new.bin"]);
        assert_eq!(report.removed, vec!["//depot/main/old.txt"]);
        assert!(report.skipped.is_empty());

        let contents = open(&archive).unwrap();
        assert_eq!(contents.entries, vec!["a.txt", "sub/new.bin"]);
        assert_eq!(contents.snapshot.branch_root, "//depot/main/");
        assert_eq!(contents.snapshot.revision, "@2");
        assert_eq!(contents.snapshot.len(), 3);
        let a = contents.snapshot.get("//depot/main/a.txt").unwrap();
        assert_eq!(a.size, Some(3));
        assert_eq!(a.digest, crate::checksum::digest(b"a2\n"));

        let bash = contents.bash.unwrap();
        assert!(bash.contains("p4 delete \"${DepotRemotePath}/old.txt\""));
        assert!(bash.contains("p4 add \"${DepotRemotePath}/sub/new.bin\""));
        assert!(bash.contains("p4 edit \"${DepotRemotePath}/a.txt\""));
        assert!(contents.bat.unwrap().starts_with("@echo off\r\n"));
    }

    #[tokio::test]
    async fn test_round_trip_onto_own_branch_is_a_no_op() {
        let workspace = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("change.zip");
        let depot = Arc::new(depot(workspace.path()));
        let executor = connected(depot.clone()).await;
        let options = Options::default();

        package_changelist(&executor, &options, 2, "//depot/main/", &archive).await.unwrap();
        let contents = open(&archive).unwrap();
        let destination = SnapshotBuilder::new(&executor, &options)
            .for_paths("//depot/main/", &contents.snapshot.paths().cloned().collect::<Vec<_>>(), &Revision::Have)
            .await
            .unwrap();
        let plan = classify(&contents.snapshot, &destination, false);
        assert!(plan.files_to_add.is_empty());
        assert!(plan.files_to_delete.is_empty());
        assert!(plan.files_to_edit.is_empty());

        let outcome = unpackage(&executor, &options, &archive, "//depot/main/", false, &Decline).await.unwrap();
        assert_eq!(outcome, Outcome::NothingToDo);
    }

    #[tokio::test]
    async fn test_unpackage_onto_other_branch() {
        let workspace = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("change.zip");
        let depot = Arc::new(depot(workspace.path()));
        let executor = connected(depot.clone()).await;
        let options = Options::default();
        package_changelist(&executor, &options, 2, "//depot/main/", &archive).await.unwrap();

        let outcome = unpackage(&executor, &options, &archive, "//depot/rel", false, &AutoConfirm).await.unwrap();
        let report = outcome.applied().unwrap();
        assert_eq!(report.deleted, vec!["//depot/rel/old.txt"]);
        assert_eq!(report.added, vec!["//depot/rel/sub/new.bin"]);
        assert_eq!(report.edited, vec!["//depot/rel/a.txt"]);

        let rel = workspace.path().join("rel");
        assert_eq!(std::fs::read(rel.join("a.txt")).unwrap(), b"a2\n");
        assert_eq!(std::fs::read(rel.join("sub/new.bin")).unwrap(), b"\x00\x01");
        assert!(!rel.join("old.txt").exists());
        assert_eq!(depot.opened_in(report.changelist).await.len(), 3);
    }

    #[tokio::test]
    async fn test_declined_unpackage_changes_nothing() {
        let workspace = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("change.zip");
        let depot = Arc::new(depot(workspace.path()));
        let executor = connected(depot.clone()).await;
        let options = Options::default();
        package_changelist(&executor, &options, 2, "//depot/main/", &archive).await.unwrap();

        let outcome = unpackage(&executor, &options, &archive, "//depot/rel/", false, &Decline).await.unwrap();
        assert!(outcome.is_declined());
        assert_eq!(std::fs::read(workspace.path().join("rel/a.txt")).unwrap(), b"a\n");
        assert!(!depot.calls().await.contains(&"create_changelist".to_string()));
    }

    #[test]
    fn test_open_rejects_archive_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.zip");
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        zip.start_file("a.txt", zip::write::FileOptions::default()).unwrap();
        std::io::Write::write_all(&mut zip, b"a").unwrap();
        zip.finish().unwrap();
        assert!(open(&path).is_err());
    }
}
