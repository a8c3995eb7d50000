//! Point-in-time records of a depot file set.
//!
//! A [`Snapshot`] holds the [`FileRecord`]s under one branch root at one
//! revision. Snapshots are built fresh for each operation by a
//! [`SnapshotBuilder`], compared with [`diff`](crate::diff), and optionally
//! persisted as `.revisions` artifacts for offline comparison.

mod build;
mod persist;

pub use self::build::SnapshotBuilder;
pub use self::persist::{REVISIONS_EXTENSION, stored_snapshots, ticks};
use crate::batch::kilobytes;
use depotsync_depot::path::{branch_root, relative, remap};
use depotsync_depot::{FileRecord, Revision};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Prefix shared by every path in the snapshot; always ends in `/`.
    pub branch_root: String,
    /// The point in time: `#head`, `#have`, `@label` or `@changelist`.
    pub revision: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub description: String,
    pub files: BTreeMap<String, FileRecord>,
}

impl Snapshot {
    pub fn new(root: impl AsRef<str>, revision: &Revision, description: impl Into<String>) -> Self {
        Self {
            branch_root: branch_root(root),
            revision: revision.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            description: description.into(),
            files: BTreeMap::new(),
        }
    }

    /// Insert a record, replacing any existing record for the same path.
    pub fn insert(&mut self, record: FileRecord) {
        self.files.insert(record.depot_path.clone(), record);
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item = FileRecord>) -> Self {
        for record in records {
            self.insert(record);
        }
        self
    }

    pub fn get(&self, depot_path: &str) -> Option<&FileRecord> {
        self.files.get(depot_path)
    }

    pub fn contains(&self, depot_path: &str) -> bool {
        self.files.contains_key(depot_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    /// The path of `depot_path` relative to the branch root.
    pub fn relative<'a>(&self, depot_path: &'a str) -> Option<&'a str> {
        relative(depot_path, &self.branch_root)
    }

    /// Re-root every record under another branch. Records outside the branch
    /// root cannot be remapped and are dropped.
    pub fn remap(&self, to_root: impl AsRef<str>) -> Snapshot {
        let to_root = branch_root(to_root);
        let files = self
            .files
            .values()
            .filter_map(|record| {
                let path = remap(&record.depot_path, &self.branch_root, &to_root)?;
                let mut record = record.clone();
                record.depot_path.clone_from(&path);
                record.local_path = None;
                Some((path, record))
            })
            .collect();
        Snapshot {
            branch_root: to_root,
            revision: self.revision.clone(),
            timestamp: self.timestamp,
            description: self.description.clone(),
            files,
        }
    }

    /// Batch-planner size of a file in KB; `0` for unknown or deleted files.
    pub fn size_kb(&self, depot_path: &str) -> u64 {
        self.get(depot_path).and_then(|r| r.size).map(kilobytes).unwrap_or(0)
    }

    /// The revision to sync a file to so that it matches this snapshot.
    ///
    /// `taken_at` is the revision the snapshot was built at. Snapshots of a
    /// fixed point in history pin each file to its recorded have-revision;
    /// moving markers (`#head`) pin it to the head revision seen when the
    /// snapshot was built. Files without a recorded revision fall back to
    /// `taken_at` itself.
    pub fn sync_revision(&self, depot_path: &str, taken_at: &Revision) -> Revision {
        let record = self.get(depot_path);
        let pinned = match taken_at.is_fixed() {
            true => record.and_then(|r| r.have_revision),
            false => record.and_then(|r| r.head_revision),
        };
        pinned.map(Revision::Number).unwrap_or_else(|| taken_at.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depotsync_depot::FileKind;

    fn sample() -> Snapshot {
        Snapshot::new("//depot/main", &Revision::label("v1"), "sample").with_records([
            FileRecord::new("//depot/main/a.txt", FileKind::Text).with_size(2048).with_revisions(Some(3), Some(5)),
            FileRecord::new("//depot/main/sub/b.bin", FileKind::Binary).with_size(10),
            FileRecord::new("//depot/main/gone.txt", FileKind::Text),
        ])
    }

    #[test]
    fn test_new_normalizes_root_and_revision() {
        let snapshot = sample();
        assert_eq!(snapshot.branch_root, "//depot/main/");
        assert_eq!(snapshot.revision, "@v1");
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.relative("//depot/main/sub/b.bin"), Some("sub/b.bin"));
    }

    #[test]
    fn test_remap_moves_every_path() {
        let remapped = sample().remap("//stream/dev/...");
        assert_eq!(remapped.branch_root, "//stream/dev/");
        let paths: Vec<_> = remapped.paths().cloned().collect();
        assert_eq!(paths, vec!["//stream/dev/a.txt", "//stream/dev/gone.txt", "//stream/dev/sub/b.bin"]);
        assert_eq!(remapped.get("//stream/dev/a.txt").unwrap().depot_path, "//stream/dev/a.txt");
    }

    #[test]
    fn test_size_kb_and_sync_revision() {
        let snapshot = sample();
        assert_eq!(snapshot.size_kb("//depot/main/a.txt"), 3);
        assert_eq!(snapshot.size_kb("//depot/main/sub/b.bin"), 1);
        assert_eq!(snapshot.size_kb("//depot/main/gone.txt"), 0);
        assert_eq!(snapshot.size_kb("//depot/main/unknown"), 0);

        let label = Revision::label("v1");
        assert_eq!(snapshot.sync_revision("//depot/main/a.txt", &label), Revision::Number(3));
        assert_eq!(snapshot.sync_revision("//depot/main/a.txt", &Revision::Head), Revision::Number(5));
        assert_eq!(snapshot.sync_revision("//depot/main/sub/b.bin", &label), label);
    }
}
