//! Snapshot comparison.

use crate::snapshot::Snapshot;

/// Classification of the paths of two snapshots.
///
/// Every list is sorted by depot path. `identical` and `differing` partition
/// `common` using [`FileRecord`](depotsync_depot::FileRecord) equality (size,
/// kind and digest).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// In `b` but not in `a`.
    pub new_files: Vec<String>,
    /// In `a` but not in `b`.
    pub deleted_files: Vec<String>,
    pub common: Vec<String>,
    pub identical: Vec<String>,
    pub differing: Vec<String>,
}
impl Diff {
    /// `true` when `b` adds, removes and changes nothing relative to `a`.
    pub fn is_unchanged(&self) -> bool {
        self.new_files.is_empty() && self.deleted_files.is_empty() && self.differing.is_empty()
    }
}

/// Compare two snapshots by depot path.
///
/// Snapshots of different branches must be [remapped](Snapshot::remap) onto
/// the same root first.
pub fn diff(a: &Snapshot, b: &Snapshot) -> Diff {
    let mut result = Diff::default();
    for (path, record) in &a.files {
        match b.files.get(path) {
            Some(other) => {
                result.common.push(path.clone());
                match record == other {
                    true => result.identical.push(path.clone()),
                    false => result.differing.push(path.clone()),
                }
            },
            None => result.deleted_files.push(path.clone()),
        }
    }
    result.new_files = b.files.keys().filter(|path| !a.files.contains_key(*path)).cloned().collect();
    tracing::debug!(
        unchanged = result.identical.len(),
        new = result.new_files.len(),
        deleted = result.deleted_files.len(),
        updated = result.differing.len(),
        "Compared snapshots"
    );
    result
}
