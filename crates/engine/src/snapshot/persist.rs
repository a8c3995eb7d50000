use crate::error::{ErrorKind, Result};
use crate::snapshot::Snapshot;
use depotsync_depot::path::flatten;
use exn::ResultExt;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use walkdir::WalkDir;

pub const REVISIONS_EXTENSION: &str = "revisions";

/// 100ns intervals between 0001-01-01 and the Unix epoch.
const TICKS_AT_UNIX_EPOCH: i128 = 621_355_968_000_000_000;

/// Timestamp in 100ns ticks since 0001-01-01, the dating scheme used in
/// artifact file names.
pub fn ticks(timestamp: OffsetDateTime) -> i128 {
    timestamp.unix_timestamp_nanos() / 100 + TICKS_AT_UNIX_EPOCH
}

impl Snapshot {
    /// `<branch root with slashes as dashes>-<revision>-<ticks>.revisions`
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.{REVISIONS_EXTENSION}",
            flatten(&self.branch_root),
            self.revision,
            ticks(self.timestamp)
        )
    }

    /// Write the snapshot into `dir`, returning the artifact's path.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).or_raise(|| ErrorKind::Artifact)?;
        let path = dir.join(self.file_name());
        let json = serde_json::to_vec_pretty(self).or_raise(|| ErrorKind::Artifact)?;
        std::fs::write(&path, json).or_raise(|| ErrorKind::Artifact)?;
        tracing::info!(path = %path.display(), files = self.len(), "Saved snapshot");
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).or_raise(|| ErrorKind::Artifact)?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).or_raise(|| ErrorKind::Artifact)
    }
}

/// Every `.revisions` artifact directly inside `dir`, sorted by name. A
/// missing directory holds no artifacts.
pub fn stored_snapshots(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.or_raise(|| ErrorKind::Artifact)?;
        let is_revisions = entry.path().extension().is_some_and(|e| e == REVISIONS_EXTENSION);
        if entry.file_type().is_file() && is_revisions {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depotsync_depot::{FileKind, FileRecord, Revision};
    use time::macros::datetime;

    #[test]
    fn test_ticks() {
        assert_eq!(ticks(OffsetDateTime::UNIX_EPOCH), 621_355_968_000_000_000);
        assert_eq!(ticks(datetime!(1970-01-01 00:00:01 UTC)), 621_355_968_010_000_000);
    }

    #[test]
    fn test_file_name() {
        let mut snapshot = Snapshot::new("//depot/main/", &Revision::label("v1"), "");
        snapshot.timestamp = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(snapshot.file_name(), "--depot-main--@v1-621355968000000000.revisions");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::new("//depot/main/", &Revision::Changelist(42), "described").with_records([
            FileRecord::new("//depot/main/a.txt", FileKind::Text)
                .with_size(4)
                .with_digest("ABCD")
                .with_revisions(Some(2), Some(9)),
        ]);
        let path = snapshot.save(dir.path().join("nested")).unwrap();
        assert!(path.to_string_lossy().ends_with(".revisions"));

        let loaded = Snapshot::load(&path).unwrap();
        assert_eq!(loaded.revision, "@42");
        assert_eq!(loaded.description, "described");
        let record = loaded.get("//depot/main/a.txt").unwrap();
        assert_eq!(record.have_revision, Some(2));
        // Head revisions are re-derived, never trusted from disk.
        assert_eq!(record.head_revision, None);

        assert_eq!(stored_snapshots(dir.path().join("nested")).unwrap(), vec![path]);
        assert!(stored_snapshots(dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(Snapshot::from_slice(b"not json").is_err());
    }
}
