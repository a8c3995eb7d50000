use crate::Options;
use crate::error::{ErrorKind, Result};
use crate::retry::RetryingExecutor;
use crate::snapshot::Snapshot;
use depotsync_depot::path::branch_root;
use depotsync_depot::{FileRecord, FileSpec, Revision};
use exn::ResultExt;
use std::path::PathBuf;
use tracing::instrument;

/// Builds [`Snapshot`]s from depot metadata, through the executor.
///
/// Discovery walks the branch one directory level at a time with the narrow
/// `*` wildcard until the configured recursion depth, then switches to the
/// wide `...` wildcard for everything below. That keeps each metadata query
/// bounded on wide trees without issuing a query per leaf directory.
///
/// Records of files deleted at the revision are dropped unless
/// [`include_deleted`](Self::include_deleted) is set, in which case deleted
/// directories are walked too.
pub struct SnapshotBuilder<'a> {
    executor: &'a RetryingExecutor,
    recursion_depth: usize,
    page_size: usize,
    include_deleted: bool,
    persist_dir: Option<PathBuf>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(executor: &'a RetryingExecutor, options: &Options) -> Self {
        Self {
            executor,
            recursion_depth: options.recursion_depth,
            page_size: options.limits.max_count.max(1),
            include_deleted: false,
            persist_dir: options.settings_dir.clone(),
        }
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    /// Where snapshots taken at a fixed revision (label, changelist) are
    /// saved. `None` disables saving.
    pub fn persist_to(mut self, dir: Option<PathBuf>) -> Self {
        self.persist_dir = dir;
        self
    }

    /// Snapshot every file under `root` at `revision`.
    #[instrument(skip_all, fields(branch = root, revision = %revision))]
    pub async fn discover(&self, root: &str, revision: &Revision, description: &str) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new(root, revision, description);
        let mut pending = vec![(snapshot.branch_root.clone(), 0usize)];
        while let Some((dir, depth)) = pending.pop() {
            if depth >= self.recursion_depth {
                self.query(&mut snapshot, vec![FileSpec::new(format!("{dir}..."), revision.clone())]).await?;
                continue;
            }
            let level = FileSpec::new(format!("{dir}*"), revision.clone());
            let include_deleted = self.include_deleted;
            let directories = {
                let level = &level;
                self.executor
                    .execute("list_subdirectories", |depot, _| async move {
                        depot.list_subdirectories(level, include_deleted).await
                    })
                    .await
                    .or_raise(|| ErrorKind::Snapshot)?
            };
            tracing::debug!(dir, depth, directories = directories.len(), "Discovered directories");
            self.query(&mut snapshot, vec![level]).await?;
            pending.extend(directories.into_iter().rev().map(|d| (branch_root(d), depth + 1)));
        }
        tracing::info!(files = snapshot.len(), "Built snapshot");
        self.persist(&snapshot, revision)?;
        Ok(snapshot)
    }

    /// Snapshot an explicit list of files at `revision`, querying in pages.
    #[instrument(skip_all, fields(branch = root, revision = %revision, files = paths.len()))]
    pub async fn for_paths(&self, root: &str, paths: &[String], revision: &Revision) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new(root, revision, "");
        for (page, chunk) in paths.chunks(self.page_size).enumerate() {
            tracing::debug!(page, files = chunk.len(), "Querying metadata page");
            self.query(&mut snapshot, FileSpec::all(chunk.iter().cloned(), revision)).await?;
        }
        self.persist(&snapshot, revision)?;
        Ok(snapshot)
    }

    async fn query(&self, snapshot: &mut Snapshot, specs: Vec<FileSpec>) -> Result<()> {
        let specs = &specs;
        let records: Vec<FileRecord> = self
            .executor
            .execute("get_metadata", |depot, _| async move { depot.get_metadata(specs).await })
            .await
            .or_raise(|| ErrorKind::Snapshot)?;
        for record in records {
            if record.is_live() || self.include_deleted {
                snapshot.insert(record);
            }
        }
        Ok(())
    }

    fn persist(&self, snapshot: &Snapshot, revision: &Revision) -> Result<()> {
        if let Some(dir) = &self.persist_dir
            && revision.is_fixed()
        {
            snapshot.save(dir)?;
        }
        Ok(())
    }
}
