//! Matching the workspace's have-state against stored label snapshots.
//!
//! Label snapshots are the `.revisions` artifacts saved whenever a snapshot is
//! taken at a label or changelist. A label is only comparable when it covers
//! every path the workspace has; otherwise it is rejected with the counts of
//! what it lacks and what it adds. Label-only paths do not affect a
//! comparable label.

use crate::Options;
use crate::diff::diff;
use crate::error::{ErrorKind, Result};
use crate::retry::RetryingExecutor;
use crate::snapshot::{Snapshot, SnapshotBuilder, stored_snapshots};
use depotsync_depot::Revision;
use depotsync_depot::path::branch_root;
use exn::OptionExt;
use std::path::Path;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The label's path set differs from the have set.
    Rejected {
        /// Have paths the label does not contain.
        missing: usize,
        /// Label paths the workspace does not have.
        extra: usize,
    },
    Compared { matching: usize, differing: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatch {
    /// Label or changelist the candidate was taken at, without the `@`.
    pub label: String,
    pub description: String,
    pub verdict: Verdict,
}
impl LabelMatch {
    pub fn is_full_match(&self) -> bool {
        matches!(self.verdict, Verdict::Compared { differing: 0, .. })
    }
}

/// Compare `have` with every candidate, in order.
///
/// Candidates of another branch are remapped onto `have`'s root first.
pub fn match_against(have: &Snapshot, candidates: &[Snapshot]) -> Vec<LabelMatch> {
    candidates
        .iter()
        .map(|candidate| {
            let candidate = match candidate.branch_root == have.branch_root {
                true => candidate.clone(),
                false => candidate.remap(&have.branch_root),
            };
            let d = diff(have, &candidate);
            let verdict = match d.common.len() == have.len() {
                true => Verdict::Compared { matching: d.identical.len(), differing: d.differing.len() },
                false => Verdict::Rejected { missing: d.deleted_files.len(), extra: d.new_files.len() },
            };
            let label = candidate.revision.trim_start_matches('@').to_string();
            tracing::debug!(label = %label, ?verdict, "Compared label with have");
            LabelMatch { label, description: candidate.description, verdict }
        })
        .collect()
}

/// The compared candidate with the fewest differing files. Ties go to the
/// earliest candidate.
pub fn best_match(matches: &[LabelMatch]) -> Option<&LabelMatch> {
    matches
        .iter()
        .filter_map(|m| match m.verdict {
            Verdict::Compared { differing, .. } => Some((differing, m)),
            Verdict::Rejected { .. } => None,
        })
        .min_by_key(|(differing, _)| *differing)
        .map(|(_, m)| m)
}

/// Stored label snapshots of `root` in `dir`.
///
/// Have snapshots, snapshots of other roots and artifacts that fail to parse
/// are skipped.
pub fn load_candidates(dir: impl AsRef<Path>, root: &str) -> Result<Vec<Snapshot>> {
    let root = branch_root(root);
    let have = Revision::Have.to_string();
    let mut candidates = Vec::new();
    for path in stored_snapshots(dir)? {
        if path.file_name().is_some_and(|name| name.to_string_lossy().contains(&have)) {
            continue;
        }
        match Snapshot::load(&path) {
            Ok(snapshot) if snapshot.branch_root == root => candidates.push(snapshot),
            Ok(_) => tracing::debug!(path = %path.display(), "Stored snapshot belongs to another branch"),
            Err(e) => tracing::warn!(path = %path.display(), error = %&*e, "Ignoring unreadable snapshot"),
        }
    }
    Ok(candidates)
}

/// Snapshot `root` at `#have`, store it, and match it against the labels
/// stored in the settings directory.
#[instrument(skip_all, fields(branch = root))]
pub async fn match_have_to_labels(
    executor: &RetryingExecutor,
    options: &Options,
    root: &str,
) -> Result<Vec<LabelMatch>> {
    let dir = options
        .settings_dir
        .as_deref()
        .ok_or_raise(|| ErrorKind::Invalid("no settings directory to load labels from".to_string()))?;
    let have = SnapshotBuilder::new(executor, options).discover(root, &Revision::Have, "").await?;
    have.save(dir)?;
    let candidates = load_candidates(dir, &have.branch_root)?;
    let matches = match_against(&have, &candidates);
    tracing::info!(
        candidates = candidates.len(),
        full = matches.iter().filter(|m| m.is_full_match()).count(),
        "Matched have against stored labels"
    );
    Ok(matches)
}
