//! Resilient sync of a branch to a target revision or label.
//!
//! The working copy's `#have` state is compared against the target snapshot
//! and only the difference is transferred: deletions first, then updates,
//! then additions, each phase in planner-bounded batches through the
//! executor's sync policy. A phase whose batch fails for good stops there;
//! later phases still run and the failure is reported, never rolled back.
//! Afterwards the touched paths are verified against the depot and the
//! local disk.

use crate::batch::{self, Batch, no_size};
use crate::checksum;
use crate::confirm::{Confirm, Outcome};
use crate::diff::diff;
use crate::error::{ErrorKind, Result};
use crate::retry::RetryingExecutor;
use crate::snapshot::{Snapshot, SnapshotBuilder};
use crate::Options;
use async_stream::stream;
use depotsync_depot::{FileSpec, Revision};
use derive_more::Display;
use futures::{Stream, StreamExt, pin_mut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Phase {
    #[display("delete")]
    Delete,
    #[display("update")]
    Update,
    #[display("add")]
    Add,
}

/// File counts of a planned sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub unchanged: usize,
    pub to_add: usize,
    pub to_delete: usize,
    pub to_update: usize,
}
impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add == 0 && self.to_delete == 0 && self.to_update == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub batches: usize,
    pub completed_batches: usize,
    /// Paths the depot reported as synced.
    pub synced: usize,
    /// Why the phase stopped early, if it did.
    pub failure: Option<String>,
}
impl PhaseReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.completed_batches == self.batches
    }
}

/// Post-sync check of every path the sync meant to touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    pub checked: usize,
    /// Deleted in the target but still in the workspace.
    pub still_present: Vec<String>,
    /// Added or updated, but the workspace has another revision (or none).
    pub wrong_revision: Vec<String>,
    /// The workspace revision is right but the local file is missing or
    /// its normalized size differs from the target.
    pub content_mismatch: Vec<String>,
}
impl Verification {
    pub fn is_verified(&self) -> bool {
        self.still_present.is_empty() && self.wrong_revision.is_empty() && self.content_mismatch.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub plan: SyncPlan,
    pub phases: Vec<PhaseReport>,
    pub verification: Option<Verification>,
}
impl SyncReport {
    /// Every phase finished and verification found nothing wrong.
    pub fn is_verified(&self) -> bool {
        self.phases.iter().all(PhaseReport::is_complete) && self.verification.as_ref().is_none_or(|v| v.is_verified())
    }
}

/// Progress events emitted by [`sync_to`].
///
/// Events follow a strict ordering:
/// 1. [`Started`](Self::Started), exactly once.
/// 2. [`Planned`](Self::Planned), exactly once, when both snapshots are built.
/// 3. [`Declined`](Self::Declined) if confirmation was refused, which ends
///    the stream.
/// 4. [`BatchComplete`](Self::BatchComplete), once per successful batch.
/// 5. [`Verified`](Self::Verified), after the last phase.
/// 6. [`Complete`](Self::Complete), exactly once.
///
/// A failed snapshot ends the stream with an `Err` item. Dropping the stream
/// between events abandons the sync at a batch boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started,
    Planned(SyncPlan),
    BatchComplete { phase: Phase, batch: usize, batches: usize, synced: usize },
    Declined,
    Verified(Verification),
    Complete(SyncReport),
}

/// Streams [`SyncEvent`]s while bringing `branch_root` to `target`.
pub fn sync_to<'a>(
    executor: &'a RetryingExecutor,
    options: &'a Options,
    branch_root: &'a str,
    target: &'a Revision,
    confirm: &'a dyn Confirm,
) -> impl Stream<Item = Result<SyncEvent>> + 'a {
    // `rustfmt` does not format macros that use braces. Wrap in parentheses!
    stream!({
        yield Ok(SyncEvent::Started);
        let builder = SnapshotBuilder::new(executor, options);
        let have = match builder.discover(branch_root, &Revision::Have, "have").await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                yield Err(e);
                return;
            },
        };
        let wanted = match builder.discover(branch_root, target, &format!("sync target {target}")).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                yield Err(e);
                return;
            },
        };

        let difference = diff(&have, &wanted);
        let plan = SyncPlan {
            unchanged: difference.identical.len(),
            to_add: difference.new_files.len(),
            to_delete: difference.deleted_files.len(),
            to_update: difference.differing.len(),
        };
        tracing::info!(
            branch = %wanted.branch_root,
            target = %target,
            unchanged = plan.unchanged,
            add = plan.to_add,
            delete = plan.to_delete,
            update = plan.to_update,
            "Planned sync"
        );
        yield Ok(SyncEvent::Planned(plan));

        let mut report = SyncReport { plan, ..Default::default() };
        if plan.is_empty() {
            yield Ok(SyncEvent::Complete(report));
            return;
        }
        let prompt = format!(
            "Sync {} to {target}: delete {}, update {}, add {} files?",
            wanted.branch_root, plan.to_delete, plan.to_update, plan.to_add
        );
        if !confirm.confirm(&prompt) {
            yield Ok(SyncEvent::Declined);
            return;
        }

        let size_kb = |path: &str| wanted.size_kb(path);
        let phases = [
            (Phase::Delete, batch::plan(&difference.deleted_files, no_size, options.limits)),
            (Phase::Update, batch::plan(&difference.differing, size_kb, options.limits)),
            (Phase::Add, batch::plan(&difference.new_files, size_kb, options.limits)),
        ];
        for (phase, batches) in phases {
            let mut phase_report =
                PhaseReport { phase, batches: batches.len(), completed_batches: 0, synced: 0, failure: None };
            for (index, batch) in batches.iter().enumerate() {
                match sync_batch(executor, &wanted, target, phase, batch).await {
                    Ok(synced) => {
                        phase_report.completed_batches += 1;
                        phase_report.synced += synced;
                        yield Ok(SyncEvent::BatchComplete { phase, batch: index + 1, batches: batches.len(), synced });
                    },
                    Err(e) => {
                        let reason = (*e).to_string();
                        tracing::error!(%phase, batch = index + 1, error = %reason, "Sync phase aborted");
                        phase_report.failure = Some(reason);
                        break;
                    },
                }
            }
            report.phases.push(phase_report);
        }

        match verify(executor, options, &wanted, target, &difference).await {
            Ok(verification) => {
                if !verification.is_verified() {
                    tracing::warn!(
                        still_present = verification.still_present.len(),
                        wrong_revision = verification.wrong_revision.len(),
                        content_mismatch = verification.content_mismatch.len(),
                        "Sync verification found mismatches"
                    );
                }
                report.verification = Some(verification.clone());
                yield Ok(SyncEvent::Verified(verification));
            },
            Err(e) => {
                yield Err(e);
                return;
            },
        }
        yield Ok(SyncEvent::Complete(report));
    })
}

/// Runs [`sync_to`] to completion.
pub async fn sync(
    executor: &RetryingExecutor,
    options: &Options,
    branch_root: &str,
    target: &Revision,
    confirm: &dyn Confirm,
) -> Result<Outcome<SyncReport>> {
    let events = sync_to(executor, options, branch_root, target, confirm);
    pin_mut!(events);
    while let Some(event) = events.next().await {
        match event? {
            SyncEvent::Declined => return Ok(Outcome::Declined { changelist: None }),
            SyncEvent::Complete(report) if report.plan.is_empty() => return Ok(Outcome::NothingToDo),
            SyncEvent::Complete(report) => return Ok(Outcome::Applied(report)),
            _ => {},
        }
    }
    exn::bail!(ErrorKind::Invalid("sync stream ended without completing".to_string()))
}

async fn sync_batch(
    executor: &RetryingExecutor,
    wanted: &Snapshot,
    target: &Revision,
    phase: Phase,
    batch: &Batch,
) -> Result<usize> {
    let specs: Vec<FileSpec> = match phase {
        Phase::Delete => FileSpec::all(batch.paths.iter().cloned(), &Revision::None),
        Phase::Update | Phase::Add => {
            batch.paths.iter().map(|p| FileSpec::new(p.clone(), wanted.sync_revision(p, target))).collect()
        },
    };
    tracing::debug!(%phase, files = batch.len(), size_kb = batch.size_kb, "Syncing batch");
    let specs = &specs;
    let synced = executor
        .execute_sync("sync_files", |depot, _| async move { depot.sync_files(specs, false).await })
        .await?;
    Ok(synced.len())
}

async fn verify(
    executor: &RetryingExecutor,
    options: &Options,
    wanted: &Snapshot,
    target: &Revision,
    difference: &crate::diff::Diff,
) -> Result<Verification> {
    let changed: Vec<String> = difference.differing.iter().chain(&difference.new_files).cloned().collect();
    let touched: Vec<String> = difference.deleted_files.iter().chain(&changed).cloned().collect();
    let after = SnapshotBuilder::new(executor, options)
        .persist_to(None)
        .for_paths(&wanted.branch_root, &touched, &Revision::Have)
        .await?;

    let mut verification = Verification { checked: touched.len(), ..Default::default() };
    verification.still_present = difference.deleted_files.iter().filter(|p| after.contains(p)).cloned().collect();
    for path in changed {
        let Some(record) = after.get(&path) else {
            verification.wrong_revision.push(path);
            continue;
        };
        if let Revision::Number(expected) = wanted.sync_revision(&path, target)
            && record.have_revision != Some(expected)
        {
            verification.wrong_revision.push(path);
            continue;
        }
        let Some(local) = &record.local_path else {
            tracing::debug!(path, "No local path reported; skipping content check");
            continue;
        };
        let Some(expected) = wanted.get(&path) else {
            continue;
        };
        let matches = checksum::local_record(local, path.as_str(), expected.file_type.clone(), false)
            .is_ok_and(|local| local.size == expected.size);
        if !matches {
            verification.content_mismatch.push(path);
        }
    }
    verification.still_present.sort();
    verification.wrong_revision.sort();
    verification.content_mismatch.sort();
    tracing::info!(checked = verification.checked, verified = verification.is_verified(), "Verified sync");
    Ok(verification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::{AutoConfirm, Decline, Scripted};
    use crate::testing::connected;
    use depotsync_depot::error::ErrorKind as DepotErrorKind;
    use depotsync_depot::remote::MockDepot;
    use depotsync_depot::FileKind;
    use std::path::Path;
    use std::sync::Arc;

    /// `v1` labels the first state; the workspace is synced to head, which
    /// edits `a.txt`, deletes `old.txt` and adds `sub/new.bin`.
    fn depot(local: &Path) -> MockDepot {
        MockDepot::default()
            .with_workspace("ws", "//depot/main/", local)
            .with_change(
                "import",
                [
                    ("//depot/main/a.txt", FileKind::Text, Some(&b"first\n"[..])),
                    ("//depot/main/same.txt", FileKind::Text, Some(&b"same\n"[..])),
                    ("//depot/main/old.txt", FileKind::Text, Some(&b"old\n"[..])),
                ],
            )
            .with_label("v1", "//depot/main/")
            .with_change(
                "rework",
                [
                    ("//depot/main/a.txt", FileKind::Text, Some(&b"second version\n"[..])),
                    ("//depot/main/old.txt", FileKind::Text, None),
                    ("//depot/main/sub/new.bin", FileKind::Binary, Some(&b"\x00\x01\x02"[..])),
                ],
            )
            .with_synced("//depot/main/")
    }

    fn options() -> Options {
        Options { limits: crate::BatchLimits { max_count: 1, max_size_kb: 100 }, ..Options::default() }
    }

    #[tokio::test]
    async fn test_sync_to_label_reconciles_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let depot = Arc::new(depot(dir.path()));
        let executor = connected(depot.clone()).await;

        let outcome = sync(&executor, &options(), "//depot/main", &Revision::label("v1"), &AutoConfirm).await.unwrap();
        let report = outcome.applied().unwrap();
        // Label v1 has old.txt (not in the workspace) and the first a.txt;
        // sub/new.bin is not labelled.
        assert_eq!(report.plan, SyncPlan { unchanged: 1, to_add: 1, to_delete: 1, to_update: 1 });
        let phases: Vec<_> = report.phases.iter().map(|p| (p.phase, p.synced)).collect();
        assert_eq!(phases, vec![(Phase::Delete, 1), (Phase::Update, 1), (Phase::Add, 1)]);
        assert!(report.is_verified(), "{report:?}");

        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"first\n");
        assert_eq!(std::fs::read(dir.path().join("old.txt")).unwrap(), b"old\n");
        assert!(!dir.path().join("sub/new.bin").exists());
        assert_eq!(depot.have("//depot/main/a.txt").await, Some(1));
    }

    #[tokio::test]
    async fn test_event_order() {
        let dir = tempfile::tempdir().unwrap();
        let executor = connected(Arc::new(depot(dir.path()))).await;
        let options = options();
        let target = Revision::label("v1");
        let events: Vec<_> = sync_to(&executor, &options, "//depot/main/", &target, &AutoConfirm)
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(events.len(), 7);
        assert_eq!(events[0], SyncEvent::Started);
        assert!(matches!(events[1], SyncEvent::Planned(_)));
        assert_eq!(events[2], SyncEvent::BatchComplete { phase: Phase::Delete, batch: 1, batches: 1, synced: 1 });
        assert!(matches!(events[3], SyncEvent::BatchComplete { phase: Phase::Update, .. }));
        assert!(matches!(events[4], SyncEvent::BatchComplete { phase: Phase::Add, .. }));
        assert!(matches!(&events[5], SyncEvent::Verified(v) if v.is_verified()));
        assert!(matches!(events[6], SyncEvent::Complete(_)));
    }

    #[tokio::test]
    async fn test_up_to_date_needs_no_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let depot = Arc::new(depot(dir.path()));
        let executor = connected(depot.clone()).await;
        let confirm = Scripted::default();
        let outcome = sync(&executor, &options(), "//depot/main/", &Revision::Head, &confirm).await.unwrap();
        assert_eq!(outcome, Outcome::NothingToDo);
        assert!(confirm.prompts().is_empty());
        assert!(!depot.calls().await.contains(&"sync_files".to_string()));
    }

    #[tokio::test]
    async fn test_declined_sync_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let depot = Arc::new(depot(dir.path()));
        let executor = connected(depot.clone()).await;
        let outcome = sync(&executor, &options(), "//depot/main/", &Revision::label("v1"), &Decline).await.unwrap();
        assert!(outcome.is_declined());
        assert!(!depot.calls().await.contains(&"sync_files".to_string()));
        assert_eq!(depot.have("//depot/main/a.txt").await, Some(2));
    }

    #[tokio::test]
    async fn test_failed_phase_is_reported_and_later_phases_run() {
        let dir = tempfile::tempdir().unwrap();
        let depot = Arc::new(depot(dir.path()));
        let executor = connected(depot.clone()).await;
        let options = options();
        let target = Revision::label("v1");
        let events = sync_to(&executor, &options, "//depot/main/", &target, &AutoConfirm);
        pin_mut!(events);

        // Let discovery finish, then break the delete phase for good.
        while let Some(event) = events.next().await {
            if matches!(event.unwrap(), SyncEvent::Planned(_)) {
                break;
            }
        }
        depot.fail_next([DepotErrorKind::Unauthorized("ticket expired".into())]).await;
        let mut report = None;
        while let Some(event) = events.next().await {
            if let SyncEvent::Complete(r) = event.unwrap() {
                report = Some(r);
            }
        }
        let report = report.unwrap();
        assert!(report.phases[0].failure.is_some());
        assert!(report.phases[1].is_complete());
        assert!(report.phases[2].is_complete());
        assert!(!report.is_verified());
        assert_eq!(report.verification.unwrap().still_present, vec!["//depot/main/sub/new.bin"]);
        assert_eq!(depot.have("//depot/main/a.txt").await, Some(1));
        assert_eq!(depot.have("//depot/main/old.txt").await, Some(1));
    }
}
