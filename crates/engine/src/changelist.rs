//! Pending changelist housekeeping.

use crate::confirm::{Confirm, Outcome};
use crate::error::{ErrorKind, Result};
use crate::retry::RetryingExecutor;
use crate::Options;
use depotsync_depot::ChangelistQuery;
use tracing::instrument;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub deleted: Vec<u32>,
    /// Changelists the depot refused to delete, with the reason.
    pub failed: Vec<(u32, String)>,
}

/// Delete the pending changelists of `user` in `workspace` that have no
/// opened files and nothing shelved.
#[instrument(skip_all, fields(user = user, workspace = workspace))]
pub async fn clean_empty_changelists(
    executor: &RetryingExecutor,
    options: &Options,
    user: &str,
    workspace: &str,
    confirm: &dyn Confirm,
) -> Result<Outcome<CleanReport>> {
    let query = ChangelistQuery::pending(options.changes_to_receive).for_user(user).for_workspace(workspace);
    let pending = {
        let query = &query;
        executor
            .execute("list_changelists", |depot, _| async move { depot.list_changelists(query).await })
            .await?
    };

    let mut empty = Vec::new();
    for summary in pending.into_iter().filter(|c| c.id != 0 && !c.shelved) {
        let id = summary.id;
        let opened = executor
            .execute("get_opened_files", |depot, _| async move { depot.get_opened_files(&[], Some(id)).await })
            .await?;
        if opened.is_empty() {
            empty.push(id);
        }
    }
    if empty.is_empty() {
        tracing::info!("No empty pending changelists");
        return Ok(Outcome::NothingToDo);
    }
    let listed: Vec<String> = empty.iter().map(u32::to_string).collect();
    let prompt = format!("This will delete {} empty pending changes ({}). Continue?", empty.len(), listed.join(", "));
    if !confirm.confirm(&prompt) {
        return Ok(Outcome::Declined { changelist: None });
    }

    let mut report = CleanReport::default();
    for id in empty {
        match executor
            .execute("delete_changelist", |depot, _| async move { depot.delete_changelist(id).await })
            .await
        {
            Ok(()) => report.deleted.push(id),
            Err(e) => {
                tracing::warn!(changelist = id, error = %&*e, "Could not delete changelist");
                report.failed.push((id, (*e).to_string()));
            },
        }
    }
    tracing::info!(deleted = report.deleted.len(), failed = report.failed.len(), "Cleaned empty changelists");
    Ok(Outcome::Applied(report))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReport {
    /// Changelist created to hold the default changelist's files.
    pub created: Option<u32>,
    /// Pending changelist and the number it was submitted as.
    pub submitted: Vec<(u32, u32)>,
}
impl SubmitReport {
    fn is_started(&self) -> bool {
        self.created.is_some() || !self.submitted.is_empty()
    }
}

/// Submit each changelist of `ids`.
///
/// The default changelist (`0`) cannot be submitted as is: its files are
/// first moved into a new changelist described by `default_description`.
/// Changelists with shelved files need their shelf deleted first. Each of
/// those steps, and the final submit, asks `confirm`.
///
/// Once a changelist has been created or submitted, a failure is returned as
/// [`Outcome::Interrupted`] carrying the [`SubmitReport`] so far. Not every
/// default file moving into the new changelist is such a failure; nothing is
/// submitted in that case.
#[instrument(skip_all, fields(changelists = ?ids))]
pub async fn submit_changelists(
    executor: &RetryingExecutor,
    ids: &[u32],
    default_description: &str,
    confirm: &dyn Confirm,
) -> Result<Outcome<SubmitReport>> {
    let mut report = SubmitReport::default();
    let result = submit_into(executor, ids, default_description, confirm, &mut report).await;
    match result {
        Ok(outcome) => Ok(outcome.map(|()| report)),
        Err(e) if report.is_started() => {
            tracing::error!(
                created = ?report.created,
                submitted = report.submitted.len(),
                error = %&*e,
                "Submit interrupted"
            );
            Ok(Outcome::Interrupted { partial: report, reason: (*e).to_string() })
        },
        Err(e) => Err(e),
    }
}

async fn submit_into(
    executor: &RetryingExecutor,
    ids: &[u32],
    default_description: &str,
    confirm: &dyn Confirm,
    report: &mut SubmitReport,
) -> Result<Outcome<()>> {
    let mut targets = Vec::with_capacity(ids.len());
    for &id in ids {
        if id == 0 {
            let opened = executor
                .execute("get_opened_files", |depot, _| async move { depot.get_opened_files(&[], Some(0)).await })
                .await?;
            if opened.is_empty() {
                tracing::info!("Default changelist has no opened files");
                continue;
            }
            let paths: Vec<String> = opened.into_iter().map(|r| r.depot_path).collect();
            let prompt =
                format!("This will move {} files from the default change into a new numbered change. Continue?", paths.len());
            if !confirm.confirm(&prompt) {
                return Ok(Outcome::Declined { changelist: report.created });
            }
            let number = executor
                .execute("create_changelist", |depot, _| async move {
                    depot.create_changelist(default_description).await
                })
                .await?;
            report.created = Some(number);
            let moved = {
                let paths = &paths;
                executor
                    .execute("reopen_files", |depot, _| async move { depot.reopen_files(paths, number).await })
                    .await?
            };
            if moved.len() != paths.len() {
                exn::bail!(ErrorKind::Changelist(
                    0,
                    format!("moved {} of {} files into change {number}", moved.len(), paths.len())
                ));
            }
            tracing::info!(changelist = number, files = moved.len(), "Moved default changelist");
            targets.push(number);
            continue;
        }

        let description = executor
            .execute("describe_changelist", |depot, _| async move { depot.describe_changelist(id).await })
            .await?;
        if !description.summary.is_pending() {
            exn::bail!(ErrorKind::Changelist(id, "already submitted".to_string()));
        }
        if description.summary.shelved {
            let prompt = format!("Change {id} has shelved files, which must be deleted before submitting. Delete them?");
            if !confirm.confirm(&prompt) {
                return Ok(Outcome::Declined { changelist: report.created });
            }
            executor
                .execute("delete_shelved_files", |depot, _| async move { depot.delete_shelved_files(id).await })
                .await?;
            tracing::info!(changelist = id, "Deleted shelved files");
        }
        targets.push(id);
    }
    if targets.is_empty() {
        return Ok(Outcome::NothingToDo);
    }

    let listed: Vec<String> = targets.iter().map(u32::to_string).collect();
    if !confirm.confirm(&format!("This will submit {} changes ({}). Continue?", targets.len(), listed.join(", "))) {
        return Ok(Outcome::Declined { changelist: report.created });
    }
    for id in targets {
        let number = executor
            .execute_sync("submit_changelist", |depot, _| async move { depot.submit_changelist(id).await })
            .await?;
        tracing::info!(changelist = id, submitted = number, "Submitted");
        report.submitted.push((id, number));
    }
    Ok(Outcome::Applied(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::{AutoConfirm, Decline, Scripted};
    use crate::testing::connected;
    use depotsync_depot::error::ErrorKind as DepotErrorKind;
    use depotsync_depot::remote::MockDepot;
    use depotsync_depot::{Depot, FileAction, FileKind};
    use std::path::Path;
    use std::sync::Arc;

    fn imported(local: &Path) -> MockDepot {
        MockDepot::default()
            .with_workspace("ws", "//depot/main/", local)
            .with_change("import", [
                ("//depot/main/a.txt", FileKind::Text, Some(&b"a\n"[..])),
                ("//depot/main/b.txt", FileKind::Text, Some(&b"b\n"[..])),
            ])
            .with_synced("//depot/main/")
    }

    fn housekeeping(local: &Path) -> MockDepot {
        imported(local)
            .with_pending(10, "work", [("//depot/main/a.txt", FileAction::Edit)])
            .with_pending(11, "empty", std::iter::empty())
            .with_pending(12, "shelved", std::iter::empty())
            .with_shelved(12)
            .with_pending(13, "also empty", std::iter::empty())
    }

    #[tokio::test]
    async fn test_clean_deletes_only_empty_unshelved() {
        let workspace = tempfile::tempdir().unwrap();
        let depot = Arc::new(housekeeping(workspace.path()));
        let executor = connected(depot.clone()).await;
        let confirm = Scripted::new([true]);

        let outcome =
            clean_empty_changelists(&executor, &Options::default(), "mock", "ws", &confirm).await.unwrap();
        let report = outcome.applied().unwrap();
        assert_eq!(report.deleted, vec![13, 11]);
        assert!(report.failed.is_empty());
        assert_eq!(confirm.prompts(), vec!["This will delete 2 empty pending changes (13, 11). Continue?"]);
        assert!(depot.has_changelist(10).await);
        assert!(!depot.has_changelist(11).await);
        assert!(depot.has_changelist(12).await);
        assert!(!depot.has_changelist(13).await);
    }

    #[tokio::test]
    async fn test_clean_declined_and_nothing_to_do() {
        let workspace = tempfile::tempdir().unwrap();
        let depot = Arc::new(housekeeping(workspace.path()));
        let executor = connected(depot.clone()).await;

        let outcome = clean_empty_changelists(&executor, &Options::default(), "mock", "ws", &Decline).await.unwrap();
        assert!(outcome.is_declined());
        assert!(depot.has_changelist(11).await);

        let outcome =
            clean_empty_changelists(&executor, &Options::default(), "someone-else", "ws", &AutoConfirm).await.unwrap();
        assert_eq!(outcome, Outcome::NothingToDo);
    }

    #[tokio::test]
    async fn test_submit_default_and_shelved() {
        let workspace = tempfile::tempdir().unwrap();
        let depot = Arc::new(
            imported(workspace.path())
                .with_pending(0, "default", [("//depot/main/a.txt", FileAction::Edit)])
                .with_pending(10, "fix b", [("//depot/main/b.txt", FileAction::Edit)])
                .with_shelved(10),
        );
        std::fs::write(workspace.path().join("a.txt"), b"a2\n").unwrap();
        let executor = connected(depot.clone()).await;
        let confirm = Scripted::new([true, true, true]);

        let outcome = submit_changelists(&executor, &[0, 10], "Default changes", &confirm).await.unwrap();
        let report = outcome.applied().unwrap();
        assert_eq!(report.created, Some(11));
        assert_eq!(report.submitted, vec![(11, 12), (10, 13)]);
        assert_eq!(confirm.prompts().len(), 3);
        assert!(depot.opened_in(0).await.is_empty());
        assert_eq!(depot.have("//depot/main/a.txt").await, Some(2));
        assert_eq!(depot.have("//depot/main/b.txt").await, Some(2));
        let submitted = depot.describe_changelist(12).await.unwrap();
        assert_eq!(submitted.summary.description, "Default changes");
    }

    #[tokio::test]
    async fn test_submit_declined_keeps_created_changelist() {
        let workspace = tempfile::tempdir().unwrap();
        let depot = Arc::new(
            imported(workspace.path())
                .with_pending(0, "default", [("//depot/main/a.txt", FileAction::Edit)])
                .with_pending(10, "fix b", [("//depot/main/b.txt", FileAction::Edit)])
                .with_shelved(10),
        );
        let executor = connected(depot.clone()).await;
        let confirm = Scripted::new([true, false]);

        let outcome = submit_changelists(&executor, &[0, 10], "Default changes", &confirm).await.unwrap();
        assert_eq!(outcome, Outcome::Declined { changelist: Some(11) });
        assert_eq!(depot.opened_in(11).await, vec![("//depot/main/a.txt".to_string(), FileAction::Edit)]);
        assert!(depot.describe_changelist(10).await.unwrap().summary.shelved);
    }

    #[tokio::test]
    async fn test_submit_empty_default_is_nothing_to_do() {
        let workspace = tempfile::tempdir().unwrap();
        let depot = Arc::new(imported(workspace.path()));
        let executor = connected(depot.clone()).await;

        let outcome = submit_changelists(&executor, &[0], "Default changes", &AutoConfirm).await.unwrap();
        assert_eq!(outcome, Outcome::NothingToDo);
        assert!(!depot.calls().await.contains(&"create_changelist".to_string()));
    }

    #[tokio::test]
    async fn test_failed_move_reports_created_changelist() {
        let workspace = tempfile::tempdir().unwrap();
        let depot =
            Arc::new(imported(workspace.path()).with_pending(0, "default", [("//depot/main/a.txt", FileAction::Edit)]));
        let executor = connected(depot.clone()).await;
        depot.fail_on("reopen_files", DepotErrorKind::Unauthorized("ticket expired".into())).await;

        let outcome = submit_changelists(&executor, &[0], "Default changes", &AutoConfirm).await.unwrap();
        let Outcome::Interrupted { partial, reason } = outcome else {
            panic!("expected an interrupted submit");
        };
        let created = partial.created.unwrap();
        assert!(partial.submitted.is_empty());
        assert!(reason.contains("reopen_files"), "{reason}");
        assert!(depot.has_changelist(created).await);
        assert!(depot.opened_in(created).await.is_empty());
        assert_eq!(depot.opened_in(0).await, vec![("//depot/main/a.txt".to_string(), FileAction::Edit)]);
    }

    #[tokio::test]
    async fn test_failure_before_any_change_is_raised() {
        let workspace = tempfile::tempdir().unwrap();
        let depot =
            Arc::new(imported(workspace.path()).with_pending(10, "fix", [("//depot/main/b.txt", FileAction::Edit)]));
        let executor = connected(depot.clone()).await;
        depot.fail_on("describe_changelist", DepotErrorKind::Unauthorized("ticket expired".into())).await;

        assert!(submit_changelists(&executor, &[10], "Default changes", &AutoConfirm).await.is_err());
    }
}
