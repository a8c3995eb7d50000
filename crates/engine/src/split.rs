//! Splitting a pending changelist into several bounded ones.
//!
//! Files are grouped by the batch planner using their size on disk. Every
//! group, the first included, is reopened into a changelist of its own, so a
//! complete split leaves the original changelist empty.

use crate::batch::{self, kilobytes};
use crate::confirm::{Confirm, Outcome};
use crate::error::{ErrorKind, Result};
use crate::retry::RetryingExecutor;
use crate::Options;
use std::collections::HashMap;
use tracing::instrument;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitBatch {
    /// The changelist created for this batch, if creating it succeeded.
    pub changelist: Option<u32>,
    pub files: Vec<String>,
    /// Files the depot reports as reopened into `changelist`.
    pub moved: Vec<String>,
    pub failure: Option<String>,
}
impl SplitBatch {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.moved.len() == self.files.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitReport {
    pub original: u32,
    pub batches: Vec<SplitBatch>,
}
impl SplitReport {
    pub fn is_complete(&self) -> bool {
        self.batches.iter().all(SplitBatch::is_complete)
    }

    pub fn changelists(&self) -> Vec<u32> {
        self.batches.iter().filter_map(|b| b.changelist).collect()
    }
}

/// Split pending changelist `changelist` into planner-sized changelists.
///
/// Returns [`Outcome::NothingToDo`] when the files fit in one batch. A batch
/// that fails is recorded in its [`SplitBatch`] and the remaining batches
/// are still attempted; batches already moved stay where they are.
#[instrument(skip_all, fields(changelist = changelist))]
pub async fn split_changelist(
    executor: &RetryingExecutor,
    options: &Options,
    changelist: u32,
    confirm: &dyn Confirm,
) -> Result<Outcome<SplitReport>> {
    let description = executor
        .execute("describe_changelist", |depot, _| async move { depot.describe_changelist(changelist).await })
        .await?;
    if !description.summary.is_pending() {
        exn::bail!(ErrorKind::Changelist(changelist, "only pending changelists can be split".to_string()));
    }

    let sizes: HashMap<String, u64> = description
        .files
        .iter()
        .map(|record| {
            let bytes = record.local_path.as_ref().and_then(|p| std::fs::metadata(p).ok()).map_or(0, |m| m.len());
            (record.depot_path.clone(), kilobytes(bytes))
        })
        .collect();
    let paths: Vec<String> = description.files.iter().map(|r| r.depot_path.clone()).collect();
    let batches = batch::plan(&paths, |p| sizes.get(p).copied().unwrap_or(0), options.limits);
    if batches.len() <= 1 {
        tracing::info!(files = paths.len(), "Changelist fits in a single batch, not splitting");
        return Ok(Outcome::NothingToDo);
    }

    let prompt = format!(
        "This will split change {changelist} with {} files into {} separate changes. Continue?",
        paths.len(),
        batches.len()
    );
    if !confirm.confirm(&prompt) {
        return Ok(Outcome::Declined { changelist: None });
    }

    let count = batches.len();
    let mut report = SplitReport { original: changelist, batches: Vec::with_capacity(count) };
    for (index, chunk) in batches.into_iter().enumerate() {
        let text = format!("Split change {}/{count}\n\n{}", index + 1, description.summary.description);
        let text = text.as_str();
        let mut result = SplitBatch { files: chunk.paths, ..Default::default() };
        let created = executor
            .execute("create_changelist", |depot, _| async move { depot.create_changelist(text).await })
            .await;
        let target = match created {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(batch = index + 1, error = %&*e, "Failed to create split changelist");
                result.failure = Some((*e).to_string());
                report.batches.push(result);
                continue;
            },
        };
        result.changelist = Some(target);
        let files = &result.files;
        match executor
            .execute("reopen_files", |depot, _| async move { depot.reopen_files(files, target).await })
            .await
        {
            Ok(moved) => result.moved = moved,
            Err(e) => result.failure = Some((*e).to_string()),
        }
        if result.failure.is_none() && result.moved.len() != result.files.len() {
            result.failure = Some(format!("reopened {} of {} files", result.moved.len(), result.files.len()));
        }
        match &result.failure {
            Some(failure) => tracing::error!(batch = index + 1, changelist = target, failure = %failure, "Split batch failed"),
            None => tracing::info!(batch = index + 1, changelist = target, files = result.moved.len(), "Split batch"),
        }
        report.batches.push(result);
    }
    if !report.is_complete() {
        tracing::warn!(original = changelist, "Split finished with failed batches");
    }
    Ok(Outcome::Applied(report))
}

/// Turn an incomplete split into an error, for callers that need every file
/// moved.
pub fn ensure_complete(report: &SplitReport) -> Result<()> {
    if let Some(batch) = report.batches.iter().find(|b| !b.is_complete()) {
        let reason = batch.failure.clone().unwrap_or_else(|| "split incomplete".to_string());
        exn::bail!(ErrorKind::Changelist(report.original, reason));
    }
    Ok(())
}
