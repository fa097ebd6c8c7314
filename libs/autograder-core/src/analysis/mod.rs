/// Analysis - Per-Submission Metrics and Pairwise Similarity
///
/// **Core Responsibility:**
/// Run analyses over sets of submissions as cached jobs. Results are stored
/// once per submission (individual) or per unordered pair (pairwise) and
/// served from the store on later requests.
///
/// **Flow:**
/// 1. Resolve submission specs into full submission IDs (`resolve`)
/// 2. Build a job whose work items are IDs or pairwise keys
/// 3. Each work item fetches its submissions into a private temp dir,
///    rewrites notebooks (`notebook`), and computes its record
/// 4. Return the results, plus how many are still pending when not waiting
///
/// **Failure Records:**
/// Deterministic failures (bad notebook, every engine failing) produce a
/// stored record with `failure` set so the same work is not retried.
/// Store and fetch problems are errors and store nothing.

use crate::jobmanager::{JobHandle, JobOptions};
use crate::store::Store;
use anyhow::{Context, Result};
use autograder_common::config::AutograderConfig;
use autograder_common::fsutil::gzip_bytes_to_directory;
use autograder_common::types::{Assignment, GradingResult};
use autograder_common::{AutograderError, FullSubmissionId};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tracing::debug;

pub mod individual;
pub mod loc;
pub mod notebook;
pub mod pairwise;
pub mod resolve;
pub mod template;

#[cfg(test)]
mod analysis_tests;

pub use individual::individual_analysis;
pub use pairwise::pairwise_analysis;
pub use resolve::{resolve_submission_specs, SpecError, SpecResolution};

#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    pub resolved_submission_ids: Vec<FullSubmissionId>,
    pub job_options: JobOptions,

    /// Return results in the order of `resolved_submission_ids` instead of sorted by ID.
    pub retain_original_order: bool,

    /// Keep the caller's cancellation token for background work.
    /// When unset and not waiting, background work gets its own token so it
    /// outlives the request that started it.
    pub retain_original_context: bool,
}

impl AnalysisOptions {
    pub fn new(ids: Vec<FullSubmissionId>, job_options: JobOptions) -> Self {
        Self {
            resolved_submission_ids: ids,
            job_options,
            ..Default::default()
        }
    }

    /// Resolve `specs` and wrap the IDs. Any resolution error voids the whole request.
    pub async fn from_specs(store: &dyn Store, specs: &[String], job_options: JobOptions) -> Result<Self> {
        let (ids, _) = resolve_submission_specs(store, specs).await.into_result()?;
        Ok(Self::new(ids, job_options))
    }

    pub(crate) fn waiting(&self) -> bool {
        self.job_options.wait_for_completion
    }

    /// The job options actually handed to the job.
    pub(crate) fn effective_job_options(&self) -> JobOptions {
        let mut job_options = self.job_options.clone();
        if !self.retain_original_context && !job_options.wait_for_completion {
            job_options.cancel = Default::default();
        }

        job_options
    }
}

/// Results of an analysis request. `pending_count` is the number of items
/// still being worked in the background (always 0 when waiting).
#[derive(Debug, Clone)]
pub struct AnalysisResults<T> {
    pub results: Vec<T>,
    pub pending_count: usize,
}

impl<T> Default for AnalysisResults<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            pending_count: 0,
        }
    }
}

/// Load a submission and unpack its input files into `dir`.
pub(crate) async fn fetch_submission(
    store: &dyn Store,
    id: &FullSubmissionId,
    dir: &Path,
) -> Result<(GradingResult, Assignment)> {
    let result = store
        .get_submission_contents(id)
        .await
        .with_context(|| format!("Failed to get submission contents for '{}'", id))?
        .ok_or_else(|| AutograderError::not_found(format!("Could not find submission '{}'", id)))?;

    let assignment = store
        .get_assignment(id.course_id(), id.assignment_id())
        .await
        .with_context(|| format!("Failed to get assignment for submission '{}'", id))?
        .ok_or_else(|| {
            AutograderError::not_found(format!("Could not find assignment '{}' for submission '{}'", id.assignment_id(), id))
        })?;

    gzip_bytes_to_directory(dir, &result.input_files_gzip)
        .with_context(|| format!("Failed to write submission input files for '{}'", id))?;

    debug!(submission = %id, files = result.input_files_gzip.len(), "Fetched submission");
    Ok((result, assignment))
}

/// A fresh temp dir for one work item, removed when dropped.
pub(crate) fn analysis_temp_dir(config: &AutograderConfig, prefix: &str) -> Result<TempDir> {
    let root = config.temp_root();
    fs::create_dir_all(&root).with_context(|| format!("Failed to create temp root '{}'", root.display()))?;

    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(&root)
        .with_context(|| format!("Failed to create temp dir with prefix '{}'", prefix))
}

/// Final results and pending count of an analysis job.
/// A job still running in the background yields its snapshot.
pub(crate) async fn collect_job_output<I, O>(handle: JobHandle<I, O>, waiting: bool) -> Result<(Vec<O>, usize)>
where
    O: Clone,
{
    if !waiting && !handle.is_done() {
        let snapshot = handle.output();
        return Ok((snapshot.result_items.clone(), snapshot.remaining_items.len()));
    }

    let output = handle.wait().await;
    if let Some(err) = output.error {
        return Err(err.context("Failed to run analysis job"));
    }

    Ok((output.result_items, output.remaining_items.len()))
}

/// Reorder `results` to follow `order`. Items not in `order` go last.
pub(crate) fn order_results<T, K: Ord>(mut results: Vec<T>, key: impl Fn(&T) -> K, order: &[K]) -> Vec<T> {
    let position = |item: &T| {
        let item_key = key(item);
        order.iter().position(|other| *other == item_key).unwrap_or(order.len())
    };

    results.sort_by(|a, b| position(a).cmp(&position(b)).then_with(|| key(a).cmp(&key(b))));
    results
}

/// Results sorted by key.
pub(crate) fn sort_results<T, K: Ord>(mut results: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    results.sort_by_key(|item| key(item));
    results
}
