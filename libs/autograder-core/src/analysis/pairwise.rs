// Pairwise analysis: per-file similarity between two submissions, fanned out across engines.
use super::notebook::prep_source_files;
use super::{analysis_temp_dir, collect_job_output, fetch_submission, order_results, sort_results};
use super::{AnalysisOptions, AnalysisResults};
use crate::context::Runtime;
use crate::jobmanager::Job;
use crate::pool::run_parallel_pool;
use crate::similarity::{available_engines, EngineList, SimilarityEngine};
use crate::store::Store;
use anyhow::{Context, Result};
use autograder_common::analysis::{AssignmentAnalysisOptions, FileSimilarity, PairwiseAnalysis, RelpathMatcher};
use autograder_common::fsutil::match_files;
use autograder_common::ids::create_pairwise_keys;
use autograder_common::{AutograderError, PairwiseKey};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type EngineOutcome = (String, Result<FileSimilarity>);

#[tracing::instrument(skip_all, fields(submissions = options.resolved_submission_ids.len()))]
pub async fn pairwise_analysis(
    runtime: &Arc<Runtime>,
    options: AnalysisOptions,
) -> Result<AnalysisResults<PairwiseAnalysis>> {
    let keys = create_pairwise_keys(&options.resolved_submission_ids);
    let Some(first) = keys.first() else {
        return Ok(AnalysisResults::default());
    };
    let lock_key = format!("analysis-pairwise-course-{}", first.course_id());

    let engines = Arc::new(available_engines(&runtime.engines).await?);
    debug!(
        engines = ?engines.iter().map(|engine| engine.name()).collect::<Vec<_>>(),
        keys = keys.len(),
        "Starting pairwise analysis"
    );

    let job_options = options.effective_job_options();
    let work_cancel = job_options.cancel.clone();
    let work_runtime = runtime.clone();
    let retrieve_store = runtime.store.clone();
    let store_store = runtime.store.clone();
    let remove_store = runtime.store.clone();

    let job = Job::new(
        runtime.locks.clone(),
        job_options,
        runtime.config.analysis_pool_size,
        keys.clone(),
        move |key: PairwiseKey| {
            let runtime = work_runtime.clone();
            let engines = engines.clone();
            let cancel = work_cancel.clone();
            async move { compute_pairwise_analysis(&runtime, &engines, &key, &cancel).await }
        },
    )
    .with_lock_key(lock_key)
    .with_return_incomplete_results(!options.waiting())
    .with_work_item_key(|key: &PairwiseKey| format!("analysis-pairwise-single-{}", key))
    .with_retrieve(move |keys| retrieve_analyses(retrieve_store.clone(), keys))
    .with_store(move |records: Vec<PairwiseAnalysis>| {
        let store = store_store.clone();
        async move { store.store_pairwise_analyses(&records).await }
    })
    .with_remove(move |keys: Vec<PairwiseKey>| {
        let store = remove_store.clone();
        async move { store.remove_pairwise_analyses(&keys).await }
    });

    let (results, pending_count) = collect_job_output(job.run().await, options.waiting()).await?;

    let results = if options.retain_original_order {
        order_results(results, |record| record.submission_ids.clone(), &keys)
    } else {
        sort_results(results, |record| record.submission_ids.clone())
    };

    info!(results = results.len(), pending = pending_count, "Pairwise analysis complete");
    Ok(AnalysisResults { results, pending_count })
}

async fn retrieve_analyses(store: Arc<dyn Store>, keys: Vec<PairwiseKey>) -> Result<(Vec<PairwiseAnalysis>, Vec<PairwiseKey>)> {
    let mut found = store.get_pairwise_analyses(&keys).await?;
    let remaining = keys.iter().filter(|key| !found.contains_key(*key)).cloned().collect();
    let results = keys.iter().filter_map(|key| found.remove(key)).collect();

    Ok((results, remaining))
}

/// Compare both submissions of `key` file by file with every engine in `engines`.
pub async fn compute_pairwise_analysis(
    runtime: &Runtime,
    engines: &EngineList,
    key: &PairwiseKey,
    cancel: &CancellationToken,
) -> Result<PairwiseAnalysis> {
    let temp_dir = analysis_temp_dir(&runtime.config, "pairwise-analysis-")?;
    let [first, second] = key.ids();

    let first_dir = temp_dir.path().join(first.as_str());
    let second_dir = temp_dir.path().join(second.as_str());
    for dir in [&first_dir, &second_dir] {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create input dir '{}'", dir.display()))?;
    }

    let (_, assignment) = fetch_submission(runtime.store.as_ref(), first, &first_dir).await?;
    fetch_submission(runtime.store.as_ref(), second, &second_dir).await?;
    let options = assignment.analysis_options.clone();

    let (renames, matcher) = match prepare_pair(&first_dir, &second_dir, options.as_ref()) {
        Ok(prepared) => prepared,
        Err(err) => {
            let message = format!("{:#}", err);
            warn!(key = %key, error = %message, "Failed to prepare submissions for pairwise analysis");
            return Ok(PairwiseAnalysis::failed(key.clone(), options, message));
        }
    };

    let (matched, unmatched_files) = match_files(&first_dir, &second_dir)?;
    let template_dir = runtime.templates.get(&assignment).await?;

    let mut similarities = BTreeMap::new();
    let mut skipped_files = Vec::new();
    let mut engine_errors = BTreeMap::new();

    for relpath in matched {
        if !matcher.matches(&relpath) {
            skipped_files.push(relpath);
            continue;
        }

        let paths = [first_dir.join(&relpath), second_dir.join(&relpath)];
        let template = template_dir
            .as_ref()
            .map(|dir| dir.join(&relpath))
            .filter(|path| path.is_file());

        let outcomes = run_engines(
            engines,
            runtime.config.engine_pool_size,
            paths,
            template,
            key.course_id(),
            cancel,
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(AutograderError::Cancelled.into());
        }

        let mut file_similarities = Vec::with_capacity(outcomes.len());
        let mut file_errors = BTreeMap::new();
        for (engine, outcome) in outcomes {
            match outcome {
                Ok(mut similarity) => {
                    similarity.filename = relpath.clone();
                    similarity.original_filename = renames.get(&relpath).cloned().unwrap_or_default();
                    file_similarities.push(similarity);
                }
                Err(err) => {
                    file_errors.insert(engine, format!("{:#}", err));
                }
            }
        }

        if file_similarities.is_empty() {
            let message = format!(
                "All similarity engines failed on file '{}': {}",
                relpath,
                file_errors
                    .iter()
                    .map(|(engine, err)| format!("{}: {}", engine, err))
                    .collect::<Vec<_>>()
                    .join("; ")
            );
            warn!(key = %key, file = %relpath, "All similarity engines failed");
            return Ok(PairwiseAnalysis::failed(key.clone(), options, message));
        }

        if !file_errors.is_empty() {
            warn!(
                key = %key,
                file = %relpath,
                failed = ?file_errors.keys().collect::<Vec<_>>(),
                "Some similarity engines failed, using partial results"
            );
            engine_errors.insert(relpath.clone(), file_errors);
        }

        similarities.insert(relpath, file_similarities);
    }

    Ok(PairwiseAnalysis::new(
        key.clone(),
        options,
        similarities,
        unmatched_files,
        skipped_files,
        engine_errors,
    ))
}

// Notebook rewriting for both sides; the rename maps are merged.
fn prepare_pair(
    first_dir: &Path,
    second_dir: &Path,
    options: Option<&AssignmentAnalysisOptions>,
) -> Result<(BTreeMap<String, String>, RelpathMatcher)> {
    let mut renames = prep_source_files(first_dir)?;
    renames.extend(prep_source_files(second_dir)?);

    let matcher = match options {
        Some(options) => options.compile()?,
        None => RelpathMatcher::allow_all(),
    };

    Ok((renames, matcher))
}

async fn run_engines(
    engines: &EngineList,
    pool_size: usize,
    paths: [PathBuf; 2],
    template: Option<PathBuf>,
    lock_base: &str,
    cancel: &CancellationToken,
) -> Result<Vec<EngineOutcome>> {
    let paths = Arc::new(paths);
    let template = Arc::new(template);
    let lock_base: Arc<str> = Arc::from(lock_base);

    let pool_cancel = cancel.child_token();
    let work_cancel = pool_cancel.clone();

    let output = run_parallel_pool(pool_size, engines.clone(), pool_cancel, move |engine: Arc<dyn SimilarityEngine>| {
        let paths = paths.clone();
        let template = template.clone();
        let lock_base = lock_base.clone();
        let cancel = work_cancel.clone();

        async move {
            let result = engine
                .compute_file_similarity(
                    [paths[0].as_path(), paths[1].as_path()],
                    Option::as_deref(&template),
                    &lock_base,
                    &cancel,
                )
                .await
                .map(|(similarity, _)| similarity);

            (engine.name().to_string(), result)
        }
    })
    .await
    .context("Failed to run similarity engines")?;

    Ok(output.completed().collect())
}
