// Individual analysis: lines of code per file, plus deltas against the user's previous submission.
use super::loc::count_lines_of_code;
use super::notebook::prep_source_files;
use super::{analysis_temp_dir, collect_job_output, fetch_submission, order_results, sort_results};
use super::{AnalysisOptions, AnalysisResults};
use crate::context::Runtime;
use crate::jobmanager::Job;
use crate::store::Store;
use anyhow::Result;
use autograder_common::analysis::{AnalysisFileInfo, AssignmentAnalysisOptions, IndividualAnalysis, RelpathMatcher};
use autograder_common::fsutil::list_relpaths;
use autograder_common::timestamp::MSECS_PER_HOURS;
use autograder_common::{FullSubmissionId, Timestamp};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[tracing::instrument(skip_all, fields(submissions = options.resolved_submission_ids.len()))]
pub async fn individual_analysis(
    runtime: &Arc<Runtime>,
    options: AnalysisOptions,
) -> Result<AnalysisResults<IndividualAnalysis>> {
    let mut ids = options.resolved_submission_ids.clone();
    ids.sort();
    ids.dedup();

    let Some(first) = ids.first() else {
        return Ok(AnalysisResults::default());
    };
    let lock_key = format!("analysis-individual-course-{}", first.course_id());

    let work_runtime = runtime.clone();
    let retrieve_store = runtime.store.clone();
    let store_store = runtime.store.clone();
    let remove_store = runtime.store.clone();

    let job = Job::new(
        runtime.locks.clone(),
        options.effective_job_options(),
        runtime.config.analysis_pool_size,
        ids,
        move |id: FullSubmissionId| {
            let runtime = work_runtime.clone();
            async move { compute_individual_analysis(&runtime, &id).await }
        },
    )
    .with_lock_key(lock_key)
    .with_return_incomplete_results(!options.waiting())
    .with_work_item_key(|id: &FullSubmissionId| format!("analysis-individual-{}", id))
    .with_retrieve(move |ids| retrieve_analyses(retrieve_store.clone(), ids))
    .with_store(move |records: Vec<IndividualAnalysis>| {
        let store = store_store.clone();
        async move { store.store_individual_analyses(&records).await }
    })
    .with_remove(move |ids: Vec<FullSubmissionId>| {
        let store = remove_store.clone();
        async move { store.remove_individual_analyses(&ids).await }
    });

    let (results, pending_count) = collect_job_output(job.run().await, options.waiting()).await?;

    let results = if options.retain_original_order {
        order_results(results, |record| record.full_id.clone(), &options.resolved_submission_ids)
    } else {
        sort_results(results, |record| record.full_id.clone())
    };

    info!(results = results.len(), pending = pending_count, "Individual analysis complete");
    Ok(AnalysisResults { results, pending_count })
}

async fn retrieve_analyses(
    store: Arc<dyn Store>,
    ids: Vec<FullSubmissionId>,
) -> Result<(Vec<IndividualAnalysis>, Vec<FullSubmissionId>)> {
    let mut found = store.get_individual_analyses(&ids).await?;
    let remaining = ids.iter().filter(|id| !found.contains_key(*id)).cloned().collect();
    let results = ids.iter().filter_map(|id| found.remove(id)).collect();

    Ok((results, remaining))
}

/// Analyze one submission and, when the user has an earlier one, fill in the deltas.
pub async fn compute_individual_analysis(runtime: &Runtime, id: &FullSubmissionId) -> Result<IndividualAnalysis> {
    let mut analysis = analyze_submission(runtime, id).await?;
    if analysis.failure {
        return Ok(analysis);
    }

    let Some(previous_id) = runtime.store.get_previous_submission_id(id).await? else {
        return Ok(analysis);
    };

    let previous = match runtime.store.get_individual_analysis(&previous_id).await? {
        Some(previous) => previous,
        None => analyze_submission(runtime, &previous_id).await?,
    };

    if previous.failure {
        debug!(submission = %id, previous = %previous_id, "Previous analysis failed, skipping deltas");
        return Ok(analysis);
    }

    apply_delta(&mut analysis, &previous);
    Ok(analysis)
}

async fn analyze_submission(runtime: &Runtime, id: &FullSubmissionId) -> Result<IndividualAnalysis> {
    let temp_dir = analysis_temp_dir(&runtime.config, "individual-analysis-")?;
    let (result, assignment) = fetch_submission(runtime.store.as_ref(), id, temp_dir.path()).await?;
    let options = assignment.analysis_options;

    let metrics = match measure_files(temp_dir.path(), options.as_ref()) {
        Ok(metrics) => metrics,
        Err(err) => {
            let message = format!("{:#}", err);
            warn!(submission = %id, error = %message, "Individual analysis failed");
            return Ok(IndividualAnalysis::failed(id.clone(), options, message));
        }
    };

    Ok(IndividualAnalysis {
        options,
        analysis_timestamp: Timestamp::now(),
        failure: false,
        failure_message: String::new(),
        full_id: id.clone(),
        short_id: id.short_id().to_string(),
        course_id: id.course_id().to_string(),
        assignment_id: id.assignment_id().to_string(),
        user_email: id.user_email().to_string(),
        submission_start_time: result.info.grading_start_time,
        score: result.info.score,
        files: metrics.files,
        skipped_files: metrics.skipped_files,
        lines_of_code: metrics.lines_of_code,
        ..Default::default()
    })
}

struct FileMetrics {
    files: Vec<AnalysisFileInfo>,
    skipped_files: Vec<String>,
    lines_of_code: i64,
}

fn measure_files(dir: &Path, options: Option<&AssignmentAnalysisOptions>) -> Result<FileMetrics> {
    let renames = prep_source_files(dir)?;
    let matcher = match options {
        Some(options) => options.compile()?,
        None => RelpathMatcher::allow_all(),
    };

    let mut metrics = FileMetrics {
        files: Vec::new(),
        skipped_files: Vec::new(),
        lines_of_code: 0,
    };

    for relpath in list_relpaths(dir)? {
        if !matcher.matches(&relpath) {
            metrics.skipped_files.push(relpath);
            continue;
        }

        let lines_of_code = count_lines_of_code(&dir.join(&relpath))?;
        metrics.lines_of_code += lines_of_code;
        metrics.files.push(AnalysisFileInfo {
            original_filename: renames.get(&relpath).cloned().unwrap_or_default(),
            filename: relpath,
            lines_of_code,
        });
    }

    Ok(metrics)
}

fn apply_delta(analysis: &mut IndividualAnalysis, previous: &IndividualAnalysis) {
    let time_delta = analysis.submission_start_time - previous.submission_start_time;

    analysis.submission_time_delta = time_delta;
    analysis.lines_of_code_delta = analysis.lines_of_code - previous.lines_of_code;
    analysis.score_delta = analysis.score - previous.score;

    if time_delta != 0 {
        let per_hour = MSECS_PER_HOURS as f64 / time_delta as f64;
        analysis.lines_of_code_velocity = analysis.lines_of_code_delta as f64 * per_hour;
        analysis.score_velocity = analysis.score_delta * per_hour;
    }
}
