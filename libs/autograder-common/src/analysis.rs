// Analysis records: per-submission metrics and per-pair similarity.
use crate::error::AutograderError;
use crate::fileop::FileOperation;
use crate::filespec::FileSpec;
use crate::ids::{FullSubmissionId, PairwiseKey};
use crate::timestamp::Timestamp;
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_INCLUDE_REGEX: &str = ".+";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AssignmentAnalysisOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_files: Vec<FileSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_file_ops: Vec<FileOperation>,
}

impl AssignmentAnalysisOptions {
    /// Check every pattern compiles. An empty include list means "everything".
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (kind, patterns) in [("include", &self.include_patterns), ("exclude", &self.exclude_patterns)] {
            for pattern in patterns {
                if let Err(e) = Regex::new(pattern) {
                    errors.push(format!("Failed to compile {} pattern `{}`: '{}'", kind, pattern, e));
                }
            }
        }

        for spec in &self.template_files {
            if let Err(e) = spec.validate() {
                errors.push(format!("Invalid template file spec: '{}'", e));
            }
        }

        for op in &self.template_file_ops {
            if let Err(e) = op.validate() {
                errors.push(format!("Invalid template file operation: '{}'", e));
            }
        }

        if !errors.is_empty() {
            return Err(AutograderError::Validation(errors.join("; ")).into());
        }

        Ok(())
    }

    pub fn compile(&self) -> Result<RelpathMatcher> {
        RelpathMatcher::new(&self.include_patterns, &self.exclude_patterns)
    }
}

/// Compiled include/exclude filter over relative paths.
#[derive(Debug, Clone)]
pub struct RelpathMatcher {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl RelpathMatcher {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).map_err(|e| {
                        anyhow::Error::from(AutograderError::Validation(format!(
                            "Failed to compile pattern `{}`: '{}'",
                            pattern, e
                        )))
                    })
                })
                .collect()
        };

        let mut include = compile(include)?;
        if include.is_empty() {
            include.push(Regex::new(DEFAULT_INCLUDE_REGEX)?);
        }

        Ok(Self {
            include,
            exclude: compile(exclude)?,
        })
    }

    pub fn allow_all() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn matches(&self, relpath: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|regex| regex.is_match(relpath));
        included && !self.exclude.iter().any(|regex| regex.is_match(relpath))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AnalysisFileInfo {
    pub filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub original_filename: String,
    pub lines_of_code: i64,
}

/// The result of one engine on one file pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileSimilarity {
    pub filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub original_filename: String,
    pub tool: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndividualAnalysis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<AssignmentAnalysisOptions>,

    pub analysis_timestamp: Timestamp,

    #[serde(default)]
    pub failure: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_message: String,

    #[serde(rename = "submission-id")]
    pub full_id: FullSubmissionId,
    pub short_id: String,
    pub course_id: String,
    pub assignment_id: String,
    pub user_email: String,

    #[serde(default)]
    pub submission_start_time: Timestamp,
    #[serde(default)]
    pub score: f64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<AnalysisFileInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_files: Vec<String>,
    #[serde(default)]
    pub lines_of_code: i64,

    #[serde(default)]
    pub submission_time_delta: i64,
    #[serde(default)]
    pub lines_of_code_delta: i64,
    #[serde(default)]
    pub score_delta: f64,

    #[serde(rename = "lines-of-code-per-hour", default)]
    pub lines_of_code_velocity: f64,
    #[serde(rename = "score-per-hour", default)]
    pub score_velocity: f64,
}

impl IndividualAnalysis {
    /// A stored record for a deterministic failure so it is not retried.
    pub fn failed(full_id: FullSubmissionId, options: Option<AssignmentAnalysisOptions>, message: impl Into<String>) -> Self {
        IndividualAnalysis {
            options,
            analysis_timestamp: Timestamp::now(),
            failure: true,
            failure_message: message.into(),
            short_id: full_id.short_id().to_string(),
            course_id: full_id.course_id().to_string(),
            assignment_id: full_id.assignment_id().to_string(),
            user_email: full_id.user_email().to_string(),
            full_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PairwiseAnalysis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<AssignmentAnalysisOptions>,

    pub analysis_timestamp: Timestamp,
    pub submission_ids: PairwiseKey,

    #[serde(default)]
    pub failure: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_message: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub similarities: BTreeMap<String, Vec<FileSimilarity>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmatched_files: Vec<[String; 2]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_files: Vec<String>,

    /// Per-file, per-engine failures for engines that did not contribute a score.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engine_errors: BTreeMap<String, BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mean_similarities: BTreeMap<String, f64>,
    #[serde(default)]
    pub total_mean_similarity: f64,
}

impl PairwiseAnalysis {
    pub fn new(
        key: PairwiseKey,
        options: Option<AssignmentAnalysisOptions>,
        similarities: BTreeMap<String, Vec<FileSimilarity>>,
        unmatched_files: Vec<[String; 2]>,
        skipped_files: Vec<String>,
        engine_errors: BTreeMap<String, BTreeMap<String, String>>,
    ) -> Self {
        let mut mean_similarities = BTreeMap::new();
        let mut total_mean_similarity = 0.0;

        for (relpath, sims) in &similarities {
            let mut value: f64 = sims.iter().map(|sim| sim.score).sum();
            if !sims.is_empty() {
                value /= sims.len() as f64;
            }

            mean_similarities.insert(relpath.clone(), value);
            total_mean_similarity += value;
        }

        if !similarities.is_empty() {
            total_mean_similarity /= similarities.len() as f64;
        }

        PairwiseAnalysis {
            options,
            analysis_timestamp: Timestamp::now(),
            submission_ids: key,
            failure: false,
            failure_message: String::new(),
            similarities,
            unmatched_files,
            skipped_files,
            engine_errors,
            mean_similarities,
            total_mean_similarity,
        }
    }

    pub fn failed(key: PairwiseKey, options: Option<AssignmentAnalysisOptions>, message: impl Into<String>) -> Self {
        PairwiseAnalysis {
            options,
            analysis_timestamp: Timestamp::now(),
            submission_ids: key,
            failure: true,
            failure_message: message.into(),
            similarities: BTreeMap::new(),
            unmatched_files: Vec::new(),
            skipped_files: Vec::new(),
            engine_errors: BTreeMap::new(),
            mean_similarities: BTreeMap::new(),
            total_mean_similarity: 0.0,
        }
    }
}

/// Count/mean/median/min/max over a set of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AggregateValues {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl AggregateValues {
    pub fn compute(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let median = if count % 2 == 1 {
            sorted[count / 2]
        } else {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        };

        Self {
            count,
            mean: sorted.iter().sum::<f64>() / count as f64,
            median,
            min: sorted[0],
            max: sorted[count - 1],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AnalysisSummary {
    pub complete: bool,
    pub complete_count: usize,
    pub pending_count: usize,
    pub failure_count: usize,
    pub first_timestamp: Timestamp,
    pub last_timestamp: Timestamp,
}

impl AnalysisSummary {
    fn from_timestamps(timestamps: impl Iterator<Item = (bool, Timestamp)>, pending_count: usize) -> Self {
        let mut summary = AnalysisSummary {
            complete: pending_count == 0,
            pending_count,
            ..Default::default()
        };

        for (failure, timestamp) in timestamps {
            if failure {
                summary.failure_count += 1;
                continue;
            }

            if summary.complete_count == 0 || timestamp < summary.first_timestamp {
                summary.first_timestamp = timestamp;
            }

            if summary.complete_count == 0 || timestamp > summary.last_timestamp {
                summary.last_timestamp = timestamp;
            }

            summary.complete_count += 1;
        }

        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PairwiseAnalysisSummary {
    #[serde(flatten)]
    pub summary: AnalysisSummary,
    pub aggregate_mean_similarities: BTreeMap<String, AggregateValues>,
    pub aggregate_total_mean_similarity: AggregateValues,
}

impl PairwiseAnalysisSummary {
    pub fn new<'a>(results: impl IntoIterator<Item = &'a PairwiseAnalysis>, pending_count: usize) -> Self {
        let results: Vec<&PairwiseAnalysis> = results.into_iter().collect();
        let summary = AnalysisSummary::from_timestamps(
            results.iter().map(|result| (result.failure, result.analysis_timestamp)),
            pending_count,
        );

        let mut mean_sims: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut total_mean_sims = Vec::new();

        for result in results.iter().filter(|result| !result.failure) {
            for (relpath, value) in &result.mean_similarities {
                mean_sims.entry(relpath.clone()).or_default().push(*value);
            }

            total_mean_sims.push(result.total_mean_similarity);
        }

        Self {
            summary,
            aggregate_mean_similarities: mean_sims
                .into_iter()
                .map(|(relpath, values)| (relpath, AggregateValues::compute(&values)))
                .collect(),
            aggregate_total_mean_similarity: AggregateValues::compute(&total_mean_sims),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndividualAnalysisSummary {
    #[serde(flatten)]
    pub summary: AnalysisSummary,
    pub aggregate_score: AggregateValues,
    pub aggregate_lines_of_code: AggregateValues,
    pub aggregate_lines_of_code_per_file: BTreeMap<String, AggregateValues>,
    pub aggregate_submission_time_delta: AggregateValues,
    pub aggregate_lines_of_code_delta: AggregateValues,
    pub aggregate_score_delta: AggregateValues,
    #[serde(rename = "aggregate-lines-of-code-per-hour")]
    pub aggregate_lines_of_code_velocity: AggregateValues,
    #[serde(rename = "aggregate-score-per-hour")]
    pub aggregate_score_velocity: AggregateValues,
}

impl IndividualAnalysisSummary {
    pub fn new<'a>(results: impl IntoIterator<Item = &'a IndividualAnalysis>, pending_count: usize) -> Self {
        let results: Vec<&IndividualAnalysis> = results.into_iter().collect();
        let summary = AnalysisSummary::from_timestamps(
            results.iter().map(|result| (result.failure, result.analysis_timestamp)),
            pending_count,
        );

        let ok: Vec<&IndividualAnalysis> = results.into_iter().filter(|result| !result.failure).collect();
        let collect = |f: fn(&IndividualAnalysis) -> f64| -> AggregateValues {
            AggregateValues::compute(&ok.iter().map(|result| f(result)).collect::<Vec<_>>())
        };

        let mut loc_per_file: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for result in &ok {
            for file in &result.files {
                loc_per_file
                    .entry(file.filename.clone())
                    .or_default()
                    .push(file.lines_of_code as f64);
            }
        }

        Self {
            summary,
            aggregate_score: collect(|r| r.score),
            aggregate_lines_of_code: collect(|r| r.lines_of_code as f64),
            aggregate_lines_of_code_per_file: loc_per_file
                .into_iter()
                .map(|(relpath, values)| (relpath, AggregateValues::compute(&values)))
                .collect(),
            aggregate_submission_time_delta: collect(|r| r.submission_time_delta as f64),
            aggregate_lines_of_code_delta: collect(|r| r.lines_of_code_delta as f64),
            aggregate_score_delta: collect(|r| r.score_delta),
            aggregate_lines_of_code_velocity: collect(|r| r.lines_of_code_velocity),
            aggregate_score_velocity: collect(|r| r.score_velocity),
        }
    }
}
