/// Tests for individual and pairwise analysis
///
/// These tests run the analyses end to end against a `MemoryStore` and the fake engine:
/// 1. Pairwise results for every pair, served from the store on the second run
/// 2. Partial and total engine failures are recorded, not retried
/// 3. Individual metrics and deltas against the previous submission
/// 4. Notebook rewriting and failure records
/// 5. Background mode returns the cached subset and finishes the rest

use super::{individual_analysis, pairwise_analysis, AnalysisOptions};
use crate::context::Runtime;
use crate::jobmanager::JobOptions;
use crate::similarity::{EngineList, FakeEngine};
use crate::store::{MemoryStore, Store};
use autograder_common::analysis::AssignmentAnalysisOptions;
use autograder_common::config::AutograderConfig;
use autograder_common::error::is_not_found_error;
use autograder_common::fsutil::gzip_bytes;
use autograder_common::types::{Assignment, Course, CourseRole, CourseUser, GradingInfo, GradingResult};
use autograder_common::{FullSubmissionId, PairwiseKey, Timestamp};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const COURSE: &str = "course101";
const ASSIGNMENT: &str = "hw0";
const EMAIL: &str = "s@x";
const SHORT_IDS: [&str; 3] = ["1697406256", "1697406265", "1697406272"];

const SUBMISSION: &str = "def f():\n    return 1\n\n# done\nf()\nprint(f())\n";

struct Fixture {
    store: Arc<MemoryStore>,
    runtime: Arc<Runtime>,
    temp_root: TempDir,
}

impl Fixture {
    fn new(engines: EngineList) -> Self {
        Self::with_options(engines, None)
    }

    fn with_options(engines: EngineList, analysis_options: Option<AssignmentAnalysisOptions>) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.add_course(Course {
            id: COURSE.to_string(),
            ..Default::default()
        });
        store.add_assignment(Assignment {
            id: ASSIGNMENT.to_string(),
            course_id: COURSE.to_string(),
            analysis_options,
            ..Default::default()
        });
        store.add_user(
            COURSE,
            CourseUser {
                email: EMAIL.to_string(),
                role: CourseRole::Student,
                ..Default::default()
            },
        );

        let temp_root = TempDir::new().unwrap();
        let config = AutograderConfig {
            temp_dir: Some(temp_root.path().to_path_buf()),
            ..Default::default()
        };

        let runtime = Runtime::with_engines(config, store.clone(), engines);
        Self {
            store,
            runtime,
            temp_root,
        }
    }

    fn add(&self, short_id: &str, start_msecs: i64, score: f64, files: &[(&str, &str)]) -> FullSubmissionId {
        let id = FullSubmissionId::new(COURSE, ASSIGNMENT, EMAIL, short_id);
        let input_files_gzip = files
            .iter()
            .map(|(relpath, contents)| (relpath.to_string(), gzip_bytes(contents.as_bytes()).unwrap()))
            .collect();

        self.store.add_submission(GradingResult {
            info: GradingInfo {
                id: id.to_string(),
                short_id: short_id.to_string(),
                course_id: COURSE.to_string(),
                assignment_id: ASSIGNMENT.to_string(),
                user: EMAIL.to_string(),
                score,
                grading_start_time: Timestamp::from_msecs(start_msecs),
                ..Default::default()
            },
            input_files_gzip,
            ..Default::default()
        });

        id
    }

    fn add_standard(&self) -> Vec<FullSubmissionId> {
        SHORT_IDS
            .iter()
            .map(|short_id| self.add(short_id, short_id.parse::<i64>().unwrap() * 1000, 1.0, &[("submission.py", SUBMISSION)]))
            .collect()
    }

    fn assert_temp_root_empty(&self) {
        assert_eq!(fs::read_dir(self.temp_root.path()).unwrap().count(), 0);
    }
}

fn fake_engines() -> EngineList {
    vec![Arc::new(FakeEngine::new())]
}

fn waiting(ids: Vec<FullSubmissionId>) -> AnalysisOptions {
    AnalysisOptions::new(ids, JobOptions::waiting())
}

#[tokio::test]
async fn test_pairwise_fake_engine() {
    let fixture = Fixture::new(fake_engines());
    let ids = fixture.add_standard();

    let output = pairwise_analysis(&fixture.runtime, waiting(ids.clone())).await.unwrap();
    assert_eq!(output.pending_count, 0);
    assert_eq!(output.results.len(), 3);

    let expected_keys = vec![
        PairwiseKey::new(ids[0].clone(), ids[1].clone()),
        PairwiseKey::new(ids[0].clone(), ids[2].clone()),
        PairwiseKey::new(ids[1].clone(), ids[2].clone()),
    ];
    let keys: Vec<PairwiseKey> = output.results.iter().map(|result| result.submission_ids.clone()).collect();
    assert_eq!(keys, expected_keys);

    for result in &output.results {
        assert!(!result.failure);
        assert!(result.unmatched_files.is_empty());
        assert!(result.engine_errors.is_empty());

        let sims = &result.similarities["submission.py"];
        assert_eq!(sims.len(), 1);
        assert_eq!(sims[0].filename, "submission.py");
        assert_eq!(sims[0].tool, "fake");
        assert_eq!(sims[0].version, "0.0.1");
        assert_eq!(sims[0].score, 0.13);
        assert!((result.total_mean_similarity - 0.13).abs() < 1e-9);
    }

    fixture.assert_temp_root_empty();

    // Everything is cached now.
    let writes = fixture.store.analysis_writes();
    let again = pairwise_analysis(&fixture.runtime, waiting(ids)).await.unwrap();
    assert_eq!(again.pending_count, 0);
    assert_eq!(again.results, output.results);
    assert_eq!(fixture.store.analysis_writes(), writes);
}

#[tokio::test]
async fn test_pairwise_unmatched_and_skipped_files() {
    let options = AssignmentAnalysisOptions {
        exclude_patterns: vec![r"\.txt$".to_string()],
        ..Default::default()
    };
    let fixture = Fixture::with_options(fake_engines(), Some(options));

    let a = fixture.add(SHORT_IDS[0], 1000, 1.0, &[("submission.py", SUBMISSION), ("notes.txt", "a"), ("extra.py", "x = 1\n")]);
    let b = fixture.add(SHORT_IDS[1], 2000, 1.0, &[("submission.py", SUBMISSION), ("notes.txt", "b")]);

    let output = pairwise_analysis(&fixture.runtime, waiting(vec![b, a])).await.unwrap();
    assert_eq!(output.results.len(), 1);

    let result = &output.results[0];
    assert_eq!(result.similarities.keys().collect::<Vec<_>>(), vec!["submission.py"]);
    assert_eq!(result.skipped_files, vec!["notes.txt".to_string()]);
    assert_eq!(result.unmatched_files, vec![["extra.py".to_string(), String::new()]]);
}

#[tokio::test]
async fn test_pairwise_partial_engine_failure() {
    let engines: EngineList = vec![Arc::new(FakeEngine::new()), Arc::new(FakeEngine::failing("broken"))];
    let fixture = Fixture::new(engines);
    let ids = fixture.add_standard();

    let output = pairwise_analysis(&fixture.runtime, waiting(ids[..2].to_vec())).await.unwrap();
    let result = &output.results[0];

    assert!(!result.failure);
    assert_eq!(result.similarities["submission.py"].len(), 1);
    assert_eq!(result.similarities["submission.py"][0].tool, "fake");
    assert!(result.engine_errors["submission.py"]["broken"].contains("failed on purpose"));
}

#[tokio::test]
async fn test_pairwise_all_engines_fail() {
    let fixture = Fixture::new(vec![Arc::new(FakeEngine::failing("broken"))]);
    let ids = fixture.add_standard();

    let output = pairwise_analysis(&fixture.runtime, waiting(ids[..2].to_vec())).await.unwrap();
    let result = &output.results[0];

    assert!(result.failure);
    assert!(result.failure_message.contains("All similarity engines failed"));
    assert!(result.similarities.is_empty());

    // The failure record is stored and not retried.
    let writes = fixture.store.analysis_writes();
    let again = pairwise_analysis(&fixture.runtime, waiting(ids[..2].to_vec())).await.unwrap();
    assert!(again.results[0].failure);
    assert_eq!(fixture.store.analysis_writes(), writes);
}

#[tokio::test]
async fn test_pairwise_requires_engines() {
    let fixture = Fixture::new(Vec::new());
    let ids = fixture.add_standard();

    let err = pairwise_analysis(&fixture.runtime, waiting(ids)).await.unwrap_err();
    assert!(is_not_found_error(&err));
}

#[tokio::test]
async fn test_pairwise_missing_submission() {
    let fixture = Fixture::new(fake_engines());
    let mut ids = fixture.add_standard();
    ids.push(FullSubmissionId::new(COURSE, ASSIGNMENT, EMAIL, "999"));

    assert!(pairwise_analysis(&fixture.runtime, waiting(ids)).await.is_err());
}

#[tokio::test]
async fn test_pairwise_cancelled_before_start() {
    let fixture = Fixture::new(fake_engines());
    let ids = fixture.add_standard();

    let options = AnalysisOptions::new(ids, JobOptions::waiting());
    options.job_options.cancel.cancel();

    let output = pairwise_analysis(&fixture.runtime, options).await.unwrap();
    assert!(output.results.is_empty());
    assert_eq!(output.pending_count, 3);
    assert_eq!(fixture.store.analysis_writes(), 0);
}

#[tokio::test]
async fn test_pairwise_background_returns_cached_subset() {
    let fixture = Fixture::new(fake_engines());
    let ids = fixture.add_standard();

    pairwise_analysis(&fixture.runtime, waiting(ids[..2].to_vec())).await.unwrap();

    let options = AnalysisOptions::new(ids.clone(), JobOptions::default());
    let output = pairwise_analysis(&fixture.runtime, options).await.unwrap();
    assert_eq!(output.results.len(), 1);
    assert_eq!(output.pending_count, 2);

    // The rest lands in the store in the background.
    let keys = autograder_common::ids::create_pairwise_keys(&ids);
    for _ in 0..200 {
        if fixture.store.get_pairwise_analyses(&keys).await.unwrap().len() == keys.len() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("Background pairwise analysis did not finish");
}

#[tokio::test]
async fn test_individual_delta() {
    let fixture = Fixture::new(fake_engines());
    let first = fixture.add(SHORT_IDS[0], 1_697_406_256_000, 0.0, &[("submission.py", SUBMISSION)]);
    let second = fixture.add("1697406266", 1_697_406_266_000, 1.0, &[("submission.py", SUBMISSION)]);

    let output = individual_analysis(&fixture.runtime, waiting(vec![second.clone(), first.clone()]))
        .await
        .unwrap();
    assert_eq!(output.results.len(), 2);
    assert_eq!(output.results[0].full_id, first);
    assert_eq!(output.results[1].full_id, second);

    let earlier = &output.results[0];
    assert_eq!(earlier.lines_of_code, 4);
    assert_eq!(earlier.submission_time_delta, 0);

    let later = &output.results[1];
    assert!(!later.failure);
    assert_eq!(later.lines_of_code, 4);
    assert_eq!(later.files.len(), 1);
    assert_eq!(later.files[0].lines_of_code, 4);
    assert_eq!(later.submission_time_delta, 10_000);
    assert_eq!(later.lines_of_code_delta, 0);
    assert_eq!(later.score_delta, 1.0);
    assert!((later.score_velocity - 360.0).abs() < 1e-9);
    assert_eq!(later.lines_of_code_velocity, 0.0);

    fixture.assert_temp_root_empty();
}

#[tokio::test]
async fn test_individual_retains_order() {
    let fixture = Fixture::new(fake_engines());
    let ids = fixture.add_standard();
    let order = vec![ids[2].clone(), ids[0].clone(), ids[1].clone()];

    let mut options = waiting(order.clone());
    options.retain_original_order = true;

    let output = individual_analysis(&fixture.runtime, options).await.unwrap();
    let result_ids: Vec<FullSubmissionId> = output.results.iter().map(|result| result.full_id.clone()).collect();
    assert_eq!(result_ids, order);
}

#[tokio::test]
async fn test_individual_notebook() {
    let notebook = r#"{"cells": [{"cell_type": "code", "source": ["x = 1\n", "print(x)\n"]}], "nbformat": 4}"#;
    let fixture = Fixture::new(fake_engines());
    let id = fixture.add(SHORT_IDS[0], 1000, 1.0, &[("work.ipynb", notebook)]);

    let output = individual_analysis(&fixture.runtime, waiting(vec![id])).await.unwrap();
    let result = &output.results[0];

    assert!(!result.failure);
    assert_eq!(result.files.len(), 1);
    assert_eq!(result.files[0].filename, "work.py");
    assert_eq!(result.files[0].original_filename, "work.ipynb");
    assert_eq!(result.lines_of_code, 2);
}

#[tokio::test]
async fn test_individual_failure_is_stored() {
    let fixture = Fixture::new(fake_engines());
    let id = fixture.add(SHORT_IDS[0], 1000, 1.0, &[("broken.ipynb", "{not json")]);

    let output = individual_analysis(&fixture.runtime, waiting(vec![id.clone()])).await.unwrap();
    assert!(output.results[0].failure);
    assert!(output.results[0].failure_message.contains("notebook"));

    let stored = fixture.store.get_individual_analysis(&id).await.unwrap().unwrap();
    assert!(stored.failure);
}

#[tokio::test]
async fn test_options_from_specs() {
    let fixture = Fixture::new(fake_engines());
    let ids = fixture.add_standard();

    let specs = vec![format!("{}::{}", COURSE, ASSIGNMENT)];
    let options = AnalysisOptions::from_specs(fixture.store.as_ref(), &specs, JobOptions::waiting())
        .await
        .unwrap();
    assert_eq!(options.resolved_submission_ids, vec![ids[2].clone()]);

    let bad = vec!["course101".to_string()];
    assert!(AnalysisOptions::from_specs(fixture.store.as_ref(), &bad, JobOptions::waiting()).await.is_err());
}
