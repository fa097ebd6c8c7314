/// Tests for full assignment scoring
///
/// These tests score a ten student assignment against a `MemoryStore` and a `MemoryLmsBackend`:
/// 1. Dry runs compute scores without writing to the LMS
/// 2. Uploads are idempotent and only changed grades are rewritten
/// 3. Penalty policies and rejection
/// 4. Locked grades are skipped
/// 5. Late days are spent from the ledger and conserved across runs
/// 6. An on-time resubmission reclaims its late days and updates the ledger comment in place

use super::full_assignment_scoring_and_upload;
use crate::lms::{LmsAdapter, LmsAssignment, LmsSubmissionComment, LmsSubmissionScore, LmsSyncOptions, MemoryLmsBackend};
use crate::lockmanager::LockManager;
use crate::store::MemoryStore;
use autograder_common::error::is_validation_error;
use autograder_common::timestamp::{MSECS_PER_DAYS, MSECS_PER_HOURS};
use autograder_common::types::{
    Assignment, Course, CourseRole, CourseUser, GradingInfo, GradingResult, LateDaysInfo, LateGradingPolicy,
    LatePolicyType, ScoringInfo,
};
use autograder_common::Timestamp;
use std::sync::Arc;

const COURSE: &str = "course101";
const ASSIGNMENT: &str = "hw0";
const LMS_ASSIGNMENT: &str = "lms-hw0";
const LEDGER: &str = "lms-late-days";
const LEDGER_NAME: &str = "Late Days";
const DUE: Timestamp = Timestamp::from_msecs(1_700_000_000_000);
const NUM_STUDENTS: usize = 10;
const RAW_SCORE: f64 = 90.0;

struct Fixture {
    store: MemoryStore,
    backend: Arc<MemoryLmsBackend>,
    lms: LmsAdapter,
    course: Course,
    assignment: Assignment,
}

fn email(index: usize) -> String {
    format!("student{}@test.edu", index)
}

fn lms_user(index: usize) -> String {
    format!("lms-{}", index)
}

// Student i submits (i - 5) days after the due date, plus an hour.
// So students 0-5 are on time and students 6-9 are 1-4 days late.
fn submission_time(index: usize) -> Timestamp {
    DUE + (index as i64 - 5) * MSECS_PER_DAYS + MSECS_PER_HOURS
}

fn submission(index: usize, short_id: i64, score: f64) -> GradingResult {
    submission_at(index, short_id, score, submission_time(index))
}

fn submission_at(index: usize, short_id: i64, score: f64, time: Timestamp) -> GradingResult {
    GradingResult {
        info: GradingInfo {
            id: format!("{}::{}::{}::{}", COURSE, ASSIGNMENT, email(index), short_id),
            short_id: short_id.to_string(),
            course_id: COURSE.to_string(),
            assignment_id: ASSIGNMENT.to_string(),
            user: email(index),
            max_points: 100.0,
            score,
            grading_start_time: time,
            grading_end_time: time + 1000,
            ..Default::default()
        },
        ..Default::default()
    }
}

impl Fixture {
    fn new(policy: Option<LateGradingPolicy>) -> Self {
        let store = MemoryStore::new();
        let course = Course {
            id: COURSE.to_string(),
            name: "Course 101".to_string(),
            late_policy: None,
        };
        let assignment = Assignment {
            id: ASSIGNMENT.to_string(),
            course_id: COURSE.to_string(),
            name: "Homework 0".to_string(),
            lms_id: Some(LMS_ASSIGNMENT.to_string()),
            max_points: 100.0,
            late_policy: policy,
            ..Default::default()
        };

        store.add_course(course.clone());
        store.add_assignment(assignment.clone());
        store.add_user(
            COURSE,
            CourseUser {
                email: "owner@test.edu".to_string(),
                role: CourseRole::Owner,
                lms_id: Some("lms-owner".to_string()),
                ..Default::default()
            },
        );

        for index in 0..NUM_STUDENTS {
            store.add_user(
                COURSE,
                CourseUser {
                    email: email(index),
                    role: CourseRole::Student,
                    lms_id: Some(lms_user(index)),
                    ..Default::default()
                },
            );
            store.add_submission(submission(index, 1_697_400_000 + index as i64, RAW_SCORE));
        }

        let backend = Arc::new(MemoryLmsBackend::new("lms-token"));
        backend.add_assignment(LmsAssignment {
            id: LMS_ASSIGNMENT.to_string(),
            name: "Homework 0".to_string(),
            due_date: Some(DUE),
            max_points: 100.0,
        });

        let lms = LmsAdapter::new(backend.clone(), Arc::new(LockManager::new()), LmsSyncOptions::default());

        Fixture {
            store,
            backend,
            lms,
            course,
            assignment,
        }
    }

    fn add_ledger(&self, available_days: f64) {
        self.backend.add_assignment(LmsAssignment {
            id: LEDGER.to_string(),
            name: LEDGER_NAME.to_string(),
            due_date: None,
            max_points: 0.0,
        });

        for index in 0..NUM_STUDENTS {
            self.backend.set_score(
                LEDGER,
                LmsSubmissionScore {
                    user_id: lms_user(index),
                    score: available_days,
                    ..Default::default()
                },
            );
        }
    }

    async fn run(&self, dry_run: bool) -> std::collections::BTreeMap<String, ScoringInfo> {
        full_assignment_scoring_and_upload(&self.store, &self.lms, &self.course, &self.assignment, dry_run)
            .await
            .unwrap()
    }

    fn posted(&self, index: usize) -> Option<LmsSubmissionScore> {
        self.backend.score(LMS_ASSIGNMENT, &lms_user(index))
    }

    fn posted_info(&self, index: usize) -> ScoringInfo {
        let posted = self.posted(index).unwrap();
        assert_eq!(posted.comments.len(), 1);
        serde_json::from_str(&posted.comments[0].text).unwrap()
    }

    fn ledger(&self, index: usize) -> (f64, LateDaysInfo) {
        let posted = self.backend.score(LEDGER, &lms_user(index)).unwrap();
        assert_eq!(posted.comments.len(), 1);
        (posted.score, serde_json::from_str(&posted.comments[0].text).unwrap())
    }
}

fn policy(policy_type: LatePolicyType) -> LateGradingPolicy {
    LateGradingPolicy {
        policy_type,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_dry_run_makes_no_writes() {
    let fixture = Fixture::new(None);

    let dry = fixture.run(true).await;
    assert_eq!(dry.len(), NUM_STUDENTS);
    assert!(!dry.contains_key("owner@test.edu"));
    assert_eq!(fixture.backend.write_count(), 0);

    for (email, info) in &dry {
        assert_eq!(info.score, RAW_SCORE, "{}", email);
        assert_eq!(info.raw_score, RAW_SCORE);
        assert!(!info.reject);
        assert!(!info.upload_time.is_zero());
    }

    // A real run reports the same scores.
    let real = fixture.run(false).await;
    assert_eq!(real.len(), dry.len());
    for (email, info) in &real {
        assert!(info.same_scoring(&dry[email]), "{}", email);
    }
}

#[tokio::test]
async fn test_upload_is_idempotent() {
    let fixture = Fixture::new(None);

    fixture.run(false).await;
    assert_eq!(fixture.backend.score_writes(), 1);
    assert_eq!(fixture.backend.comment_writes(), 0);

    for index in 0..NUM_STUDENTS {
        let posted = fixture.posted(index).unwrap();
        assert_eq!(posted.score, RAW_SCORE);
        assert_eq!(posted.time, Some(submission_time(index)));

        let info = fixture.posted_info(index);
        assert_eq!(info.raw_score, RAW_SCORE);
        assert_eq!(info.submission_time, submission_time(index));
    }

    // Nothing changed, so nothing is written.
    fixture.run(false).await;
    assert_eq!(fixture.backend.write_count(), 1);

    // A newer submission rewrites that student's score and comment in place.
    fixture.store.add_submission(submission(0, 1_697_500_000, 95.0));
    fixture.run(false).await;
    assert_eq!(fixture.backend.score_writes(), 2);
    assert_eq!(fixture.backend.comment_writes(), 1);

    assert_eq!(fixture.posted(0).unwrap().score, 95.0);
    assert_eq!(fixture.posted_info(0).raw_score, 95.0);
    assert_eq!(fixture.posted(1).unwrap().score, RAW_SCORE);
}

#[tokio::test]
async fn test_constant_penalty() {
    let mut late_policy = policy(LatePolicyType::ConstantPenalty);
    late_policy.penalty = 5.0;
    let fixture = Fixture::new(Some(late_policy));

    let scores = fixture.run(false).await;
    for index in 0..NUM_STUDENTS {
        let days_late = index.saturating_sub(5) as i64;
        let info = &scores[&email(index)];
        assert_eq!(info.num_days_late, days_late);
        assert_eq!(info.score, RAW_SCORE - 5.0 * days_late as f64);
        assert_eq!(fixture.posted(index).unwrap().score, info.score);
    }
}

#[tokio::test]
async fn test_percentage_penalty_with_rejection() {
    let mut late_policy = policy(LatePolicyType::PercentagePenalty);
    late_policy.penalty = 0.1;
    late_policy.reject_after_days = 3;
    let fixture = Fixture::new(Some(late_policy));

    let scores = fixture.run(false).await;
    assert_eq!(scores[&email(5)].score, RAW_SCORE);
    assert_eq!(scores[&email(6)].score, 80.0);
    assert_eq!(scores[&email(8)].score, 60.0);

    // Past the rejection window: scored, but never uploaded.
    assert!(scores[&email(9)].reject);
    assert!(fixture.posted(9).is_none());
    assert_eq!(fixture.posted(8).unwrap().score, 60.0);
}

#[tokio::test]
async fn test_invalid_policy() {
    let mut late_policy = policy(LatePolicyType::ConstantPenalty);
    late_policy.penalty = -1.0;
    let fixture = Fixture::new(Some(late_policy));

    let err = full_assignment_scoring_and_upload(&fixture.store, &fixture.lms, &fixture.course, &fixture.assignment, false)
        .await
        .unwrap_err();
    assert!(is_validation_error(&err));
    assert_eq!(fixture.backend.write_count(), 0);
}

#[tokio::test]
async fn test_missing_lms_id() {
    let mut fixture = Fixture::new(None);
    fixture.assignment.lms_id = None;

    let err = full_assignment_scoring_and_upload(&fixture.store, &fixture.lms, &fixture.course, &fixture.assignment, false)
        .await
        .unwrap_err();
    assert!(is_validation_error(&err));
}

#[tokio::test]
async fn test_locked_grades_are_skipped() {
    let fixture = Fixture::new(None);

    fixture.backend.set_score(
        LMS_ASSIGNMENT,
        LmsSubmissionScore {
            user_id: lms_user(2),
            score: 42.0,
            comments: vec![LmsSubmissionComment {
                text: "Regraded by hand. __LOCK__".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        },
    );

    let locked = ScoringInfo {
        id: "manual".to_string(),
        score: 12.0,
        raw_score: 12.0,
        lock: true,
        ..Default::default()
    }
    .new_versioned();
    fixture.backend.set_score(
        LMS_ASSIGNMENT,
        LmsSubmissionScore {
            user_id: lms_user(3),
            score: 12.0,
            comments: vec![LmsSubmissionComment {
                text: serde_json::to_string(&locked).unwrap(),
                ..Default::default()
            }],
            ..Default::default()
        },
    );

    fixture.run(false).await;
    assert_eq!(fixture.backend.comment_writes(), 0);

    let lock_comment = fixture.posted(2).unwrap();
    assert_eq!(lock_comment.score, 42.0);
    assert_eq!(lock_comment.comments.len(), 1);

    let lock_flag = fixture.posted(3).unwrap();
    assert_eq!(lock_flag.score, 12.0);
    assert_eq!(lock_flag.comments.len(), 1);

    assert_eq!(fixture.posted(4).unwrap().score, RAW_SCORE);
}

#[tokio::test]
async fn test_late_days_ledger() {
    let mut late_policy = policy(LatePolicyType::LateDays);
    late_policy.penalty = 0.1;
    late_policy.max_late_days = 2;
    late_policy.late_days_lms_name = LEDGER_NAME.to_string();
    let fixture = Fixture::new(Some(late_policy));
    fixture.add_ledger(3.0);

    let scores = fixture.run(false).await;

    // (days late, days used, final score)
    let expected = [(1, 1, 90.0), (2, 2, 90.0), (3, 2, 80.0), (4, 2, 70.0)];
    for (index, (days_late, used, score)) in (6..NUM_STUDENTS).zip(expected) {
        let info = &scores[&email(index)];
        assert_eq!(info.num_days_late, days_late, "{}", email(index));
        assert_eq!(info.late_day_usage, used);
        assert_eq!(info.score, score);
        assert_eq!(fixture.posted(index).unwrap().score, score);

        let (posted_days, ledger) = fixture.ledger(index);
        assert_eq!(posted_days, (3 - used) as f64);
        assert_eq!(ledger.allocated_days.get(ASSIGNMENT), Some(&used));
        assert_eq!(ledger.total_days(), 3);
    }

    // On time students keep an untouched ledger.
    for index in 0..6 {
        assert_eq!(scores[&email(index)].late_day_usage, 0);
        let ledger = fixture.backend.score(LEDGER, &lms_user(index)).unwrap();
        assert_eq!(ledger.score, 3.0);
        assert!(ledger.comments.is_empty());
    }

    // A second run finds the same allocations and writes nothing.
    let writes = fixture.backend.write_count();
    let again = fixture.run(false).await;
    assert_eq!(fixture.backend.write_count(), writes);
    for (email, info) in &again {
        assert!(info.same_scoring(&scores[email]), "{}", email);
    }
}

#[tokio::test]
async fn test_late_days_dry_run() {
    let mut late_policy = policy(LatePolicyType::LateDays);
    late_policy.penalty = 0.5;
    late_policy.max_late_days = 1;
    late_policy.late_days_lms_id = LEDGER.to_string();
    let fixture = Fixture::new(Some(late_policy));
    fixture.add_ledger(1.0);

    let scores = fixture.run(true).await;
    assert_eq!(fixture.backend.write_count(), 0);

    assert_eq!(scores[&email(6)].late_day_usage, 1);
    assert_eq!(scores[&email(6)].score, RAW_SCORE);
    assert_eq!(scores[&email(7)].score, 40.0);
    assert!(fixture.backend.score(LEDGER, &lms_user(6)).unwrap().comments.is_empty());
}

#[tokio::test]
async fn test_late_days_reclaimed_by_on_time_resubmission() {
    let mut late_policy = policy(LatePolicyType::LateDays);
    late_policy.penalty = 0.1;
    late_policy.max_late_days = 2;
    late_policy.late_days_lms_id = LEDGER.to_string();
    let fixture = Fixture::new(Some(late_policy));
    fixture.add_ledger(2.0);

    // Student 6 is one day late and spends a day.
    let scores = fixture.run(false).await;
    assert_eq!(scores[&email(6)].late_day_usage, 1);
    assert_eq!(scores[&email(6)].score, RAW_SCORE);

    let (posted_days, ledger) = fixture.ledger(6);
    assert_eq!(posted_days, 1.0);
    assert_eq!(ledger.available_days, 1);
    assert_eq!(ledger.allocated_days.len(), 1);
    assert_eq!(ledger.allocated_days.get(ASSIGNMENT), Some(&1));
    assert_eq!(ledger.total_days(), 2);

    let ledger_comment = fixture.backend.score(LEDGER, &lms_user(6)).unwrap().comments[0].clone();
    assert!(!ledger_comment.id.is_empty());

    // An on-time resubmission gives the day back.
    fixture
        .store
        .add_submission(submission_at(6, 1_697_500_000, RAW_SCORE, DUE - MSECS_PER_HOURS));
    let comment_writes = fixture.backend.comment_writes();

    let scores = fixture.run(false).await;
    let info = &scores[&email(6)];
    assert_eq!(info.num_days_late, 0);
    assert_eq!(info.late_day_usage, 0);
    assert_eq!(info.score, RAW_SCORE);
    assert_eq!(fixture.posted_info(6).late_day_usage, 0);

    let (posted_days, ledger) = fixture.ledger(6);
    assert_eq!(posted_days, 2.0);
    assert_eq!(ledger.available_days, 2);
    assert!(ledger.allocated_days.is_empty());
    assert_eq!(ledger.total_days(), 2);

    // Same single ledger comment, rewritten rather than reposted.
    let comments = fixture.backend.score(LEDGER, &lms_user(6)).unwrap().comments;
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].id, ledger_comment.id);
    assert_ne!(comments[0].text, ledger_comment.text);
    assert!(fixture.backend.comment_writes() > comment_writes);

    // Other late students keep their allocations.
    let (_, ledger) = fixture.ledger(7);
    assert_eq!(ledger.allocated_days.get(ASSIGNMENT), Some(&2));
    assert_eq!(ledger.total_days(), 2);
}
