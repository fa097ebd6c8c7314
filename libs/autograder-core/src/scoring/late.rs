// Late policies: day counting, fixed penalties, and the late-day ledger kept on the LMS.
use crate::lms::{LmsAdapter, LmsSubmissionComment, LmsSubmissionScore};
use anyhow::{anyhow, bail, Context, Result};
use autograder_common::timestamp::{MSECS_PER_DAYS, MSECS_PER_MINS};
use autograder_common::types::{
    is_autograder_comment, is_lock_comment, Assignment, Course, LateDaysInfo, LateGradingPolicy, LatePolicyType,
    ScoringInfo, UserMap, LATE_DAYS_STRUCT_VERSION,
};
use autograder_common::{AutograderError, Timestamp};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Whole days past `due` (plus grace), rounded down. On-time and early submissions are 0 days late.
pub fn late_days_with_grace(due: Timestamp, submitted: Timestamp, grace_minutes: i64) -> i64 {
    let due = due + grace_minutes * MSECS_PER_MINS;
    if submitted <= due {
        return 0;
    }

    (submitted - due) / MSECS_PER_DAYS
}

pub fn late_days(due: Timestamp, submitted: Timestamp) -> i64 {
    late_days_with_grace(due, submitted, 0)
}

/// Set `score`, `num_days_late`, `late_day_usage`, and `reject` on every scoring info.
/// Scores are keyed by user email. Under a late-days policy the ledger changes are uploaded
/// (or only logged on a dry run).
#[tracing::instrument(skip_all, fields(course = %course.id, assignment = %assignment.id, dry_run = dry_run))]
pub async fn apply_late_policy(
    lms: &LmsAdapter,
    course: &Course,
    assignment: &Assignment,
    users: &UserMap,
    scores: &mut BTreeMap<String, ScoringInfo>,
    dry_run: bool,
) -> Result<()> {
    let policy = assignment.effective_late_policy(course);

    for score in scores.values_mut() {
        score.score = score.raw_score;
    }

    if policy.policy_type == LatePolicyType::Empty {
        return Ok(());
    }

    policy.validate()?;

    let lms_assignment = lms
        .fetch_assignment(assignment.lms_id())
        .await
        .with_context(|| format!("Failed to fetch LMS assignment '{}'", assignment.lms_id()))?;
    let due_date = lms_assignment
        .due_date
        .ok_or_else(|| AutograderError::validation(format!("Assignment '{}' does not have a due date", assignment.id)))?;

    apply_baseline_policy(&policy, users, scores, due_date);

    match policy.policy_type {
        LatePolicyType::Empty | LatePolicyType::Baseline => Ok(()),
        LatePolicyType::ConstantPenalty => {
            apply_constant_policy(scores, policy.penalty);
            Ok(())
        }
        LatePolicyType::PercentagePenalty => {
            apply_constant_policy(scores, lms_assignment.max_points * policy.penalty);
            Ok(())
        }
        LatePolicyType::LateDays => {
            let penalty = lms_assignment.max_points * policy.penalty;
            apply_late_days_policy(lms, &policy, assignment, users, scores, penalty, dry_run)
                .await
                .context("Failed to apply late days policy")
        }
    }
}

fn apply_baseline_policy(
    policy: &LateGradingPolicy,
    users: &UserMap,
    scores: &mut BTreeMap<String, ScoringInfo>,
    due_date: Timestamp,
) {
    for (email, score) in scores.iter_mut() {
        score.num_days_late = late_days(due_date, score.submission_time);

        if !users.contains_key(email) {
            warn!(user = %email, "Cannot find user, rejecting submission");
            score.reject = true;
            continue;
        }

        if policy.reject_after_days > 0 && score.num_days_late > policy.reject_after_days {
            score.reject = true;
        }
    }
}

fn apply_constant_policy(scores: &mut BTreeMap<String, ScoringInfo>, penalty: f64) {
    for score in scores.values_mut().filter(|score| score.num_days_late > 0) {
        score.score = (score.raw_score - penalty * score.num_days_late as f64).max(0.0);
    }
}

async fn apply_late_days_policy(
    lms: &LmsAdapter,
    policy: &LateGradingPolicy,
    assignment: &Assignment,
    users: &UserMap,
    scores: &mut BTreeMap<String, ScoringInfo>,
    penalty: f64,
    dry_run: bool,
) -> Result<()> {
    let ledger_id = resolve_ledger_id(lms, policy).await?;
    let mut ledgers = fetch_late_days(lms, &ledger_id).await?;
    let mut updates = BTreeMap::new();

    for (email, score) in scores.iter_mut() {
        if score.reject {
            continue;
        }

        let lms_id = users.get(email).map(|user| user.lms_id()).unwrap_or_default();
        if lms_id.is_empty() {
            warn!(user = %email, "User does not have an LMS ID, cannot apply late days policy. Rejecting submission.");
            score.reject = true;
            continue;
        }

        let Some(ledger) = ledgers.get_mut(lms_id) else {
            warn!(user = %email, lms_id = %lms_id, "Cannot find user late days. Rejecting submission.");
            score.reject = true;
            continue;
        };

        if allocate_late_days(ledger, &assignment.id, score, policy.max_late_days, penalty) {
            updates.insert(lms_id.to_string(), ledger.clone());
        }
    }

    upload_late_days(lms, &ledger_id, &updates, dry_run).await
}

/// Reclaim this assignment's previous allocation and spend what is needed.
/// Returns true when the ledger changed and must be uploaded.
fn allocate_late_days(
    ledger: &mut LateDaysInfo,
    assignment_id: &str,
    score: &mut ScoringInfo,
    max_late_days: i64,
    penalty: f64,
) -> bool {
    let original = ledger.allocated_days.clone();

    let previous = ledger.allocated_days.remove(assignment_id);
    let available = ledger.available_days + previous.unwrap_or(0);

    // Not late and nothing to reclaim.
    if score.num_days_late <= 0 && previous.is_none() {
        return false;
    }

    let used = available.min(max_late_days).min(score.num_days_late).max(0);
    score.late_day_usage = used;
    score.score = (score.raw_score - penalty * (score.num_days_late - used) as f64).max(0.0);

    ledger.available_days = available - used;
    if used > 0 {
        ledger.allocated_days.insert(assignment_id.to_string(), used);
    }

    if ledger.allocated_days == original {
        return false;
    }

    ledger.upload_time = Timestamp::now();
    true
}

/// The ledger assignment's LMS ID, looked up by name when only the name is configured.
async fn resolve_ledger_id(lms: &LmsAdapter, policy: &LateGradingPolicy) -> Result<String> {
    if !policy.late_days_lms_id.is_empty() {
        return Ok(policy.late_days_lms_id.clone());
    }

    if policy.late_days_lms_name.is_empty() {
        return Err(AutograderError::validation("Late days policy names no LMS assignment").into());
    }

    let assignments = lms.fetch_assignments().await.context("Failed to fetch LMS assignments")?;
    let mut matches = assignments
        .into_iter()
        .filter(|assignment| assignment.name == policy.late_days_lms_name);

    match (matches.next(), matches.next()) {
        (Some(assignment), None) => {
            debug!(name = %policy.late_days_lms_name, id = %assignment.id, "Resolved late days assignment");
            Ok(assignment.id)
        }
        (None, _) => Err(AutograderError::not_found(format!(
            "Could not find late days LMS assignment named '{}'",
            policy.late_days_lms_name
        ))
        .into()),
        (Some(_), Some(_)) => Err(AutograderError::validation(format!(
            "Found multiple LMS assignments named '{}'",
            policy.late_days_lms_name
        ))
        .into()),
    }
}

/// Ledgers keyed by LMS user ID.
async fn fetch_late_days(lms: &LmsAdapter, ledger_id: &str) -> Result<BTreeMap<String, LateDaysInfo>> {
    let scores = lms
        .fetch_assignment_scores(ledger_id)
        .await
        .with_context(|| format!("Failed to fetch late days assignment '{}'", ledger_id))?;

    scores
        .iter()
        .map(|score| -> Result<(String, LateDaysInfo)> { Ok((score.user_id.clone(), parse_late_days(ledger_id, score)?)) })
        .collect()
}

fn parse_late_days(ledger_id: &str, score: &LmsSubmissionScore) -> Result<LateDaysInfo> {
    let mut found: Option<LateDaysInfo> = None;

    for comment in &score.comments {
        if is_lock_comment(&comment.text) {
            bail!(
                "Late days assignment '{}' for user '{}' has a lock comment. Resolve this lock to allow for grading.",
                ledger_id,
                score.user_id
            );
        }

        if !is_autograder_comment(&comment.text) {
            continue;
        }

        let mut info: LateDaysInfo = serde_json::from_str(&comment.text).with_context(|| {
            format!("Could not parse LMS comment {} ({}) into a late days info", comment.id, comment.text)
        })?;

        if info.autograder_struct_version != LATE_DAYS_STRUCT_VERSION {
            return Err(anyhow!(
                "Mismatch in late days info version found in LMS comment. Current version: '{}', comment version: '{}'",
                LATE_DAYS_STRUCT_VERSION,
                info.autograder_struct_version
            ));
        }

        info.lms_comment_id = comment.id.clone();
        info.lms_comment_author_id = comment.author.clone();
        found = Some(info);
    }

    // The posted score is authoritative for available days.
    let posted_days = score.score.round() as i64;
    let mut info = match found {
        Some(info) => {
            if info.available_days != posted_days {
                warn!(
                    user_lms_id = %score.user_id,
                    posted_days,
                    comment_days = info.available_days,
                    "Mismatch between posted late days and the autograder comment"
                );
            }
            info
        }
        None => LateDaysInfo::default(),
    };

    info.available_days = posted_days;
    info.upload_time = Timestamp::now();
    info.autograder_struct_version = LATE_DAYS_STRUCT_VERSION.to_string();
    Ok(info)
}

async fn upload_late_days(
    lms: &LmsAdapter,
    ledger_id: &str,
    updates: &BTreeMap<String, LateDaysInfo>,
    dry_run: bool,
) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }

    let mut scores = Vec::with_capacity(updates.len());
    let mut comments = Vec::new();

    for (user_id, info) in updates {
        let text = serde_json::to_string(info).context("Failed to serialize late days info")?;

        let mut new_comments = Vec::new();
        if info.lms_comment_id.is_empty() {
            new_comments.push(LmsSubmissionComment {
                text,
                ..Default::default()
            });
        } else {
            comments.push(LmsSubmissionComment {
                id: info.lms_comment_id.clone(),
                author: info.lms_comment_author_id.clone(),
                text,
            });
        }

        scores.push(LmsSubmissionScore {
            user_id: user_id.clone(),
            score: info.available_days as f64,
            time: Some(info.upload_time),
            comments: new_comments,
        });
    }

    if dry_run {
        info!(
            ledger = %ledger_id,
            scores = scores.len(),
            comments = comments.len(),
            "Dry run: skipping upload of late days"
        );
        return Ok(());
    }

    lms.update_assignment_scores(ledger_id, &scores)
        .await
        .context("Failed to upload late days")?;

    if !comments.is_empty() {
        lms.update_comments(ledger_id, &comments)
            .await
            .context("Failed to update late days comments")?;
    }

    info!(ledger = %ledger_id, updated = updates.len(), "Uploaded late days");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autograder_common::timestamp::MSECS_PER_HOURS;

    const DUE: Timestamp = Timestamp::from_msecs(1_700_000_000_000);

    #[test]
    fn test_late_days() {
        assert_eq!(late_days(DUE, DUE - MSECS_PER_DAYS), 0);
        assert_eq!(late_days(DUE, DUE), 0);
        assert_eq!(late_days(DUE, DUE + MSECS_PER_HOURS), 0);
        assert_eq!(late_days(DUE, DUE + MSECS_PER_DAYS), 1);
        assert_eq!(late_days(DUE, DUE + 2 * MSECS_PER_DAYS + 1), 2);
    }

    #[test]
    fn test_late_days_with_grace() {
        let submitted = DUE + MSECS_PER_DAYS + 10 * MSECS_PER_MINS;
        assert_eq!(late_days_with_grace(DUE, submitted, 0), 1);
        assert_eq!(late_days_with_grace(DUE, submitted, 15), 0);
        assert_eq!(late_days_with_grace(DUE, DUE + 5 * MSECS_PER_MINS, 10), 0);
    }

    fn ledger(available: i64, allocated: &[(&str, i64)]) -> LateDaysInfo {
        LateDaysInfo {
            available_days: available,
            allocated_days: allocated.iter().map(|(id, days)| (id.to_string(), *days)).collect(),
            autograder_struct_version: LATE_DAYS_STRUCT_VERSION.to_string(),
            ..Default::default()
        }
    }

    fn scoring(raw_score: f64, num_days_late: i64) -> ScoringInfo {
        ScoringInfo {
            raw_score,
            score: raw_score,
            num_days_late,
            ..Default::default()
        }
    }

    #[test]
    fn test_reclaim() {
        let mut info = ledger(2, &[("hw1", 1)]);
        let mut score = scoring(10.0, 0);

        assert!(allocate_late_days(&mut info, "hw1", &mut score, 3, 1.0));
        assert_eq!(info.available_days, 3);
        assert!(info.allocated_days.is_empty());
        assert_eq!(score.late_day_usage, 0);
        assert_eq!(score.score, 10.0);
    }

    #[test]
    fn test_allocation_caps_and_penalty() {
        let mut info = ledger(5, &[("hw0", 2)]);
        let mut score = scoring(10.0, 4);

        // Max of 3 per assignment, 1 day penalized.
        assert!(allocate_late_days(&mut info, "hw1", &mut score, 3, 2.5));
        assert_eq!(score.late_day_usage, 3);
        assert_eq!(score.score, 7.5);
        assert_eq!(info.available_days, 2);
        assert_eq!(info.allocated_days["hw1"], 3);
        assert_eq!(info.total_days(), 7);

        // Same inputs again: nothing changes.
        assert!(!allocate_late_days(&mut info, "hw1", &mut score, 3, 2.5));
        assert_eq!(info.total_days(), 7);
    }

    #[test]
    fn test_not_late_without_allocation() {
        let mut info = ledger(2, &[]);
        let mut score = scoring(10.0, 0);

        assert!(!allocate_late_days(&mut info, "hw1", &mut score, 3, 1.0));
        assert_eq!(info.available_days, 2);
    }

    #[test]
    fn test_parse_late_days() {
        let stored = ledger(1, &[("hw0", 1)]);
        let score = LmsSubmissionScore {
            user_id: "lms-a".to_string(),
            score: 2.0,
            comments: vec![LmsSubmissionComment {
                id: "c1".to_string(),
                author: "grader".to_string(),
                text: serde_json::to_string(&stored).unwrap(),
            }],
            ..Default::default()
        };

        // The posted score wins over the comment.
        let info = parse_late_days("late", &score).unwrap();
        assert_eq!(info.available_days, 2);
        assert_eq!(info.allocated_days["hw0"], 1);
        assert_eq!(info.lms_comment_id, "c1");
        assert_eq!(info.lms_comment_author_id, "grader");

        let mut locked = score.clone();
        locked.comments.push(LmsSubmissionComment {
            text: "__LOCK__".to_string(),
            ..Default::default()
        });
        assert!(parse_late_days("late", &locked).unwrap_err().to_string().contains("lock comment"));

        let mut old = stored.clone();
        old.autograder_struct_version = "0.0.1".to_string();
        let mut mismatched = score.clone();
        mismatched.comments[0].text = serde_json::to_string(&old).unwrap();
        assert!(parse_late_days("late", &mismatched).unwrap_err().to_string().contains("Mismatch"));
    }
}
