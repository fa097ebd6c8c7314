// Final scoring for one assignment: apply the late policy, then push changed scores to the LMS.
use super::late::apply_late_policy;
use crate::lms::{LmsAdapter, LmsSubmissionComment, LmsSubmissionScore};
use crate::store::Store;
use anyhow::{anyhow, Context, Result};
use autograder_common::types::{
    is_autograder_comment, is_lock_comment, Assignment, Course, CourseRole, ScoringInfo, UserMap,
    SCORING_INFO_STRUCT_VERSION,
};
use autograder_common::{AutograderError, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// What the LMS already knows, keyed by LMS user ID.
#[derive(Debug, Default)]
pub struct ExistingComments {
    pub locks: BTreeSet<String>,
    pub scoring: BTreeMap<String, ScoringInfo>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    scores: Vec<LmsSubmissionScore>,
    comments: Vec<LmsSubmissionComment>,
}

/// Score every student's most recent submission and upload what changed.
/// Returns the final scoring infos keyed by email, the same on a dry run as on a real one.
#[tracing::instrument(skip_all, fields(course = %course.id, assignment = %assignment.id, dry_run = dry_run))]
pub async fn full_assignment_scoring_and_upload(
    store: &dyn Store,
    lms: &LmsAdapter,
    course: &Course,
    assignment: &Assignment,
    dry_run: bool,
) -> Result<BTreeMap<String, ScoringInfo>> {
    let lms_id = assignment.lms_id();
    if lms_id.is_empty() {
        return Err(AutograderError::validation(format!("Assignment '{}' has no LMS ID", assignment.id)).into());
    }

    let users = store
        .get_course_users(&course.id)
        .await
        .context("Failed to fetch autograder users")?;

    let lms_scores = lms
        .fetch_assignment_scores(lms_id)
        .await
        .context("Could not fetch LMS grades")?;

    let mut scoring_infos: BTreeMap<String, ScoringInfo> = store
        .get_scoring_infos(&course.id, &assignment.id, CourseRole::Student)
        .await
        .context("Failed to get scoring information")?
        .into_iter()
        .map(|(email, info)| (email, info.new_versioned()))
        .collect();

    apply_late_policy(lms, course, assignment, &users, &mut scoring_infos, dry_run)
        .await
        .context("Failed to apply late policy")?;

    let existing = parse_comments(&lms_scores)?;
    let upload = filter_final_scores(&users, &mut scoring_infos, &existing);

    if dry_run {
        info!(
            scores = upload.scores.len(),
            comments = upload.comments.len(),
            "Dry run: skipping upload of final grades"
        );
        return Ok(scoring_infos);
    }

    if !upload.scores.is_empty() {
        lms.update_assignment_scores(lms_id, &upload.scores)
            .await
            .context("Failed to upload final scores")?;
    }

    if !upload.comments.is_empty() {
        lms.update_comments(lms_id, &upload.comments)
            .await
            .context("Failed to update final comments")?;
    }

    info!(
        scores = upload.scores.len(),
        comments = upload.comments.len(),
        "Uploaded final grades"
    );
    Ok(scoring_infos)
}

/// Find lock comments and this system's previous scoring comments.
pub fn parse_comments(lms_scores: &[LmsSubmissionScore]) -> Result<ExistingComments> {
    let mut existing = ExistingComments::default();

    for lms_score in lms_scores {
        for comment in &lms_score.comments {
            if is_lock_comment(&comment.text) {
                existing.locks.insert(lms_score.user_id.clone());
                continue;
            }

            if !is_autograder_comment(&comment.text) {
                continue;
            }

            let mut info: ScoringInfo = serde_json::from_str(&comment.text).with_context(|| {
                format!("Could not parse LMS comment {} ({}) into a scoring info", comment.id, comment.text)
            })?;

            if info.autograder_struct_version != SCORING_INFO_STRUCT_VERSION {
                return Err(anyhow!(
                    "Mismatch in scoring info version found in LMS comment. Current version: '{}', comment version: '{}'",
                    SCORING_INFO_STRUCT_VERSION,
                    info.autograder_struct_version
                ));
            }

            info.lms_comment_id = comment.id.clone();
            info.lms_comment_author_id = comment.author.clone();

            // A stored lock flag freezes the grade too.
            if info.lock {
                existing.locks.insert(lms_score.user_id.clone());
            }

            existing.scoring.insert(lms_score.user_id.clone(), info);
        }
    }

    Ok(existing)
}

fn filter_final_scores(
    users: &UserMap,
    scoring_infos: &mut BTreeMap<String, ScoringInfo>,
    existing: &ExistingComments,
) -> PendingUpload {
    let mut upload = PendingUpload::default();

    for (email, info) in scoring_infos.iter_mut() {
        let Some(user) = users.get(email) else {
            warn!(user = %email, "User does not exist, skipping grade upload");
            continue;
        };

        if info.reject {
            continue;
        }

        let lms_id = user.lms_id();
        if lms_id.is_empty() {
            warn!(user = %email, "User does not have an LMS ID, skipping grade upload");
            continue;
        }

        if existing.locks.contains(lms_id) {
            debug!(user = %email, "Grade is locked");
            continue;
        }

        info.upload_time = Timestamp::now();

        let previous = existing.scoring.get(lms_id);
        if previous.is_some_and(|previous| previous.same_scoring(info)) {
            debug!(user = %email, submission = %info.id, "Grade is up to date");
            continue;
        }

        let text = match serde_json::to_string(&*info) {
            Ok(text) => text,
            Err(err) => {
                warn!(user = %email, error = %err, "Failed to serialize scoring info, skipping grade upload");
                continue;
            }
        };

        let mut new_comments = Vec::new();
        match previous {
            Some(previous) => {
                info.lms_comment_id = previous.lms_comment_id.clone();
                info.lms_comment_author_id = previous.lms_comment_author_id.clone();
                upload.comments.push(LmsSubmissionComment {
                    id: info.lms_comment_id.clone(),
                    author: info.lms_comment_author_id.clone(),
                    text,
                });
            }
            None => new_comments.push(LmsSubmissionComment {
                text,
                ..Default::default()
            }),
        }

        let time = if info.submission_time.is_zero() {
            Timestamp::now()
        } else {
            info.submission_time
        };

        upload.scores.push(LmsSubmissionScore {
            user_id: lms_id.to_string(),
            score: info.score,
            time: Some(time),
            comments: new_comments,
        });
    }

    upload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: &str, text: &str) -> LmsSubmissionComment {
        LmsSubmissionComment {
            id: id.to_string(),
            author: "grader".to_string(),
            text: text.to_string(),
        }
    }

    fn versioned(id: &str, score: f64) -> ScoringInfo {
        ScoringInfo {
            id: id.to_string(),
            raw_score: score,
            score,
            ..Default::default()
        }
        .new_versioned()
    }

    #[test]
    fn test_parse_comments() {
        let mut locked_info = versioned("sub-b", 1.0);
        locked_info.lock = true;

        let scores = vec![
            LmsSubmissionScore {
                user_id: "a".to_string(),
                comments: vec![
                    comment("1", "Nice work"),
                    comment("2", &serde_json::to_string(&versioned("sub-a", 5.0)).unwrap()),
                ],
                ..Default::default()
            },
            LmsSubmissionScore {
                user_id: "b".to_string(),
                comments: vec![comment("3", &serde_json::to_string(&locked_info).unwrap())],
                ..Default::default()
            },
            LmsSubmissionScore {
                user_id: "c".to_string(),
                comments: vec![comment("4", "Grade frozen: __Lock__")],
                ..Default::default()
            },
        ];

        let existing = parse_comments(&scores).unwrap();
        assert_eq!(existing.locks, BTreeSet::from(["b".to_string(), "c".to_string()]));
        assert_eq!(existing.scoring["a"].id, "sub-a");
        assert_eq!(existing.scoring["a"].lms_comment_id, "2");
        assert_eq!(existing.scoring["a"].lms_comment_author_id, "grader");
        assert!(existing.scoring.contains_key("b"));
    }

    #[test]
    fn test_parse_comments_rejects_versions() {
        let mut info = versioned("sub-a", 5.0);
        info.autograder_struct_version = "0.9.0".to_string();

        let scores = vec![LmsSubmissionScore {
            user_id: "a".to_string(),
            comments: vec![comment("1", &serde_json::to_string(&info).unwrap())],
            ..Default::default()
        }];
        assert!(parse_comments(&scores).is_err());

        let broken = vec![LmsSubmissionScore {
            user_id: "a".to_string(),
            comments: vec![comment("1", r#"{"__autograder__version__": "#)],
            ..Default::default()
        }];
        assert!(parse_comments(&broken).is_err());
    }
}
