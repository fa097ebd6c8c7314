/// Submission Specs - Turning User Input into Full Submission IDs
///
/// **Accepted Forms:**
/// - `<course>::<assignment>::<email>::<short id>`: that exact submission
/// - `<course>::<assignment>::<email>`: the user's most recent submission
/// - `<course>::<assignment>`: the most recent submission of every student
///
/// **Error Classes:**
/// Malformed specs and unknown courses/assignments/submissions are the
/// caller's fault (`SpecError::User`). Store failures are ours (`SpecError::System`).
/// Any error voids the whole resolution.

use crate::store::Store;
use autograder_common::ids::{is_valid_short_id, validate_id, SUBMISSION_ID_DELIM};
use autograder_common::types::CourseRole;
use autograder_common::FullSubmissionId;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("Invalid submission specs: {}", .0.join("; "))]
    User(Vec<String>),

    #[error("Failed to resolve submission specs: {}", .0.join("; "))]
    System(Vec<String>),
}

impl SpecError {
    pub fn is_user_error(&self) -> bool {
        matches!(self, SpecError::User(_))
    }

    pub fn messages(&self) -> &[String] {
        match self {
            SpecError::User(messages) | SpecError::System(messages) => messages,
        }
    }
}

/// The raw outcome of a resolution. On any error `ids` and `courses` are empty.
#[derive(Debug, Default)]
pub struct SpecResolution {
    pub ids: Vec<FullSubmissionId>,
    pub courses: Vec<String>,
    pub user_errors: Vec<String>,
    pub system_errors: Vec<String>,
}

impl SpecResolution {
    /// System errors win over user errors.
    pub fn into_result(self) -> Result<(Vec<FullSubmissionId>, Vec<String>), SpecError> {
        if !self.system_errors.is_empty() {
            return Err(SpecError::System(self.system_errors));
        }

        if !self.user_errors.is_empty() {
            return Err(SpecError::User(self.user_errors));
        }

        Ok((self.ids, self.courses))
    }
}

struct SplitSpec {
    course_id: String,
    assignment_id: String,
    email: String,
    short_id: String,
}

fn split_submission_spec(spec: &str) -> Result<SplitSpec, String> {
    let parts: Vec<&str> = spec.split(SUBMISSION_ID_DELIM).collect();

    if parts.len() > 4 {
        return Err(format!("Submission spec has too many components {}. Max is 4.", parts.len()));
    }

    if parts.len() < 2 {
        return Err(format!("Submission spec has too few components {}. Min is 2.", parts.len()));
    }

    if let Some(index) = parts.iter().position(|part| part.is_empty()) {
        return Err(format!("Submission spec has an empty component at index {}.", index));
    }

    let short_id = parts.get(3).copied().unwrap_or_default();
    if !short_id.is_empty() && !is_valid_short_id(short_id) {
        return Err(format!("Submission short ID is invalid ({}).", short_id));
    }

    let course_id = validate_id(parts[0]).map_err(|err| format!("Course ID is invalid ({}): '{}'.", parts[0], err))?;
    let assignment_id =
        validate_id(parts[1]).map_err(|err| format!("Assignment ID is invalid ({}): '{}'.", parts[1], err))?;

    Ok(SplitSpec {
        course_id,
        assignment_id,
        email: parts.get(2).copied().unwrap_or_default().to_string(),
        short_id: short_id.to_string(),
    })
}

#[tracing::instrument(skip_all, fields(specs = specs.len()))]
pub async fn resolve_submission_specs(store: &dyn Store, specs: &[String]) -> SpecResolution {
    let mut ids = BTreeSet::new();
    let mut courses = BTreeSet::new();
    let mut resolution = SpecResolution::default();

    for (index, spec) in specs.iter().enumerate() {
        let split = match split_submission_spec(spec) {
            Ok(split) => split,
            Err(message) => {
                resolution
                    .user_errors
                    .push(format!("Submission spec at index {} had an error: '{}'", index, message));
                continue;
            }
        };

        match store.get_course(&split.course_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                resolution.user_errors.push(format!("Course not found: {}.", split.course_id));
                continue;
            }
            Err(err) => {
                resolution
                    .system_errors
                    .push(format!("Failed to fetch course ({}): '{:#}'.", split.course_id, err));
                continue;
            }
        }

        match store.get_assignment(&split.course_id, &split.assignment_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                resolution
                    .user_errors
                    .push(format!("Assignment not found {}.{}.", split.course_id, split.assignment_id));
                continue;
            }
            Err(err) => {
                resolution
                    .system_errors
                    .push(format!("Failed to fetch assignment ({}): '{:#}'.", spec, err));
                continue;
            }
        }

        if split.email.is_empty() {
            match store
                .get_recent_submissions(&split.course_id, &split.assignment_id, CourseRole::Student)
                .await
            {
                Ok(submissions) => {
                    for info in submissions.into_values().flatten() {
                        ids.insert(info.full_id());
                        courses.insert(split.course_id.clone());
                    }
                }
                Err(err) => {
                    resolution
                        .system_errors
                        .push(format!("Failed to fetch submissions ({}): '{:#}'.", spec, err));
                }
            }

            continue;
        }

        match store
            .get_submission_result(&split.course_id, &split.assignment_id, &split.email, &split.short_id)
            .await
        {
            Ok(Some(info)) => {
                ids.insert(info.full_id());
                courses.insert(split.course_id.clone());
            }
            Ok(None) => resolution.user_errors.push(format!("Could not find submission {}.", spec)),
            Err(err) => {
                resolution
                    .system_errors
                    .push(format!("Failed to fetch submission ({}): '{:#}'.", spec, err));
            }
        }
    }

    if resolution.user_errors.is_empty() && resolution.system_errors.is_empty() {
        resolution.ids = ids.into_iter().collect();
        resolution.courses = courses.into_iter().collect();
    } else {
        debug!(
            user_errors = resolution.user_errors.len(),
            system_errors = resolution.system_errors.len(),
            "Submission specs did not resolve"
        );
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use autograder_common::types::{Assignment, Course, CourseUser, GradingInfo, GradingResult};

    const COURSE: &str = "course101";
    const ASSIGNMENT: &str = "hw0";

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_course(Course {
            id: COURSE.to_string(),
            ..Default::default()
        });
        store.add_assignment(Assignment {
            id: ASSIGNMENT.to_string(),
            course_id: COURSE.to_string(),
            ..Default::default()
        });

        for (email, role) in [
            ("a@test.edu", CourseRole::Student),
            ("b@test.edu", CourseRole::Student),
            ("grader@test.edu", CourseRole::Grader),
        ] {
            store.add_user(
                COURSE,
                CourseUser {
                    email: email.to_string(),
                    role,
                    ..Default::default()
                },
            );
        }

        for (email, short_id) in [
            ("a@test.edu", "100"),
            ("a@test.edu", "200"),
            ("b@test.edu", "150"),
            ("grader@test.edu", "300"),
        ] {
            store.add_submission(GradingResult {
                info: GradingInfo {
                    id: FullSubmissionId::new(COURSE, ASSIGNMENT, email, short_id).to_string(),
                    short_id: short_id.to_string(),
                    course_id: COURSE.to_string(),
                    assignment_id: ASSIGNMENT.to_string(),
                    user: email.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            });
        }

        store
    }

    fn specs(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn test_full_id_round_trip() {
        let store = store();
        let id = FullSubmissionId::new(COURSE, ASSIGNMENT, "a@test.edu", "100");

        let (ids, courses) = resolve_submission_specs(&store, &[id.to_string()]).await.into_result().unwrap();
        assert_eq!(ids, vec![id]);
        assert_eq!(courses, vec![COURSE.to_string()]);
    }

    #[tokio::test]
    async fn test_user_and_assignment_forms() {
        let store = store();

        let (ids, _) = resolve_submission_specs(&store, &specs(&["course101::hw0::a@test.edu"]))
            .await
            .into_result()
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].short_id(), "200");

        // Students only, deduplicated against the explicit spec.
        let (ids, courses) = resolve_submission_specs(&store, &specs(&["course101::hw0", "COURSE101::hw0::b@test.edu"]))
            .await
            .into_result()
            .unwrap();
        let shorts: Vec<&str> = ids.iter().map(|id| id.short_id()).collect();
        assert_eq!(shorts, vec!["200", "150"]);
        assert_eq!(courses, vec![COURSE.to_string()]);
    }

    #[tokio::test]
    async fn test_rejections() {
        let store = store();

        let resolution = resolve_submission_specs(&store, &specs(&["course101"])).await;
        assert!(resolution.ids.is_empty());
        assert!(resolution.user_errors[0].contains("too few components"));

        let resolution = resolve_submission_specs(&store, &specs(&["a::b::c::ZZZ"])).await;
        assert!(resolution.user_errors[0].contains("Submission short ID is invalid"));

        let resolution = resolve_submission_specs(&store, &specs(&["a::b::c::1::2"])).await;
        assert!(resolution.user_errors[0].contains("too many components"));

        let resolution = resolve_submission_specs(&store, &specs(&["course101::::a@test.edu"])).await;
        assert!(resolution.user_errors[0].contains("empty component at index 1"));

        let resolution = resolve_submission_specs(&store, &specs(&["-bad::hw0"])).await;
        assert!(resolution.user_errors[0].contains("Course ID is invalid"));

        let err = resolve_submission_specs(&store, &specs(&["course999::hw0", "course101::hw9", "course101::hw0::z@test.edu"]))
            .await
            .into_result()
            .unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(err.messages().len(), 3);
        assert!(err.messages()[0].contains("Course not found"));
        assert!(err.messages()[1].contains("Assignment not found"));
        assert!(err.messages()[2].contains("Could not find submission"));
    }

    #[tokio::test]
    async fn test_store_failure_is_system_error() {
        let store = store();
        store.set_offline(true);

        let err = resolve_submission_specs(&store, &specs(&["course101::hw0"]))
            .await
            .into_result()
            .unwrap_err();
        assert!(!err.is_user_error());
    }
}
