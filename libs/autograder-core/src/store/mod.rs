/// Store - Persistence Seam
///
/// **Core Responsibility:**
/// Everything the execution core reads or writes about courses, submissions,
/// and cached analyses goes through this trait.
///
/// **Contract:**
/// - Lookups return `Ok(None)` for missing records; `Err` is reserved for I/O failures
/// - Course and assignment IDs arrive already normalized
/// - Implementations are shared across tasks (`Send + Sync`) and must give
///   read-your-writes within a single task

use anyhow::Result;
use async_trait::async_trait;
use autograder_common::analysis::{IndividualAnalysis, PairwiseAnalysis};
use autograder_common::types::{Assignment, Course, CourseRole, CourseUser, GradingInfo, GradingResult, ScoringInfo, UserMap};
use autograder_common::{FullSubmissionId, PairwiseKey};
use std::collections::BTreeMap;

pub mod memory;

pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_course(&self, course_id: &str) -> Result<Option<Course>>;

    async fn get_assignment(&self, course_id: &str, assignment_id: &str) -> Result<Option<Assignment>>;

    async fn get_course_users(&self, course_id: &str) -> Result<UserMap>;

    async fn get_course_user(&self, course_id: &str, email: &str) -> Result<Option<CourseUser>> {
        Ok(self.get_course_users(course_id).await?.remove(email))
    }

    /// An empty `short_id` means the user's most recent submission.
    async fn get_submission_result(
        &self,
        course_id: &str,
        assignment_id: &str,
        email: &str,
        short_id: &str,
    ) -> Result<Option<GradingInfo>>;

    async fn get_submission_contents(&self, id: &FullSubmissionId) -> Result<Option<GradingResult>>;

    /// The same user's submission just before `id` on the same assignment.
    async fn get_previous_submission_id(&self, id: &FullSubmissionId) -> Result<Option<FullSubmissionId>>;

    /// Most recent submission for every user with `role`, keyed by email.
    /// Users without a submission map to `None`.
    async fn get_recent_submissions(
        &self,
        course_id: &str,
        assignment_id: &str,
        role: CourseRole,
    ) -> Result<BTreeMap<String, Option<GradingInfo>>>;

    /// Fresh scoring infos derived from the most recent submissions, keyed by email.
    async fn get_scoring_infos(
        &self,
        course_id: &str,
        assignment_id: &str,
        role: CourseRole,
    ) -> Result<BTreeMap<String, ScoringInfo>> {
        let submissions = self.get_recent_submissions(course_id, assignment_id, role).await?;

        Ok(submissions
            .into_iter()
            .filter_map(|(email, info)| info.map(|info| (email, info.to_scoring_info())))
            .collect())
    }

    async fn save_submission(&self, result: GradingResult) -> Result<()>;

    async fn get_individual_analyses(
        &self,
        ids: &[FullSubmissionId],
    ) -> Result<BTreeMap<FullSubmissionId, IndividualAnalysis>>;

    async fn get_individual_analysis(&self, id: &FullSubmissionId) -> Result<Option<IndividualAnalysis>> {
        Ok(self.get_individual_analyses(std::slice::from_ref(id)).await?.remove(id))
    }

    async fn store_individual_analyses(&self, records: &[IndividualAnalysis]) -> Result<()>;

    async fn remove_individual_analyses(&self, ids: &[FullSubmissionId]) -> Result<()>;

    async fn get_pairwise_analyses(&self, keys: &[PairwiseKey]) -> Result<BTreeMap<PairwiseKey, PairwiseAnalysis>>;

    async fn get_pairwise_analysis(&self, key: &PairwiseKey) -> Result<Option<PairwiseAnalysis>> {
        Ok(self.get_pairwise_analyses(std::slice::from_ref(key)).await?.remove(key))
    }

    async fn store_pairwise_analyses(&self, records: &[PairwiseAnalysis]) -> Result<()>;

    async fn remove_pairwise_analyses(&self, keys: &[PairwiseKey]) -> Result<()>;
}
