// In-memory Store for tests and fixtures.
use super::Store;
use anyhow::{bail, Result};
use async_trait::async_trait;
use autograder_common::analysis::{IndividualAnalysis, PairwiseAnalysis};
use autograder_common::types::{Assignment, Course, CourseRole, CourseUser, GradingInfo, GradingResult, UserMap};
use autograder_common::{FullSubmissionId, PairwiseKey};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
pub struct MemoryStore {
    courses: RwLock<HashMap<String, Course>>,
    assignments: RwLock<HashMap<(String, String), Assignment>>,
    users: RwLock<HashMap<String, UserMap>>,
    submissions: RwLock<BTreeMap<FullSubmissionId, GradingResult>>,
    individual: RwLock<BTreeMap<FullSubmissionId, IndividualAnalysis>>,
    pairwise: RwLock<BTreeMap<PairwiseKey, PairwiseAnalysis>>,

    analysis_writes: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_course(&self, course: Course) {
        self.users.write().entry(course.id.clone()).or_default();
        self.courses.write().insert(course.id.clone(), course);
    }

    pub fn add_assignment(&self, assignment: Assignment) {
        self.assignments
            .write()
            .insert((assignment.course_id.clone(), assignment.id.clone()), assignment);
    }

    pub fn add_user(&self, course_id: &str, user: CourseUser) {
        self.users
            .write()
            .entry(course_id.to_string())
            .or_default()
            .insert(user.email.clone(), user);
    }

    pub fn add_submission(&self, result: GradingResult) {
        self.submissions.write().insert(result.info.full_id(), result);
    }

    /// Number of analysis store/remove calls so far.
    pub fn analysis_writes(&self) -> usize {
        self.analysis_writes.load(Ordering::SeqCst)
    }

    /// When offline every call fails, simulating a storage outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("Store is offline");
        }

        Ok(())
    }

    fn user_submissions(&self, course_id: &str, assignment_id: &str, email: &str) -> Vec<FullSubmissionId> {
        self.submissions
            .read()
            .keys()
            .filter(|id| id.course_id() == course_id && id.assignment_id() == assignment_id && id.user_email() == email)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_course(&self, course_id: &str) -> Result<Option<Course>> {
        self.check_online()?;
        Ok(self.courses.read().get(course_id).cloned())
    }

    async fn get_assignment(&self, course_id: &str, assignment_id: &str) -> Result<Option<Assignment>> {
        self.check_online()?;
        Ok(self
            .assignments
            .read()
            .get(&(course_id.to_string(), assignment_id.to_string()))
            .cloned())
    }

    async fn get_course_users(&self, course_id: &str) -> Result<UserMap> {
        self.check_online()?;
        Ok(self.users.read().get(course_id).cloned().unwrap_or_default())
    }

    async fn get_submission_result(
        &self,
        course_id: &str,
        assignment_id: &str,
        email: &str,
        short_id: &str,
    ) -> Result<Option<GradingInfo>> {
        self.check_online()?;

        let id = if short_id.is_empty() {
            match self.user_submissions(course_id, assignment_id, email).pop() {
                Some(id) => id,
                None => return Ok(None),
            }
        } else {
            FullSubmissionId::new(course_id, assignment_id, email, short_id)
        };

        Ok(self.submissions.read().get(&id).map(|result| result.info.clone()))
    }

    async fn get_submission_contents(&self, id: &FullSubmissionId) -> Result<Option<GradingResult>> {
        self.check_online()?;
        Ok(self.submissions.read().get(id).cloned())
    }

    async fn get_previous_submission_id(&self, id: &FullSubmissionId) -> Result<Option<FullSubmissionId>> {
        self.check_online()?;
        Ok(self
            .user_submissions(id.course_id(), id.assignment_id(), id.user_email())
            .into_iter()
            .filter(|other| other.short_id() < id.short_id())
            .max())
    }

    async fn get_recent_submissions(
        &self,
        course_id: &str,
        assignment_id: &str,
        role: CourseRole,
    ) -> Result<BTreeMap<String, Option<GradingInfo>>> {
        let users = self.get_course_users(course_id).await?;

        let mut results = BTreeMap::new();
        for user in users.values().filter(|user| user.role == role) {
            let info = self.get_submission_result(course_id, assignment_id, &user.email, "").await?;
            results.insert(user.email.clone(), info);
        }

        Ok(results)
    }

    async fn save_submission(&self, result: GradingResult) -> Result<()> {
        self.check_online()?;
        self.add_submission(result);
        Ok(())
    }

    async fn get_individual_analyses(
        &self,
        ids: &[FullSubmissionId],
    ) -> Result<BTreeMap<FullSubmissionId, IndividualAnalysis>> {
        self.check_online()?;
        let records = self.individual.read();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|record| (id.clone(), record.clone())))
            .collect())
    }

    async fn store_individual_analyses(&self, records: &[IndividualAnalysis]) -> Result<()> {
        self.check_online()?;
        self.analysis_writes.fetch_add(1, Ordering::SeqCst);

        let mut stored = self.individual.write();
        for record in records {
            stored.insert(record.full_id.clone(), record.clone());
        }

        Ok(())
    }

    async fn remove_individual_analyses(&self, ids: &[FullSubmissionId]) -> Result<()> {
        self.check_online()?;
        self.analysis_writes.fetch_add(1, Ordering::SeqCst);

        let mut stored = self.individual.write();
        for id in ids {
            stored.remove(id);
        }

        Ok(())
    }

    async fn get_pairwise_analyses(&self, keys: &[PairwiseKey]) -> Result<BTreeMap<PairwiseKey, PairwiseAnalysis>> {
        self.check_online()?;
        let records = self.pairwise.read();
        Ok(keys
            .iter()
            .filter_map(|key| records.get(key).map(|record| (key.clone(), record.clone())))
            .collect())
    }

    async fn store_pairwise_analyses(&self, records: &[PairwiseAnalysis]) -> Result<()> {
        self.check_online()?;
        self.analysis_writes.fetch_add(1, Ordering::SeqCst);

        let mut stored = self.pairwise.write();
        for record in records {
            stored.insert(record.submission_ids.clone(), record.clone());
        }

        Ok(())
    }

    async fn remove_pairwise_analyses(&self, keys: &[PairwiseKey]) -> Result<()> {
        self.check_online()?;
        self.analysis_writes.fetch_add(1, Ordering::SeqCst);

        let mut stored = self.pairwise.write();
        for key in keys {
            stored.remove(key);
        }

        Ok(())
    }
}
