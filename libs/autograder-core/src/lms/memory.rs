// In-memory LMS backend with write counters, for tests and dry tooling.
use super::{LmsAssignment, LmsBackend, LmsSubmissionComment, LmsSubmissionScore, LmsUser};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const MEMORY_LMS_AUTHOR: &str = "autograder-lms-user";

#[derive(Default)]
struct LmsState {
    assignments: BTreeMap<String, LmsAssignment>,
    users: Vec<LmsUser>,
    // assignment id -> user id -> score
    scores: BTreeMap<String, BTreeMap<String, LmsSubmissionScore>>,
    next_comment_id: u64,
}

pub struct MemoryLmsBackend {
    token: String,
    state: Mutex<LmsState>,
    score_writes: AtomicUsize,
    comment_writes: AtomicUsize,
}

impl MemoryLmsBackend {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            state: Mutex::new(LmsState::default()),
            score_writes: AtomicUsize::new(0),
            comment_writes: AtomicUsize::new(0),
        }
    }

    pub fn add_assignment(&self, assignment: LmsAssignment) {
        self.state.lock().assignments.insert(assignment.id.clone(), assignment);
    }

    pub fn add_user(&self, user: LmsUser) {
        self.state.lock().users.push(user);
    }

    /// Seed a score directly, bypassing the write counters.
    pub fn set_score(&self, assignment_id: &str, score: LmsSubmissionScore) {
        let mut state = self.state.lock();
        let mut score = score;
        for comment in &mut score.comments {
            if comment.id.is_empty() {
                state.next_comment_id += 1;
                comment.id = format!("comment-{}", state.next_comment_id);
            }
        }

        state
            .scores
            .entry(assignment_id.to_string())
            .or_default()
            .insert(score.user_id.clone(), score);
    }

    pub fn score(&self, assignment_id: &str, user_id: &str) -> Option<LmsSubmissionScore> {
        self.state
            .lock()
            .scores
            .get(assignment_id)
            .and_then(|scores| scores.get(user_id))
            .cloned()
    }

    /// Total number of write calls (scores plus comments).
    pub fn write_count(&self) -> usize {
        self.score_writes.load(Ordering::SeqCst) + self.comment_writes.load(Ordering::SeqCst)
    }

    pub fn score_writes(&self) -> usize {
        self.score_writes.load(Ordering::SeqCst)
    }

    pub fn comment_writes(&self) -> usize {
        self.comment_writes.load(Ordering::SeqCst)
    }

    fn replace_comment(state: &mut LmsState, assignment_id: &str, comment: &LmsSubmissionComment) -> Result<()> {
        let Some(scores) = state.scores.get_mut(assignment_id) else {
            bail!("No scores for LMS assignment '{}'", assignment_id);
        };

        for score in scores.values_mut() {
            if let Some(existing) = score.comments.iter_mut().find(|existing| existing.id == comment.id) {
                existing.text = comment.text.clone();
                return Ok(());
            }
        }

        bail!("Comment '{}' not found on LMS assignment '{}'", comment.id, assignment_id)
    }
}

#[async_trait]
impl LmsBackend for MemoryLmsBackend {
    fn api_token(&self) -> &str {
        &self.token
    }

    async fn fetch_assignment(&self, assignment_id: &str) -> Result<LmsAssignment> {
        match self.state.lock().assignments.get(assignment_id) {
            Some(assignment) => Ok(assignment.clone()),
            None => bail!("LMS assignment '{}' not found", assignment_id),
        }
    }

    async fn fetch_assignments(&self) -> Result<Vec<LmsAssignment>> {
        Ok(self.state.lock().assignments.values().cloned().collect())
    }

    async fn fetch_assignment_scores(&self, assignment_id: &str) -> Result<Vec<LmsSubmissionScore>> {
        Ok(self
            .state
            .lock()
            .scores
            .get(assignment_id)
            .map(|scores| scores.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_assignment_scores(&self, assignment_id: &str, scores: &[LmsSubmissionScore]) -> Result<()> {
        self.score_writes.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        let mut next_comment_id = state.next_comment_id;
        let existing_scores = state.scores.entry(assignment_id.to_string()).or_default();

        for score in scores {
            let entry = existing_scores
                .entry(score.user_id.clone())
                .or_insert_with(|| LmsSubmissionScore {
                    user_id: score.user_id.clone(),
                    ..Default::default()
                });

            entry.score = score.score;
            entry.time = score.time;

            for comment in &score.comments {
                let mut comment = comment.clone();
                if comment.id.is_empty() {
                    next_comment_id += 1;
                    comment.id = format!("comment-{}", next_comment_id);
                }
                if comment.author.is_empty() {
                    comment.author = MEMORY_LMS_AUTHOR.to_string();
                }
                entry.comments.push(comment);
            }
        }

        state.next_comment_id = next_comment_id;
        Ok(())
    }

    async fn update_comments(&self, assignment_id: &str, comments: &[LmsSubmissionComment]) -> Result<()> {
        self.comment_writes.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        for comment in comments {
            Self::replace_comment(&mut state, assignment_id, comment)?;
        }

        Ok(())
    }

    async fn update_comment(&self, assignment_id: &str, comment: &LmsSubmissionComment) -> Result<()> {
        self.comment_writes.fetch_add(1, Ordering::SeqCst);
        Self::replace_comment(&mut self.state.lock(), assignment_id, comment)
    }

    async fn fetch_user(&self, email: &str) -> Result<Option<LmsUser>> {
        Ok(self.state.lock().users.iter().find(|user| user.email == email).cloned())
    }

    async fn fetch_users(&self) -> Result<Vec<LmsUser>> {
        Ok(self.state.lock().users.clone())
    }
}
