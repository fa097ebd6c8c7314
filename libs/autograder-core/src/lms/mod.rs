/// LMS - Learning Management System Seam
///
/// **Core Responsibility:**
/// Read and write grades and submission comments on the external LMS,
/// which is the store of record for final scores and late-day ledgers.
///
/// **Rate Limiting:**
/// The LMS limits per API token, so `LmsAdapter` serializes every call made
/// with the same token. Adapters for different courses that share a token
/// share the lock. These locks live in their own `LockManager`, apart from
/// the job locks.

use crate::lockmanager::LockManager;
use anyhow::Result;
use async_trait::async_trait;
use autograder_common::types::CourseRole;
use autograder_common::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub mod memory;

pub use memory::MemoryLmsBackend;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LmsAssignment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub due_date: Option<Timestamp>,
    #[serde(default)]
    pub max_points: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LmsUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: CourseRole,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LmsSubmissionComment {
    /// Empty for a comment that does not exist yet.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub author: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LmsSubmissionScore {
    pub user_id: String,
    pub score: f64,
    #[serde(default)]
    pub time: Option<Timestamp>,
    #[serde(default)]
    pub comments: Vec<LmsSubmissionComment>,
}

#[async_trait]
pub trait LmsBackend: Send + Sync {
    fn api_token(&self) -> &str;

    async fn fetch_assignment(&self, assignment_id: &str) -> Result<LmsAssignment>;

    async fn fetch_assignments(&self) -> Result<Vec<LmsAssignment>>;

    async fn fetch_assignment_scores(&self, assignment_id: &str) -> Result<Vec<LmsSubmissionScore>>;

    /// Set scores; comments without an ID are posted as new comments.
    async fn update_assignment_scores(&self, assignment_id: &str, scores: &[LmsSubmissionScore]) -> Result<()>;

    /// Replace the text of existing comments (matched by ID).
    async fn update_comments(&self, assignment_id: &str, comments: &[LmsSubmissionComment]) -> Result<()>;

    async fn update_comment(&self, assignment_id: &str, comment: &LmsSubmissionComment) -> Result<()>;

    async fn fetch_user(&self, email: &str) -> Result<Option<LmsUser>>;

    async fn fetch_users(&self) -> Result<Vec<LmsUser>>;
}

/// Which parts of a course the sync procedures may change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LmsSyncOptions {
    pub sync_assignments: bool,
    pub sync_user_adds: bool,
    pub sync_user_removes: bool,
    pub sync_user_attributes: bool,
}

impl LmsSyncOptions {
    pub fn syncs_users(&self) -> bool {
        self.sync_user_adds || self.sync_user_removes || self.sync_user_attributes
    }
}

pub struct LmsAdapter {
    backend: Arc<dyn LmsBackend>,
    locks: Arc<LockManager>,
    lock_key: String,
    pub sync: LmsSyncOptions,
}

impl LmsAdapter {
    pub fn new(backend: Arc<dyn LmsBackend>, locks: Arc<LockManager>, sync: LmsSyncOptions) -> Self {
        let lock_key = token_lock_key(backend.api_token());
        Self {
            backend,
            locks,
            lock_key,
            sync,
        }
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub async fn fetch_assignment(&self, assignment_id: &str) -> Result<LmsAssignment> {
        let _guard = self.locks.lock_scoped(&self.lock_key).await;
        self.backend.fetch_assignment(assignment_id).await
    }

    pub async fn fetch_assignments(&self) -> Result<Vec<LmsAssignment>> {
        let _guard = self.locks.lock_scoped(&self.lock_key).await;
        self.backend.fetch_assignments().await
    }

    pub async fn fetch_assignment_scores(&self, assignment_id: &str) -> Result<Vec<LmsSubmissionScore>> {
        let _guard = self.locks.lock_scoped(&self.lock_key).await;
        self.backend.fetch_assignment_scores(assignment_id).await
    }

    pub async fn update_assignment_scores(&self, assignment_id: &str, scores: &[LmsSubmissionScore]) -> Result<()> {
        let _guard = self.locks.lock_scoped(&self.lock_key).await;
        self.backend.update_assignment_scores(assignment_id, scores).await
    }

    pub async fn update_comments(&self, assignment_id: &str, comments: &[LmsSubmissionComment]) -> Result<()> {
        let _guard = self.locks.lock_scoped(&self.lock_key).await;
        self.backend.update_comments(assignment_id, comments).await
    }

    pub async fn update_comment(&self, assignment_id: &str, comment: &LmsSubmissionComment) -> Result<()> {
        let _guard = self.locks.lock_scoped(&self.lock_key).await;
        self.backend.update_comment(assignment_id, comment).await
    }

    pub async fn fetch_user(&self, email: &str) -> Result<Option<LmsUser>> {
        let _guard = self.locks.lock_scoped(&self.lock_key).await;
        self.backend.fetch_user(email).await
    }

    pub async fn fetch_users(&self) -> Result<Vec<LmsUser>> {
        let _guard = self.locks.lock_scoped(&self.lock_key).await;
        self.backend.fetch_users().await
    }
}

// Tokens never appear in lock keys (or logs) in the clear.
fn token_lock_key(token: &str) -> String {
    format!("lms-token-{}", hex::encode(Sha256::digest(token.as_bytes())))
}
