// Deterministic engine for tests and for exercising the pipeline without containers.
use super::common::file_name;
use super::SimilarityEngine;
use anyhow::{bail, Result};
use async_trait::async_trait;
use autograder_common::analysis::FileSimilarity;
use autograder_common::AutograderError;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub const FAKE_ENGINE_NAME: &str = "fake";
pub const FAKE_ENGINE_VERSION: &str = "0.0.1";
pub const FAKE_SCORE: f64 = 0.13;

pub struct FakeEngine {
    name: String,
    score: f64,
    fail: bool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            name: FAKE_ENGINE_NAME.to_string(),
            score: FAKE_SCORE,
            fail: false,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    /// An engine that errors on every file.
    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            score: 0.0,
            fail: true,
        }
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SimilarityEngine for FakeEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        FAKE_ENGINE_VERSION
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn compute_file_similarity(
        &self,
        paths: [&Path; 2],
        _template: Option<&Path>,
        _lock_base: &str,
        cancel: &CancellationToken,
    ) -> Result<(FileSimilarity, i64)> {
        if cancel.is_cancelled() {
            return Err(AutograderError::Cancelled.into());
        }

        if self.fail {
            bail!("Engine '{}' failed on purpose", self.name);
        }

        let similarity = FileSimilarity {
            filename: file_name(paths[0]),
            tool: self.name.clone(),
            version: FAKE_ENGINE_VERSION.to_string(),
            score: self.score,
            ..Default::default()
        };

        Ok((similarity, 0))
    }
}

#[cfg(test)]
pub(crate) use scripted::ScriptedRunner;
