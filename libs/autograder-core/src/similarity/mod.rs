/// Similarity Engines - Pluggable Code Similarity Tools
///
/// **Core Responsibility:**
/// Score how similar two source files are. Each engine wraps one external
/// tool and reports a `FileSimilarity` plus the wall time it spent.
///
/// **Built-in Engines:**
/// - `dolos`: Dolos CLI in a container
/// - `jplag`: JPlag in a container
/// - `fake`: deterministic scores for tests and dry tooling
///
/// **Contract:**
/// - `is_available` is cheap and may be called before every batch
/// - `compute_file_similarity` reports `filename` as the basename of the first path;
///   callers overwrite it with the relative path they matched on
/// - Runs for the same engine and lock base are serialized
/// - Cancellation surfaces as `AutograderError::Cancelled`

use crate::docker::ContainerRunner;
use crate::lockmanager::LockManager;
use anyhow::Result;
use async_trait::async_trait;
use autograder_common::analysis::FileSimilarity;
use autograder_common::config::AutograderConfig;
use autograder_common::AutograderError;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod common;
pub mod dolos;
pub mod fake;
pub mod jplag;

pub use dolos::DolosEngine;
pub use fake::FakeEngine;
pub use jplag::JPlagEngine;

#[async_trait]
pub trait SimilarityEngine: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    async fn is_available(&self) -> bool;

    /// Compare `paths[0]` against `paths[1]`. `template` is boilerplate both
    /// files started from; engines that support it discount matches against it.
    /// `lock_base` scopes the engine's run lock (usually a course ID).
    async fn compute_file_similarity(
        &self,
        paths: [&Path; 2],
        template: Option<&Path>,
        lock_base: &str,
        cancel: &CancellationToken,
    ) -> Result<(FileSimilarity, i64)>;
}

pub type EngineList = Vec<Arc<dyn SimilarityEngine>>;

/// The container-backed engines. Without a runner they report unavailable.
pub fn default_engines(
    runner: Option<Arc<dyn ContainerRunner>>,
    locks: Arc<LockManager>,
    config: &AutograderConfig,
) -> EngineList {
    vec![
        Arc::new(DolosEngine::new(runner.clone(), locks.clone(), config)),
        Arc::new(JPlagEngine::new(runner, locks, config)),
    ]
}

/// Engines that can run right now. Having none is an error.
pub async fn available_engines(engines: &[Arc<dyn SimilarityEngine>]) -> Result<EngineList> {
    let mut available = Vec::with_capacity(engines.len());
    for engine in engines {
        if engine.is_available().await {
            available.push(engine.clone());
        }
    }

    if available.is_empty() {
        return Err(AutograderError::not_found("No similarity engines are currently available").into());
    }

    Ok(available)
}

pub fn find_engine(engines: &[Arc<dyn SimilarityEngine>], name: &str) -> Option<Arc<dyn SimilarityEngine>> {
    engines.iter().find(|engine| engine.name() == name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_available_engines() {
        let config = AutograderConfig::default();
        let locks = Arc::new(LockManager::new());

        // No runner, so the container engines are unavailable.
        let engines = default_engines(None, locks, &config);
        let Err(err) = available_engines(&engines).await else {
            panic!("expected no available engines");
        };
        assert!(autograder_common::error::is_not_found_error(&err));

        let mut engines = engines;
        engines.push(Arc::new(FakeEngine::new()));
        let available = available_engines(&engines).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name(), fake::FAKE_ENGINE_NAME);
    }

    #[test]
    fn test_find_engine() {
        let engines: EngineList = vec![Arc::new(FakeEngine::new())];
        assert!(find_engine(&engines, "fake").is_some());
        assert!(find_engine(&engines, "dolos").is_none());
    }
}
