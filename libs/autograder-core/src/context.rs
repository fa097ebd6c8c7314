/// Runtime - Process-Wide Services
///
/// **Core Responsibility:**
/// Own the long-lived pieces every operation needs (config, lock managers,
/// container runner, store, similarity engines, template cache) and hand
/// them out explicitly. Nothing in the core reaches for a global.
///
/// **Lifecycle:**
/// 1. `Runtime::init` connects to Docker (unless disabled) and starts the lock sweeper
/// 2. Operations take `&Arc<Runtime>` and clone what their tasks need
/// 3. `Runtime::shutdown` stops the sweeper and drops cached template trees

use crate::analysis::template::TemplateFileStore;
use crate::docker::{ContainerRunner, DockerRunner};
use crate::lockmanager::LockManager;
use crate::similarity::{default_engines, EngineList};
use crate::store::Store;
use anyhow::{Context, Result};
use autograder_common::config::AutograderConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Runtime {
    pub config: AutograderConfig,

    /// Job, analysis, image, and engine locks.
    pub locks: Arc<LockManager>,

    /// LMS token locks; a separate domain from the job locks.
    pub lms_locks: Arc<LockManager>,

    pub docker: Option<Arc<DockerRunner>>,
    pub store: Arc<dyn Store>,
    pub engines: EngineList,
    pub templates: Arc<TemplateFileStore>,

    sweeper_cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Build the runtime with the container-backed engines.
    /// Must be called inside a tokio runtime (the lock sweeper is spawned here).
    pub fn init(config: AutograderConfig, store: Arc<dyn Store>) -> Result<Arc<Self>> {
        config.validate().context("Invalid autograder config")?;

        let locks = Arc::new(LockManager::new());

        let docker = if config.docker_disable {
            info!("Docker is disabled, container features will use fallbacks");
            None
        } else {
            match DockerRunner::connect(locks.clone(), &config) {
                Ok(runner) => Some(Arc::new(runner)),
                Err(err) => {
                    warn!(error = %err, "Could not connect to Docker, container features will use fallbacks");
                    None
                }
            }
        };

        let runner = docker.clone().map(|runner| runner as Arc<dyn ContainerRunner>);
        let engines = default_engines(runner, locks.clone(), &config);

        Ok(Self::assemble(config, locks, docker, store, engines))
    }

    /// A runtime without Docker, using exactly `engines`.
    pub fn with_engines(config: AutograderConfig, store: Arc<dyn Store>, engines: EngineList) -> Arc<Self> {
        Self::assemble(config, Arc::new(LockManager::new()), None, store, engines)
    }

    fn assemble(
        config: AutograderConfig,
        locks: Arc<LockManager>,
        docker: Option<Arc<DockerRunner>>,
        store: Arc<dyn Store>,
        engines: EngineList,
    ) -> Arc<Self> {
        let sweeper_cancel = CancellationToken::new();
        let sweeper = locks.spawn_sweeper(
            Duration::from_secs(config.lock_sweep_interval_secs),
            Duration::from_secs(config.lock_stale_secs),
            sweeper_cancel.clone(),
        );

        let templates = Arc::new(TemplateFileStore::new(&config, locks.clone()));

        Arc::new(Self {
            config,
            locks,
            lms_locks: Arc::new(LockManager::new()),
            docker,
            store,
            engines,
            templates,
            sweeper_cancel,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn container_runner(&self) -> Option<Arc<dyn ContainerRunner>> {
        self.docker.clone().map(|runner| runner as Arc<dyn ContainerRunner>)
    }

    pub async fn shutdown(&self) {
        self.sweeper_cancel.cancel();

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(err) = sweeper.await {
                warn!(error = %err, "Lock sweeper ended abnormally");
            }
        }

        self.templates.clear();
        info!("Runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.sweeper_cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::FakeEngine;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_shutdown_stops_sweeper() {
        let runtime = Runtime::with_engines(
            AutograderConfig::default(),
            Arc::new(MemoryStore::new()),
            vec![Arc::new(FakeEngine::new())],
        );

        assert!(runtime.container_runner().is_none());
        assert_eq!(runtime.engines.len(), 1);

        runtime.shutdown().await;
        assert!(runtime.sweeper.lock().is_none());

        // A second shutdown is a no-op.
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_init_without_docker() {
        let config = AutograderConfig {
            docker_disable: true,
            ..Default::default()
        };

        let runtime = Runtime::init(config, Arc::new(MemoryStore::new())).unwrap();
        assert!(runtime.docker.is_none());

        // The container engines exist but cannot run.
        assert_eq!(runtime.engines.len(), 2);
        assert!(crate::similarity::available_engines(&runtime.engines).await.is_err());

        runtime.shutdown().await;
    }
}
