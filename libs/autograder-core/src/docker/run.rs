/// Container Runner - Sandboxed Tool Execution
///
/// **Core Responsibility:**
/// Run one container to completion and hand back its raw output.
/// The runner knows nothing about what the tool computes; callers
/// (grading, similarity engines) interpret stdout/stderr and output files.
///
/// **Run Rules:**
/// 1. The image is ensured first; pulls are serialized per image name
/// 2. Containers get no network and a unique sanitized name
/// 3. Output is read through the attach stream, one reader demultiplexing
///    stdout and stderr, each capped at the configured size
/// 4. `max_secs` bounds the wait; on expiry the container is killed and
///    `timeout` is set while the output read so far is kept
/// 5. The container is force-removed on every exit path
///
/// **Cancellation:**
/// A cancelled token kills the container and returns `canceled = true`.
/// It is not reported as an error.

use crate::lockmanager::LockManager;
use anyhow::{Context, Result};
use async_trait::async_trait;
use autograder_common::config::AutograderConfig;
use autograder_common::fsutil::{recursive_chmod, OPEN_DIR_MODE, OPEN_FILE_MODE};
use autograder_common::AutograderError;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, HostConfigLogConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const GRADING_INPUT_DIR: &str = "/autograder/input";
pub const GRADING_OUTPUT_DIR: &str = "/autograder/output";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountInfo {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl MountInfo {
    pub fn read_only(source: &Path, target: impl Into<String>) -> Self {
        Self {
            source: source.to_string_lossy().into_owned(),
            target: target.into(),
            read_only: true,
        }
    }

    pub fn read_write(source: &Path, target: impl Into<String>) -> Self {
        Self {
            source: source.to_string_lossy().into_owned(),
            target: target.into(),
            read_only: false,
        }
    }

    fn to_docker(&self) -> Mount {
        Mount {
            source: Some(self.source.clone()),
            target: Some(self.target.clone()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(self.read_only),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub image: String,
    pub mounts: Vec<MountInfo>,
    /// Empty means the image's own CMD.
    pub args: Vec<String>,
    /// Prefix for the container name.
    pub base_name: String,
    /// Zero disables the deadline.
    pub max_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub timeout: bool,
    pub canceled: bool,
    pub exit_code: Option<i64>,
    pub run_time_ms: i64,
}

impl RunOutput {
    pub fn succeeded(&self) -> bool {
        !self.timeout && !self.canceled && self.exit_code == Some(0)
    }

    /// Turn an unsuccessful run into the matching error; `tool` names the container in messages.
    pub fn check(self, tool: &str, max_secs: u64) -> Result<Self> {
        if self.canceled {
            return Err(AutograderError::Cancelled.into());
        }

        if self.timeout {
            return Err(AutograderError::Timeout { secs: max_secs }.into());
        }

        if self.exit_code != Some(0) {
            return Err(AutograderError::tool(
                format!("{} container exited with {:?}", tool, self.exit_code),
                self.stdout,
                self.stderr,
            )
            .into());
        }

        Ok(self)
    }
}

/// Anything that can run a container. `DockerRunner` is the real one;
/// tests substitute runners that fake a tool's output files.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    async fn ensure_image(&self, image: &str) -> Result<()>;

    async fn run_container(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunOutput>;

    /// Run a grading image with its input mounted read-only and output read-write.
    async fn run_grading_container(
        &self,
        image: &str,
        input_dir: &Path,
        output_dir: &Path,
        base_name: &str,
        max_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        // The container user rarely matches ours.
        for dir in [input_dir, output_dir] {
            recursive_chmod(dir, OPEN_FILE_MODE, OPEN_DIR_MODE)
                .with_context(|| format!("Failed to open permissions on '{}'", dir.display()))?;
        }

        let request = RunRequest {
            image: image.to_string(),
            mounts: vec![
                MountInfo::read_only(input_dir, GRADING_INPUT_DIR),
                MountInfo::read_write(output_dir, GRADING_OUTPUT_DIR),
            ],
            args: Vec::new(),
            base_name: base_name.to_string(),
            max_secs,
        };

        self.run_container(&request, cancel).await
    }
}

/// Container cleanup guard - force-removes the container on drop.
/// `release` removes it inline so the happy path returns with the container gone.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    released: bool,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        remove_container(&self.docker, &self.container_id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.container_id, "No runtime to remove container");
            return;
        };

        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        handle.spawn(async move {
            remove_container(&docker, &container_id).await;
        });
    }
}

async fn remove_container(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    if let Err(err) = docker.remove_container(container_id, Some(options)).await {
        warn!(container_id = %container_id, error = %err, "Failed to remove container");
    }
}

enum WaitOutcome {
    Exited(Option<i64>),
    TimedOut,
    Canceled,
}

pub struct DockerRunner {
    docker: Docker,
    locks: Arc<LockManager>,
    max_output_bytes: usize,
    extra_init_secs: u64,
}

impl DockerRunner {
    pub fn new(docker: Docker, locks: Arc<LockManager>, config: &AutograderConfig) -> Self {
        Self {
            docker,
            locks,
            max_output_bytes: config.docker_max_output_bytes(),
            extra_init_secs: config.docker_extra_init_secs,
        }
    }

    pub fn connect(locks: Arc<LockManager>, config: &AutograderConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self::new(docker, locks, config))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    async fn kill(&self, container_id: &str) {
        if let Err(err) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id = %container_id, error = %err, "Failed to kill container");
        }
    }

    async fn wait_for_exit(&self, container_id: &str) -> Option<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(container_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Some(response.status_code),
            // Non-zero exits arrive as this error variant.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
            Some(Err(err)) => {
                warn!(container_id = %container_id, error = %err, "Failed to wait on container");
                None
            }
            None => {
                warn!(container_id = %container_id, "No wait response from container");
                None
            }
        }
    }

    async fn wait_with_deadline(&self, container_id: &str, max_secs: u64, cancel: &CancellationToken) -> WaitOutcome {
        let deadline = async {
            if max_secs > 0 {
                tokio::time::sleep(Duration::from_secs(max_secs)).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            code = self.wait_for_exit(container_id) => WaitOutcome::Exited(code),
            _ = deadline => {
                info!(container_id = %container_id, max_secs, "Container timed out, killing it");
                self.kill(container_id).await;
                WaitOutcome::TimedOut
            }
            _ = cancel.cancelled() => {
                info!(container_id = %container_id, "Container run cancelled, killing it");
                self.kill(container_id).await;
                WaitOutcome::Canceled
            }
        }
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    /// Image cache check; on a miss the pull runs under the image's lock key.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        let _guard = self.locks.lock_scoped(&image_lock_key(image)).await;

        // Another task may have pulled it while we waited.
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.with_context(|| format!("Failed to pull Docker image '{}'", image))?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    #[tracing::instrument(skip(self, request, cancel), fields(image = %request.image, base_name = %request.base_name))]
    async fn run_container(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunOutput> {
        self.ensure_image(&request.image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", request.image))?;

        let name = clean_container_name(&format!("{}-{}", request.base_name, Uuid::new_v4()));

        let config = Config {
            image: Some(request.image.clone()),
            cmd: if request.args.is_empty() { None } else { Some(request.args.clone()) },
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                mounts: Some(request.mounts.iter().map(MountInfo::to_docker).collect()),
                // Output comes through the attach stream.
                log_config: Some(HostConfigLogConfig {
                    typ: Some("none".to_string()),
                    config: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;

        let container_id = container.id.clone();
        let guard = ContainerGuard::new(&self.docker, container_id.clone());

        let attach_options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };

        let mut attached = self
            .docker
            .attach_container(&container_id, Some(attach_options))
            .await
            .context("Failed to attach to Docker container")?;

        let start = Instant::now();

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let mut stdout = CappedOutput::new(self.max_output_bytes);
        let mut stderr = CappedOutput::new(self.max_output_bytes);

        let collect = async {
            while let Some(chunk) = attached.output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => {}
                    Err(err) => {
                        warn!(container_id = %container_id, error = %err, "Error reading container output");
                        break;
                    }
                }
            }
        };

        let wait = self.wait_with_deadline(&container_id, request.max_secs, cancel);

        let outcome = if request.max_secs > 0 {
            // The outer deadline leaves room for start-up and the final output flush.
            let outer = Duration::from_secs(request.max_secs + self.extra_init_secs);
            match tokio::time::timeout(outer, async { tokio::join!(collect, wait).1 }).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(container_id = %container_id, "Container missed its outer deadline");
                    self.kill(&container_id).await;
                    WaitOutcome::TimedOut
                }
            }
        } else {
            tokio::join!(collect, wait).1
        };

        let run_time_ms = start.elapsed().as_millis() as i64;
        guard.release().await;

        let mut output = RunOutput {
            stdout: stdout.finish(),
            stderr: stderr.finish(),
            run_time_ms,
            ..Default::default()
        };

        match outcome {
            WaitOutcome::Exited(code) => {
                debug!(container_id = %container_id, exit_code = ?code, run_time_ms, "Container exited");
                output.exit_code = code;
            }
            WaitOutcome::TimedOut => output.timeout = true,
            WaitOutcome::Canceled => output.canceled = true,
        }

        Ok(output)
    }
}

pub(crate) fn image_lock_key(image: &str) -> String {
    format!("docker-image-{}", image)
}

/// Keep `[A-Za-z0-9_.-]` and make sure the name starts alphanumeric.
pub fn clean_container_name(text: &str) -> String {
    let mut name: String = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();

    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        name.insert(0, 'a');
    }

    name
}

/// One captured stream, cut off at `limit` bytes.
struct CappedOutput {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedOutput {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }

        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    fn finish(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(&format!(
                "\n\nOutput exceeds maximum size ({} KB), output has been truncated.",
                self.limit / 1024
            ));
        }

        text
    }
}
