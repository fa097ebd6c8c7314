// Plumbing shared by the container-backed similarity engines.
use crate::docker::{ContainerRunner, RunOutput, RunRequest};
use crate::lockmanager::{KeyGuard, LockManager};
use anyhow::{Context, Result};
use autograder_common::config::AutograderConfig;
use autograder_common::fsutil::{recursive_chmod, OPEN_DIR_MODE, OPEN_FILE_MODE};
use autograder_common::AutograderError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A language as a tool understands it, plus the extension staged files get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolLanguage {
    pub name: &'static str,
    pub extension: &'static str,
}

/// Pick a language by lowercase extension. Unknown extensions get `fallback`,
/// and staged files are renamed to the fallback's extension.
pub fn language_for(path: &Path, table: &[(&'static str, &'static str)], fallback: ToolLanguage) -> ToolLanguage {
    let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
        return fallback;
    };

    let extension = extension.to_lowercase();
    table
        .iter()
        .find(|(known, _)| *known == extension)
        .map(|&(extension, name)| ToolLanguage { name, extension })
        .unwrap_or(fallback)
}

/// Read a header-prefixed CSV and pull one float out of its single data row.
pub fn read_score_csv(path: &Path, tool: &str, rows: usize, cols: usize, score_column: usize) -> Result<f64> {
    if !path.is_file() {
        return Err(AutograderError::tool(
            format!("{} output file does not exist: '{}'", tool, path.display()),
            "",
            "",
        )
        .into());
    }

    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {} output file", tool))?;
    let records: Vec<Vec<String>> = text
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(split_csv_line)
        .collect();

    let found_cols = records.first().map(Vec::len).unwrap_or(0);
    if records.len() != rows || found_cols != cols {
        return Err(AutograderError::tool(
            format!(
                "Shape of {} output is not correct. Expected ({} x {}), found ({} x {})",
                tool,
                rows,
                cols,
                records.len(),
                found_cols
            ),
            text,
            "",
        )
        .into());
    }

    let raw = &records[0][score_column];
    raw.parse::<f64>().map_err(|err| {
        AutograderError::tool(
            format!("Failed to parse {} similarity value '{}' to a float: {}", tool, raw, err),
            text.clone(),
            "",
        )
        .into()
    })
}

// Fields never contain commas here (staged names are numeric), only optional quotes.
fn split_csv_line(line: &str) -> Vec<String> {
    line.split(',')
        .map(|field| field.trim().trim_matches('"').to_string())
        .collect()
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Copy `source` to `dir/<index>.<ext>` and return the new filename.
pub fn stage_file(source: &Path, dir: &Path, index: usize, extension: &str) -> Result<String> {
    let filename = format!("{}.{}", index, extension);
    fs::copy(source, dir.join(&filename))
        .with_context(|| format!("Failed to stage '{}' for similarity", source.display()))?;

    Ok(filename)
}

/// State every container engine carries: where to run, how to lock, where to stage.
pub struct ContainerTool {
    pub name: &'static str,
    pub version: &'static str,
    pub image: String,
    pub max_secs: u64,
    runner: Option<Arc<dyn ContainerRunner>>,
    locks: Arc<LockManager>,
    temp_root: PathBuf,
    image_ready: AtomicBool,
}

impl ContainerTool {
    pub fn new(
        name: &'static str,
        version: &'static str,
        image: &str,
        max_secs: u64,
        runner: Option<Arc<dyn ContainerRunner>>,
        locks: Arc<LockManager>,
        config: &AutograderConfig,
    ) -> Self {
        Self {
            name,
            version,
            image: format!("{}:{}", image, version),
            max_secs,
            runner,
            locks,
            temp_root: config.temp_root(),
            image_ready: AtomicBool::new(false),
        }
    }

    pub fn is_available(&self) -> bool {
        self.runner.is_some()
    }

    fn runner(&self) -> Result<&Arc<dyn ContainerRunner>> {
        self.runner
            .as_ref()
            .ok_or_else(|| AutograderError::not_found(format!("Similarity engine '{}' needs containers", self.name)).into())
    }

    /// Pull the image once per process. Concurrent callers wait on the engine's image lock.
    pub async fn ensure_image(&self) -> Result<()> {
        if self.image_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let (_guard, _) = self.locks.lock_scoped(&format!("similarity-image-{}", self.name)).await;
        if self.image_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        self.runner()?
            .ensure_image(&self.image)
            .await
            .with_context(|| format!("Failed to ensure {} docker image exists", self.name))?;

        self.image_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Take the engine's run lock for `lock_base`, giving up if cancelled while waiting.
    pub async fn lock_run(&self, lock_base: &str, cancel: &CancellationToken) -> Result<KeyGuard> {
        let key = format!("{}-{}", self.name, lock_base);
        tokio::select! {
            _ = cancel.cancelled() => Err(AutograderError::Cancelled.into()),
            (guard, _) = self.locks.lock_scoped(&key) => Ok(guard),
        }
    }

    pub fn temp_dir(&self) -> Result<TempDir> {
        fs::create_dir_all(&self.temp_root)
            .with_context(|| format!("Failed to create temp root '{}'", self.temp_root.display()))?;

        tempfile::Builder::new()
            .prefix(&format!("{}-", self.name))
            .tempdir_in(&self.temp_root)
            .context("Failed to create temp dir")
    }

    /// Open up the staged tree and run the tool. Unsuccessful runs become errors.
    pub async fn run(&self, staged: &Path, request: RunRequest, cancel: &CancellationToken) -> Result<RunOutput> {
        // The tool's container user will not match ours.
        recursive_chmod(staged, OPEN_FILE_MODE, OPEN_DIR_MODE)
            .context("Failed to set recursive permissions for temp dir")?;

        let output = self
            .runner()?
            .run_container(&request, cancel)
            .await
            .with_context(|| format!("Failed to run {} container", self.name))?;

        if !output.succeeded() {
            debug!(
                engine = self.name,
                stdout = %output.stdout,
                stderr = %output.stderr,
                "Similarity container failed"
            );
        }

        output.check(self.name, self.max_secs)
    }
}
