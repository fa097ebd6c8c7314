// Per-assignment template trees, materialized once and shared by pairwise runs.
use crate::fetch::copy_file_specs;
use crate::lockmanager::LockManager;
use anyhow::{Context, Result};
use autograder_common::analysis::AssignmentAnalysisOptions;
use autograder_common::config::AutograderConfig;
use autograder_common::types::Assignment;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

struct TemplateEntry {
    options: AssignmentAnalysisOptions,
    dir: Arc<TempDir>,
}

pub struct TemplateFileStore {
    temp_root: PathBuf,
    locks: Arc<LockManager>,
    entries: Mutex<HashMap<String, TemplateEntry>>,
}

impl TemplateFileStore {
    pub fn new(config: &AutograderConfig, locks: Arc<LockManager>) -> Self {
        Self {
            temp_root: config.temp_root(),
            locks,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The template dir for `assignment`, or `None` when it declares no template files.
    /// The tree is rebuilt when the assignment's analysis options change.
    pub async fn get(&self, assignment: &Assignment) -> Result<Option<PathBuf>> {
        let Some(options) = assignment.analysis_options.as_ref() else {
            return Ok(None);
        };

        if options.template_files.is_empty() {
            return Ok(None);
        }

        let key = format!("{}::{}", assignment.course_id, assignment.id);
        if let Some(dir) = self.cached(&key, options) {
            return Ok(Some(dir));
        }

        let (_guard, _) = self.locks.lock_scoped(&format!("analysis-template-{}", key)).await;
        if let Some(dir) = self.cached(&key, options) {
            return Ok(Some(dir));
        }

        fs::create_dir_all(&self.temp_root)
            .with_context(|| format!("Failed to create temp root '{}'", self.temp_root.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("analysis-template-")
            .tempdir_in(&self.temp_root)
            .context("Failed to create template temp dir")?;

        copy_file_specs(
            Path::new(&assignment.source_dir),
            dir.path(),
            dir.path(),
            &options.template_files,
            &[],
            &options.template_file_ops,
        )
        .await
        .with_context(|| format!("Failed to copy template files for assignment '{}'", key))?;

        info!(assignment = %key, dir = %dir.path().display(), "Materialized template files");

        let path = dir.path().to_path_buf();
        self.entries.lock().insert(
            key,
            TemplateEntry {
                options: options.clone(),
                dir: Arc::new(dir),
            },
        );

        Ok(Some(path))
    }

    fn cached(&self, key: &str, options: &AssignmentAnalysisOptions) -> Option<PathBuf> {
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.options == *options)
            .map(|entry| entry.dir.path().to_path_buf())
    }

    /// Drop every cached tree (their temp dirs are removed).
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
