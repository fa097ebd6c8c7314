// JPlag (https://github.com/jplag/JPlag) through a CSV-exporting image.
use super::common::{file_name, language_for, read_score_csv, stage_file, ContainerTool, ToolLanguage};
use super::SimilarityEngine;
use crate::docker::{ContainerRunner, MountInfo, RunRequest};
use crate::lockmanager::LockManager;
use anyhow::{Context, Result};
use async_trait::async_trait;
use autograder_common::analysis::FileSimilarity;
use autograder_common::config::AutograderConfig;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const JPLAG_ENGINE_NAME: &str = "jplag";
pub const JPLAG_VERSION: &str = "5.1.0.2";
const JPLAG_IMAGE: &str = "ghcr.io/edulinq/jplag-docker";
const JPLAG_MAX_SECS: u64 = 2 * 60;

pub const DEFAULT_MIN_TOKENS: u32 = 12;

const MOUNT_DIR: &str = "/jplag";
const SRC_DIRNAME: &str = "src";
const TEMPLATE_DIRNAME: &str = "template";
const OUT_DIRNAME: &str = "out";
const OUT_FILENAME: &str = "results.csv";

// results.csv: first submission, second submission, similarity, max similarity
const OUT_COLS: usize = 4;
const SCORE_COLUMN: usize = 2;

const LANGUAGES: &[(&str, &str)] = &[
    ("c", "c"),
    ("h", "c"),
    ("cc", "cpp"),
    ("cpp", "cpp"),
    ("cxx", "cpp"),
    ("hpp", "cpp"),
    ("cs", "csharp"),
    ("go", "golang"),
    ("java", "java"),
    ("js", "javascript"),
    ("kt", "kotlin"),
    ("py", "python3"),
    ("r", "rlang"),
    ("rs", "rust"),
    ("scala", "scala"),
    ("scm", "scheme"),
    ("swift", "swift"),
    ("ts", "typescript"),
];

const FALLBACK_LANGUAGE: ToolLanguage = ToolLanguage {
    name: "text",
    extension: "txt",
};

pub struct JPlagEngine {
    tool: ContainerTool,
    min_tokens: u32,
}

impl JPlagEngine {
    pub fn new(runner: Option<Arc<dyn ContainerRunner>>, locks: Arc<LockManager>, config: &AutograderConfig) -> Self {
        Self {
            tool: ContainerTool::new(
                JPLAG_ENGINE_NAME,
                JPLAG_VERSION,
                JPLAG_IMAGE,
                JPLAG_MAX_SECS,
                runner,
                locks,
                config,
            ),
            min_tokens: DEFAULT_MIN_TOKENS,
        }
    }

    pub fn with_min_tokens(mut self, min_tokens: u32) -> Self {
        self.min_tokens = min_tokens;
        self
    }

    fn args(&self, language: &str, with_template: bool) -> Vec<String> {
        let mut args = vec![
            "--mode".to_string(),
            "RUN".to_string(),
            "--csv-export".to_string(),
            "--language".to_string(),
            language.to_string(),
            "--min-tokens".to_string(),
            self.min_tokens.to_string(),
        ];

        if with_template {
            args.push("--base-code".to_string());
            args.push(format!("{}/{}", MOUNT_DIR, TEMPLATE_DIRNAME));
        }

        args.push(format!("{}/{}", MOUNT_DIR, SRC_DIRNAME));
        args
    }
}

#[async_trait]
impl SimilarityEngine for JPlagEngine {
    fn name(&self) -> &str {
        JPLAG_ENGINE_NAME
    }

    fn version(&self) -> &str {
        JPLAG_VERSION
    }

    async fn is_available(&self) -> bool {
        self.tool.is_available()
    }

    #[tracing::instrument(skip_all, fields(engine = JPLAG_ENGINE_NAME, file = %paths[0].display()))]
    async fn compute_file_similarity(
        &self,
        paths: [&Path; 2],
        template: Option<&Path>,
        lock_base: &str,
        cancel: &CancellationToken,
    ) -> Result<(FileSimilarity, i64)> {
        let _guard = self.tool.lock_run(lock_base, cancel).await?;
        self.tool.ensure_image().await?;

        let start = Instant::now();
        let temp_dir = self.tool.temp_dir()?;
        let language = language_for(paths[0], LANGUAGES, FALLBACK_LANGUAGE);

        let src_dir = temp_dir.path().join(SRC_DIRNAME);
        fs::create_dir_all(&src_dir).context("Failed to create temp src dir")?;
        for (index, path) in paths.iter().enumerate() {
            stage_file(path, &src_dir, index, language.extension)?;
        }

        if let Some(path) = template {
            let template_dir = temp_dir.path().join(TEMPLATE_DIRNAME);
            fs::create_dir_all(&template_dir).context("Failed to create temp template dir")?;
            stage_file(path, &template_dir, 0, language.extension)?;
        }

        let request = RunRequest {
            image: self.tool.image.clone(),
            mounts: vec![MountInfo::read_write(temp_dir.path(), MOUNT_DIR)],
            args: self.args(language.name, template.is_some()),
            base_name: JPLAG_ENGINE_NAME.to_string(),
            max_secs: self.tool.max_secs,
        };

        self.tool.run(temp_dir.path(), request, cancel).await?;

        let out_path = temp_dir.path().join(OUT_DIRNAME).join(OUT_FILENAME);
        let score = read_score_csv(&out_path, "JPlag", 1, OUT_COLS, SCORE_COLUMN)?;
        let run_time = start.elapsed().as_millis() as i64;

        debug!(score, run_time, language = language.name, "JPlag similarity computed");

        let mut similarity = FileSimilarity {
            filename: file_name(paths[0]),
            tool: JPLAG_ENGINE_NAME.to_string(),
            version: JPLAG_VERSION.to_string(),
            score,
            ..Default::default()
        };
        similarity.options.insert("min-tokens".to_string(), json!(self.min_tokens));

        Ok((similarity, run_time))
    }
}
