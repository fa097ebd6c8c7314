// Dolos (https://dolos.ugent.be) through its CLI image.
use super::common::{file_name, language_for, read_score_csv, stage_file, ContainerTool, ToolLanguage};
use super::SimilarityEngine;
use crate::docker::{ContainerRunner, MountInfo, RunRequest};
use crate::lockmanager::LockManager;
use anyhow::{Context, Result};
use async_trait::async_trait;
use autograder_common::analysis::FileSimilarity;
use autograder_common::config::AutograderConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DOLOS_ENGINE_NAME: &str = "dolos";
pub const DOLOS_VERSION: &str = "2.9.0";
const DOLOS_IMAGE: &str = "ghcr.io/dodona-edu/dolos-cli";
const DOLOS_MAX_SECS: u64 = 2 * 60;

const MOUNT_DIR: &str = "/dolos";
const OUT_DIRNAME: &str = "out";
const OUT_FILENAME: &str = "pairs.csv";

// pairs.csv: id, left id, left path, right id, right path, similarity, ...
const OUT_COLS: usize = 10;
const SCORE_COLUMN: usize = 5;

const LANGUAGES: &[(&str, &str)] = &[
    ("c", "c"),
    ("h", "c"),
    ("cc", "cpp"),
    ("cpp", "cpp"),
    ("cxx", "cpp"),
    ("hpp", "cpp"),
    ("cs", "csharp"),
    ("go", "go"),
    ("java", "java"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("php", "php"),
    ("py", "python"),
    ("r", "r"),
    ("rs", "rust"),
    ("scala", "scala"),
    ("sh", "bash"),
    ("sql", "sql"),
    ("ts", "typescript"),
    ("tsx", "tsx"),
    ("v", "verilog"),
];

const FALLBACK_LANGUAGE: ToolLanguage = ToolLanguage {
    name: "char",
    extension: "txt",
};

pub struct DolosEngine {
    tool: ContainerTool,
}

impl DolosEngine {
    pub fn new(runner: Option<Arc<dyn ContainerRunner>>, locks: Arc<LockManager>, config: &AutograderConfig) -> Self {
        Self {
            tool: ContainerTool::new(
                DOLOS_ENGINE_NAME,
                DOLOS_VERSION,
                DOLOS_IMAGE,
                DOLOS_MAX_SECS,
                runner,
                locks,
                config,
            ),
        }
    }
}

fn dolos_args(language: &str, filenames: &[String; 2], template: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--output-format".to_string(),
        "csv".to_string(),
        "--language".to_string(),
        language.to_string(),
        "--output-destination".to_string(),
        format!("{}/{}", MOUNT_DIR, OUT_DIRNAME),
    ];

    if let Some(template) = template {
        args.push("--ignore".to_string());
        args.push(format!("{}/{}", MOUNT_DIR, template));
    }

    args.extend(filenames.iter().map(|name| format!("{}/{}", MOUNT_DIR, name)));
    args
}

#[async_trait]
impl SimilarityEngine for DolosEngine {
    fn name(&self) -> &str {
        DOLOS_ENGINE_NAME
    }

    fn version(&self) -> &str {
        DOLOS_VERSION
    }

    async fn is_available(&self) -> bool {
        self.tool.is_available()
    }

    #[tracing::instrument(skip_all, fields(engine = DOLOS_ENGINE_NAME, file = %paths[0].display()))]
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

        let filenames = [
            stage_file(paths[0], temp_dir.path(), 0, language.extension)?,
            stage_file(paths[1], temp_dir.path(), 1, language.extension)?,
        ];

        let template_name = match template {
            Some(path) => {
                let name = format!("template.{}", language.extension);
                std::fs::copy(path, temp_dir.path().join(&name)).context("Failed to stage template file")?;
                Some(name)
            }
            None => None,
        };

        let request = RunRequest {
            image: self.tool.image.clone(),
            mounts: vec![MountInfo::read_write(temp_dir.path(), MOUNT_DIR)],
            args: dolos_args(language.name, &filenames, template_name.as_deref()),
            base_name: DOLOS_ENGINE_NAME.to_string(),
            max_secs: self.tool.max_secs,
        };

        self.tool.run(temp_dir.path(), request, cancel).await?;

        let out_path = temp_dir.path().join(OUT_DIRNAME).join(OUT_FILENAME);
        let score = read_score_csv(&out_path, "Dolos", 1, OUT_COLS, SCORE_COLUMN)?;
        let run_time = start.elapsed().as_millis() as i64;

        debug!(score, run_time, language = language.name, "Dolos similarity computed");

        let similarity = FileSimilarity {
            filename: file_name(paths[0]),
            tool: DOLOS_ENGINE_NAME.to_string(),
            version: DOLOS_VERSION.to_string(),
            score,
            ..Default::default()
        };

        Ok((similarity, run_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::fake::ScriptedRunner;
    use std::fs;
    use tempfile::TempDir;

    const PAIRS_CSV: &str = "id,leftFileId,leftFilePath,rightFileId,rightFilePath,similarity,longestFragment,totalOverlap,leftCovered,rightCovered\n\
        0,0,\"/dolos/0.py\",1,\"/dolos/1.py\",0.42,10,20,15,15\n";

    fn engine(runner: Arc<ScriptedRunner>) -> DolosEngine {
        DolosEngine::new(Some(runner), Arc::new(LockManager::new()), &AutograderConfig::default())
    }

    #[test]
    fn test_dolos_args() {
        let filenames = ["0.py".to_string(), "1.py".to_string()];
        let args = dolos_args("python", &filenames, Some("template.py"));

        assert_eq!(args[0], "run");
        assert!(args.windows(2).any(|pair| pair == ["--language", "python"]));
        assert!(args.windows(2).any(|pair| pair == ["--ignore", "/dolos/template.py"]));
        assert_eq!(&args[args.len() - 2..], ["/dolos/0.py", "/dolos/1.py"]);
    }

    #[tokio::test]
    async fn test_compute_file_similarity() {
        let inputs = TempDir::new().unwrap();
        let a = inputs.path().join("a").join("submission.py");
        let b = inputs.path().join("b").join("submission.py");
        for path in [&a, &b] {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "print('hello')\n").unwrap();
        }

        let runner = Arc::new(ScriptedRunner::writing(&format!("{}/{}", OUT_DIRNAME, OUT_FILENAME), PAIRS_CSV));
        let engine = engine(runner.clone());

        let (similarity, _) = engine
            .compute_file_similarity([&a, &b], None, "course101", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(similarity.filename, "submission.py");
        assert_eq!(similarity.tool, DOLOS_ENGINE_NAME);
        assert_eq!(similarity.version, DOLOS_VERSION);
        assert_eq!(similarity.score, 0.42);

        let request = runner.last_request().unwrap();
        assert_eq!(request.image, "ghcr.io/dodona-edu/dolos-cli:2.9.0");
        assert_eq!(request.mounts[0].target, MOUNT_DIR);
        assert_eq!(runner.ensured_images(), vec![request.image.clone()]);
    }

    #[tokio::test]
    async fn test_bad_output_shape() {
        let inputs = TempDir::new().unwrap();
        let path = inputs.path().join("x.py");
        fs::write(&path, "x = 1\n").unwrap();

        let runner = Arc::new(ScriptedRunner::writing("out/pairs.csv", "header\n1,2,3\n"));
        let err = engine(runner)
            .compute_file_similarity([&path, &path], None, "course101", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Expected (1 x 10)"));
    }
}
