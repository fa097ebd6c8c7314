// CLI commands: thin wrappers over the core's container, image, and similarity APIs
use anyhow::{bail, Context, Result};
use autograder_common::config::AutograderConfig;
use autograder_core::docker::{build_image_from_source, write_docker_context, ContainerRunner, DockerRunner, ImageInfo, MountInfo, RunRequest};
use autograder_core::lockmanager::LockManager;
use autograder_core::similarity::{default_engines, find_engine, EngineList, FakeEngine};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const IMAGE_BUILD_CACHE_FILENAME: &str = ".image-build-cache.json";

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct RunReport {
    exit_code: Option<i64>,
    timeout: bool,
    canceled: bool,
    run_time_ms: i64,
    stdout: String,
    stderr: String,
}

/// Parse `SOURCE:TARGET` or `SOURCE:TARGET:ro`. The source is made absolute.
fn parse_mount(text: &str) -> Result<MountInfo> {
    let parts: Vec<&str> = text.split(':').collect();
    let (source, target, read_only) = match parts.as_slice() {
        [source, target] => (*source, *target, false),
        [source, target, "ro"] => (*source, *target, true),
        [source, target, "rw"] => (*source, *target, false),
        _ => bail!("Invalid mount '{}', expected SOURCE:TARGET[:ro]", text),
    };

    if source.is_empty() || !target.starts_with('/') {
        bail!("Invalid mount '{}': source must be non-empty and target absolute", text);
    }

    let source = fs::canonicalize(source).with_context(|| format!("Mount source '{}' does not exist", source))?;
    Ok(if read_only {
        MountInfo::read_only(&source, target)
    } else {
        MountInfo::read_write(&source, target)
    })
}

// Ctrl-C cancels whatever is running.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received interrupt, cancelling");
            token.cancel();
        }
    });

    cancel
}

fn load_image_info(config_path: &Path, name: &str) -> Result<ImageInfo> {
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read image config {}", config_path.display()))?;
    let mut info: ImageInfo = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse image config {}", config_path.display()))?;

    let config_path = fs::canonicalize(config_path)?;
    info.name = name.to_string();
    info.base_dir = config_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    info.validate()?;

    Ok(info)
}

pub async fn run_container(
    config: &AutograderConfig,
    image: &str,
    mounts: &[String],
    max_secs: u64,
    name: &str,
    args: Vec<String>,
) -> Result<()> {
    let mounts = mounts.iter().map(|mount| parse_mount(mount)).collect::<Result<Vec<_>>>()?;
    let runner = DockerRunner::connect(Arc::new(LockManager::new()), config)?;

    let request = RunRequest {
        image: image.to_string(),
        mounts,
        args,
        base_name: name.to_string(),
        max_secs,
    };

    println!("🐳 Running container from image: {}", image);
    let output = runner.run_container(&request, &cancel_on_ctrl_c()).await?;
    let succeeded = output.succeeded();

    let report = RunReport {
        exit_code: output.exit_code,
        timeout: output.timeout,
        canceled: output.canceled,
        run_time_ms: output.run_time_ms,
        stdout: output.stdout,
        stderr: output.stderr,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !succeeded {
        bail!("Container did not complete successfully");
    }

    Ok(())
}

pub async fn write_dockerfile(image_config: &Path, name: &str, out: &Path) -> Result<()> {
    let info = load_image_info(image_config, name)?;

    println!("📝 Writing build context for '{}' to {}", name, out.display());
    write_docker_context(&info, out).await?;
    println!("✅ Wrote {}", out.join("Dockerfile").display());

    Ok(())
}

pub async fn build_image(config: &AutograderConfig, image_config: &Path, name: &str, force: bool) -> Result<()> {
    let info = load_image_info(image_config, name)?;
    let cache_path = info.base_dir.join(IMAGE_BUILD_CACHE_FILENAME);

    let locks = Arc::new(LockManager::new());
    let runner = DockerRunner::connect(locks.clone(), config)?;

    println!("🔨 Building image '{}'", name);
    if build_image_from_source(runner.docker(), &locks, &info, &cache_path, force, config).await? {
        println!("✅ Image '{}' built", name);
    } else {
        println!("✅ Image '{}' is up to date", name);
    }

    Ok(())
}

fn cli_engines(config: &AutograderConfig) -> EngineList {
    let locks = Arc::new(LockManager::new());
    let runner = if config.docker_disable {
        None
    } else {
        match DockerRunner::connect(locks.clone(), config) {
            Ok(runner) => Some(Arc::new(runner) as Arc<dyn ContainerRunner>),
            Err(err) => {
                warn!(error = %err, "Could not connect to Docker, container engines are unavailable");
                None
            }
        }
    };

    let mut engines = default_engines(runner, locks, config);
    engines.push(Arc::new(FakeEngine::new()));
    engines
}

pub async fn compute_similarity(
    config: &AutograderConfig,
    engine_name: &str,
    paths: [&Path; 2],
    template: Option<&Path>,
    lock_base: &str,
) -> Result<()> {
    for path in paths.iter().copied().chain(template) {
        if !path.is_file() {
            bail!("File not found: {}", path.display());
        }
    }

    let engines = cli_engines(config);
    let Some(engine) = find_engine(&engines, engine_name) else {
        let names: Vec<&str> = engines.iter().map(|engine| engine.name()).collect();
        bail!("Unknown similarity engine '{}', expected one of {:?}", engine_name, names);
    };

    if !engine.is_available().await {
        bail!("Similarity engine '{}' is not available", engine_name);
    }

    let (similarity, run_time_ms) = engine
        .compute_file_similarity(paths, template, lock_base, &cancel_on_ctrl_c())
        .await
        .with_context(|| format!("Similarity engine '{}' failed", engine_name))?;

    info!(engine = %engine_name, score = similarity.score, run_time_ms, "Computed similarity");
    println!("{}", serde_json::to_string_pretty(&similarity)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_mount() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().to_string_lossy().into_owned();

        let mount = parse_mount(&format!("{}:/data", source)).unwrap();
        assert_eq!(mount.target, "/data");
        assert!(!mount.read_only);

        let mount = parse_mount(&format!("{}:/data:ro", source)).unwrap();
        assert!(mount.read_only);

        assert!(parse_mount("/data").is_err());
        assert!(parse_mount(&format!("{}:relative", source)).is_err());
        assert!(parse_mount(&format!("{}:/data:xx", source)).is_err());
        assert!(parse_mount("/does/not/exist:/data").is_err());
    }

    #[test]
    fn test_load_image_info() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image.json");
        fs::write(&path, r#"{"invocation": ["python3", "grader.py"]}"#).unwrap();

        let info = load_image_info(&path, "course101-hw0").unwrap();
        assert_eq!(info.name, "course101-hw0");
        assert_eq!(info.base_dir, fs::canonicalize(dir.path()).unwrap());
        assert!(!info.image.is_empty());

        fs::write(&path, "{}").unwrap();
        assert!(load_image_info(&path, "course101-hw0").is_err());
    }

    #[tokio::test]
    async fn test_fake_similarity() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a.py");
        let second = dir.path().join("b.py");
        fs::write(&first, "print(1)\n").unwrap();
        fs::write(&second, "print(2)\n").unwrap();

        let config = AutograderConfig {
            docker_disable: true,
            ..Default::default()
        };

        compute_similarity(&config, "fake", [first.as_path(), second.as_path()], None, "test").await.unwrap();
        assert!(compute_similarity(&config, "dolos", [first.as_path(), second.as_path()], None, "test").await.is_err());
        assert!(compute_similarity(&config, "nope", [first.as_path(), second.as_path()], None, "test").await.is_err());
    }
}
