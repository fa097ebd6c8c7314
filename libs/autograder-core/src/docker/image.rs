/// Grading Images - Build Context Assembly and Image Builds
///
/// **Core Responsibility:**
/// Turn an `ImageInfo` (base image, static files, file operations, docker
/// commands) into a built image tagged with the image's name.
///
/// **Build Context Layout:**
/// ```text
/// <context>/
///   Dockerfile
///   config.json               grading config baked into the image
///   post-submission-ops.sh    file ops run after each submission lands
///   input/  output/  work/    work/ holds the static files
/// ```
///
/// **Rebuild Detection:**
/// A small JSON cache per image source records the hash of the image info,
/// a hash per static path, the git reference per static repo, and whether the
/// last build succeeded. Any difference (or a failed last build) means rebuild.

use crate::fetch::copy_file_specs;
use crate::lockmanager::LockManager;
use anyhow::{bail, Context, Result};
use autograder_common::config::AutograderConfig;
use autograder_common::fileop::FileOperation;
use autograder_common::filespec::FileSpec;
use autograder_common::fsutil::list_relpaths;
use autograder_common::AutograderError;
use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_GRADING_IMAGE: &str = "autograder/grader-base";

pub const DOCKER_BASE_DIR: &str = "/autograder";
pub const DOCKER_INPUT_DIR: &str = "/autograder/input";
pub const DOCKER_OUTPUT_DIR: &str = "/autograder/output";
pub const DOCKER_WORK_DIR: &str = "/autograder/work";
pub const DOCKER_SCRIPTS_DIR: &str = "/autograder/scripts";

pub const GRADING_INPUT_DIRNAME: &str = "input";
pub const GRADING_OUTPUT_DIRNAME: &str = "output";
pub const GRADING_WORK_DIRNAME: &str = "work";

pub const DOCKER_CONFIG_FILENAME: &str = "config.json";
pub const DOCKER_POST_SUBMISSION_OPS_FILENAME: &str = "post-submission-ops.sh";

const BUILD_TEMPDIR_PREFIX: &str = "autograder-docker-build-";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_static_docker_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_static_docker_commands: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocation: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_files: Vec<FileSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_static_files_ops: Vec<FileOperation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_static_files_ops: Vec<FileOperation>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_submission_files_ops: Vec<FileOperation>,

    #[serde(default)]
    pub max_runtime_secs: u64,

    /// Image tag; set by the owner after loading.
    #[serde(skip)]
    pub name: String,

    /// Static file paths are relative to this dir.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// The subset of an `ImageInfo` baked into the image for use at grading time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GradingConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_submission_files_ops: Vec<FileOperation>,
}

impl ImageInfo {
    pub fn grading_config(&self) -> GradingConfig {
        GradingConfig {
            name: self.name.clone(),
            post_submission_files_ops: self.post_submission_files_ops.clone(),
        }
    }

    /// Validate and fill defaults (the base image).
    pub fn validate(&mut self) -> Result<()> {
        let invalid = |message: String| -> Result<()> { Err(AutograderError::Validation(message).into()) };

        if self.name.is_empty() {
            return invalid("Missing image name".to_string());
        }

        if self.base_dir.as_os_str().is_empty() {
            return invalid(format!("Missing base dir for image '{}'", self.name));
        }

        if self.image.is_empty() && self.invocation.is_empty() {
            return invalid(format!("Image '{}': image and invocation cannot both be empty", self.name));
        }

        if self.image.is_empty() {
            self.image = DEFAULT_GRADING_IMAGE.to_string();
        }

        let mut static_files = Vec::with_capacity(self.static_files.len());
        for spec in self.static_files.drain(..) {
            let spec = spec.validated(false).context("Failed to validate static file spec")?;
            if spec.is_abs() {
                return invalid(format!(
                    "All static file paths must be relative (to the assignment config file), found: '{}'",
                    spec
                ));
            }
            static_files.push(spec);
        }
        self.static_files = static_files;

        for (label, ops) in [
            ("pre-static", &self.pre_static_files_ops),
            ("post-static", &self.post_static_files_ops),
            ("post-submission", &self.post_submission_files_ops),
        ] {
            for op in ops {
                op.validate()
                    .with_context(|| format!("Failed to validate {} file operation '{}'", label, op))?;
            }
        }

        Ok(())
    }

    /// Stable digest of everything that goes into the build.
    pub fn info_hash(&self) -> Result<String> {
        let json = serde_json::to_string(self).context("Failed to serialize image info")?;

        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\n");
        hasher.update(json.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Create `input/`, `output/`, and `work/` under `base`.
pub fn create_standard_grading_dirs(base: &Path) -> Result<(PathBuf, PathBuf, PathBuf)> {
    let dirs = [
        base.join(GRADING_INPUT_DIRNAME),
        base.join(GRADING_OUTPUT_DIRNAME),
        base.join(GRADING_WORK_DIRNAME),
    ];

    for dir in &dirs {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create grading dir '{}'", dir.display()))?;
    }

    let [input, output, work] = dirs;
    Ok((input, output, work))
}

/// Write a full build context (Dockerfile, config, ops script, static files) into `dir`.
pub async fn write_docker_context(info: &ImageInfo, dir: &Path) -> Result<()> {
    let (_, _, work_dir) = create_standard_grading_dirs(dir).context("Could not create standard grading directories")?;

    copy_file_specs(
        &info.base_dir,
        &work_dir,
        dir,
        &info.static_files,
        &info.pre_static_files_ops,
        &info.post_static_files_ops,
    )
    .await
    .context("Failed to copy static image files")?;

    let config_json =
        serde_json::to_string_pretty(&info.grading_config()).context("Failed to serialize grading config")?;
    fs::write(dir.join(DOCKER_CONFIG_FILENAME), config_json).context("Failed to create docker config file")?;

    fs::write(dir.join(DOCKER_POST_SUBMISSION_OPS_FILENAME), post_submission_ops_script(info))
        .context("Failed to write post-submission operations script")?;

    let dockerfile = to_dockerfile(info, &work_dir)?;
    fs::write(dir.join("Dockerfile"), dockerfile).context("Failed to write Dockerfile")?;

    Ok(())
}

pub fn post_submission_ops_script(info: &ImageInfo) -> String {
    let mut lines = vec![
        "#!/bin/bash\n".to_string(),
        format!("# Post-Submission operations for '{}'.\n", info.name),
    ];

    lines.extend(info.post_submission_files_ops.iter().map(|op| op.to_unix(".")));

    lines.join("\n")
}

/// Double-quote a Dockerfile path or exec-form argument.
pub fn dockerfile_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

pub fn to_dockerfile(info: &ImageInfo, work_dir: &Path) -> Result<String> {
    // Blank entries become blank lines.
    let mut lines: Vec<String> = vec![format!("FROM {}", info.image), String::new()];

    lines.push("# Core directories".to_string());
    for dir in [DOCKER_BASE_DIR, DOCKER_INPUT_DIR, DOCKER_OUTPUT_DIR, DOCKER_WORK_DIR, DOCKER_SCRIPTS_DIR] {
        lines.push(format!("RUN mkdir -p '{}'", dir));
    }
    lines.push(String::new());

    lines.push(format!("WORKDIR {}", DOCKER_BASE_DIR));
    lines.push(String::new());

    lines.push(format!("COPY {} {}/{}", DOCKER_CONFIG_FILENAME, DOCKER_BASE_DIR, DOCKER_CONFIG_FILENAME));
    lines.push(String::new());

    lines.push(format!(
        "COPY {} {}/{}",
        DOCKER_POST_SUBMISSION_OPS_FILENAME, DOCKER_SCRIPTS_DIR, DOCKER_POST_SUBMISSION_OPS_FILENAME
    ));
    lines.push(String::new());

    lines.push("# Pre-Static Commands".to_string());
    lines.extend(info.pre_static_docker_commands.iter().cloned());
    lines.push(String::new());

    let mut names = Vec::new();
    let entries = fs::read_dir(work_dir)
        .with_context(|| format!("Failed to list work dir ('{}') for static files", work_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list work dir '{}'", work_dir.display()))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    lines.push("# Static Files".to_string());
    for name in names {
        lines.push(format!(
            "COPY {} {}",
            dockerfile_quote(&format!("{}/{}", GRADING_WORK_DIRNAME, name)),
            dockerfile_quote(&format!("{}/{}", DOCKER_WORK_DIR, name))
        ));
    }
    lines.push(String::new());

    lines.push("# Post-Static Commands".to_string());
    lines.extend(info.post_static_docker_commands.iter().cloned());
    lines.push(String::new());

    if !info.invocation.is_empty() {
        let parts: Vec<String> = info.invocation.iter().map(|part| dockerfile_quote(part)).collect();
        lines.push("# Invocation".to_string());
        lines.push(format!("CMD [{}]", parts.join(", ")));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Build without the layer cache.
    pub rebuild: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub output: String,
}

/// Build `info` into an image tagged `info.name`.
#[tracing::instrument(skip_all, fields(image = %info.name))]
pub async fn build_image(docker: &Docker, info: &ImageInfo, options: BuildOptions, config: &AutograderConfig) -> Result<BuildOutput> {
    let temp_root = config.temp_root();
    fs::create_dir_all(&temp_root).with_context(|| format!("Failed to create temp root '{}'", temp_root.display()))?;

    let temp_dir = tempfile::Builder::new()
        .prefix(&format!("{}{}-", BUILD_TEMPDIR_PREFIX, info.name))
        .tempdir_in(&temp_root)
        .with_context(|| format!("Failed to create temp build directory for '{}'", info.name))?;

    write_docker_context(info, temp_dir.path()).await?;

    let context = tar_directory(temp_dir.path())
        .with_context(|| format!("Failed to create tar build context for image '{}'", info.name))?;

    if config.keep_build_dirs {
        let kept = temp_dir.into_path();
        debug!(path = %kept.display(), "Leaving behind image building dir");
    }

    let build_options = BuildImageOptions {
        dockerfile: "Dockerfile",
        t: info.name.as_str(),
        nocache: options.rebuild,
        rm: true,
        ..Default::default()
    };

    let mut stream = docker.build_image(build_options, None, Some(context.into()));

    let mut lines = Vec::new();
    let mut errors = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                if let Some(text) = chunk.stream {
                    lines.push(text);
                }
                if let Some(error) = chunk.error {
                    warn!(error = %error, "Image build reported an error");
                    errors.push(error);
                }
            }
            Err(err) => {
                errors.push(err.to_string());
                break;
            }
        }
    }

    let output = lines.concat();
    if !errors.is_empty() {
        return Err(AutograderError::tool(format!("Failed to build image '{}'", info.name), output, errors.join("\n")).into());
    }

    info!("Image built");
    Ok(BuildOutput { output })
}

fn tar_directory(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    Ok(builder.into_inner()?)
}

/// Persisted record of the last build of one image source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ImageBuildCache {
    pub image_info_hash: String,
    pub build_success: bool,
    pub static_file_hashes: BTreeMap<String, String>,
    pub git_references: BTreeMap<String, String>,
}

impl ImageBuildCache {
    /// A missing cache file reads as an empty cache (which always rebuilds).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create dir '{}'", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize image build cache")?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// The cache as it would look right after building `info` now.
    pub fn snapshot(info: &ImageInfo, build_success: bool) -> Result<Self> {
        let mut cache = Self {
            image_info_hash: info.info_hash()?,
            build_success,
            ..Default::default()
        };

        for spec in &info.static_files {
            if spec.is_path() {
                let path = info.base_dir.join(&spec.path);
                cache.static_file_hashes.insert(spec.path.clone(), hash_path(&path)?);
            } else if spec.is_git() {
                if spec.reference.is_empty() {
                    warn!(repo = %spec.path, "Git repo without a reference used as a static file; changes will not be seen");
                }
                cache.git_references.insert(spec.path.clone(), spec.reference.clone());
            }
        }

        Ok(cache)
    }
}

/// Whether `info` differs from what the cache says was last built (or that build failed).
pub fn need_rebuild(info: &ImageInfo, cache: &ImageBuildCache) -> Result<bool> {
    if !cache.build_success {
        return Ok(true);
    }

    Ok(ImageBuildCache::snapshot(info, true)? != *cache)
}

/// Build when forced or when `need_rebuild` says so, recording the outcome in `cache_path`.
/// Builds of the same image are serialized. Returns whether a build ran.
pub async fn build_image_from_source(
    docker: &Docker,
    locks: &Arc<LockManager>,
    info: &ImageInfo,
    cache_path: &Path,
    force: bool,
    config: &AutograderConfig,
) -> Result<bool> {
    let _guard = locks.lock_scoped(&format!("docker-build-{}", info.name)).await;

    let cache = ImageBuildCache::load(cache_path)?;
    if !force && !need_rebuild(info, &cache)? {
        debug!(image = %info.name, "Image is up to date");
        return Ok(false);
    }

    let result = build_image(docker, info, BuildOptions { rebuild: force }, config).await;

    ImageBuildCache::snapshot(info, result.is_ok())?
        .save(cache_path)
        .context("Failed to record image build result")?;

    result.map(|_| true)
}

// Globs hash their nearest existing ancestor, so any change under it counts.
fn hash_path(path: &Path) -> Result<String> {
    let Some(existing) = path.ancestors().find(|candidate| candidate.exists()) else {
        bail!("No existing ancestor for '{}'", path.display());
    };

    let mut hasher = Sha256::new();
    if existing.is_dir() {
        for relpath in list_relpaths(existing)? {
            let bytes = fs::read(existing.join(&relpath)).with_context(|| format!("Failed to read '{}'", relpath))?;
            hasher.update(relpath.as_bytes());
            hasher.update(b"\0");
            hasher.update(Sha256::digest(&bytes));
        }
    } else {
        let bytes = fs::read(existing).with_context(|| format!("Failed to read '{}'", existing.display()))?;
        hasher.update(&bytes);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn image_info(base_dir: &Path) -> ImageInfo {
        let mut info: ImageInfo = serde_json::from_str(
            r#"{
                "image": "python:3.12-slim",
                "invocation": ["python3", "-m", "grader", "--out", "/autograder/output"],
                "static-files": ["grader.py", {"type": "path", "path": "data", "dest": "fixtures"}],
                "post-static-docker-commands": ["RUN pip install --no-cache-dir numpy"],
                "post-submission-files-ops": [["cp", "input/submission.py", "work/submission.py"]]
            }"#,
        )
        .unwrap();

        info.name = "course101-hw0".to_string();
        info.base_dir = base_dir.to_path_buf();
        info
    }

    fn source_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("grader.py"), "print('grading')\n").unwrap();
        fs::create_dir(dir.path().join("data")).unwrap();
        fs::write(dir.path().join("data").join("case1.txt"), "1 2 3\n").unwrap();
        dir
    }

    #[test]
    fn test_validate() {
        let source = source_dir();
        let mut info = image_info(source.path());
        info.validate().unwrap();

        let mut info = ImageInfo {
            name: "x".to_string(),
            base_dir: source.path().to_path_buf(),
            invocation: vec!["true".to_string()],
            ..Default::default()
        };
        info.validate().unwrap();
        assert_eq!(info.image, DEFAULT_GRADING_IMAGE);

        let mut info = ImageInfo {
            name: "x".to_string(),
            base_dir: source.path().to_path_buf(),
            ..Default::default()
        };
        assert!(info.validate().is_err());

        let mut info = ImageInfo {
            name: "x".to_string(),
            base_dir: source.path().to_path_buf(),
            image: "python".to_string(),
            static_files: vec![FileSpec::path("/etc/passwd")],
            ..Default::default()
        };
        assert!(info.validate().is_err());

        let mut info = ImageInfo {
            image: "python".to_string(),
            ..Default::default()
        };
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_dockerfile_quote() {
        assert_eq!(dockerfile_quote("work/a b"), r#""work/a b""#);
        assert_eq!(dockerfile_quote(r#"say "hi""#), r#""say \"hi\"""#);
    }

    #[tokio::test]
    async fn test_write_docker_context() {
        let source = source_dir();
        let context = TempDir::new().unwrap();
        let mut info = image_info(source.path());
        info.validate().unwrap();

        write_docker_context(&info, context.path()).await.unwrap();

        assert!(context.path().join("input").is_dir());
        assert!(context.path().join("output").is_dir());
        assert_eq!(
            fs::read_to_string(context.path().join("work").join("grader.py")).unwrap(),
            "print('grading')\n"
        );
        assert!(context.path().join("work").join("fixtures").join("case1.txt").is_file());

        let config: GradingConfig =
            serde_json::from_str(&fs::read_to_string(context.path().join(DOCKER_CONFIG_FILENAME)).unwrap()).unwrap();
        assert_eq!(config.name, "course101-hw0");
        assert_eq!(config.post_submission_files_ops.len(), 1);

        let script = fs::read_to_string(context.path().join(DOCKER_POST_SUBMISSION_OPS_FILENAME)).unwrap();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("# Post-Submission operations for 'course101-hw0'."));
        assert!(script.ends_with("cp -r 'input/submission.py' 'work/submission.py'"));

        let dockerfile = fs::read_to_string(context.path().join("Dockerfile")).unwrap();
        let expected = [
            "FROM python:3.12-slim",
            "",
            "# Core directories",
            "RUN mkdir -p '/autograder'",
            "RUN mkdir -p '/autograder/input'",
            "RUN mkdir -p '/autograder/output'",
            "RUN mkdir -p '/autograder/work'",
            "RUN mkdir -p '/autograder/scripts'",
            "",
            "WORKDIR /autograder",
            "",
            "COPY config.json /autograder/config.json",
            "",
            "COPY post-submission-ops.sh /autograder/scripts/post-submission-ops.sh",
            "",
            "# Pre-Static Commands",
            "",
            "# Static Files",
            r#"COPY "work/fixtures" "/autograder/work/fixtures""#,
            r#"COPY "work/grader.py" "/autograder/work/grader.py""#,
            "",
            "# Post-Static Commands",
            "RUN pip install --no-cache-dir numpy",
            "",
            "# Invocation",
            r#"CMD ["python3", "-m", "grader", "--out", "/autograder/output"]"#,
            "",
        ]
        .join("\n");
        assert_eq!(dockerfile, expected);
    }

    #[test]
    fn test_need_rebuild() {
        let source = source_dir();
        let cache_dir = TempDir::new().unwrap();
        let cache_path = cache_dir.path().join("cache.json");

        let mut info = image_info(source.path());
        info.validate().unwrap();

        // Nothing cached yet.
        assert!(need_rebuild(&info, &ImageBuildCache::load(&cache_path).unwrap()).unwrap());

        ImageBuildCache::snapshot(&info, true).unwrap().save(&cache_path).unwrap();
        assert!(!need_rebuild(&info, &ImageBuildCache::load(&cache_path).unwrap()).unwrap());

        // A static file changed.
        fs::write(source.path().join("data").join("case1.txt"), "4 5 6\n").unwrap();
        assert!(need_rebuild(&info, &ImageBuildCache::load(&cache_path).unwrap()).unwrap());

        ImageBuildCache::snapshot(&info, true).unwrap().save(&cache_path).unwrap();
        info.post_static_docker_commands.push("RUN true".to_string());
        assert!(need_rebuild(&info, &ImageBuildCache::load(&cache_path).unwrap()).unwrap());

        // A failed build always rebuilds.
        ImageBuildCache::snapshot(&info, false).unwrap().save(&cache_path).unwrap();
        assert!(need_rebuild(&info, &ImageBuildCache::load(&cache_path).unwrap()).unwrap());
    }

    #[test]
    fn test_tar_directory() {
        let source = source_dir();
        let bytes = tar_directory(source.path()).unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();

        assert!(names.iter().any(|name| name.ends_with("grader.py")));
        assert!(names.iter().any(|name| name.ends_with("data/case1.txt")));
    }
}
