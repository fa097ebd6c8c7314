// Runtime configuration for the execution core
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "AUTOGRADER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AutograderConfig {
    /// Disable container support entirely; callers fall back to host-side behavior where one exists.
    pub docker_disable: bool,
    /// Per-stream cap on captured container output.
    pub docker_max_output_kb: usize,
    /// Added to a run's max seconds for the outer deadline (container start-up slack).
    pub docker_extra_init_secs: u64,
    pub lock_stale_secs: u64,
    pub lock_sweep_interval_secs: u64,
    pub analysis_pool_size: usize,
    pub engine_pool_size: usize,
    pub keep_build_dirs: bool,
    pub temp_dir: Option<PathBuf>,
}

impl Default for AutograderConfig {
    fn default() -> Self {
        Self {
            docker_disable: false,
            docker_max_output_kb: 4 * 1024,
            docker_extra_init_secs: 5,
            lock_stale_secs: 2 * 60 * 60,
            lock_sweep_interval_secs: 60 * 60,
            analysis_pool_size: 4,
            engine_pool_size: 2,
            keep_build_dirs: false,
            temp_dir: None,
        }
    }
}

impl AutograderConfig {
    /// Load from a JSON file (missing keys take defaults), then apply environment overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: AutograderConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Defaults plus environment overrides, for when no config file is given.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Each key may be overridden by `AUTOGRADER_<KEY>` with dashes as underscores,
    /// e.g. `AUTOGRADER_DOCKER_DISABLE=true`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key.replace('-', "_").to_uppercase()));

        if let Some(value) = get("docker-disable") {
            self.docker_disable = parse_bool("docker-disable", &value)?;
        }
        if let Some(value) = get("docker-max-output-kb") {
            self.docker_max_output_kb = parse_num("docker-max-output-kb", &value)?;
        }
        if let Some(value) = get("docker-extra-init-secs") {
            self.docker_extra_init_secs = parse_num("docker-extra-init-secs", &value)?;
        }
        if let Some(value) = get("lock-stale-secs") {
            self.lock_stale_secs = parse_num("lock-stale-secs", &value)?;
        }
        if let Some(value) = get("lock-sweep-interval-secs") {
            self.lock_sweep_interval_secs = parse_num("lock-sweep-interval-secs", &value)?;
        }
        if let Some(value) = get("analysis-pool-size") {
            self.analysis_pool_size = parse_num("analysis-pool-size", &value)?;
        }
        if let Some(value) = get("engine-pool-size") {
            self.engine_pool_size = parse_num("engine-pool-size", &value)?;
        }
        if let Some(value) = get("keep-build-dirs") {
            self.keep_build_dirs = parse_bool("keep-build-dirs", &value)?;
        }
        if let Some(value) = get("temp-dir") {
            self.temp_dir = if value.trim().is_empty() { None } else { Some(PathBuf::from(value.trim())) };
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.analysis_pool_size == 0 {
            bail!("analysis-pool-size must be positive");
        }
        if self.engine_pool_size == 0 {
            bail!("engine-pool-size must be positive");
        }
        if self.lock_sweep_interval_secs == 0 {
            bail!("lock-sweep-interval-secs must be positive");
        }

        Ok(())
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn docker_max_output_bytes(&self) -> usize {
        self.docker_max_output_kb.saturating_mul(1024)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("Invalid boolean for '{}': '{}'", key, other),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid number for '{}': '{}'", key, value))
}
