use crate::archiver::paths::ArchiverPaths;
use crate::error::ArchiverError;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const MAX_FRESHNESS_DAYS: u64 = 36_500;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// `file:///abs/path` or `s3://bucket[/prefix]`.
    pub bucket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub data_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub freshness_days: u64,
    pub floor_year: i32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            freshness_days: 7,
            floor_year: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub group_by_period: bool,
    /// Zero disables the run deadline.
    pub max_runtime_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            group_by_period: true,
            max_runtime_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArchiverConfig {
    pub storage: StorageConfig,
    pub discovery: DiscoveryConfig,
    pub policy: PolicyConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialArchiverConfig {
    storage: Option<StorageConfig>,
    discovery: Option<DiscoveryConfig>,
    policy: Option<PolicyConfig>,
    run: Option<RunConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_i32(var: &str, fallback: i32) -> i32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<i32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

pub fn validate(cfg: &ArchiverConfig) -> Result<()> {
    let bucket = cfg.storage.bucket.trim();
    if !bucket.is_empty() && !bucket.starts_with("file://") && !bucket.starts_with("s3://") {
        return Err(anyhow!(ArchiverError::InvalidConfig(format!(
            "storage.bucket must start with file:// or s3://, got `{bucket}`"
        ))));
    }
    if !(1970..=9999).contains(&cfg.policy.floor_year) {
        return Err(anyhow!(ArchiverError::InvalidConfig(format!(
            "policy.floor_year out of range: {}",
            cfg.policy.floor_year
        ))));
    }
    if cfg.policy.freshness_days > MAX_FRESHNESS_DAYS {
        return Err(anyhow!(ArchiverError::InvalidConfig(format!(
            "policy.freshness_days must be at most {MAX_FRESHNESS_DAYS}, got {}",
            cfg.policy.freshness_days
        ))));
    }
    Ok(())
}

fn merge_file_config(base: &mut ArchiverConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(path)
        .map_err(|err| ArchiverError::InvalidConfig(format!("{}: {err}", path.display())))?;
    let parsed: PartialArchiverConfig = toml::from_str(&raw).map_err(|err| {
        ArchiverError::InvalidConfig(format!("failed to parse {}: {err}", path.display()))
    })?;
    if let Some(storage) = parsed.storage {
        base.storage = storage;
    }
    if let Some(discovery) = parsed.discovery {
        base.discovery = discovery;
    }
    if let Some(policy) = parsed.policy {
        base.policy = policy;
    }
    if let Some(run) = parsed.run {
        base.run = run;
    }
    Ok(())
}

pub fn load_config(paths: &ArchiverPaths) -> Result<ArchiverConfig> {
    let mut cfg = ArchiverConfig::default();
    merge_file_config(&mut cfg, &paths.config_file)?;

    cfg.storage.bucket = env_or_string("ARCHIVER_BUCKET", &cfg.storage.bucket);
    cfg.discovery.data_dir = env_or_string("ARCHIVER_DATA_DIR", &cfg.discovery.data_dir);
    cfg.discovery.logs_dir = env_or_string("ARCHIVER_CRAWL_LOGS_DIR", &cfg.discovery.logs_dir);
    cfg.policy.freshness_days =
        env_or_u64("ARCHIVER_FRESHNESS_DAYS", cfg.policy.freshness_days);
    cfg.policy.floor_year = env_or_i32("ARCHIVER_FLOOR_YEAR", cfg.policy.floor_year);
    cfg.run.group_by_period = env_or_bool("ARCHIVER_GROUP_BY_PERIOD", cfg.run.group_by_period);
    cfg.run.max_runtime_secs = env_or_u64("ARCHIVER_MAX_RUNTIME_SECS", cfg.run.max_runtime_secs);

    validate(&cfg)?;
    Ok(cfg)
}

impl ArchiverConfig {
    pub fn freshness(&self) -> chrono::Duration {
        let days = self.policy.freshness_days.min(MAX_FRESHNESS_DAYS) as i64;
        chrono::Duration::days(days)
    }

    pub fn max_runtime(&self) -> Option<std::time::Duration> {
        match self.run.max_runtime_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }

    /// The `archive` and `gc-staging` commands cannot run on defaults alone.
    pub fn require_bucket(&self) -> Result<&str> {
        let bucket = self.storage.bucket.trim();
        if bucket.is_empty() {
            return Err(anyhow!(ArchiverError::InvalidConfig(
                "storage.bucket (or ARCHIVER_BUCKET / --bucket) must be set".to_string()
            )));
        }
        Ok(bucket)
    }

    pub fn require_directories(&self) -> Result<(PathBuf, PathBuf)> {
        if self.discovery.data_dir.trim().is_empty() {
            return Err(anyhow!(ArchiverError::InvalidConfig(
                "discovery.data_dir (or ARCHIVER_DATA_DIR / --data-dir) must be set".to_string()
            )));
        }
        if self.discovery.logs_dir.trim().is_empty() {
            return Err(anyhow!(ArchiverError::InvalidConfig(
                "discovery.logs_dir (or ARCHIVER_CRAWL_LOGS_DIR / --logs-dir) must be set"
                    .to_string()
            )));
        }
        Ok((
            PathBuf::from(self.discovery.data_dir.trim()),
            PathBuf::from(self.discovery.logs_dir.trim()),
        ))
    }
}
