use anyhow::Result;
use std::env;

use crate::archiver::config::load_config;
use crate::archiver::paths::resolve_paths;
use crate::archiver::store::BucketUrl;
use crate::commands::CommandReport;

mod generated {
    include!(concat!(env!("OUT_DIR"), "/archiver_env_allowlist.rs"));
}

pub use generated::GENERATED_ENV_ALLOWLIST;

/// `ARCHIVER_*` variables set in this process that no code path reads.
pub fn unknown_env_vars() -> Vec<String> {
    let mut out = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("ARCHIVER_"))
        .filter(|key| !GENERATED_ENV_ALLOWLIST.contains(&key.as_str()))
        .collect::<Vec<_>>();
    out.sort();
    out
}

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    report.detail(format!("build_id={}", env!("BUILD_ID")));
    report.detail(format!("home={}", paths.home.display()));
    report.detail(format!("config_file={}", paths.config_file.display()));
    report.detail(format!("cache_db={}", paths.cache_db.display()));
    report.detail(format!("audit_dir={}", paths.audit_dir.display()));
    report.detail(format!("lock_file={}", paths.lock_file.display()));

    let cfg = match load_config(&paths) {
        Ok(cfg) => cfg,
        Err(err) => {
            report.issue(format!("config invalid: {err:#}"));
            return Ok(report);
        }
    };

    let bucket = cfg.storage.bucket.trim();
    if bucket.is_empty() {
        report.issue("storage.bucket is not set (config file, ARCHIVER_BUCKET or --bucket)");
    } else {
        report.detail(format!("bucket={bucket}"));
        match BucketUrl::parse(bucket) {
            Ok(BucketUrl::S3 { .. }) if !cfg!(feature = "s3") => {
                report.issue("s3:// bucket configured but this build lacks the `s3` feature");
            }
            Ok(_) => {}
            Err(err) => report.issue(format!("{err:#}")),
        }
    }

    for (label, dir) in [
        ("data_dir", cfg.discovery.data_dir.trim()),
        ("logs_dir", cfg.discovery.logs_dir.trim()),
    ] {
        if dir.is_empty() {
            report.issue(format!("discovery.{label} is not set"));
            continue;
        }
        report.detail(format!("{label}={dir}"));
        if !std::path::Path::new(dir).is_dir() {
            report.issue(format!("{label} does not exist: {dir}"));
        }
    }

    report.detail(format!("freshness_days={}", cfg.policy.freshness_days));
    report.detail(format!("floor_year={}", cfg.policy.floor_year));
    report.detail(format!("group_by_period={}", cfg.run.group_by_period));
    report.detail(format!("max_runtime_secs={}", cfg.run.max_runtime_secs));

    for key in unknown_env_vars() {
        report.issue(format!("unrecognised environment variable {key}"));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::GENERATED_ENV_ALLOWLIST;

    #[test]
    fn allowlist_covers_config_overrides() {
        for key in [
            "ARCHIVER_HOME",
            "ARCHIVER_BUCKET",
            "ARCHIVER_DATA_DIR",
            "ARCHIVER_CRAWL_LOGS_DIR",
            "ARCHIVER_FRESHNESS_DAYS",
            "ARCHIVER_MAX_RUNTIME_SECS",
        ] {
            assert!(GENERATED_ENV_ALLOWLIST.contains(&key), "{key} missing");
        }
    }
}
