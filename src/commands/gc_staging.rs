use anyhow::Result;

use crate::archiver::config::{self, load_config};
use crate::archiver::metadata::STAGING_PREFIX;
use crate::archiver::paths::resolve_paths;
use crate::archiver::store::{ObjectStore, open_store};
use crate::archiver::util::RunLock;
use crate::commands::CommandReport;
use crate::error::ArchiverError;

#[derive(Debug, Clone, Default)]
pub struct GcStagingOptions {
    pub dry_run: bool,
    pub bucket: Option<String>,
}

/// Deletes every object under `staging/`. Only safe while no archive run is
/// in flight, which the run lock guarantees.
pub fn collect(store: &dyn ObjectStore, dry_run: bool, report: &mut CommandReport) -> Result<usize> {
    let prefix = format!("{STAGING_PREFIX}/");
    let keys = store.list(&prefix).map_err(ArchiverError::from)?;
    report.detail(format!("staged_objects={}", keys.len()));
    let mut deleted = 0usize;
    for key in keys {
        if dry_run {
            report.detail(format!("would delete {key}"));
            continue;
        }
        match store.delete(&key) {
            Ok(()) => {
                tracing::info!(key = %key, "deleted orphaned staged object");
                report.detail(format!("deleted {key}"));
                deleted += 1;
            }
            Err(err) => report.issue(format!("failed to delete {key}: {err}")),
        }
    }
    Ok(deleted)
}

pub fn run(opts: &GcStagingOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut cfg = load_config(&paths)?;
    if let Some(bucket) = opts.bucket.as_deref() {
        cfg.storage.bucket = bucket.to_string();
        config::validate(&cfg)?;
    }
    let bucket = cfg.require_bucket()?.to_string();

    let mut report = CommandReport::new("gc-staging");
    report.detail(format!("bucket={bucket}"));

    let _lock = RunLock::acquire(&paths.lock_file)?;
    let store = open_store(&bucket)?;
    let deleted = collect(store.as_ref(), opts.dry_run, &mut report)?;
    if !opts.dry_run {
        report.detail(format!("deleted={deleted}"));
    }
    Ok(report)
}
