//! Staged commit: upload under `staging/`, promote to the final keys with
//! store-side copies (data first, metadata last), drop the staged copies,
//! then reclaim local disk.
//!
//! The final `metadata.json` is what the archive index reads, so a crash at
//! any point before its copy leaves the period looking unarchived. When a
//! period is being replaced, its old metadata is deleted before the new data
//! lands, so the final prefix never pairs one archive's metadata with
//! another's data.

use crate::archiver::crawl::Crawl;
use crate::archiver::facts::CandidateFacts;
use crate::archiver::metadata::{
    DATA_OBJECT, METADATA_OBJECT, final_prefix, object_key, staging_prefix,
};
use crate::archiver::packager::Packager;
use crate::archiver::store::ObjectStore;
use crate::error::ArchiverError;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    /// `<source>/<YYYY>/<MM>`
    pub final_prefix: String,
    pub local_cleanup_failed: Vec<String>,
}

pub struct StagedCommit<'a> {
    store: &'a dyn ObjectStore,
    packager: &'a dyn Packager,
}

impl<'a> StagedCommit<'a> {
    pub fn new(store: &'a dyn ObjectStore, packager: &'a dyn Packager) -> Self {
        Self { store, packager }
    }

    pub fn commit(&self, crawl: &Crawl, facts: &CandidateFacts) -> Result<CommitOutcome> {
        let (Some(data), Some(log)) = (facts.data.as_ref(), facts.log.as_ref()) else {
            return Err(ArchiverError::PolicyViolation(format!(
                "crawl {crawl} was selected for archiving without data and log facts"
            ))
            .into());
        };
        let source = crawl.source_id.as_str();
        let version = crawl.data_version_label();
        let period = crawl.period();

        let package = self.packager.package(crawl, data, log)?;

        let staging = staging_prefix(source, period);
        let target = final_prefix(source, period);
        let staged_data = object_key(&staging, DATA_OBJECT);
        let staged_meta = object_key(&staging, METADATA_OBJECT);
        let final_data = object_key(&target, DATA_OBJECT);
        let final_meta = object_key(&target, METADATA_OBJECT);

        self.put(source, &version, &staged_data, package.data_path())?;
        self.put(source, &version, &staged_meta, package.metadata_path())?;

        self.retire_existing(source, &version, &final_meta)?;
        self.promote(source, &version, &staged_data, &final_data)?;
        self.promote(source, &version, &staged_meta, &final_meta)?;
        tracing::info!(source, data_version = %version, key = %final_meta, "archive committed");

        for key in [&staged_data, &staged_meta] {
            self.store
                .delete(key)
                .map_err(ArchiverError::from)
                .with_context(|| format!("failed to delete staged object {key}"))?;
            tracing::debug!(source, data_version = %version, key = %key, "deleted staged object");
        }
        drop(package);

        let mut local_cleanup_failed = Vec::new();
        if let Err(err) = remove_local(&crawl.local_path, true) {
            tracing::warn!(source, data_version = %version, error = %err, "failed to remove crawl directory");
            local_cleanup_failed.push(crawl.local_path.display().to_string());
        }
        if let Some(log_path) = crawl.log_path.as_deref()
            && let Err(err) = remove_local(log_path, false)
        {
            tracing::warn!(source, data_version = %version, error = %err, "failed to remove crawl log");
            local_cleanup_failed.push(log_path.display().to_string());
        }
        if local_cleanup_failed.is_empty() {
            tracing::info!(source, data_version = %version, "local crawl files removed");
        }

        Ok(CommitOutcome {
            final_prefix: target,
            local_cleanup_failed,
        })
    }

    fn put(&self, source: &str, version: &str, key: &str, body: &Path) -> Result<()> {
        self.store
            .put(key, body)
            .map_err(ArchiverError::from)
            .with_context(|| format!("failed to upload {key}"))?;
        tracing::debug!(source, data_version = version, key, "uploaded staged object");
        Ok(())
    }

    fn retire_existing(&self, source: &str, version: &str, final_meta: &str) -> Result<()> {
        let existing = self
            .store
            .get(final_meta)
            .map_err(ArchiverError::from)
            .with_context(|| format!("failed to read {final_meta}"))?;
        if existing.is_none() {
            return Ok(());
        }
        self.store
            .delete(final_meta)
            .map_err(ArchiverError::from)
            .with_context(|| format!("failed to retire {final_meta}"))?;
        tracing::info!(source, data_version = version, key = final_meta, "retired previous archive metadata");
        Ok(())
    }

    fn promote(&self, source: &str, version: &str, from: &str, to: &str) -> Result<()> {
        self.store
            .copy(from, to)
            .map_err(ArchiverError::from)
            .with_context(|| format!("failed to promote {from} to {to}"))?;
        tracing::debug!(source, data_version = version, key = to, "promoted object");
        Ok(())
    }
}

fn remove_local(path: &Path, dir: bool) -> Result<(), ArchiverError> {
    let result = if dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ArchiverError::io(path, err)),
    }
}
