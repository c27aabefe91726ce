//! Object-store seam. The commit protocol and the archive index only ever
//! talk to a `dyn ObjectStore` constructed once per run.

pub mod fs;
#[cfg(test)]
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use crate::error::{ArchiverError, RemoteError};
use anyhow::{Result, anyhow};
use std::path::{Path, PathBuf};

pub trait ObjectStore {
    /// Uploads the file at `body` under `key`, replacing any existing object.
    fn put(&self, key: &str, body: &Path) -> Result<(), RemoteError>;
    /// Store-side copy. The destination becomes visible in one step.
    fn copy(&self, src: &str, dst: &str) -> Result<(), RemoteError>;
    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), RemoteError>;
    /// `Ok(None)` on 404.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;
    /// All keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketUrl {
    File(PathBuf),
    S3 { bucket: String, prefix: String },
}

impl BucketUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("file://") {
            if path.is_empty() {
                return Err(anyhow!(ArchiverError::InvalidConfig(format!(
                    "missing path in bucket url: {raw}"
                ))));
            }
            return Ok(Self::File(PathBuf::from(path)));
        }
        if let Some(rest) = raw.strip_prefix("s3://") {
            let rest = rest.trim_matches('/');
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(anyhow!(ArchiverError::InvalidConfig(format!(
                    "missing bucket in s3 url: {raw}"
                ))));
            }
            return Ok(Self::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            });
        }
        Err(anyhow!(ArchiverError::InvalidConfig(format!(
            "unsupported bucket url: {raw}"
        ))))
    }
}

pub fn open_store(raw_url: &str) -> Result<Box<dyn ObjectStore>> {
    match BucketUrl::parse(raw_url)? {
        BucketUrl::File(root) => Ok(Box::new(fs::FsObjectStore::new(root))),
        #[cfg(feature = "s3")]
        BucketUrl::S3 { bucket, prefix } => Ok(Box::new(s3::S3ObjectStore::connect(bucket, prefix)?)),
        #[cfg(not(feature = "s3"))]
        BucketUrl::S3 { .. } => Err(anyhow!(ArchiverError::InvalidConfig(
            "s3:// buckets require building with `--features s3`".to_string()
        ))),
    }
}
