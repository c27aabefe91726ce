use crate::archiver::crawl::Period;
use crate::archiver::facts::CandidateFacts;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DATA_OBJECT: &str = "data.tar.gz";
pub const METADATA_OBJECT: &str = "metadata.json";
pub const STAGING_PREFIX: &str = "staging";

/// The metadata blob stored next to each archive. Field names and types are
/// a wire contract shared with every reader of the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub source_id: String,
    pub period: String,
    pub checksum: String,
    pub bytes: u64,
    pub file_count: Option<u64>,
    pub error_count: Option<u64>,
}

impl ArchiveMetadata {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec_pretty(self)?;
        out.push(b'\n');
        Ok(out)
    }
}

/// A previously committed archive, as read back from the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArchiveRecord {
    pub source_id: String,
    pub period: Period,
    pub checksum: String,
    pub bytes: u64,
    pub file_count: Option<u64>,
    pub error_count: Option<u64>,
}

impl RemoteArchiveRecord {
    /// The record a commit of `facts` would write. `None` without a fingerprint.
    pub fn from_candidate(facts: &CandidateFacts) -> Option<Self> {
        let data = facts.data.as_ref()?;
        Some(Self {
            source_id: facts.source_id.clone(),
            period: facts.period(),
            checksum: data.checksum.clone(),
            bytes: data.bytes,
            file_count: facts.file_count(),
            error_count: facts.error_count(),
        })
    }

    pub fn from_json(raw: &[u8], key: &str) -> Result<Self> {
        let meta: ArchiveMetadata =
            serde_json::from_slice(raw).with_context(|| format!("failed to parse {key}"))?;
        let period = Period::parse(&meta.period)
            .ok_or_else(|| anyhow!("invalid period `{}` in {key}", meta.period))?;
        Ok(Self {
            source_id: meta.source_id,
            period,
            checksum: meta.checksum,
            bytes: meta.bytes,
            file_count: meta.file_count,
            error_count: meta.error_count,
        })
    }
}

/// `<source>/<YYYY>/<MM>`
pub fn final_prefix(source_id: &str, period: Period) -> String {
    format!("{source_id}/{}", period.key_segment())
}

/// `staging/<source>/<YYYY>/<MM>`
pub fn staging_prefix(source_id: &str, period: Period) -> String {
    format!("{STAGING_PREFIX}/{}", final_prefix(source_id, period))
}

pub fn object_key(prefix: &str, object: &str) -> String {
    format!("{prefix}/{object}")
}

/// Parses `<source>/<YYYY>/<MM>/metadata.json` back into its period.
pub fn period_from_metadata_key(source_id: &str, key: &str) -> Option<Period> {
    let rest = key.strip_prefix(source_id)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let year = parts.next()?.parse::<i32>().ok()?;
    let month = parts.next()?.parse::<u32>().ok()?;
    if parts.next()? != METADATA_OBJECT || parts.next().is_some() {
        return None;
    }
    Period::new(year, month)
}
