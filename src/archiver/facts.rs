use crate::archiver::crawl::{Crawl, Period};
use crate::archiver::fingerprint::{Fingerprint, fingerprint};
use crate::archiver::log_facts::{LogFactSource, LogFacts};
use anyhow::Result;
use chrono::NaiveDateTime;

/// Everything the retention policy needs to know about a local crawl,
/// computed once per decision and passed by value.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFacts {
    pub source_id: String,
    pub data_version: NaiveDateTime,
    /// `None` when the crawl's data directory does not exist.
    pub data: Option<Fingerprint>,
    /// `None` when no log file was found.
    pub log: Option<LogFacts>,
}

impl CandidateFacts {
    pub fn period(&self) -> Period {
        Period::of(&self.data_version)
    }

    pub fn label(&self) -> String {
        format!(
            "{}/{}",
            self.source_id,
            self.data_version
                .format(crate::archiver::crawl::DATA_VERSION_FORMAT)
        )
    }

    pub fn bytes(&self) -> Option<u64> {
        self.data.as_ref().map(|d| d.bytes)
    }

    pub fn checksum(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.checksum.as_str())
    }

    pub fn error_count(&self) -> Option<u64> {
        self.log.and_then(|l| l.error_count)
    }

    pub fn file_count(&self) -> Option<u64> {
        self.log.and_then(|l| l.file_count)
    }
}

pub fn gather(crawl: &Crawl, logs: &dyn LogFactSource) -> Result<CandidateFacts> {
    let data = if crawl.local_path.is_dir() {
        Some(fingerprint(&crawl.local_path)?)
    } else {
        None
    };
    let log = logs.facts(crawl)?;
    Ok(CandidateFacts {
        source_id: crawl.source_id.clone(),
        data_version: crawl.data_version,
        data,
        log,
    })
}
