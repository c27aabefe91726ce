use crate::archiver::log_facts::LogIndex;
use crate::error::ArchiverError;
use anyhow::Result;
use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DATA_VERSION_FORMAT: &str = "%Y%m%d_%H%M%S";

/// The (year, month) bucket an archive is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn of(data_version: &NaiveDateTime) -> Self {
        Self {
            year: data_version.year(),
            month: data_version.month(),
        }
    }

    /// `YYYYMM`, as written to the metadata document.
    pub fn compact(self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    /// Accepts `YYYYMM` or an ISO date / datetime.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() == 6 && raw.bytes().all(|b| b.is_ascii_digit()) {
            let year = raw[..4].parse().ok()?;
            let month = raw[4..].parse().ok()?;
            return Self::new(year, month);
        }
        let date = raw.get(..10)?;
        let mut parts = date.split('-');
        let year = parts.next()?.parse().ok()?;
        let month = parts.next()?.parse().ok()?;
        Self::new(year, month)
    }

    /// Remote key segment: `YYYY/MM`.
    pub fn key_segment(self) -> String {
        format!("{:04}/{:02}", self.year, self.month)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}/{:02}", self.year, self.month)
    }
}

/// One timestamped batch of scraped files plus its log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crawl {
    pub source_id: String,
    pub data_version: NaiveDateTime,
    pub local_path: PathBuf,
    pub log_path: Option<PathBuf>,
}

impl Crawl {
    pub fn period(&self) -> Period {
        Period::of(&self.data_version)
    }

    pub fn data_version_label(&self) -> String {
        self.data_version.format(DATA_VERSION_FORMAT).to_string()
    }

    /// Stable identity used as the cache key: `source_id/YYYYMMDD_HHMMSS`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.source_id, self.data_version_label())
    }
}

impl fmt::Display for Crawl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

pub fn parse_data_version(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, DATA_VERSION_FORMAT).ok()
}

/// Splits a cache key back into its source and data version.
pub fn parse_crawl_id(id: &str) -> Option<(String, NaiveDateTime)> {
    let (source, version) = id.trim().rsplit_once('/')?;
    if source.is_empty() {
        return None;
    }
    Some((source.to_string(), parse_data_version(version)?))
}

fn sorted_dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let read_dir = fs::read_dir(dir).map_err(|err| ArchiverError::io(dir, err))?;
    let mut out = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|err| ArchiverError::io(dir, err))?;
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}

/// Scans `<data_dir>/<source_id>/<YYYYMMDD_HHMMSS>` and pairs each crawl with
/// its log file under `<logs_dir>/<source_id>/`. Directory names that do not
/// parse as a data version are ignored.
pub fn discover(data_dir: &Path, logs_dir: &Path) -> Result<Vec<Crawl>> {
    let mut crawls = Vec::new();

    for spider_dir in sorted_dir_entries(data_dir)? {
        if !spider_dir.is_dir() {
            continue;
        }
        let Some(source_id) = spider_dir.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let logs = LogIndex::build(&logs_dir.join(source_id))?;

        for crawl_dir in sorted_dir_entries(&spider_dir)? {
            if !crawl_dir.is_dir() {
                continue;
            }
            let Some(data_version) = crawl_dir
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(parse_data_version)
            else {
                continue;
            };
            crawls.push(Crawl {
                source_id: source_id.to_string(),
                data_version,
                log_path: logs.find(&data_version),
                local_path: crawl_dir,
            });
        }
    }

    crawls.sort_by(|a, b| {
        a.source_id
            .cmp(&b.source_id)
            .then(a.data_version.cmp(&b.data_version))
    });
    Ok(crawls)
}
