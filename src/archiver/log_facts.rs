use crate::archiver::crawl::Crawl;
use crate::error::ArchiverError;
use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// A log belongs to a crawl when its first line is this close to the data version.
const LOG_MATCH_TOLERANCE_SECS: i64 = 3;
const SPIDER_ARGUMENTS_MARKER: &str = "] INFO: Spider arguments: ";
const STATS_MARKER: &str = "Dumping Scrapy stats:";
const SUBSET_ARGUMENTS: [&str; 3] = ["sample", "from_date", "until_date"];

/// What the scraper's log says about a crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFacts {
    pub finished: bool,
    pub complete: bool,
    pub error_count: Option<u64>,
    pub file_count: Option<u64>,
}

pub trait LogFactSource {
    /// `Ok(None)` when the crawl has no log file.
    fn facts(&self, crawl: &Crawl) -> Result<Option<LogFacts>>;
}

/// Reads Scrapy log files as written by the crawler's `LOG_FILE` setting.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapyLogReader;

impl LogFactSource for ScrapyLogReader {
    fn facts(&self, crawl: &Crawl) -> Result<Option<LogFacts>> {
        let Some(path) = crawl.log_path.as_deref() else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }
        let file = fs::File::open(path).map_err(|err| ArchiverError::io(path, err))?;
        let facts = parse_log(BufReader::new(file)).map_err(|err| ArchiverError::io(path, err))?;
        Ok(Some(facts))
    }
}

/// First-line timestamps of the log files of one source.
#[derive(Debug, Default)]
pub struct LogIndex {
    entries: Vec<(NaiveDateTime, PathBuf)>,
}

impl LogIndex {
    pub fn build(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Ok(Self::default());
        }
        let mut entries = Vec::new();
        let read_dir = fs::read_dir(dir).map_err(|err| ArchiverError::io(dir, err))?;
        for entry in read_dir {
            let path = entry.map_err(|err| ArchiverError::io(dir, err))?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            if let Some(started) = first_log_time(&path)? {
                entries.push((started, path));
            }
        }
        entries.sort();
        Ok(Self { entries })
    }

    pub fn find(&self, data_version: &NaiveDateTime) -> Option<PathBuf> {
        self.entries
            .iter()
            .map(|(started, path)| ((*started - *data_version).num_seconds().abs(), path))
            .filter(|(diff, _)| *diff < LOG_MATCH_TOLERANCE_SECS)
            .min_by_key(|(diff, _)| *diff)
            .map(|(_, path)| path.clone())
    }
}

fn first_log_time(path: &Path) -> Result<Option<NaiveDateTime>> {
    let file = fs::File::open(path).map_err(|err| ArchiverError::io(path, err))?;
    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .map_err(|err| ArchiverError::io(path, err))?;
    Ok(line
        .get(..19)
        .and_then(|stamp| NaiveDateTime::parse_from_str(stamp, LOG_TIME_FORMAT).ok()))
}

/// Value of `'key': value` inside a Python dict repr, with quotes stripped.
fn dict_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}': ");
    let start = text.find(&needle)? + needle.len();
    let rest = &text[start..];
    let value = if let Some(quoted) = rest.strip_prefix('\'') {
        &quoted[..quoted.find('\'')?]
    } else {
        let end = rest.find([',', '}']).unwrap_or(rest.len());
        rest[..end].trim()
    };
    Some(value)
}

fn is_truthy(value: Option<&str>) -> bool {
    match value {
        None => false,
        Some(v) => !matches!(v.trim(), "" | "None" | "False" | "0"),
    }
}

pub fn parse_log<R: BufRead>(reader: R) -> std::io::Result<LogFacts> {
    let mut complete = true;
    let mut stats: Option<String> = None;
    let mut error_items = 0u64;

    let mut block = String::new();
    let mut block_is_stats = false;
    let mut stats_announced = false;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();

        if block.is_empty() && trimmed.starts_with('{') {
            block_is_stats = stats_announced;
            stats_announced = false;
        }
        if !block.is_empty() || trimmed.starts_with('{') {
            block.push_str(trimmed);
            if trimmed.ends_with('}') {
                if block_is_stats {
                    stats = Some(std::mem::take(&mut block));
                } else {
                    if block.contains("'errors': ") {
                        error_items += 1;
                    }
                    block.clear();
                }
            }
            continue;
        }

        if line.contains(STATS_MARKER) {
            stats_announced = true;
        }
        if let Some(at) = line.find(SPIDER_ARGUMENTS_MARKER) {
            let arguments = &line[at + SPIDER_ARGUMENTS_MARKER.len()..];
            complete = !SUBSET_ARGUMENTS
                .iter()
                .any(|arg| is_truthy(dict_value(arguments, arg)));
        }
    }

    let Some(stats) = stats else {
        // Killed or still-running crawls never dump stats.
        return Ok(LogFacts {
            finished: false,
            complete,
            error_count: None,
            file_count: None,
        });
    };

    let finished = dict_value(&stats, "finish_reason") == Some("finished");
    let scraped = dict_value(&stats, "item_scraped_count")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(LogFacts {
        finished,
        complete,
        error_count: Some(error_items),
        file_count: Some(scraped.saturating_sub(error_items)),
    })
}

#[cfg(test)]
pub(crate) fn sample_log(started: &str, arguments: &str, items: &[&str], finish: Option<&str>) -> String {
    let mut out = format!("{started} [scrapy.utils.log] INFO: Scrapy 2.4.0 started (bot: kingfisher)\n");
    out.push_str(&format!("{started} [spider] INFO: Spider arguments: {arguments}\n"));
    for item in items {
        out.push_str(&format!("{started} [scrapy.core.scraper] DEBUG: Scraped from <200 https://example.com>\n"));
        out.push_str(item);
        out.push('\n');
    }
    if let Some(reason) = finish {
        out.push_str(&format!("{started} [scrapy.statscollectors] INFO: Dumping Scrapy stats:\n"));
        out.push_str("{'downloader/request_count': 3,\n");
        out.push_str(&format!(" 'finish_reason': '{reason}',\n"));
        out.push_str(&format!(" 'item_scraped_count': {},\n", items.len()));
        out.push_str(" 'log_count/ERROR': 1}\n");
        out.push_str(&format!("{started} [scrapy.core.engine] INFO: Spider closed ({reason})\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::crawl::parse_data_version;
    use std::io::Cursor;
    use tempfile::tempdir;

    const FILE_ITEM: &str = "{'file_name': 'a.json', 'url': 'https://example.com/a'}";
    const ERROR_ITEM: &str = "{'errors': {'http_code': 500},\n 'file_name': 'b.json'}";

    fn parse(text: &str) -> LogFacts {
        parse_log(Cursor::new(text.as_bytes())).expect("parse")
    }

    #[test]
    fn finished_full_crawl_counts_files_and_errors() {
        let log = sample_log(
            "2020-09-02 05:24:58",
            "{}",
            &[FILE_ITEM, FILE_ITEM, ERROR_ITEM],
            Some("finished"),
        );
        let facts = parse(&log);
        assert!(facts.finished);
        assert!(facts.complete);
        assert_eq!(facts.error_count, Some(1));
        assert_eq!(facts.file_count, Some(2));
    }

    #[test]
    fn sample_or_date_filtered_crawls_are_not_complete() {
        for args in [
            "{'sample': 'true'}",
            "{'from_date': '2020-01-01'}",
            "{'until_date': '2020-02-01', 'sample': None}",
        ] {
            let facts = parse(&sample_log("2020-09-02 05:24:58", args, &[], Some("finished")));
            assert!(!facts.complete, "{args}");
        }
        let facts = parse(&sample_log(
            "2020-09-02 05:24:58",
            "{'sample': None, 'from_date': ''}",
            &[],
            Some("finished"),
        ));
        assert!(facts.complete);
    }

    #[test]
    fn missing_stats_dump_leaves_counts_unknown() {
        let facts = parse(&sample_log("2020-09-02 05:24:58", "{}", &[ERROR_ITEM], None));
        assert!(!facts.finished);
        assert_eq!(facts.error_count, None);
        assert_eq!(facts.file_count, None);
    }

    #[test]
    fn shutdown_reason_is_not_finished() {
        let facts = parse(&sample_log("2020-09-02 05:24:58", "{}", &[], Some("shutdown")));
        assert!(!facts.finished);
        assert_eq!(facts.error_count, Some(0));
    }

    #[test]
    fn log_index_matches_within_tolerance() {
        let tmp = tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("near.log"),
            "2020-09-02 05:25:00 [scrapy.utils.log] INFO: start\n",
        )
        .expect("write");
        fs::write(
            tmp.path().join("far.log"),
            "2020-09-02 06:00:00 [scrapy.utils.log] INFO: start\n",
        )
        .expect("write");
        fs::write(tmp.path().join("notes.txt"), "2020-09-02 05:24:58").expect("write");

        let index = LogIndex::build(tmp.path()).expect("index");
        let version = parse_data_version("20200902_052458").expect("version");
        assert_eq!(index.find(&version), Some(tmp.path().join("near.log")));
        let other = parse_data_version("20200902_052455").expect("version");
        assert_eq!(index.find(&other), None);
    }

    #[test]
    fn reader_returns_none_without_log() {
        let crawl = Crawl {
            source_id: "scotland".to_string(),
            data_version: parse_data_version("20200902_052458").expect("version"),
            local_path: PathBuf::from("/nowhere"),
            log_path: None,
        };
        assert_eq!(ScrapyLogReader.facts(&crawl).expect("facts"), None);
    }
}
