use anyhow::{Result, anyhow};

use crate::archiver::cache::CrawlCache;
use crate::archiver::crawl::parse_crawl_id;
use crate::archiver::paths::resolve_paths;
use crate::commands::CommandReport;

#[derive(Debug, Clone)]
pub enum CacheAction {
    List,
    Invalidate { crawl_id: String },
    Prune,
}

fn or_dash(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn run(action: &CacheAction) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("cache");
    report.detail(format!("cache_db={}", paths.cache_db.display()));

    if !paths.cache_db.exists() {
        report.detail("cache is empty (no database yet)");
        return Ok(report);
    }
    let cache = CrawlCache::open(&paths.cache_db)?;

    match action {
        CacheAction::List => {
            let entries = cache.list()?;
            report.detail(format!("entries={}", entries.len()));
            for entry in entries {
                report.detail(format!(
                    "{} outcome={} reason={} checksum={} bytes={} files={} errors={} updated_at={}",
                    entry.crawl_id,
                    entry.outcome.as_str(),
                    entry.reason,
                    entry.checksum.as_deref().unwrap_or("-"),
                    or_dash(entry.bytes),
                    or_dash(entry.file_count),
                    or_dash(entry.error_count),
                    entry.updated_at
                ));
            }
        }
        CacheAction::Invalidate { crawl_id } => {
            let crawl_id = crawl_id.trim();
            if parse_crawl_id(crawl_id).is_none() {
                return Err(anyhow!(
                    "invalid crawl id `{crawl_id}`; expected <source_id>/YYYYMMDD_HHMMSS"
                ));
            }
            if cache.invalidate(crawl_id)? {
                report.detail(format!("invalidated {crawl_id}"));
            } else {
                report.issue(format!("no cache entry for {crawl_id}"));
            }
        }
        CacheAction::Prune => {
            let removed = cache.prune()?;
            report.detail(format!("pruned={}", removed.len()));
            for id in removed {
                report.detail(format!("pruned {id}"));
            }
        }
    }

    Ok(report)
}
