use anyhow::Result;
use std::path::PathBuf;

use crate::archiver::cache::CrawlCache;
use crate::archiver::config::{self, ArchiverConfig, load_config};
use crate::archiver::crawl::discover;
use crate::archiver::log_facts::ScrapyLogReader;
use crate::archiver::orchestrator::{CrawlOutcome, Orchestrator, RunOptions, RunSummary};
use crate::archiver::packager::TarGzPackager;
use crate::archiver::paths::resolve_paths;
use crate::archiver::store::open_store;
use crate::archiver::util::RunLock;
use crate::commands::CommandReport;

#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    pub dry_run: bool,
    pub ignore_cache: bool,
    pub bucket: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
}

fn apply_overrides(cfg: &mut ArchiverConfig, opts: &ArchiveOptions) -> Result<()> {
    if let Some(bucket) = opts.bucket.as_deref() {
        cfg.storage.bucket = bucket.to_string();
    }
    if let Some(dir) = opts.data_dir.as_deref() {
        cfg.discovery.data_dir = dir.display().to_string();
    }
    if let Some(dir) = opts.logs_dir.as_deref() {
        cfg.discovery.logs_dir = dir.display().to_string();
    }
    config::validate(cfg)
}

fn summarize(report: &mut CommandReport, summary: &RunSummary) {
    report.detail(format!(
        "considered={} archived={} skipped={} cached={} fresh={} failed={}",
        summary.considered,
        summary.archived,
        summary.skipped,
        summary.cached,
        summary.fresh,
        summary.failed
    ));
    for decision in &summary.decisions {
        let line = format!(
            "{} {} reason={}",
            decision.crawl_id,
            outcome_label(decision.outcome, summary.dry_run),
            decision.reason
        );
        match (&decision.outcome, &decision.detail) {
            (CrawlOutcome::Failed, Some(detail)) => report.issue(format!("{line}: {detail}")),
            (CrawlOutcome::Failed, None) => report.issue(line),
            (_, Some(detail)) => report.detail(format!("{line} ({detail})")),
            (_, None) => report.detail(line),
        }
    }
    if summary.deadline_reached {
        report.detail(format!(
            "run deadline reached; deferred={} crawls to the next run",
            summary.deferred
        ));
    }
}

fn outcome_label(outcome: CrawlOutcome, dry_run: bool) -> &'static str {
    match outcome {
        CrawlOutcome::Archived if dry_run => "would_archive",
        CrawlOutcome::Archived => "archived",
        CrawlOutcome::Skipped => "skipped",
        CrawlOutcome::Pending => "pending",
        CrawlOutcome::Cached => "cached",
        CrawlOutcome::Failed => "failed",
    }
}

pub fn run(opts: &ArchiveOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut cfg = load_config(&paths)?;
    apply_overrides(&mut cfg, opts)?;
    let bucket = cfg.require_bucket()?.to_string();
    let (data_dir, logs_dir) = cfg.require_directories()?;

    let mut report = CommandReport::new("archive");
    report.detail(format!("bucket={bucket}"));
    report.detail(format!("data_dir={}", data_dir.display()));
    report.detail(format!("logs_dir={}", logs_dir.display()));
    report.detail(format!("cache_db={}", paths.cache_db.display()));
    if opts.dry_run {
        report.detail("dry-run: no uploads, cache writes or local deletions");
    }

    let _lock = RunLock::acquire(&paths.lock_file)?;

    let store = open_store(&bucket)?;
    let cache = if opts.dry_run && !paths.cache_db.exists() {
        CrawlCache::open_in_memory()?
    } else {
        CrawlCache::open(&paths.cache_db)?
    };
    let crawls = discover(&data_dir, &logs_dir)?;
    tracing::info!(crawls = crawls.len(), store = %store.describe(), "discovered crawls");

    let run_opts = RunOptions {
        dry_run: opts.dry_run,
        ignore_cache: opts.ignore_cache,
        group_by_period: cfg.run.group_by_period,
        freshness: cfg.freshness(),
        max_runtime: cfg.max_runtime(),
        ..RunOptions::new(chrono::Utc::now().naive_utc())
    };

    let packager = TarGzPackager::default();
    let logs = ScrapyLogReader;
    let summary = Orchestrator::new(
        store.as_ref(),
        &logs,
        &packager,
        &cache,
        cfg.policy.floor_year,
    )
    .with_audit(&paths)
    .run(crawls, &run_opts)?;

    summarize(&mut report, &summary);
    Ok(report)
}
