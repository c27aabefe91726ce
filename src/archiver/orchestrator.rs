//! Batch driver: freshness filter, cache lookup, same-period winner
//! selection, retention decision, staged commit and cache update, one crawl
//! group at a time.

use crate::archiver::audit;
use crate::archiver::cache::{CrawlCache, Outcome};
use crate::archiver::commit::StagedCommit;
use crate::archiver::crawl::{Crawl, Period};
use crate::archiver::facts::{CandidateFacts, gather};
use crate::archiver::log_facts::LogFactSource;
use crate::archiver::metadata::RemoteArchiveRecord;
use crate::archiver::packager::Packager;
use crate::archiver::paths::ArchiverPaths;
use crate::archiver::policy::{self, Decision, Reason};
use crate::archiver::remote_index::RemoteArchiveIndex;
use crate::archiver::store::ObjectStore;
use crate::error::classify;
use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub ignore_cache: bool,
    pub group_by_period: bool,
    /// Crawls younger than this are left for a later run.
    pub freshness: chrono::Duration,
    pub max_runtime: Option<Duration>,
    /// Reference time for the freshness check, in the same clock as data versions.
    pub now: NaiveDateTime,
}

impl RunOptions {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            dry_run: false,
            ignore_cache: false,
            group_by_period: true,
            freshness: chrono::Duration::days(7),
            max_runtime: None,
            now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlOutcome {
    Archived,
    Skipped,
    Pending,
    Cached,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlDecision {
    pub crawl_id: String,
    pub outcome: CrawlOutcome,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub considered: usize,
    pub fresh: usize,
    pub cached: usize,
    pub archived: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Crawls left untouched because the run deadline passed.
    pub deferred: usize,
    pub deadline_reached: bool,
    pub decisions: Vec<CrawlDecision>,
}

impl RunSummary {
    fn push(&mut self, crawl: &Crawl, outcome: CrawlOutcome, reason: String, detail: Option<String>) {
        match outcome {
            CrawlOutcome::Archived => self.archived += 1,
            CrawlOutcome::Skipped => self.skipped += 1,
            CrawlOutcome::Pending => self.fresh += 1,
            CrawlOutcome::Cached => self.cached += 1,
            CrawlOutcome::Failed => self.failed += 1,
        }
        self.decisions.push(CrawlDecision {
            crawl_id: crawl.id(),
            outcome,
            reason,
            detail,
        });
    }

    pub fn decision(&self, crawl_id: &str) -> Option<&CrawlDecision> {
        self.decisions.iter().find(|d| d.crawl_id == crawl_id)
    }
}

pub struct Orchestrator<'a> {
    store: &'a dyn ObjectStore,
    logs: &'a dyn LogFactSource,
    packager: &'a dyn Packager,
    cache: &'a CrawlCache,
    audit: Option<&'a ArchiverPaths>,
    floor_year: i32,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        logs: &'a dyn LogFactSource,
        packager: &'a dyn Packager,
        cache: &'a CrawlCache,
        floor_year: i32,
    ) -> Self {
        Self {
            store,
            logs,
            packager,
            cache,
            audit: None,
            floor_year,
        }
    }

    /// Appends every decision to the JSONL audit log under these paths.
    pub fn with_audit(mut self, paths: &'a ArchiverPaths) -> Self {
        self.audit = Some(paths);
        self
    }

    /// Processes `crawls` in order. Per-crawl failures are counted and the
    /// batch continues; programmer errors from the policy abort the run.
    pub fn run(&self, crawls: Vec<Crawl>, opts: &RunOptions) -> Result<RunSummary> {
        let started = Instant::now();
        let index = RemoteArchiveIndex::new(self.store, self.floor_year);
        let mut summary = RunSummary {
            dry_run: opts.dry_run,
            ..RunSummary::default()
        };

        let mut groups: BTreeMap<(String, Period, usize), Vec<Crawl>> = BTreeMap::new();
        for (seq, crawl) in crawls.into_iter().enumerate() {
            summary.considered += 1;

            if opts.now - crawl.data_version < opts.freshness {
                tracing::debug!(crawl = %crawl, "crawl is too recent to decide");
                self.settle(&crawl, CrawlOutcome::Pending, Reason::TooRecent.code(), None, opts, &mut summary);
                continue;
            }

            if !opts.ignore_cache {
                match self.cache.lookup(&crawl.id()) {
                    Ok(Some(entry)) if entry.outcome.is_terminal() => {
                        tracing::debug!(crawl = %crawl, outcome = entry.outcome.as_str(), "cached decision");
                        summary.push(&crawl, CrawlOutcome::Cached, entry.reason, None);
                        continue;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.fail(&crawl, &err, &mut summary);
                        continue;
                    }
                }
            }

            let slot = if opts.group_by_period { 0 } else { seq };
            groups
                .entry((crawl.source_id.clone(), crawl.period(), slot))
                .or_default()
                .push(crawl);
        }

        let mut remaining = groups.into_values();
        while let Some(group) = remaining.next() {
            if let Some(limit) = opts.max_runtime
                && started.elapsed() >= limit
            {
                let deferred = group.len() + remaining.by_ref().map(|g| g.len()).sum::<usize>();
                tracing::warn!(deferred, "run deadline reached; leaving remaining crawls for the next run");
                summary.deadline_reached = true;
                summary.deferred = deferred;
                break;
            }
            self.process_group(group, &index, opts, &mut summary)?;
        }

        tracing::info!(
            considered = summary.considered,
            archived = summary.archived,
            skipped = summary.skipped,
            cached = summary.cached,
            fresh = summary.fresh,
            failed = summary.failed,
            dry_run = opts.dry_run,
            "archive run finished"
        );
        Ok(summary)
    }

    fn process_group(
        &self,
        group: Vec<Crawl>,
        index: &RemoteArchiveIndex<'_>,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut eligible: Vec<(Crawl, CandidateFacts)> = Vec::new();
        for crawl in group {
            let facts = match gather(&crawl, self.logs) {
                Ok(facts) => facts,
                Err(err) => {
                    self.fail(&crawl, &err, summary);
                    continue;
                }
            };
            match policy::precheck(&facts) {
                Some(decision) => self.settle_decision(&crawl, decision, &facts, opts, summary),
                None => eligible.push((crawl, facts)),
            }
        }

        let candidates = eligible.iter().map(|(_, f)| f.clone()).collect::<Vec<_>>();
        let Some(winner) = policy::select_winner(&candidates)? else {
            return Ok(());
        };

        for (idx, (crawl, facts)) in eligible.iter().enumerate() {
            if idx == winner {
                continue;
            }
            tracing::info!(crawl = %crawl, reason = "superseded", "skipping crawl");
            self.settle(crawl, CrawlOutcome::Skipped, Reason::Superseded.code(), Some(facts), opts, summary);
        }

        let (crawl, facts) = &eligible[winner];
        if let Err(err) = self.decide_and_commit(crawl, facts, index, opts, summary) {
            if classify(&err).is_some_and(|e| e.is_fatal()) {
                return Err(err);
            }
            self.fail(crawl, &err, summary);
        }
        Ok(())
    }

    fn decide_and_commit(
        &self,
        crawl: &Crawl,
        facts: &CandidateFacts,
        index: &RemoteArchiveIndex<'_>,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let period = crawl.period();
        let exact = index.query_exact(&crawl.source_id, period)?;
        let earlier = if exact.is_none() {
            index.query_latest_before(&crawl.source_id, period)?
        } else {
            None
        };
        let decision = policy::decide(
            facts,
            exact.as_ref(),
            earlier.as_ref().map(|(record, p)| (record, *p)),
        );

        if !decision.archive {
            self.settle_decision(crawl, decision, facts, opts, summary);
            return Ok(());
        }
        if opts.dry_run {
            if let Some(record) = RemoteArchiveRecord::from_candidate(facts) {
                index.assume_committed(record);
            }
            self.settle_decision(crawl, decision, facts, opts, summary);
            return Ok(());
        }

        tracing::info!(crawl = %crawl, reason = %decision.reason, "archiving crawl");
        let outcome = StagedCommit::new(self.store, self.packager).commit(crawl, facts)?;
        index.forget(&crawl.source_id);
        let detail = if outcome.local_cleanup_failed.is_empty() {
            None
        } else {
            Some(format!(
                "local cleanup failed: {}",
                outcome.local_cleanup_failed.join(", ")
            ))
        };
        self.settle_with_detail(
            crawl,
            CrawlOutcome::Archived,
            decision.reason.code(),
            Some(facts),
            detail,
            opts,
            summary,
        );
        Ok(())
    }

    fn settle_decision(
        &self,
        crawl: &Crawl,
        decision: Decision,
        facts: &CandidateFacts,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) {
        let outcome = if decision.archive {
            CrawlOutcome::Archived
        } else {
            tracing::info!(crawl = %crawl, reason = %decision.reason, "skipping crawl");
            CrawlOutcome::Skipped
        };
        self.settle(crawl, outcome, decision.reason.code(), Some(facts), opts, summary);
    }

    fn settle(
        &self,
        crawl: &Crawl,
        outcome: CrawlOutcome,
        reason: String,
        facts: Option<&CandidateFacts>,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) {
        self.settle_with_detail(crawl, outcome, reason, facts, None, opts, summary);
    }

    /// Records the outcome in the cache and audit log (unless dry-run) and
    /// in the summary. A cache write failure turns the crawl into a failure.
    #[allow(clippy::too_many_arguments)]
    fn settle_with_detail(
        &self,
        crawl: &Crawl,
        outcome: CrawlOutcome,
        reason: String,
        facts: Option<&CandidateFacts>,
        detail: Option<String>,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) {
        if !opts.dry_run {
            let cached = match outcome {
                CrawlOutcome::Archived => Some(Outcome::Archived),
                CrawlOutcome::Skipped => Some(Outcome::Skipped),
                CrawlOutcome::Pending => Some(Outcome::Pending),
                CrawlOutcome::Cached | CrawlOutcome::Failed => None,
            };
            if let Some(cached) = cached
                && let Err(err) = self.cache.record(crawl, cached, &reason, facts)
            {
                self.fail(crawl, &err, summary);
                return;
            }
            self.audit(crawl, "decide", outcome_label(outcome), &reason);
        }
        summary.push(crawl, outcome, reason, detail);
    }

    fn fail(&self, crawl: &Crawl, err: &anyhow::Error, summary: &mut RunSummary) {
        tracing::error!(crawl = %crawl, error = %format!("{err:#}"), "crawl failed");
        let reason = classify(err)
            .map(|e| e.code().as_str().to_string())
            .unwrap_or_else(|| "error".to_string());
        summary.push(crawl, CrawlOutcome::Failed, reason, Some(format!("{err:#}")));
    }

    fn audit(&self, crawl: &Crawl, phase: &str, status: &str, message: &str) {
        let Some(paths) = self.audit else {
            return;
        };
        if let Err(err) = audit::append_event(paths, &crawl.id(), phase, status, message) {
            tracing::warn!(crawl = %crawl, error = %err, "failed to append audit event");
        }
    }
}

fn outcome_label(outcome: CrawlOutcome) -> &'static str {
    match outcome {
        CrawlOutcome::Archived => "archived",
        CrawlOutcome::Skipped => "skipped",
        CrawlOutcome::Pending => "pending",
        CrawlOutcome::Cached => "cached",
        CrawlOutcome::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::crawl::{discover, parse_data_version};
    use crate::archiver::log_facts::{ScrapyLogReader, sample_log};
    use crate::archiver::packager::TarGzPackager;
    use crate::archiver::paths::test_paths;
    use crate::archiver::store::memory::{MemoryObjectStore, Op};
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::{TempDir, tempdir};

    const ITEM: &str = "{'file_name': 'a.json'}";

    struct Fixture {
        tmp: TempDir,
        store: MemoryObjectStore,
        cache: CrawlCache,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempdir().expect("tempdir");
            let cache = CrawlCache::open(&tmp.path().join("cache.sqlite3")).expect("cache");
            Self {
                tmp,
                store: MemoryObjectStore::new(),
                cache,
            }
        }

        fn data_dir(&self) -> PathBuf {
            self.tmp.path().join("data")
        }

        fn logs_dir(&self) -> PathBuf {
            self.tmp.path().join("logs")
        }

        /// Writes one crawl of `size` bytes whose content is derived from `seed`.
        fn crawl(&self, version: &str, seed: u8, size: usize, finish: Option<&str>) {
            let dir = self.data_dir().join("scotland").join(version);
            fs::create_dir_all(&dir).expect("mkdir");
            let body = vec![b'a' + seed; size];
            fs::write(dir.join("release.json"), body).expect("write");

            let started = parse_data_version(version)
                .expect("version")
                .format("%Y-%m-%d %H:%M:%S")
                .to_string();
            let logs = self.logs_dir().join("scotland");
            fs::create_dir_all(&logs).expect("mkdir");
            fs::write(
                logs.join(format!("{version}.log")),
                sample_log(&started, "{}", &[ITEM], finish),
            )
            .expect("write");
        }

        fn discover(&self) -> Vec<Crawl> {
            discover(&self.data_dir(), &self.logs_dir()).expect("discover")
        }

        fn run(&self, opts: &RunOptions) -> RunSummary {
            let packager = TarGzPackager::default();
            Orchestrator::new(&self.store, &ScrapyLogReader, &packager, &self.cache, 2000)
                .run(self.discover(), opts)
                .expect("run")
        }

        fn exact(&self) -> Option<crate::archiver::metadata::RemoteArchiveRecord> {
            RemoteArchiveIndex::new(&self.store, 2000)
                .query_exact("scotland", Period::new(2020, 9).expect("period"))
                .expect("query")
        }
    }

    fn opts() -> RunOptions {
        RunOptions::new(parse_data_version("20210101_000000").expect("now"))
    }

    fn exists(path: &Path) -> bool {
        path.exists()
    }

    #[test]
    fn scenario_a_archives_fresh_source() {
        let fx = Fixture::new();
        fx.crawl("20200902_052458", 0, 239, Some("finished"));

        let summary = fx.run(&opts());
        assert_eq!(summary.archived, 1);
        let decision = summary.decision("scotland/20200902_052458").expect("decision");
        assert_eq!(decision.outcome, CrawlOutcome::Archived);
        assert_eq!(decision.reason, "new_period");

        let record = fx.exact().expect("archived record");
        assert_eq!(record.bytes, 239);
        assert!(!exists(&fx.data_dir().join("scotland/20200902_052458")));
        assert!(fx.store.keys().iter().all(|k| !k.starts_with("staging/")));

        let entry = fx
            .cache
            .lookup("scotland/20200902_052458")
            .expect("lookup")
            .expect("entry");
        assert_eq!(entry.outcome, Outcome::Archived);
        assert_eq!(entry.checksum.as_deref(), Some(record.checksum.as_str()));
    }

    #[test]
    fn scenario_b_identical_checksum_writes_nothing() {
        let fx = Fixture::new();
        fx.crawl("20200902_052458", 0, 239, Some("finished"));
        fx.run(&opts());
        let writes_after_first = fx.store.writes().len();

        fx.crawl("20200915_000000", 0, 239, Some("finished"));
        let summary = fx.run(&opts());
        let decision = summary.decision("scotland/20200915_000000").expect("decision");
        assert_eq!(decision.outcome, CrawlOutcome::Skipped);
        assert_eq!(decision.reason, "same_period_not_distinct");
        assert_eq!(fx.store.writes().len(), writes_after_first);
        assert!(exists(&fx.data_dir().join("scotland/20200915_000000")));
    }

    #[test]
    fn scenario_c_bigger_crawl_replaces_same_period() {
        let fx = Fixture::new();
        fx.crawl("20200902_052458", 0, 239, Some("finished"));
        fx.run(&opts());

        fx.crawl("20200915_000000", 1, 400, Some("finished"));
        let summary = fx.run(&opts());
        let decision = summary.decision("scotland/20200915_000000").expect("decision");
        assert_eq!(decision.outcome, CrawlOutcome::Archived);
        assert_eq!(decision.reason, "same_period_more_bytes");
        assert_eq!(fx.exact().expect("record").bytes, 400);
    }

    #[test]
    fn same_period_batch_commits_only_the_winner() {
        let fx = Fixture::new();
        fx.crawl("20200902_052458", 0, 100, Some("finished"));
        fx.crawl("20200910_000000", 1, 200, Some("finished"));
        fx.crawl("20200920_000000", 2, 210, Some("finished"));

        let summary = fx.run(&opts());
        assert_eq!(summary.archived, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(
            summary.decision("scotland/20200910_000000").map(|d| d.outcome),
            Some(CrawlOutcome::Archived)
        );
        assert_eq!(
            summary.decision("scotland/20200920_000000").map(|d| d.reason.as_str()),
            Some("superseded")
        );
        assert_eq!(fx.exact().expect("record").bytes, 200);
    }

    #[test]
    fn terminal_cache_entries_short_circuit_unless_ignored() {
        let fx = Fixture::new();
        fx.crawl("20200902_052458", 0, 239, Some("shutdown"));

        let first = fx.run(&opts());
        assert_eq!(
            first.decision("scotland/20200902_052458").map(|d| d.reason.as_str()),
            Some("not_finished")
        );

        let second = fx.run(&opts());
        assert_eq!(second.cached, 1);
        assert_eq!(second.skipped, 0);

        let mut ignore = opts();
        ignore.ignore_cache = true;
        let third = fx.run(&ignore);
        assert_eq!(third.cached, 0);
        assert_eq!(third.skipped, 1);
    }

    #[test]
    fn fresh_crawls_are_pending_and_revisited() {
        let fx = Fixture::new();
        fx.crawl("20201230_000000", 0, 239, Some("finished"));

        let summary = fx.run(&opts());
        assert_eq!(summary.fresh, 1);
        assert_eq!(
            fx.cache
                .lookup("scotland/20201230_000000")
                .expect("lookup")
                .map(|e| e.outcome),
            Some(Outcome::Pending)
        );
        assert!(fx.store.writes().is_empty());

        let mut later = opts();
        later.now = parse_data_version("20210115_000000").expect("now");
        assert_eq!(fx.run(&later).archived, 1);
    }

    #[test]
    fn dry_run_decides_without_side_effects() {
        let fx = Fixture::new();
        fx.crawl("20200902_052458", 0, 239, Some("finished"));
        let mut dry = opts();
        dry.dry_run = true;

        let summary = fx.run(&dry);
        assert!(summary.dry_run);
        assert_eq!(
            summary.decision("scotland/20200902_052458").map(|d| d.reason.as_str()),
            Some("new_period")
        );
        assert!(fx.store.writes().is_empty());
        assert!(fx.cache.list().expect("list").is_empty());
        assert!(exists(&fx.data_dir().join("scotland/20200902_052458")));
    }

    #[test]
    fn dry_run_matches_real_run_across_months() {
        let fx = Fixture::new();
        fx.crawl("20200815_000000", 0, 239, Some("finished"));
        fx.crawl("20200902_000000", 0, 239, Some("finished"));
        fx.crawl("20201010_000000", 1, 400, Some("finished"));
        fx.crawl("20201020_000000", 1, 400, Some("finished"));

        let outcomes = |summary: &RunSummary| {
            summary
                .decisions
                .iter()
                .map(|d| (d.crawl_id.clone(), d.outcome, d.reason.clone()))
                .collect::<Vec<_>>()
        };

        let mut dry = opts();
        dry.dry_run = true;
        let dry_summary = fx.run(&dry);
        assert!(fx.store.writes().is_empty());

        let real_summary = fx.run(&opts());
        assert_eq!(outcomes(&dry_summary), outcomes(&real_summary));
        assert_eq!(
            real_summary.decision("scotland/20200902_000000").map(|d| d.reason.as_str()),
            Some("2020_08_not_distinct")
        );
        assert_eq!(
            real_summary.decision("scotland/20201020_000000").map(|d| d.reason.as_str()),
            Some("superseded")
        );
    }

    #[test]
    fn failure_between_upload_and_promote_leaves_cache_untouched() {
        let fx = Fixture::new();
        fx.crawl("20200902_052458", 0, 239, Some("finished"));
        fx.store.fail_next(Op::Copy);

        let summary = fx.run(&opts());
        assert_eq!(summary.failed, 1);
        assert_eq!(
            summary.decision("scotland/20200902_052458").map(|d| d.reason.as_str()),
            Some("E002_REMOTE")
        );
        assert!(fx.exact().is_none());
        assert!(fx.cache.lookup("scotland/20200902_052458").expect("lookup").is_none());
        assert!(exists(&fx.data_dir().join("scotland/20200902_052458")));

        // retried on the next run
        assert_eq!(fx.run(&opts()).archived, 1);
    }

    #[test]
    fn earlier_period_archive_is_left_alone() {
        let fx = Fixture::new();
        fx.crawl("20200815_000000", 0, 239, Some("finished"));
        fx.run(&opts());

        fx.crawl("20200902_052458", 1, 239, Some("finished"));
        let summary = fx.run(&opts());
        assert_eq!(
            summary.decision("scotland/20200902_052458").map(|d| d.reason.as_str()),
            Some("new_period")
        );
        assert!(fx.store.keys().contains(&"scotland/2020/08/metadata.json".to_string()));
        assert!(fx.exact().is_some());
    }

    #[test]
    fn zero_deadline_defers_every_group() {
        let fx = Fixture::new();
        fx.crawl("20200902_052458", 0, 239, Some("finished"));
        let paths = test_paths(fx.tmp.path());
        let mut o = opts();
        o.max_runtime = Some(Duration::ZERO);

        let packager = TarGzPackager::default();
        let summary = Orchestrator::new(&fx.store, &ScrapyLogReader, &packager, &fx.cache, 2000)
            .with_audit(&paths)
            .run(fx.discover(), &o)
            .expect("run");
        assert!(summary.deadline_reached);
        assert_eq!(summary.deferred, 1);
        assert!(summary.decisions.is_empty());
    }

    #[test]
    fn decisions_are_audited() {
        let fx = Fixture::new();
        fx.crawl("20200902_052458", 0, 239, Some("finished"));
        let paths = test_paths(fx.tmp.path());
        let packager = TarGzPackager::default();
        Orchestrator::new(&fx.store, &ScrapyLogReader, &packager, &fx.cache, 2000)
            .with_audit(&paths)
            .run(fx.discover(), &opts())
            .expect("run");
        let raw = fs::read_to_string(audit::audit_log_path(&paths)).expect("audit");
        assert!(raw.contains("\"crawl_id\":\"scotland/20200902_052458\""));
        assert!(raw.contains("new_period"));
    }
}
