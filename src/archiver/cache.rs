//! Local idempotency cache: one SQLite row per crawl, holding the outcome of
//! its last decision. A terminal row turns later runs into a no-op for that
//! crawl until it is invalidated or pruned.

use crate::archiver::crawl::Crawl;
use crate::archiver::facts::CandidateFacts;
use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Seen but not decided yet; the next run looks again.
    Pending,
    Skipped,
    Archived,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "skipped" => Some(Self::Skipped),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub crawl_id: String,
    pub source_id: String,
    pub local_path: String,
    pub outcome: Outcome,
    pub reason: String,
    pub checksum: Option<String>,
    pub bytes: Option<u64>,
    pub file_count: Option<u64>,
    pub error_count: Option<u64>,
    /// RFC 3339, UTC.
    pub updated_at: String,
}

pub struct CrawlCache {
    db: Connection,
}

const COLUMNS: &str = "crawl_id, source_id, local_path, outcome, reason, checksum, bytes, file_count, error_count, updated_at";

fn to_sql_int(value: Option<u64>) -> Result<Option<i64>> {
    value
        .map(|v| i64::try_from(v).map_err(|_| anyhow!("value {v} does not fit the cache schema")))
        .transpose()
}

fn from_sql_int(value: Option<i64>) -> Option<u64> {
    value.and_then(|v| u64::try_from(v).ok())
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(CacheEntry, String)> {
    let outcome: String = row.get(3)?;
    Ok((
        CacheEntry {
            crawl_id: row.get(0)?,
            source_id: row.get(1)?,
            local_path: row.get(2)?,
            outcome: Outcome::Pending,
            reason: row.get(4)?,
            checksum: row.get(5)?,
            bytes: from_sql_int(row.get(6)?),
            file_count: from_sql_int(row.get(7)?),
            error_count: from_sql_int(row.get(8)?),
            updated_at: row.get(9)?,
        },
        outcome,
    ))
}

fn finish_entry((mut entry, outcome): (CacheEntry, String)) -> Result<CacheEntry> {
    entry.outcome = Outcome::parse(&outcome).ok_or_else(|| {
        anyhow!(
            "cache row {} has unknown outcome `{outcome}`",
            entry.crawl_id
        )
    })?;
    Ok(entry)
}

impl CrawlCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = Connection::open(path)
            .with_context(|| format!("failed to open cache {}", path.display()))?;
        db.execute_batch("PRAGMA journal_mode = WAL;")
            .with_context(|| format!("failed to initialise cache {}", path.display()))?;
        Self::with_schema(db)
    }

    /// A throwaway cache, used by dry runs when no cache file exists yet.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(db: Connection) -> Result<Self> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS crawl_cache (
              crawl_id     TEXT PRIMARY KEY,  -- source_id/YYYYMMDD_HHMMSS
              source_id    TEXT NOT NULL,
              local_path   TEXT NOT NULL,
              outcome      TEXT NOT NULL,     -- pending | skipped | archived
              reason       TEXT NOT NULL,
              checksum     TEXT,
              bytes        INTEGER,
              file_count   INTEGER,
              error_count  INTEGER,
              updated_at   TEXT NOT NULL
            );
            "#,
        )
        .context("failed to create cache schema")?;
        Ok(Self { db })
    }

    pub fn lookup(&self, crawl_id: &str) -> Result<Option<CacheEntry>> {
        let sql = format!("SELECT {COLUMNS} FROM crawl_cache WHERE crawl_id = ?1");
        let row = self
            .db
            .query_row(&sql, [crawl_id], entry_from_row)
            .optional()
            .with_context(|| format!("failed to read cache entry {crawl_id}"))?;
        row.map(finish_entry).transpose()
    }

    /// Inserts or replaces the row for `crawl`.
    pub fn record(
        &self,
        crawl: &Crawl,
        outcome: Outcome,
        reason: &str,
        facts: Option<&CandidateFacts>,
    ) -> Result<()> {
        let crawl_id = crawl.id();
        let checksum = facts.and_then(|f| f.checksum()).map(str::to_string);
        let bytes = to_sql_int(facts.and_then(CandidateFacts::bytes))?;
        let file_count = to_sql_int(facts.and_then(CandidateFacts::file_count))?;
        let error_count = to_sql_int(facts.and_then(CandidateFacts::error_count))?;
        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .execute(
                r#"
                INSERT INTO crawl_cache(crawl_id, source_id, local_path, outcome, reason, checksum, bytes, file_count, error_count, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(crawl_id) DO UPDATE SET
                  source_id   = excluded.source_id,
                  local_path  = excluded.local_path,
                  outcome     = excluded.outcome,
                  reason      = excluded.reason,
                  checksum    = excluded.checksum,
                  bytes       = excluded.bytes,
                  file_count  = excluded.file_count,
                  error_count = excluded.error_count,
                  updated_at  = excluded.updated_at
                "#,
                rusqlite::params![
                    crawl_id,
                    crawl.source_id,
                    crawl.local_path.display().to_string(),
                    outcome.as_str(),
                    reason,
                    checksum,
                    bytes,
                    file_count,
                    error_count,
                    now,
                ],
            )
            .with_context(|| format!("failed to record cache entry {crawl_id}"))?;
        tracing::debug!(crawl = %crawl_id, outcome = outcome.as_str(), reason, "cache entry recorded");
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn invalidate(&self, crawl_id: &str) -> Result<bool> {
        let removed = self
            .db
            .execute("DELETE FROM crawl_cache WHERE crawl_id = ?1", [crawl_id])
            .with_context(|| format!("failed to delete cache entry {crawl_id}"))?;
        Ok(removed > 0)
    }

    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        let sql = format!("SELECT {COLUMNS} FROM crawl_cache ORDER BY crawl_id");
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map([], entry_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_entry(row?)?);
        }
        Ok(out)
    }

    /// Drops rows whose crawl directory is gone. Returns the removed ids.
    pub fn prune(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for entry in self.list()? {
            if Path::new(&entry.local_path).exists() {
                continue;
            }
            if self.invalidate(&entry.crawl_id)? {
                removed.push(entry.crawl_id);
            }
        }
        Ok(removed)
    }
}
