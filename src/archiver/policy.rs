//! Retention policy: should this crawl be archived, given what the bucket
//! already holds? Pure functions over [`CandidateFacts`] and remote records;
//! no I/O happens here.

use crate::archiver::crawl::Period;
use crate::archiver::facts::CandidateFacts;
use crate::archiver::metadata::RemoteArchiveRecord;
use crate::error::ArchiverError;
use serde::{Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NoDataDirectory,
    NoDataFiles,
    NoLogFile,
    NotFinished,
    NotComplete,
    NotCleanEnough,
    SamePeriodNotDistinct,
    SamePeriodLessBytes,
    SamePeriodLessClean,
    SamePeriodLessDistinct,
    SamePeriodMoreBytes,
    SamePeriodMoreFiles,
    SamePeriodMoreClean,
    SamePeriod,
    EarlierNotDistinct(Period),
    EarlierNotDistinctMaybe(Period),
    NewPeriod,
    /// Lost the same-period comparison against a later crawl in the batch.
    Superseded,
    /// Younger than the freshness threshold; decided on a later run.
    TooRecent,
}

impl Reason {
    pub fn code(&self) -> String {
        let fixed = match self {
            Self::NoDataDirectory => "no_data_directory",
            Self::NoDataFiles => "no_data_files",
            Self::NoLogFile => "no_log_file",
            Self::NotFinished => "not_finished",
            Self::NotComplete => "not_complete",
            Self::NotCleanEnough => "not_clean_enough",
            Self::SamePeriodNotDistinct => "same_period_not_distinct",
            Self::SamePeriodLessBytes => "same_period_less_bytes",
            Self::SamePeriodLessClean => "same_period_less_clean",
            Self::SamePeriodLessDistinct => "same_period_less_distinct",
            Self::SamePeriodMoreBytes => "same_period_more_bytes",
            Self::SamePeriodMoreFiles => "same_period_more_files",
            Self::SamePeriodMoreClean => "same_period_more_clean",
            Self::SamePeriod => "same_period",
            Self::EarlierNotDistinct(p) => {
                return format!("{:04}_{:02}_not_distinct", p.year, p.month);
            }
            Self::EarlierNotDistinctMaybe(p) => {
                return format!("{:04}_{:02}_not_distinct_maybe", p.year, p.month);
            }
            Self::NewPeriod => "new_period",
            Self::Superseded => "superseded",
            Self::TooRecent => "too_recent",
        };
        fixed.to_string()
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

impl Serialize for Reason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub archive: bool,
    pub reason: Reason,
}

impl Decision {
    fn archive(reason: Reason) -> Self {
        Self {
            archive: true,
            reason,
        }
    }

    fn skip(reason: Reason) -> Self {
        Self {
            archive: false,
            reason,
        }
    }
}

/// `candidate >= other * 1.5`, exactly.
fn at_least_half_again(candidate: u64, other: u64) -> bool {
    2 * u128::from(candidate) >= 3 * u128::from(other)
}

fn both<T>(a: Option<T>, b: Option<T>) -> Option<(T, T)> {
    Some((a?, b?))
}

/// Rules that only look at the local crawl. `None` means the crawl is
/// eligible and the remote comparison decides.
pub fn precheck(candidate: &CandidateFacts) -> Option<Decision> {
    let Some(data) = candidate.data.as_ref() else {
        return Some(Decision::skip(Reason::NoDataDirectory));
    };
    if data.files == 0 {
        return Some(Decision::skip(Reason::NoDataFiles));
    }
    let Some(log) = candidate.log else {
        return Some(Decision::skip(Reason::NoLogFile));
    };
    if !log.finished {
        return Some(Decision::skip(Reason::NotFinished));
    }
    if !log.complete {
        return Some(Decision::skip(Reason::NotComplete));
    }
    // errors / (files + errors) > 0.5  <=>  errors > files
    if let Some((errors, files)) = both(log.error_count, log.file_count)
        && errors > files
    {
        return Some(Decision::skip(Reason::NotCleanEnough));
    }
    None
}

struct Side {
    checksum: String,
    bytes: u64,
    files: Option<u64>,
    errors: Option<u64>,
}

impl Side {
    fn record(record: &RemoteArchiveRecord) -> Self {
        Self {
            checksum: record.checksum.clone(),
            bytes: record.bytes,
            files: record.file_count,
            errors: record.error_count,
        }
    }

    fn candidate(facts: &CandidateFacts) -> Option<Self> {
        let data = facts.data.as_ref()?;
        Some(Self {
            checksum: data.checksum.clone(),
            bytes: data.bytes,
            files: facts.file_count(),
            errors: facts.error_count(),
        })
    }
}

/// The replacement test: strictly more bytes, and a meaningful gain in at
/// least one dimension. Returns the first dimension that qualifies.
fn replacement_reason(candidate: &Side, existing: &Side) -> Option<Reason> {
    if candidate.bytes <= existing.bytes {
        return None;
    }
    if at_least_half_again(candidate.bytes, existing.bytes) {
        return Some(Reason::SamePeriodMoreBytes);
    }
    if let Some((ours, theirs)) = both(candidate.files, existing.files)
        && at_least_half_again(ours, theirs)
    {
        return Some(Reason::SamePeriodMoreFiles);
    }
    if let Some((ours, theirs)) = both(candidate.errors, existing.errors)
        && ours < theirs
    {
        return Some(Reason::SamePeriodMoreClean);
    }
    None
}

fn against_same_period(candidate: &Side, existing: &Side) -> Decision {
    if candidate.checksum == existing.checksum {
        return Decision::skip(Reason::SamePeriodNotDistinct);
    }
    if candidate.bytes <= existing.bytes
        && let Some((ours, theirs)) = both(candidate.errors, existing.errors)
        && ours >= theirs
    {
        let reason = if candidate.bytes < existing.bytes {
            Reason::SamePeriodLessBytes
        } else if ours > theirs {
            Reason::SamePeriodLessClean
        } else {
            Reason::SamePeriodLessDistinct
        };
        return Decision::skip(reason);
    }
    match replacement_reason(candidate, existing) {
        Some(reason) => Decision::archive(reason),
        None => Decision::skip(Reason::SamePeriod),
    }
}

fn against_earlier_period(candidate: &Side, earlier: &Side, period: Period) -> Decision {
    if candidate.checksum == earlier.checksum {
        return Decision::skip(Reason::EarlierNotDistinct(period));
    }
    if let Some((ours, theirs)) = both(candidate.errors, earlier.errors)
        && let Some((our_files, their_files)) = both(candidate.files, earlier.files)
        && ours > theirs
        && our_files <= their_files
        && candidate.bytes <= earlier.bytes
    {
        return Decision::skip(Reason::EarlierNotDistinctMaybe(period));
    }
    Decision::archive(Reason::NewPeriod)
}

/// Decides one candidate against the archive filed under its own period
/// (`exact`) and the most recent archive of any earlier period.
pub fn decide(
    candidate: &CandidateFacts,
    exact: Option<&RemoteArchiveRecord>,
    latest_earlier: Option<(&RemoteArchiveRecord, Period)>,
) -> Decision {
    if let Some(decision) = precheck(candidate) {
        return decision;
    }
    // precheck guarantees a fingerprint
    let Some(ours) = Side::candidate(candidate) else {
        return Decision::skip(Reason::NoDataDirectory);
    };
    if let Some(record) = exact {
        return against_same_period(&ours, &Side::record(record));
    }
    if let Some((record, period)) = latest_earlier {
        return against_earlier_period(&ours, &Side::record(record), period);
    }
    Decision::archive(Reason::NewPeriod)
}

/// Whether `a` should replace `b` when both crawled the same period. `a` must
/// not be older than `b`.
pub fn supersedes(a: &CandidateFacts, b: &CandidateFacts) -> Result<bool, ArchiverError> {
    if a.source_id != b.source_id {
        return Err(ArchiverError::SourceMismatch {
            left: a.label(),
            right: b.label(),
        });
    }
    if a.data_version < b.data_version {
        return Err(ArchiverError::FutureDataVersion {
            candidate: a.label(),
            incumbent: b.label(),
        });
    }
    let (Some(ours), Some(theirs)) = (Side::candidate(a), Side::candidate(b)) else {
        let missing = if a.data.is_none() { a.label() } else { b.label() };
        return Err(ArchiverError::PolicyViolation(format!(
            "crawl {missing} reached the pairwise comparison without a fingerprint"
        )));
    };
    Ok(replacement_reason(&ours, &theirs).is_some())
}

/// Folds same-period candidates, ordered by data version, down to one.
/// Returns the index of the winner, or `None` for an empty slice.
pub fn select_winner(candidates: &[CandidateFacts]) -> Result<Option<usize>, ArchiverError> {
    let mut winner: Option<usize> = None;
    for (idx, next) in candidates.iter().enumerate() {
        winner = match winner {
            None => Some(idx),
            Some(current) if supersedes(next, &candidates[current])? => Some(idx),
            keep => keep,
        };
    }
    Ok(winner)
}
