use crate::archiver::crawl::Period;
use crate::archiver::metadata::{
    METADATA_OBJECT, RemoteArchiveRecord, final_prefix, object_key, period_from_metadata_key,
};
use crate::archiver::store::ObjectStore;
use crate::error::ArchiverError;
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

/// Read side of the bucket: which periods of a source already hold a
/// committed archive, and what that archive recorded.
///
/// A period counts as archived once its final `metadata.json` exists; the
/// data blob alone never does. Period listings are cached per source for the
/// lifetime of the index, so callers that commit must call [`Self::forget`].
/// Dry runs register would-be commits with [`Self::assume_committed`]; those
/// records shadow the bucket for the rest of the run.
pub struct RemoteArchiveIndex<'a> {
    store: &'a dyn ObjectStore,
    floor_year: i32,
    periods: RefCell<BTreeMap<String, BTreeSet<Period>>>,
    assumed: RefCell<BTreeMap<(String, Period), RemoteArchiveRecord>>,
}

impl<'a> RemoteArchiveIndex<'a> {
    pub fn new(store: &'a dyn ObjectStore, floor_year: i32) -> Self {
        Self {
            store,
            floor_year,
            periods: RefCell::new(BTreeMap::new()),
            assumed: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn archived_periods(&self, source_id: &str) -> Result<BTreeSet<Period>> {
        let mut periods = self.listed_periods(source_id)?;
        periods.extend(
            self.assumed
                .borrow()
                .keys()
                .filter(|(source, _)| source == source_id)
                .map(|(_, period)| *period),
        );
        Ok(periods)
    }

    fn listed_periods(&self, source_id: &str) -> Result<BTreeSet<Period>> {
        if let Some(cached) = self.periods.borrow().get(source_id) {
            return Ok(cached.clone());
        }
        let prefix = format!("{source_id}/");
        let keys = self
            .store
            .list(&prefix)
            .map_err(ArchiverError::from)
            .with_context(|| format!("failed to list archives under {prefix}"))?;
        let periods = keys
            .iter()
            .filter_map(|key| period_from_metadata_key(source_id, key))
            .collect::<BTreeSet<_>>();
        tracing::debug!(source = source_id, periods = periods.len(), "listed archived periods");
        self.periods
            .borrow_mut()
            .insert(source_id.to_string(), periods.clone());
        Ok(periods)
    }

    /// Drops the cached listing for `source_id` after a commit changed it.
    pub fn forget(&self, source_id: &str) {
        self.periods.borrow_mut().remove(source_id);
    }

    /// Answers later queries as if `record` had been committed, without
    /// touching the bucket.
    pub fn assume_committed(&self, record: RemoteArchiveRecord) {
        tracing::debug!(source = %record.source_id, period = %record.period, "assuming archive for dry run");
        self.assumed
            .borrow_mut()
            .insert((record.source_id.clone(), record.period), record);
    }

    pub fn query_exact(
        &self,
        source_id: &str,
        period: Period,
    ) -> Result<Option<RemoteArchiveRecord>> {
        if !self.archived_periods(source_id)?.contains(&period) {
            return Ok(None);
        }
        self.read_record(source_id, period)
    }

    /// Most recent archive strictly before `period`, no earlier than January
    /// of the floor year.
    pub fn query_latest_before(
        &self,
        source_id: &str,
        period: Period,
    ) -> Result<Option<(RemoteArchiveRecord, Period)>> {
        let periods = self.archived_periods(source_id)?;
        let Some(floor) = Period::new(self.floor_year, 1) else {
            return Ok(None);
        };
        if period <= floor {
            return Ok(None);
        }
        let Some(found) = periods.range(floor..period).next_back().copied() else {
            return Ok(None);
        };
        Ok(self
            .read_record(source_id, found)?
            .map(|record| (record, found)))
    }

    fn read_record(&self, source_id: &str, period: Period) -> Result<Option<RemoteArchiveRecord>> {
        if let Some(record) = self.assumed.borrow().get(&(source_id.to_string(), period)) {
            return Ok(Some(record.clone()));
        }
        let key = object_key(&final_prefix(source_id, period), METADATA_OBJECT);
        let raw = self
            .store
            .get(&key)
            .map_err(ArchiverError::from)
            .with_context(|| format!("failed to read {key}"))?;
        match raw {
            Some(raw) => Ok(Some(RemoteArchiveRecord::from_json(&raw, &key)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::store::memory::{MemoryObjectStore, Op};

    fn metadata(source: &str, period: &str, checksum: &str, bytes: u64) -> Vec<u8> {
        format!(
            r#"{{"source_id":"{source}","period":"{period}","checksum":"{checksum}","bytes":{bytes},"file_count":1,"error_count":0}}"#
        )
        .into_bytes()
    }

    fn p(year: i32, month: u32) -> Period {
        Period::new(year, month).expect("period")
    }

    #[test]
    fn exact_query_reads_metadata_and_ignores_orphan_data() {
        let store = MemoryObjectStore::new();
        store.insert(
            "scotland/2020/09/metadata.json",
            &metadata("scotland", "202009", "c1", 239),
        );
        store.insert("scotland/2020/10/data.tar.gz", b"orphan");
        let index = RemoteArchiveIndex::new(&store, 2000);

        let found = index
            .query_exact("scotland", p(2020, 9))
            .expect("query")
            .expect("record");
        assert_eq!(found.bytes, 239);
        assert_eq!(found.checksum, "c1");
        assert!(index.query_exact("scotland", p(2020, 10)).expect("query").is_none());
        assert!(index.query_exact("wales", p(2020, 9)).expect("query").is_none());
    }

    #[test]
    fn latest_before_walks_back_to_nearest_archive() {
        let store = MemoryObjectStore::new();
        store.insert("s/2019/11/metadata.json", &metadata("s", "201911", "old", 10));
        store.insert("s/2020/03/metadata.json", &metadata("s", "202003", "mid", 20));
        store.insert("s/2020/09/metadata.json", &metadata("s", "202009", "same", 30));
        let index = RemoteArchiveIndex::new(&store, 2000);

        let (record, period) = index
            .query_latest_before("s", p(2020, 9))
            .expect("query")
            .expect("found");
        assert_eq!(period, p(2020, 3));
        assert_eq!(record.checksum, "mid");

        let (_, period) = index
            .query_latest_before("s", p(2020, 3))
            .expect("query")
            .expect("found");
        assert_eq!(period, p(2019, 11));
        assert!(index.query_latest_before("s", p(2019, 11)).expect("query").is_none());
    }

    #[test]
    fn latest_before_stops_at_floor_year() {
        let store = MemoryObjectStore::new();
        store.insert("s/2009/12/metadata.json", &metadata("s", "200912", "c", 1));
        let index = RemoteArchiveIndex::new(&store, 2010);
        assert!(index.query_latest_before("s", p(2012, 1)).expect("query").is_none());
    }

    #[test]
    fn listing_happens_once_per_source_until_forgotten() {
        let store = MemoryObjectStore::new();
        let index = RemoteArchiveIndex::new(&store, 2000);
        index.query_exact("s", p(2020, 9)).expect("query");
        index.query_latest_before("s", p(2020, 9)).expect("query");
        store.insert("s/2020/09/metadata.json", &metadata("s", "202009", "c", 1));
        assert!(index.query_exact("s", p(2020, 9)).expect("query").is_none());

        index.forget("s");
        assert!(index.query_exact("s", p(2020, 9)).expect("query").is_some());
    }

    #[test]
    fn assumed_commits_shadow_the_bucket() {
        let store = MemoryObjectStore::new();
        store.insert("s/2020/09/metadata.json", &metadata("s", "202009", "old", 10));
        let index = RemoteArchiveIndex::new(&store, 2000);
        index.query_exact("s", p(2020, 9)).expect("query");

        for (period, checksum, bytes) in [(p(2020, 9), "new", 20), (p(2020, 11), "nov", 30)] {
            index.assume_committed(RemoteArchiveRecord {
                source_id: "s".to_string(),
                period,
                checksum: checksum.to_string(),
                bytes,
                file_count: Some(1),
                error_count: Some(0),
            });
        }

        let exact = index.query_exact("s", p(2020, 9)).expect("query").expect("record");
        assert_eq!(exact.checksum, "new");
        let (record, period) = index
            .query_latest_before("s", p(2020, 12))
            .expect("query")
            .expect("found");
        assert_eq!((record.bytes, period), (30, p(2020, 11)));
        assert!(index.query_exact("other", p(2020, 11)).expect("query").is_none());
        assert!(store.writes().is_empty());
    }

    #[test]
    fn store_errors_propagate() {
        let store = MemoryObjectStore::new();
        store.fail_next(Op::List);
        let index = RemoteArchiveIndex::new(&store, 2000);
        let err = index.query_exact("s", p(2020, 9)).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(ArchiverError::Remote(_))
        ));
    }
}
