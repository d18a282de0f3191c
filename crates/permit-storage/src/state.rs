use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use permit_core::{ArchiveRecord, CycleLogEntry, Fingerprint, HighWaterMark, SeenEntry};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StateError {
    /// The ledger cannot be trusted; new vs. duplicate is undecidable.
    #[error("state store is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serializing state: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, StateError::Corrupt(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveWrite {
    Inserted,
    /// Same `(source_id, fingerprint)` already archived; non-identity fields replaced.
    Refreshed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveFilter {
    pub source_id: Option<String>,
    pub archived_since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ArchiveFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(at: DateTime<Utc>) -> Self {
        Self {
            archived_since: Some(at),
            ..Self::default()
        }
    }

    pub fn for_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &ArchiveRecord) -> bool {
        self.source_id
            .as_deref()
            .map_or(true, |id| id == entry.source_id)
            && self
                .archived_since
                .map_or(true, |since| entry.archived_at >= since)
    }
}

/// Durable run-over-run state: the seen ledger, the archive, per-source
/// high-water marks and the cycle log.
///
/// Every write is individually atomic; nothing here is transactional across a
/// whole cycle.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Integrity check run before a cycle touches the ledger.
    async fn verify(&self) -> Result<(), StateError>;

    async fn is_seen(&self, source_id: &str, fingerprint: &Fingerprint)
        -> Result<bool, StateError>;

    /// Returns `false` when the entry already existed; `first_seen_at` is kept.
    async fn mark_seen(&self, entry: &SeenEntry) -> Result<bool, StateError>;

    /// Drops ledger entries first seen before `now - retention_days`. Archive rows
    /// are untouched.
    async fn prune_older_than(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<u64, StateError>;

    /// Upsert keyed on `(source_id, fingerprint)`.
    async fn append_archive(&self, record: &ArchiveRecord) -> Result<ArchiveWrite, StateError>;

    /// Oldest first.
    async fn load_archive(&self, filter: &ArchiveFilter) -> Result<Vec<ArchiveRecord>, StateError>;

    async fn ledger_size(&self) -> Result<u64, StateError>;

    async fn archive_size(&self) -> Result<u64, StateError>;

    async fn record_cycle(&self, entry: &CycleLogEntry) -> Result<(), StateError>;

    /// Newest first.
    async fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleLogEntry>, StateError>;

    async fn high_water_mark(&self, source_id: &str) -> Result<Option<HighWaterMark>, StateError>;

    /// Moves the mark forward only; an older `record_date` leaves the date as is.
    async fn advance_high_water_mark(
        &self,
        source_id: &str,
        record_date: Option<NaiveDate>,
        success_at: DateTime<Utc>,
    ) -> Result<HighWaterMark, StateError>;
}

pub(crate) fn retention_cutoff(retention_days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    now - ChronoDuration::days(i64::from(retention_days))
}

pub(crate) fn merge_high_water_mark(
    current: Option<HighWaterMark>,
    source_id: &str,
    record_date: Option<NaiveDate>,
    success_at: DateTime<Utc>,
) -> HighWaterMark {
    let previous_date = current.and_then(|m| m.last_record_date);
    HighWaterMark {
        source_id: source_id.to_string(),
        last_record_date: match (previous_date, record_date) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        },
        last_success_at: Some(success_at),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    seen: HashMap<(String, Fingerprint), DateTime<Utc>>,
    archive: Vec<ArchiveRecord>,
    archive_index: HashMap<(String, Fingerprint), usize>,
    cycles: Vec<CycleLogEntry>,
    watermarks: BTreeMap<String, HighWaterMark>,
}

/// Process-local store for tests and dry runs. Lost on exit, which degrades to
/// re-delivering everything on the next process start.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn verify(&self) -> Result<(), StateError> {
        let state = self.inner.lock().await;
        if state.archive_index.len() != state.archive.len() {
            return Err(StateError::Corrupt("archive index out of sync".into()));
        }
        Ok(())
    }

    async fn is_seen(
        &self,
        source_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StateError> {
        let state = self.inner.lock().await;
        Ok(state
            .seen
            .contains_key(&(source_id.to_string(), fingerprint.clone())))
    }

    async fn mark_seen(&self, entry: &SeenEntry) -> Result<bool, StateError> {
        let mut state = self.inner.lock().await;
        let key = (entry.source_id.clone(), entry.fingerprint.clone());
        if state.seen.contains_key(&key) {
            return Ok(false);
        }
        state.seen.insert(key, entry.first_seen_at);
        Ok(true)
    }

    async fn prune_older_than(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<u64, StateError> {
        let cutoff = retention_cutoff(retention_days, now);
        let mut state = self.inner.lock().await;
        let before = state.seen.len();
        state.seen.retain(|_, first_seen| *first_seen >= cutoff);
        Ok((before - state.seen.len()) as u64)
    }

    async fn append_archive(&self, record: &ArchiveRecord) -> Result<ArchiveWrite, StateError> {
        let mut state = self.inner.lock().await;
        let key = (record.source_id.clone(), record.fingerprint.clone());
        let existing_idx = state.archive_index.get(&key).copied();
        if let Some(idx) = existing_idx {
            let existing = &mut state.archive[idx];
            existing.record = record.record.clone();
            existing.updated_at = record.updated_at;
            return Ok(ArchiveWrite::Refreshed);
        }
        let idx = state.archive.len();
        state.archive.push(record.clone());
        state.archive_index.insert(key, idx);
        Ok(ArchiveWrite::Inserted)
    }

    async fn load_archive(&self, filter: &ArchiveFilter) -> Result<Vec<ArchiveRecord>, StateError> {
        let state = self.inner.lock().await;
        let mut rows: Vec<ArchiveRecord> = state
            .archive
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        rows.sort_by_key(|entry| entry.archived_at);
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn ledger_size(&self) -> Result<u64, StateError> {
        Ok(self.inner.lock().await.seen.len() as u64)
    }

    async fn archive_size(&self) -> Result<u64, StateError> {
        Ok(self.inner.lock().await.archive.len() as u64)
    }

    async fn record_cycle(&self, entry: &CycleLogEntry) -> Result<(), StateError> {
        self.inner.lock().await.cycles.push(entry.clone());
        Ok(())
    }

    async fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleLogEntry>, StateError> {
        let state = self.inner.lock().await;
        Ok(state.cycles.iter().rev().take(limit).cloned().collect())
    }

    async fn high_water_mark(&self, source_id: &str) -> Result<Option<HighWaterMark>, StateError> {
        Ok(self.inner.lock().await.watermarks.get(source_id).cloned())
    }

    async fn advance_high_water_mark(
        &self,
        source_id: &str,
        record_date: Option<NaiveDate>,
        success_at: DateTime<Utc>,
    ) -> Result<HighWaterMark, StateError> {
        let mut state = self.inner.lock().await;
        let merged = merge_high_water_mark(
            state.watermarks.get(source_id).cloned(),
            source_id,
            record_date,
            success_at,
        );
        state
            .watermarks
            .insert(source_id.to_string(), merged.clone());
        Ok(merged)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use permit_core::PermitRecord;

    pub(crate) fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).single().unwrap()
    }

    pub(crate) fn archive_entry(address: &str, at: DateTime<Utc>) -> ArchiveRecord {
        let mut record = PermitRecord::new("wilson", at);
        record.address = address.to_string();
        record.permit_type = "Addition".to_string();
        ArchiveRecord::from_record(record, at)
    }

    /// Exercises the contract every store implementation must satisfy.
    pub(crate) async fn exercise_store_contract(store: &dyn StateStore) {
        store.verify().await.unwrap();

        let entry = archive_entry("5 Main St", at(1));
        assert!(!store.is_seen("wilson", &entry.fingerprint).await.unwrap());

        let seen = SeenEntry {
            source_id: "wilson".into(),
            fingerprint: entry.fingerprint.clone(),
            first_seen_at: at(1),
        };
        assert!(store.mark_seen(&seen).await.unwrap());
        assert!(!store.mark_seen(&seen).await.unwrap());
        assert!(store.is_seen("wilson", &entry.fingerprint).await.unwrap());
        assert!(!store.is_seen("sumner", &entry.fingerprint).await.unwrap());

        assert_eq!(
            store.append_archive(&entry).await.unwrap(),
            ArchiveWrite::Inserted
        );
        let mut refreshed = entry.clone();
        refreshed.record.work_description = "revised scope".into();
        refreshed.updated_at = at(3);
        assert_eq!(
            store.append_archive(&refreshed).await.unwrap(),
            ArchiveWrite::Refreshed
        );
        assert_eq!(store.archive_size().await.unwrap(), 1);
        let rows = store.load_archive(&ArchiveFilter::all()).await.unwrap();
        assert_eq!(rows[0].record.work_description, "revised scope");
        assert_eq!(rows[0].archived_at, at(1));
        assert_eq!(rows[0].updated_at, at(3));

        // Ledger pruning never touches the archive.
        let pruned = store.prune_older_than(30, at(1) + ChronoDuration::days(45)).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.ledger_size().await.unwrap(), 0);
        assert_eq!(store.archive_size().await.unwrap(), 1);
        assert!(!store.is_seen("wilson", &entry.fingerprint).await.unwrap());

        let later = archive_entry("9 Oak Ave", at(5));
        store.append_archive(&later).await.unwrap();
        let since = store.load_archive(&ArchiveFilter::since(at(4))).await.unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].record.address, "9 Oak Ave");
        let other_source = store
            .load_archive(&ArchiveFilter::all().for_source("sumner"))
            .await
            .unwrap();
        assert!(other_source.is_empty());
        let limited = store
            .load_archive(&ArchiveFilter::all().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].record.address, "5 Main St");

        let mark = store
            .advance_high_water_mark("wilson", NaiveDate::from_ymd_opt(2026, 3, 4), at(5))
            .await
            .unwrap();
        assert_eq!(mark.last_record_date, NaiveDate::from_ymd_opt(2026, 3, 4));
        let mark = store
            .advance_high_water_mark("wilson", NaiveDate::from_ymd_opt(2026, 2, 1), at(6))
            .await
            .unwrap();
        assert_eq!(mark.last_record_date, NaiveDate::from_ymd_opt(2026, 3, 4));
        assert_eq!(mark.last_success_at, Some(at(6)));
        assert_eq!(store.high_water_mark("wilson").await.unwrap(), Some(mark));
        assert!(store.high_water_mark("sumner").await.unwrap().is_none());

        for day in [7, 8] {
            store
                .record_cycle(&CycleLogEntry {
                    run_id: uuid::Uuid::new_v4(),
                    started_at: at(day),
                    finished_at: at(day),
                    new_count: day as usize,
                    duplicate_count: 0,
                    errors: vec![permit_core::CollectorError::transient("wilson", "timeout")],
                })
                .await
                .unwrap();
        }
        let cycles = store.recent_cycles(5).await.unwrap();
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].new_count, 8);
        assert_eq!(cycles[0].errors[0].cause, "timeout");
    }

    #[tokio::test]
    async fn memory_store_honors_contract() {
        let store = MemoryStateStore::new();
        exercise_store_contract(&store).await;
    }
}
