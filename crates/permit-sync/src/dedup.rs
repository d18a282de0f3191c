use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use permit_core::{ArchiveRecord, Fingerprint, PermitRecord, SeenEntry};
use permit_storage::{StateError, StateStore};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    /// Records delivered as new, in input order.
    pub new_records: Vec<PermitRecord>,
    pub duplicate_count: usize,
    /// Archive rows whose non-identity fields were replaced by a newer copy.
    pub refreshed: usize,
    /// Commit stopped early on cancellation; `new_records` holds what was committed.
    pub interrupted: bool,
}

/// Separates never-seen permits from ones already delivered.
///
/// Classification runs before anything is written, so a store error there
/// leaves the ledger untouched. Each commit appends the archive row before
/// marking the fingerprint seen: a crash in between re-delivers the permit
/// next cycle instead of losing it.
pub struct DedupEngine {
    store: Arc<dyn StateStore>,
    gate: Mutex<()>,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub async fn filter_new(
        &self,
        records: Vec<PermitRecord>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<DedupOutcome, StateError> {
        let _serialized = self.gate.lock().await;

        let mut pending: Vec<PermitRecord> = Vec::new();
        let mut pending_index: HashMap<(String, Fingerprint), usize> = HashMap::new();
        let mut known: Vec<PermitRecord> = Vec::new();
        let mut duplicate_count = 0usize;

        for record in records {
            let key = (record.source_id.clone(), record.fingerprint());
            if let Some(&slot) = pending_index.get(&key) {
                // Same permit twice in one batch: keep the later copy's fields.
                pending[slot] = record;
                duplicate_count += 1;
                continue;
            }
            if self.store.is_seen(&key.0, &key.1).await? {
                duplicate_count += 1;
                known.push(record);
                continue;
            }
            pending_index.insert(key, pending.len());
            pending.push(record);
        }

        let mut outcome = DedupOutcome {
            duplicate_count,
            ..DedupOutcome::default()
        };

        for record in pending {
            if cancel.is_cancelled() {
                warn!(committed = outcome.new_records.len(), "dedup commit interrupted");
                outcome.interrupted = true;
                return Ok(outcome);
            }
            let archive = ArchiveRecord::from_record(record, now);
            self.store.append_archive(&archive).await?;
            let first_delivery = self
                .store
                .mark_seen(&SeenEntry {
                    source_id: archive.source_id.clone(),
                    fingerprint: archive.fingerprint.clone(),
                    first_seen_at: now,
                })
                .await?;
            if !first_delivery {
                debug!(
                    source_id = %archive.source_id,
                    fingerprint = %archive.fingerprint,
                    "ledger entry appeared concurrently"
                );
            }
            outcome.new_records.push(archive.record);
        }

        for record in known {
            if cancel.is_cancelled() {
                outcome.interrupted = true;
                break;
            }
            self.store
                .append_archive(&ArchiveRecord::from_record(record, now))
                .await?;
            outcome.refreshed += 1;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use permit_storage::{ArchiveFilter, MemoryStateStore};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 6, 0, 0).single().unwrap()
    }

    fn permit(number: &str, address: &str, permit_type: &str) -> PermitRecord {
        let mut r = PermitRecord::new("nashville", at(1));
        r.permit_number = number.into();
        r.address = address.into();
        r.permit_type = permit_type.into();
        r.issue_date = NaiveDate::from_ymd_opt(2026, 2, 27);
        r
    }

    fn engine() -> (Arc<MemoryStateStore>, DedupEngine) {
        let store = Arc::new(MemoryStateStore::new());
        let engine = DedupEngine::new(store.clone());
        (store, engine)
    }

    #[tokio::test]
    async fn second_pass_over_same_input_finds_nothing_new() {
        let (store, engine) = engine();
        let batch = vec![
            permit("1", "100 Broadway", "Addition"),
            permit("2", "7 Elm St", "Remodel"),
        ];
        let cancel = CancellationToken::new();

        let first = engine.filter_new(batch.clone(), at(2), &cancel).await.unwrap();
        assert_eq!(first.new_records.len(), 2);
        assert_eq!(first.duplicate_count, 0);

        let second = engine.filter_new(batch, at(3), &cancel).await.unwrap();
        assert!(second.new_records.is_empty());
        assert_eq!(second.duplicate_count, 2);
        assert_eq!(second.refreshed, 2);
        assert_eq!(store.ledger_size().await.unwrap(), 2);
        assert_eq!(store.archive_size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn intra_batch_and_ledger_duplicates_are_both_counted() {
        let (_store, engine) = engine();
        let cancel = CancellationToken::new();
        engine
            .filter_new(vec![permit("0", "9 Old Hickory Blvd", "Pool")], at(2), &cancel)
            .await
            .unwrap();

        let batch = vec![
            permit("1", "100 Broadway", "Addition"),
            permit("1b", " 100  BROADWAY", "addition"),
            permit("2", "7 Elm St", "Remodel"),
            permit("3", "9 Old Hickory Blvd", "Pool"),
            permit("4", "55 Music Sq", "Sign"),
        ];
        let outcome = engine.filter_new(batch, at(3), &cancel).await.unwrap();
        assert_eq!(outcome.new_records.len(), 3);
        assert_eq!(outcome.duplicate_count, 2);
        // The later copy of the in-batch duplicate wins.
        assert_eq!(outcome.new_records[0].permit_number, "1b");
    }

    #[tokio::test]
    async fn ledger_duplicate_refreshes_archive_fields() {
        let (store, engine) = engine();
        let cancel = CancellationToken::new();
        let original = permit("1", "100 Broadway", "Addition");
        engine.filter_new(vec![original.clone()], at(2), &cancel).await.unwrap();

        let mut revised = original;
        revised.estimated_value = 80_000.0;
        revised.status = Some("Issued".into());
        engine.filter_new(vec![revised], at(4), &cancel).await.unwrap();

        let archive = store.load_archive(&ArchiveFilter::all()).await.unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].record.estimated_value, 80_000.0);
        assert_eq!(archive[0].archived_at, at(2));
        assert_eq!(archive[0].updated_at, at(4));
    }

    #[tokio::test]
    async fn pruned_permit_is_new_again_without_a_second_archive_row() {
        let (store, engine) = engine();
        let cancel = CancellationToken::new();
        let record = permit("1", "100 Broadway", "Addition");
        engine.filter_new(vec![record.clone()], at(1), &cancel).await.unwrap();

        let pruned = store.prune_older_than(2, at(10)).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.archive_size().await.unwrap(), 1);

        let again = engine.filter_new(vec![record], at(10), &cancel).await.unwrap();
        assert_eq!(again.new_records.len(), 1);
        assert_eq!(store.ledger_size().await.unwrap(), 1);
        assert_eq!(store.archive_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_commit_writes_nothing_further() {
        let (store, engine) = engine();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = engine
            .filter_new(vec![permit("1", "100 Broadway", "Addition")], at(2), &cancel)
            .await
            .unwrap();
        assert!(outcome.interrupted);
        assert!(outcome.new_records.is_empty());
        assert_eq!(store.ledger_size().await.unwrap(), 0);
        assert_eq!(store.archive_size().await.unwrap(), 0);
    }
}
