//! Bounded concurrent upserts and the run log bookkeeping around them.

use std::sync::Arc;

use anyhow::{Context, Result};
use nppes_core::{IngestError, IngestionRun, ProviderRecord, RunCounters, UpsertOutcome};
use nppes_storage::ProviderStore;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertTally {
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

type UpsertResult = Result<UpsertOutcome, IngestError>;

/// Runs at most `max_in_flight` upserts at once. [`UpsertScheduler::submit`]
/// waits for a free slot, which is what pauses the row producer upstream.
pub struct UpsertScheduler {
    store: Arc<dyn ProviderStore>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<UpsertResult>,
    tally: UpsertTally,
}

impl UpsertScheduler {
    pub fn new(store: Arc<dyn ProviderStore>, max_in_flight: usize) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tasks: JoinSet::new(),
            tally: UpsertTally::default(),
        }
    }

    pub async fn submit(&mut self, record: ProviderRecord) -> Result<()> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .context("upsert slots closed")?;
        self.reap_finished();

        let store = Arc::clone(&self.store);
        self.tasks.spawn(async move {
            let result = store
                .upsert_provider(&record)
                .await
                .map_err(|err| IngestError::UpsertFailed {
                    npi: record.npi.clone(),
                    message: err.to_string(),
                });
            drop(permit);
            result
        });
        Ok(())
    }

    /// Waits for every outstanding upsert and returns the final tally.
    pub async fn drain(mut self) -> UpsertTally {
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined);
        }
        self.tally
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined);
        }
    }

    fn record(&mut self, joined: Result<UpsertResult, JoinError>) {
        match joined {
            Ok(Ok(UpsertOutcome::Created)) => self.tally.created += 1,
            Ok(Ok(UpsertOutcome::Updated)) => self.tally.updated += 1,
            Ok(Err(IngestError::UpsertFailed { npi, message })) => {
                self.tally.failed += 1;
                warn!(%npi, error = %message, "upsert failed");
            }
            Ok(Err(err)) => {
                self.tally.failed += 1;
                warn!(error = %err, "upsert failed");
            }
            Err(err) => {
                self.tally.failed += 1;
                warn!(error = %err, "upsert task did not finish");
            }
        }
    }
}

/// Writes the start and completion entries of the ingestion run log.
#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn ProviderStore>,
}

impl RunTracker {
    pub fn new(store: Arc<dyn ProviderStore>) -> Self {
        Self { store }
    }

    pub async fn begin(&self, source_url: &str, source_file: &str) -> Result<IngestionRun> {
        let run = self
            .store
            .begin_run(source_url, source_file)
            .await
            .context("recording ingestion run start")?;
        info!(run_id = %run.id, source_url, source_file, "ingestion run started");
        Ok(run)
    }

    pub async fn complete(&self, run_id: Uuid, counters: &RunCounters) -> Result<IngestionRun> {
        self.store
            .complete_run(run_id, counters)
            .await
            .with_context(|| format!("recording completion of ingestion run {run_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nppes_storage::{MemoryProviderStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn record(npi: &str) -> ProviderRecord {
        ProviderRecord {
            npi: npi.to_string(),
            slug: format!("jane-doe-{npi}"),
            first_name: "Jane".into(),
            middle_name: None,
            last_name: "Doe".into(),
            credential: None,
            full_name: "Jane Doe".into(),
            gender: None,
            taxonomy_codes: vec!["2084P0800X".into()],
            specialties: vec!["Psychiatry".into()],
            practice_address1: None,
            practice_address2: None,
            practice_city: None,
            practice_state: None,
            practice_postal_code: None,
            practice_phone: None,
            deactivation_date: None,
            reactivation_date: None,
            last_updated: None,
            active: true,
        }
    }

    #[derive(Default)]
    struct SlowStore {
        inner: MemoryProviderStore,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ProviderStore for SlowStore {
        async fn upsert_provider(&self, record: &ProviderRecord) -> Result<UpsertOutcome, StoreError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let outcome = if record.npi.ends_with('7') {
                Err(StoreError::Rejected("simulated constraint violation".into()))
            } else {
                self.inner.upsert_provider(record).await
            };
            self.current.fetch_sub(1, Ordering::SeqCst);
            outcome
        }

        async fn begin_run(&self, source_url: &str, source_file: &str) -> Result<IngestionRun, StoreError> {
            self.inner.begin_run(source_url, source_file).await
        }

        async fn complete_run(&self, run_id: Uuid, counters: &RunCounters) -> Result<IngestionRun, StoreError> {
            self.inner.complete_run(run_id, counters).await
        }
    }

    #[tokio::test]
    async fn never_exceeds_in_flight_ceiling() {
        let store = Arc::new(SlowStore::default());
        let mut scheduler = UpsertScheduler::new(store.clone(), 3);
        for i in 0..20 {
            scheduler.submit(record(&format!("10000000{i:02}"))).await.unwrap();
        }
        let tally = scheduler.drain().await;

        let peak = store.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak {peak} exceeded ceiling");
        assert!(peak > 1, "upserts never overlapped");
        assert_eq!(tally.created + tally.failed, 20);
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let store = Arc::new(SlowStore::default());
        let mut scheduler = UpsertScheduler::new(store.clone(), 4);
        for npi in ["1000000001", "1000000007", "1000000017", "1000000002"] {
            scheduler.submit(record(npi)).await.unwrap();
        }
        let tally = scheduler.drain().await;
        assert_eq!(
            tally,
            UpsertTally {
                created: 2,
                updated: 0,
                failed: 2,
            }
        );
        assert_eq!(store.inner.provider_count().await, 2);
    }

    #[tokio::test]
    async fn repeated_npi_counts_as_update() {
        let store = Arc::new(MemoryProviderStore::new());
        let mut scheduler = UpsertScheduler::new(store.clone(), 1);
        scheduler.submit(record("1000000001")).await.unwrap();
        scheduler.submit(record("1000000001")).await.unwrap();
        let tally = scheduler.drain().await;
        assert_eq!(tally.created, 1);
        assert_eq!(tally.updated, 1);
    }

    #[tokio::test]
    async fn tracker_completes_a_run_once() {
        let store = Arc::new(MemoryProviderStore::new());
        let tracker = RunTracker::new(store.clone());
        let run = tracker.begin("auto", "nppes.zip").await.unwrap();
        assert!(!run.is_complete());

        let counters = RunCounters {
            processed: 3,
            created: 1,
            ..RunCounters::default()
        };
        let done = tracker.complete(run.id, &counters).await.unwrap();
        assert_eq!(done.counters, Some(counters));
        assert!(tracker.complete(run.id, &counters).await.is_err());
    }
}
