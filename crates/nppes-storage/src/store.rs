//! Provider store contract: upsert-by-npi plus the append-only ingestion run log.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nppes_core::{IngestionRun, ProviderRecord, RunCounters, UpsertOutcome};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("ingestion run {0} not found")]
    RunNotFound(Uuid),
    #[error("ingestion run {0} already completed")]
    RunAlreadyCompleted(Uuid),
    #[error("record rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// Insert the record if its npi is unknown, otherwise overwrite every other field.
    async fn upsert_provider(&self, record: &ProviderRecord) -> Result<UpsertOutcome, StoreError>;

    /// Append a run entry carrying only its identifying fields.
    async fn begin_run(&self, source_url: &str, source_file: &str)
        -> Result<IngestionRun, StoreError>;

    /// Write terminal counters and the completion timestamp. Allowed once per run.
    async fn complete_run(
        &self,
        run_id: Uuid,
        counters: &RunCounters,
    ) -> Result<IngestionRun, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgProviderStore {
    pool: PgPool,
}

impl PgProviderStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn to_db_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_db_count(n: Option<i64>) -> u64 {
    n.and_then(|v| u64::try_from(v).ok()).unwrap_or_default()
}

fn run_from_row(row: &PgRow) -> Result<IngestionRun, sqlx::Error> {
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;
    let counters = if completed_at.is_some() {
        Some(RunCounters {
            processed: from_db_count(row.try_get("processed")?),
            created: from_db_count(row.try_get("created")?),
            updated: from_db_count(row.try_get("updated")?),
            skipped: from_db_count(row.try_get("skipped")?),
            error_count: from_db_count(row.try_get("error_count")?),
        })
    } else {
        None
    };
    Ok(IngestionRun {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        source_file: row.try_get("source_file")?,
        started_at: row.try_get("started_at")?,
        completed_at,
        counters,
    })
}

#[async_trait]
impl ProviderStore for PgProviderStore {
    async fn upsert_provider(&self, record: &ProviderRecord) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO providers (
                npi, slug, first_name, middle_name, last_name, credential, full_name, gender,
                taxonomy_codes, specialties,
                practice_address1, practice_address2, practice_city, practice_state,
                practice_postal_code, practice_phone,
                deactivation_date, reactivation_date, last_updated, active
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
            )
            ON CONFLICT (npi) DO UPDATE SET
                slug = EXCLUDED.slug,
                first_name = EXCLUDED.first_name,
                middle_name = EXCLUDED.middle_name,
                last_name = EXCLUDED.last_name,
                credential = EXCLUDED.credential,
                full_name = EXCLUDED.full_name,
                gender = EXCLUDED.gender,
                taxonomy_codes = EXCLUDED.taxonomy_codes,
                specialties = EXCLUDED.specialties,
                practice_address1 = EXCLUDED.practice_address1,
                practice_address2 = EXCLUDED.practice_address2,
                practice_city = EXCLUDED.practice_city,
                practice_state = EXCLUDED.practice_state,
                practice_postal_code = EXCLUDED.practice_postal_code,
                practice_phone = EXCLUDED.practice_phone,
                deactivation_date = EXCLUDED.deactivation_date,
                reactivation_date = EXCLUDED.reactivation_date,
                last_updated = EXCLUDED.last_updated,
                active = EXCLUDED.active,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.npi)
        .bind(&record.slug)
        .bind(&record.first_name)
        .bind(&record.middle_name)
        .bind(&record.last_name)
        .bind(&record.credential)
        .bind(&record.full_name)
        .bind(&record.gender)
        .bind(&record.taxonomy_codes)
        .bind(&record.specialties)
        .bind(&record.practice_address1)
        .bind(&record.practice_address2)
        .bind(&record.practice_city)
        .bind(&record.practice_state)
        .bind(&record.practice_postal_code)
        .bind(&record.practice_phone)
        .bind(record.deactivation_date)
        .bind(record.reactivation_date)
        .bind(record.last_updated)
        .bind(record.active)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn begin_run(
        &self,
        source_url: &str,
        source_file: &str,
    ) -> Result<IngestionRun, StoreError> {
        let run = IngestionRun::started(source_url, source_file);
        sqlx::query(
            "INSERT INTO ingestion_runs (id, source_url, source_file, started_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(run.id)
        .bind(&run.source_url)
        .bind(&run.source_file)
        .bind(run.started_at)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        counters: &RunCounters,
    ) -> Result<IngestionRun, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE ingestion_runs SET
                completed_at = $2,
                processed = $3,
                created = $4,
                updated = $5,
                skipped = $6,
                error_count = $7
            WHERE id = $1 AND completed_at IS NULL
            RETURNING id, source_url, source_file, started_at, completed_at,
                      processed, created, updated, skipped, error_count
            "#,
        )
        .bind(run_id)
        .bind(Utc::now())
        .bind(to_db_count(counters.processed))
        .bind(to_db_count(counters.created))
        .bind(to_db_count(counters.updated))
        .bind(to_db_count(counters.skipped))
        .bind(to_db_count(counters.error_count))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(run_from_row(&row)?);
        }

        let exists = sqlx::query("SELECT 1 FROM ingestion_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        Err(if exists {
            StoreError::RunAlreadyCompleted(run_id)
        } else {
            StoreError::RunNotFound(run_id)
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    providers: HashMap<String, ProviderRecord>,
    runs: Vec<IngestionRun>,
}

/// Process-local store used for dry runs.
#[derive(Debug, Default)]
pub struct MemoryProviderStore {
    state: Mutex<MemoryState>,
}

impl MemoryProviderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn provider(&self, npi: &str) -> Option<ProviderRecord> {
        self.state.lock().await.providers.get(npi).cloned()
    }

    pub async fn provider_count(&self) -> usize {
        self.state.lock().await.providers.len()
    }

    /// Providers sorted by npi.
    pub async fn providers(&self) -> Vec<ProviderRecord> {
        let state = self.state.lock().await;
        let mut out = state.providers.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| a.npi.cmp(&b.npi));
        out
    }

    pub async fn runs(&self) -> Vec<IngestionRun> {
        self.state.lock().await.runs.clone()
    }
}

#[async_trait]
impl ProviderStore for MemoryProviderStore {
    async fn upsert_provider(&self, record: &ProviderRecord) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let previous = state.providers.insert(record.npi.clone(), record.clone());
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Created,
        })
    }

    async fn begin_run(
        &self,
        source_url: &str,
        source_file: &str,
    ) -> Result<IngestionRun, StoreError> {
        let run = IngestionRun::started(source_url, source_file);
        self.state.lock().await.runs.push(run.clone());
        Ok(run)
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        counters: &RunCounters,
    ) -> Result<IngestionRun, StoreError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if run.is_complete() {
            return Err(StoreError::RunAlreadyCompleted(run_id));
        }
        run.completed_at = Some(Utc::now());
        run.counters = Some(*counters);
        Ok(run.clone())
    }
}
