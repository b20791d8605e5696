//! Core domain model and run provenance types for NPPES provider ingestion.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nppes-core";

/// Number of positional taxonomy columns on an NPPES data row.
pub const MAX_TAXONOMY_CODES: usize = 15;

/// Classification labels for one taxonomy code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaxonomyEntry {
    pub classification: String,
    pub specialization: String,
}

impl TaxonomyEntry {
    pub fn new(classification: impl Into<String>, specialization: impl Into<String>) -> Self {
        Self {
            classification: classification.into(),
            specialization: specialization.into(),
        }
    }

    /// Human-readable label: the specialization when present, else the classification.
    pub fn label(&self) -> Option<&str> {
        [self.specialization.as_str(), self.classification.as_str()]
            .into_iter()
            .find(|s| !s.is_empty())
    }
}

/// `code -> labels` lookup, built once per run and read-only afterwards.
pub type TaxonomyIndex = HashMap<String, TaxonomyEntry>;

/// Canonical provider record handed to the store, keyed by `npi`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub npi: String,
    pub slug: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub credential: Option<String>,
    pub full_name: String,
    pub gender: Option<String>,
    pub taxonomy_codes: Vec<String>,
    pub specialties: Vec<String>,
    pub practice_address1: Option<String>,
    pub practice_address2: Option<String>,
    pub practice_city: Option<String>,
    pub practice_state: Option<String>,
    pub practice_postal_code: Option<String>,
    pub practice_phone: Option<String>,
    pub deactivation_date: Option<NaiveDate>,
    pub reactivation_date: Option<NaiveDate>,
    pub last_updated: Option<NaiveDate>,
    pub active: bool,
}

/// What the store did with an upserted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Terminal counters written to the ingestion run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunCounters {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub error_count: u64,
}

impl RunCounters {
    pub fn record_upsert(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }
}

/// One entry in the append-only ingestion run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: Uuid,
    pub source_url: String,
    pub source_file: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: Option<RunCounters>,
}

impl IngestionRun {
    pub fn started(source_url: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.into(),
            source_file: source_file.into(),
            started_at: Utc::now(),
            completed_at: None,
            counters: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Fatal pipeline errors. Per-row and per-upsert failures never surface here
/// except as [`IngestError::UpsertFailed`] values that callers count and log.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("archive download failed: {0}")]
    DownloadFailed(String),
    #[error("no qualifying provider data file in archive {0}")]
    NoDataFile(String),
    #[error("upsert failed for npi {npi}: {message}")]
    UpsertFailed { npi: String, message: String },
}

/// Join non-empty name parts with single spaces.
pub fn full_name(first: &str, middle: Option<&str>, last: &str) -> String {
    [Some(first), middle, Some(last)]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// URL-safe slug: lowercase ASCII alphanumerics separated by single dashes.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Slug for a provider, unique because the npi is part of it.
pub fn provider_slug(full_name: &str, npi: &str) -> String {
    slugify(&format!("{full_name}-{npi}"))
}
