//! Row-level classification and normalization of NPPES provider data.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use csv::ByteRecord;
use nppes_core::{full_name, provider_slug, ProviderRecord, TaxonomyIndex, MAX_TAXONOMY_CODES};
use thiserror::Error;

use crate::layout::CategoryFilter;

const INDIVIDUAL_ENTITY_TYPE: &str = "1";

mod column {
    pub const NPI: &str = "NPI";
    pub const ENTITY_TYPE: &str = "Entity Type Code";
    pub const FIRST_NAME: &str = "Provider First Name";
    pub const MIDDLE_NAME: &str = "Provider Middle Name";
    pub const LAST_NAME_LEGAL: &str = "Provider Last Name (Legal Name)";
    pub const LAST_NAME: &str = "Provider Last Name";
    pub const CREDENTIAL: &str = "Provider Credential Text";
    pub const GENDER: &str = "Provider Gender Code";
    pub const ADDRESS1: &str = "Provider Business Practice Location Address Line 1";
    pub const ADDRESS2: &str = "Provider Business Practice Location Address Line 2";
    pub const CITY: &str = "Provider Business Practice Location Address City Name";
    pub const STATE: &str = "Provider Business Practice Location Address State Name";
    pub const POSTAL_CODE: &str = "Provider Business Practice Location Address Postal Code";
    pub const PHONE: &str = "Provider Business Practice Location Address Telephone Number";
    pub const DEACTIVATION_DATE: &str = "NPI Deactivation Date";
    pub const REACTIVATION_DATE: &str = "NPI Reactivation Date";
    pub const LAST_UPDATE_DATE: &str = "Last Update Date";
    pub const TAXONOMY_CODE_PREFIX: &str = "Healthcare Provider Taxonomy Code_";
}

/// Column name to position, taken from a CSV header row.
#[derive(Debug, Clone, Default)]
pub struct HeaderIndex {
    positions: HashMap<String, usize>,
}

impl HeaderIndex {
    pub fn from_byte_record(headers: &ByteRecord) -> Self {
        let mut positions = HashMap::with_capacity(headers.len());
        for (i, raw) in headers.iter().enumerate() {
            let name = String::from_utf8_lossy(raw);
            let name = name.trim_start_matches('\u{feff}').trim();
            positions.entry(name.to_string()).or_insert(i);
        }
        Self { positions }
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// One untyped source row viewed through its header. Missing columns read as blank.
#[derive(Debug, Clone, Copy)]
pub struct RawRow<'a> {
    headers: &'a HeaderIndex,
    record: &'a ByteRecord,
}

impl<'a> RawRow<'a> {
    pub fn new(headers: &'a HeaderIndex, record: &'a ByteRecord) -> Self {
        Self { headers, record }
    }

    /// Trimmed field value, or `""` when the column is absent or the row is short.
    pub fn get(&self, column: &str) -> Cow<'a, str> {
        let Some(bytes) = self
            .headers
            .position(column)
            .and_then(|i| self.record.get(i))
        else {
            return Cow::Borrowed("");
        };
        match String::from_utf8_lossy(bytes) {
            Cow::Borrowed(s) => Cow::Borrowed(s.trim()),
            Cow::Owned(s) => Cow::Owned(s.trim().to_string()),
        }
    }

    /// First non-blank value among `columns`.
    pub fn first_of(&self, columns: &[&str]) -> Cow<'a, str> {
        columns
            .iter()
            .map(|c| self.get(c))
            .find(|v| !v.is_empty())
            .unwrap_or(Cow::Borrowed(""))
    }

    fn optional(&self, column: &str) -> Option<String> {
        let value = self.get(column);
        (!value.is_empty()).then(|| value.into_owned())
    }

    fn optional_date(&self, npi: &str, column: &'static str) -> Result<Option<NaiveDate>, RowError> {
        let value = self.get(column);
        if value.is_empty() {
            return Ok(None);
        }
        parse_source_date(&value)
            .map(Some)
            .ok_or_else(|| RowError::InvalidDate {
                npi: npi.to_string(),
                column,
                value: value.into_owned(),
            })
    }

    /// Non-blank taxonomy codes in column order.
    pub fn taxonomy_codes(&self) -> Vec<String> {
        (1..=MAX_TAXONOMY_CODES)
            .map(|i| self.get(&format!("{}{i}", column::TAXONOMY_CODE_PREFIX)))
            .filter(|code| !code.is_empty())
            .map(Cow::into_owned)
            .collect()
    }
}

/// Accepts the NPPES `MM/DD/YYYY` layout as well as ISO dates and RFC 3339 timestamps.
pub fn parse_source_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%m/%d/%Y")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotIndividual,
    MissingNpi,
    NoMatchingTaxonomy,
    MissingName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Provider(Box<ProviderRecord>),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("npi {npi}: unparseable {column} {value:?}")]
    InvalidDate {
        npi: String,
        column: &'static str,
        value: String,
    },
}

/// Turns raw rows into canonical provider records for one category.
#[derive(Debug, Clone)]
pub struct RowNormalizer {
    taxonomy: Arc<TaxonomyIndex>,
    category: CategoryFilter,
}

impl RowNormalizer {
    pub fn new(taxonomy: Arc<TaxonomyIndex>, category: CategoryFilter) -> Self {
        Self { taxonomy, category }
    }

    pub fn classify(&self, row: &RawRow<'_>) -> Result<RowOutcome, RowError> {
        if row.get(column::ENTITY_TYPE) != INDIVIDUAL_ENTITY_TYPE {
            return Ok(RowOutcome::Skipped(SkipReason::NotIndividual));
        }

        let npi = row.get(column::NPI);
        if npi.is_empty() {
            return Ok(RowOutcome::Skipped(SkipReason::MissingNpi));
        }

        let taxonomy_codes = row.taxonomy_codes();
        let in_scope = taxonomy_codes
            .iter()
            .filter(|code| self.category.is_in_scope(code, &self.taxonomy))
            .collect::<Vec<_>>();
        if in_scope.is_empty() {
            return Ok(RowOutcome::Skipped(SkipReason::NoMatchingTaxonomy));
        }

        let first_name = row.get(column::FIRST_NAME);
        let last_name = row.first_of(&[column::LAST_NAME_LEGAL, column::LAST_NAME]);
        if first_name.is_empty() || last_name.is_empty() {
            return Ok(RowOutcome::Skipped(SkipReason::MissingName));
        }

        let specialties = self.resolve_specialties(&in_scope);
        let middle_name = row.optional(column::MIDDLE_NAME);
        let full_name = full_name(&first_name, middle_name.as_deref(), &last_name);
        let slug = provider_slug(&full_name, &npi);

        let deactivation_date = row.optional_date(&npi, column::DEACTIVATION_DATE)?;
        let reactivation_date = row.optional_date(&npi, column::REACTIVATION_DATE)?;
        let last_updated = row.optional_date(&npi, column::LAST_UPDATE_DATE)?;

        Ok(RowOutcome::Provider(Box::new(ProviderRecord {
            npi: npi.to_string(),
            slug,
            first_name: first_name.into_owned(),
            middle_name,
            last_name: last_name.into_owned(),
            credential: row.optional(column::CREDENTIAL),
            full_name,
            gender: row.optional(column::GENDER),
            taxonomy_codes,
            specialties,
            practice_address1: row.optional(column::ADDRESS1),
            practice_address2: row.optional(column::ADDRESS2),
            practice_city: row.optional(column::CITY),
            practice_state: row.optional(column::STATE),
            practice_postal_code: row.optional(column::POSTAL_CODE),
            practice_phone: row.optional(column::PHONE),
            deactivation_date,
            reactivation_date,
            last_updated,
            active: deactivation_date.is_none(),
        })))
    }

    fn resolve_specialties(&self, codes: &[&String]) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for code in codes {
            let Some(label) = self.taxonomy.get(code.as_str()).and_then(|e| e.label()) else {
                continue;
            };
            if !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        }
        if labels.is_empty() {
            labels.push(self.category.default_label.clone());
        }
        labels
    }
}
