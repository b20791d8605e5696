//! NPPES archive adapters: archive discovery, entry selection, taxonomy lookup
//! and streaming provider extraction.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use anyhow::{Context, Result};
use csv::ByteRecord;
use nppes_core::{IngestError, ProviderRecord, TaxonomyEntry, TaxonomyIndex};
use tracing::{debug, info, warn};
use zip::ZipArchive;

pub mod layout;
pub mod locator;
pub mod rows;

pub use layout::{ArchiveLayout, ArchiveLayoutFile, CategoryFilter, EntryInfo, EntryRule, EntryRuleConfig};
pub use locator::{latest_archive_link, resolve_archive_url};
pub use rows::{HeaderIndex, RawRow, RowError, RowNormalizer, RowOutcome, SkipReason};

pub const CRATE_NAME: &str = "nppes-adapters";

const PROGRESS_EVERY_ROWS: u64 = 100_000;

const TAXONOMY_CODE_COLUMNS: &[&str] = &["Code", "Healthcare Provider Taxonomy Code"];
const TAXONOMY_CLASSIFICATION_COLUMNS: &[&str] = &["Classification", "Classification Name"];
const TAXONOMY_SPECIALIZATION_COLUMNS: &[&str] = &["Specialization", "Specialization Name"];

/// Row-level tallies from streaming the primary data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStats {
    pub processed: u64,
    pub emitted: u64,
    pub skipped: u64,
    pub row_errors: u64,
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader)
}

/// A dissemination archive opened for random access.
pub struct NppesArchive<R: Read + Seek> {
    archive: ZipArchive<R>,
    label: String,
}

impl NppesArchive<File> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening archive {}", path.display()))?;
        Self::from_reader(file, path.display().to_string())
    }
}

impl<R: Read + Seek> NppesArchive<R> {
    pub fn from_reader(reader: R, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let archive =
            ZipArchive::new(reader).with_context(|| format!("reading zip directory of {label}"))?;
        Ok(Self { archive, label })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn entries(&mut self) -> Result<Vec<EntryInfo>> {
        (0..self.archive.len())
            .map(|index| {
                let entry = self
                    .archive
                    .by_index_raw(index)
                    .with_context(|| format!("reading entry {index} of {}", self.label))?;
                Ok(EntryInfo {
                    index,
                    name: entry.name().to_string(),
                    size: entry.size(),
                    is_file: !entry.is_dir(),
                })
            })
            .collect()
    }

    /// Builds the code lookup from the taxonomy reference entry. An archive without
    /// one yields an empty lookup so callers fall back to prefix matching.
    pub fn build_taxonomy_index(&mut self, layout: &ArchiveLayout) -> Result<TaxonomyIndex> {
        let entries = self.entries()?;
        let Some(entry) = layout.find_taxonomy_entry(&entries) else {
            info!(archive = %self.label, "no taxonomy reference entry; using code prefix fallback");
            return Ok(TaxonomyIndex::new());
        };

        let file = self
            .archive
            .by_index(entry.index)
            .with_context(|| format!("opening taxonomy entry {}", entry.name))?;
        let index = read_taxonomy_csv(file).with_context(|| format!("reading {}", entry.name))?;
        info!(entry = %entry.name, codes = index.len(), "taxonomy lookup built");
        Ok(index)
    }

    /// The entry holding provider rows. Fails with [`IngestError::NoDataFile`].
    pub fn primary_entry(&mut self, layout: &ArchiveLayout) -> Result<EntryInfo> {
        let entries = self.entries()?;
        layout
            .find_primary_entry(&entries)
            .cloned()
            .ok_or_else(|| IngestError::NoDataFile(self.label.clone()).into())
    }

    /// Streams `entry` row by row, handing each qualifying record to `sink`.
    /// Stops early once `limit` rows have been read; a limit of zero reads every
    /// row. Returning an error from `sink` aborts the stream.
    pub fn stream_providers<F>(
        &mut self,
        entry: &EntryInfo,
        normalizer: &RowNormalizer,
        limit: Option<u64>,
        mut sink: F,
    ) -> Result<StreamStats>
    where
        F: FnMut(ProviderRecord) -> Result<()>,
    {
        let file = self
            .archive
            .by_index(entry.index)
            .with_context(|| format!("opening data entry {}", entry.name))?;
        let mut reader = csv_reader(file);
        let headers = HeaderIndex::from_byte_record(
            reader
                .byte_headers()
                .with_context(|| format!("reading header of {}", entry.name))?,
        );

        let limit = limit.filter(|max| *max > 0);
        let mut stats = StreamStats::default();
        let mut record = ByteRecord::new();
        loop {
            if limit.is_some_and(|max| stats.processed >= max) {
                info!(limit = ?limit, "row limit reached");
                break;
            }
            match reader.read_byte_record(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) if err.is_io_error() => {
                    return Err(err).with_context(|| format!("streaming {}", entry.name));
                }
                Err(err) => {
                    stats.processed += 1;
                    stats.row_errors += 1;
                    warn!(error = %err, "malformed row");
                    continue;
                }
            }
            stats.processed += 1;

            match normalizer.classify(&RawRow::new(&headers, &record)) {
                Ok(RowOutcome::Provider(provider)) => {
                    stats.emitted += 1;
                    sink(*provider)?;
                }
                Ok(RowOutcome::Skipped(reason)) => {
                    stats.skipped += 1;
                    debug!(?reason, "row skipped");
                }
                Err(err) => {
                    stats.row_errors += 1;
                    warn!(error = %err, "row rejected");
                }
            }

            if stats.processed % PROGRESS_EVERY_ROWS == 0 {
                info!(
                    processed = stats.processed,
                    emitted = stats.emitted,
                    skipped = stats.skipped,
                    "streaming provider rows"
                );
            }
        }

        Ok(stats)
    }
}

fn read_taxonomy_csv<R: Read>(reader: R) -> Result<TaxonomyIndex> {
    let mut reader = csv_reader(reader);
    let headers = HeaderIndex::from_byte_record(reader.byte_headers().context("reading header")?);

    let mut index = TaxonomyIndex::new();
    let mut record = ByteRecord::new();
    loop {
        match reader.read_byte_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) if err.is_io_error() => return Err(err).context("streaming taxonomy rows"),
            Err(err) => {
                warn!(error = %err, "malformed taxonomy row");
                continue;
            }
        }
        let row = RawRow::new(&headers, &record);
        let code = row.first_of(TAXONOMY_CODE_COLUMNS);
        if code.is_empty() {
            continue;
        }
        index.insert(
            code.into_owned(),
            TaxonomyEntry::new(
                row.first_of(TAXONOMY_CLASSIFICATION_COLUMNS),
                row.first_of(TAXONOMY_SPECIALIZATION_COLUMNS),
            ),
        );
    }
    Ok(index)
}
