//! Configurable predicates describing where things live in an NPPES archive.

use std::path::Path;

use anyhow::{Context, Result};
use nppes_core::TaxonomyIndex;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

/// Name and size of one entry in the archive's central directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub is_file: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EntryRuleConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub extension: Option<String>,
}

/// Compiled entry predicate. Patterns are case-insensitive regexes matched
/// anywhere in the entry name; an empty include list accepts every name.
#[derive(Debug, Clone)]
pub struct EntryRule {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    extension: Option<String>,
}

impl EntryRule {
    pub fn compile(rule: &EntryRuleConfig) -> Result<Self> {
        Ok(Self {
            include: compile_all(&rule.include)?,
            exclude: compile_all(&rule.exclude)?,
            extension: rule
                .extension
                .as_deref()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty()),
        })
    }

    pub fn matches(&self, entry: &EntryInfo) -> bool {
        if !entry.is_file {
            return false;
        }
        if let Some(ext) = &self.extension {
            let lower = entry.name.to_ascii_lowercase();
            if !lower.ends_with(&format!(".{ext}")) {
                return false;
            }
        }
        let included = self.include.is_empty() || self.include.iter().any(|re| re.is_match(&entry.name));
        included && !self.exclude.iter().any(|re| re.is_match(&entry.name))
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("compiling entry pattern {p:?}"))
        })
        .collect()
}

/// The professional category a run keeps.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CategoryFilter {
    /// Matched case-insensitively against a code's classification and specialization.
    pub keyword: String,
    /// Used on the raw code when no taxonomy reference was found in the archive.
    pub fallback_prefix: String,
    pub default_label: String,
}

impl Default for CategoryFilter {
    fn default() -> Self {
        Self {
            keyword: "psychiatry".to_string(),
            fallback_prefix: "2084P".to_string(),
            default_label: "Psychiatry".to_string(),
        }
    }
}

impl CategoryFilter {
    pub fn is_in_scope(&self, code: &str, taxonomy: &TaxonomyIndex) -> bool {
        if taxonomy.is_empty() {
            return code.starts_with(&self.fallback_prefix);
        }
        let Some(entry) = taxonomy.get(code) else {
            return false;
        };
        let keyword = self.keyword.to_lowercase();
        entry.classification.to_lowercase().contains(&keyword)
            || entry.specialization.to_lowercase().contains(&keyword)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveLayoutFile {
    pub archive_name: String,
    pub taxonomy: EntryRuleConfig,
    pub primary: EntryRuleConfig,
    pub category: CategoryFilter,
}

impl Default for ArchiveLayoutFile {
    fn default() -> Self {
        Self {
            archive_name: r"^NPPES_Data_Dissemination_\d+\.zip$".to_string(),
            taxonomy: EntryRuleConfig {
                include: vec!["taxonom".into(), "code.*value".into()],
                exclude: Vec::new(),
                extension: None,
            },
            primary: EntryRuleConfig {
                include: vec!["npidata".into(), "nppes".into()],
                exclude: vec![
                    "header".into(),
                    "code".into(),
                    "value".into(),
                    "endpoint".into(),
                    "other".into(),
                ],
                extension: Some("csv".into()),
            },
            category: CategoryFilter::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    pub archive_name: Regex,
    pub taxonomy: EntryRule,
    pub primary: EntryRule,
    pub category: CategoryFilter,
}

impl Default for ArchiveLayout {
    fn default() -> Self {
        Self::compile(&ArchiveLayoutFile::default()).expect("built-in archive layout compiles")
    }
}

impl ArchiveLayout {
    pub fn compile(file: &ArchiveLayoutFile) -> Result<Self> {
        Ok(Self {
            archive_name: RegexBuilder::new(&file.archive_name)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("compiling archive name pattern {:?}", file.archive_name))?,
            taxonomy: EntryRule::compile(&file.taxonomy).context("taxonomy rule")?,
            primary: EntryRule::compile(&file.primary).context("primary rule")?,
            category: file.category.clone(),
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: ArchiveLayoutFile = serde_yaml::from_str(text).context("parsing archive layout")?;
        Self::compile(&file)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// First entry that looks like the taxonomy reference table.
    pub fn find_taxonomy_entry<'a>(&self, entries: &'a [EntryInfo]) -> Option<&'a EntryInfo> {
        entries.iter().find(|e| self.taxonomy.matches(e))
    }

    /// Largest entry that looks like the primary provider data file.
    pub fn find_primary_entry<'a>(&self, entries: &'a [EntryInfo]) -> Option<&'a EntryInfo> {
        entries
            .iter()
            .filter(|e| self.primary.matches(e))
            .fold(None, |best: Option<&EntryInfo>, e| match best {
                Some(b) if b.size >= e.size => Some(b),
                _ => Some(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nppes_core::TaxonomyEntry;

    fn entry(index: usize, name: &str, size: u64) -> EntryInfo {
        EntryInfo {
            index,
            name: name.to_string(),
            size,
            is_file: true,
        }
    }

    fn dissemination_entries() -> Vec<EntryInfo> {
        vec![
            entry(0, "npidata_pfile_20050523-20250608_fileheader.csv", 4_000),
            entry(1, "npidata_pfile_20050523-20250608.csv", 9_000_000),
            entry(2, "othername_pfile_20050523-20250608.csv", 50_000),
            entry(3, "endpoint_pfile_20050523-20250608.csv", 40_000),
            entry(4, "pl_pfile_20050523-20250608.csv", 70_000),
            entry(5, "NPPES_Data_Dissemination_Readme.pdf", 10_000),
            entry(6, "nucc_taxonomy_250.csv", 300_000),
        ]
    }

    #[test]
    fn primary_entry_skips_auxiliary_files() {
        let layout = ArchiveLayout::default();
        let entries = dissemination_entries();
        let primary = layout.find_primary_entry(&entries).expect("primary");
        assert_eq!(primary.index, 1);
    }

    #[test]
    fn primary_entry_picks_largest_candidate() {
        let layout = ArchiveLayout::default();
        let entries = vec![
            entry(0, "nppes_small.csv", 10),
            entry(1, "nppes_big.csv", 1_000),
            entry(2, "npidata_mid.csv", 500),
        ];
        assert_eq!(layout.find_primary_entry(&entries).unwrap().index, 1);
    }

    #[test]
    fn directories_and_other_extensions_never_match() {
        let layout = ArchiveLayout::default();
        let mut dir = entry(0, "npidata/", 0);
        dir.is_file = false;
        let entries = vec![dir, entry(1, "npidata.txt", 100)];
        assert!(layout.find_primary_entry(&entries).is_none());
    }

    #[test]
    fn taxonomy_entry_matches_case_insensitively() {
        let layout = ArchiveLayout::default();
        let entries = vec![entry(0, "npidata.csv", 1), entry(1, "NUCC_Taxonomy.CSV", 2)];
        assert_eq!(layout.find_taxonomy_entry(&entries).unwrap().index, 1);
        let entries = vec![entry(0, "Code_Values_Table.csv", 2)];
        assert_eq!(layout.find_taxonomy_entry(&entries).unwrap().index, 0);
        assert!(layout.find_taxonomy_entry(&dissemination_entries()[..5]).is_none());
    }

    #[test]
    fn yaml_overrides_only_named_keys() {
        let layout = ArchiveLayout::from_yaml_str(
            "primary:\n  include: ['providers']\n  extension: csv\ncategory:\n  keyword: psychology\n  fallback_prefix: '103T'\n  default_label: Psychology\n",
        )
        .expect("layout");
        let entries = vec![entry(0, "npidata.csv", 10), entry(1, "providers.csv", 5)];
        assert_eq!(layout.find_primary_entry(&entries).unwrap().index, 1);
        assert_eq!(layout.category.default_label, "Psychology");
        assert!(layout.archive_name.is_match("NPPES_Data_Dissemination_0625.zip"));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = ArchiveLayout::from_yaml_str("taxonomy:\n  include: ['(unclosed']\n").unwrap_err();
        assert!(format!("{err:#}").contains("(unclosed"));
    }

    #[test]
    fn category_uses_lookup_when_present() {
        let category = CategoryFilter::default();
        let mut taxonomy = TaxonomyIndex::new();
        taxonomy.insert(
            "2084P0800X".into(),
            TaxonomyEntry::new("Psychiatry & Neurology", "Psychiatry"),
        );
        taxonomy.insert(
            "2084N0400X".into(),
            TaxonomyEntry::new("Psychiatry & Neurology", "Neurology"),
        );
        taxonomy.insert("207Q00000X".into(), TaxonomyEntry::new("Family Medicine", ""));

        assert!(category.is_in_scope("2084P0800X", &taxonomy));
        assert!(category.is_in_scope("2084N0400X", &taxonomy));
        assert!(!category.is_in_scope("207Q00000X", &taxonomy));
        assert!(!category.is_in_scope("2084P0802X", &taxonomy));
    }

    #[test]
    fn category_falls_back_to_prefix_without_lookup() {
        let category = CategoryFilter::default();
        let empty = TaxonomyIndex::new();
        assert!(category.is_in_scope("2084P0800X", &empty));
        assert!(!category.is_in_scope("207Q00000X", &empty));
    }
}
