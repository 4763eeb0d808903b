//! Loader-specific types for vocabulary file processing.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or querying vocabulary data.
#[derive(Error, Debug)]
pub enum VocabError {
    /// I/O error reading a vocabulary file.
    #[error("IO error reading vocabulary file: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing error.
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    /// Invalid concept id.
    #[error("Invalid concept id: {value}")]
    InvalidConceptId {
        /// The invalid value that was encountered.
        value: String,
    },

    /// Missing required column in a vocabulary file.
    #[error("Missing required column: {column}")]
    MissingColumn {
        /// The name of the missing column.
        column: String,
    },

    /// Invalid date format (expected YYYYMMDD).
    #[error("Invalid date format: {value}")]
    InvalidDate {
        /// The invalid date value.
        value: String,
    },

    /// Validity window ends before it starts.
    #[error("Invalid validity window for {code}: {start} > {end}")]
    InvalidWindow {
        /// Code carrying the window.
        code: String,
        /// Window start.
        start: chrono::NaiveDate,
        /// Window end.
        end: chrono::NaiveDate,
    },

    /// File not found.
    #[error("File not found: {path}")]
    FileNotFound {
        /// The path that was not found.
        path: String,
    },

    /// Directory not found.
    #[error("Directory not found: {path}")]
    DirectoryNotFound {
        /// The path that was not found.
        path: String,
    },

    /// Required file missing from the vocabulary directory.
    #[error("Required vocabulary file not found: {file_type} in {directory}")]
    RequiredFileMissing {
        /// The type of file that was missing.
        file_type: String,
        /// The directory that was searched.
        directory: String,
    },

    /// Invalid header - column count mismatch.
    #[error("Invalid header: expected {expected} columns, found {found}")]
    InvalidHeader {
        /// Expected column count.
        expected: usize,
        /// Found column count.
        found: usize,
    },

    /// Unexpected column name.
    #[error("Unexpected column '{found}' at position {position}, expected '{expected}'")]
    UnexpectedColumn {
        /// The column position.
        position: usize,
        /// Expected column name.
        expected: String,
        /// Found column name.
        found: String,
    },

    /// Routing table could not be read.
    #[error("Invalid vocabulary routing table: {0}")]
    Routes(#[from] serde_json::Error),

    /// Live vocabulary query failed.
    #[error("Vocabulary query failed: {0}")]
    Query(String),
}

/// Result type for vocabulary operations.
pub type VocabResult<T> = Result<T, VocabError>;

/// Configuration for vocabulary file parsing.
#[derive(Debug, Clone)]
pub struct VocabConfig {
    /// Whether to drop rows carrying an `invalid_reason`.
    ///
    /// Off by default: retired concepts are still needed to map historic
    /// data inside their validity window.
    pub valid_only: bool,
    /// Batch size for processing (affects memory usage).
    pub batch_size: usize,
}

impl Default for VocabConfig {
    fn default() -> Self {
        Self {
            valid_only: false,
            batch_size: 10_000,
        }
    }
}

/// Statistics from parsing a vocabulary file.
#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    /// Total records read from file.
    pub total_records: usize,
    /// Records that passed filters.
    pub filtered_records: usize,
    /// Records skipped by filters.
    pub skipped_records: usize,
    /// Parse errors encountered (non-fatal).
    pub error_count: usize,
}

impl ParseStats {
    /// Returns the percentage of records that passed filters.
    pub fn filter_rate(&self) -> f64 {
        if self.total_records == 0 {
            0.0
        } else {
            (self.filtered_records as f64 / self.total_records as f64) * 100.0
        }
    }
}

/// Discovered vocabulary files in an export directory.
#[derive(Debug, Clone, Default)]
pub struct VocabFiles {
    /// Path to the `CONCEPT` file.
    pub concept_file: Option<PathBuf>,
    /// Path to the `CONCEPT_RELATIONSHIP` file.
    pub concept_relationship_file: Option<PathBuf>,
    /// Path to the `SOURCE_TO_CONCEPT_MAP` file.
    pub source_to_concept_file: Option<PathBuf>,
}

impl VocabFiles {
    /// Creates a new empty file set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if all required files (concept) are present.
    pub fn has_required_files(&self) -> bool {
        self.concept_file.is_some()
    }

    /// Returns a list of missing required files.
    pub fn missing_files(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.concept_file.is_none() {
            missing.push("CONCEPT");
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocab_config_default() {
        let config = VocabConfig::default();
        assert!(!config.valid_only);
        assert_eq!(config.batch_size, 10_000);
    }

    #[test]
    fn test_parse_stats_filter_rate() {
        let stats = ParseStats {
            total_records: 200,
            filtered_records: 50,
            ..Default::default()
        };
        assert!((stats.filter_rate() - 25.0).abs() < 0.01);
        assert_eq!(ParseStats::default().filter_rate(), 0.0);
    }

    #[test]
    fn test_vocab_files_missing() {
        let files = VocabFiles {
            concept_file: None,
            concept_relationship_file: Some(PathBuf::from("CONCEPT_RELATIONSHIP.csv")),
            ..Default::default()
        };

        assert!(!files.has_required_files());
        assert_eq!(files.missing_files(), vec!["CONCEPT"]);
    }
}
