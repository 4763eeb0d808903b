//! Generic vocabulary file parser.
//!
//! Provides a streaming parser for the tab-delimited files of an OMOP
//! vocabulary export (`CONCEPT.csv`, `CONCEPT_RELATIONSHIP.csv`, ...).

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::marker::PhantomData;
use std::path::Path;

use csv::{Reader, ReaderBuilder, StringRecord};

use crate::types::{ParseStats, VocabConfig, VocabError, VocabResult};

/// Trait for types that can be parsed from vocabulary file rows.
pub trait VocabRecord: Sized {
    /// Expected column names for this record type.
    const EXPECTED_COLUMNS: &'static [&'static str];

    /// Parse a record from a CSV StringRecord.
    fn from_record(record: &StringRecord) -> VocabResult<Self>;

    /// Returns true if this record passes the given filter config.
    fn passes_filter(&self, config: &VocabConfig) -> bool;
}

/// A streaming parser for vocabulary files.
///
/// Reads record-by-record so a full `CONCEPT.csv` never has to sit in
/// memory as text.
pub struct VocabParser<R: Read, T: VocabRecord> {
    reader: Reader<R>,
    config: VocabConfig,
    stats: ParseStats,
    _marker: PhantomData<T>,
}

impl<T: VocabRecord> VocabParser<BufReader<File>, T> {
    /// Creates a new parser from a file path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or has invalid headers.
    pub fn from_path<P: AsRef<Path>>(path: P, config: VocabConfig) -> VocabResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(VocabError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Self::from_reader(reader, config)
    }

    /// Counts the data rows in a file (for progress reporting).
    pub fn count_lines<P: AsRef<Path>>(path: P) -> VocabResult<usize> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let count = reader.lines().count();
        // Header row
        Ok(count.saturating_sub(1))
    }
}

impl<R: Read, T: VocabRecord> VocabParser<R, T> {
    /// Creates a new parser from a reader.
    pub fn from_reader(reader: R, config: VocabConfig) -> VocabResult<Self> {
        // Athena exports are unquoted; concept names may contain stray quotes.
        let mut csv_reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(false)
            .quoting(false)
            .trim(csv::Trim::None)
            .from_reader(reader);

        Self::validate_headers(&mut csv_reader)?;

        Ok(Self {
            reader: csv_reader,
            config,
            stats: ParseStats::default(),
            _marker: PhantomData,
        })
    }

    fn validate_headers(reader: &mut Reader<R>) -> VocabResult<()> {
        let headers = reader.headers()?;
        let expected = T::EXPECTED_COLUMNS;

        if headers.len() < expected.len() {
            return Err(VocabError::InvalidHeader {
                expected: expected.len(),
                found: headers.len(),
            });
        }

        for (i, expected_col) in expected.iter().enumerate() {
            let found = headers.get(i).unwrap_or("");
            // UTF-8 BOM
            let found = found.trim_start_matches('\u{feff}');
            if !found.eq_ignore_ascii_case(expected_col) {
                return Err(VocabError::UnexpectedColumn {
                    position: i,
                    expected: expected_col.to_string(),
                    found: found.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Returns the number of records read so far.
    pub fn records_read(&self) -> usize {
        self.stats.total_records
    }

    /// Returns the statistics gathered so far.
    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    /// Returns the parser configuration.
    pub fn config(&self) -> &VocabConfig {
        &self.config
    }

    /// Parses all records into a Vec, applying filters.
    ///
    /// Unlike iteration, the first malformed row aborts the parse.
    pub fn parse_all(self) -> VocabResult<Vec<T>> {
        self.collect()
    }

    /// Parses records in batches, calling the callback for each batch.
    ///
    /// Malformed rows are logged and skipped.
    pub fn parse_batched<F>(mut self, mut callback: F) -> VocabResult<usize>
    where
        F: FnMut(Vec<T>) -> VocabResult<()>,
    {
        let batch_size = self.config.batch_size;
        let mut batch = Vec::with_capacity(batch_size);
        let mut total = 0;

        while let Some(result) = self.next() {
            let record = match result {
                Ok(record) => record,
                Err(VocabError::Csv(e)) if e.is_io_error() => return Err(VocabError::Csv(e)),
                Err(e) => {
                    tracing::warn!(row = self.stats.total_records, error = %e, "skipping malformed vocabulary row");
                    continue;
                }
            };
            batch.push(record);
            if batch.len() >= batch_size {
                total += batch.len();
                callback(std::mem::take(&mut batch))?;
                batch = Vec::with_capacity(batch_size);
            }
        }

        if !batch.is_empty() {
            total += batch.len();
            callback(batch)?;
        }

        tracing::debug!(
            total = self.stats.total_records,
            kept = self.stats.filtered_records,
            skipped = self.stats.skipped_records,
            errors = self.stats.error_count,
            "parsed vocabulary file"
        );
        Ok(total)
    }
}

impl<R: Read, T: VocabRecord> Iterator for VocabParser<R, T> {
    type Item = VocabResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut record = StringRecord::new();
            match self.reader.read_record(&mut record) {
                Ok(true) => {
                    self.stats.total_records += 1;

                    if record.is_empty() || record.iter().all(|f| f.trim().is_empty()) {
                        continue;
                    }

                    match T::from_record(&record) {
                        Ok(parsed) => {
                            if parsed.passes_filter(&self.config) {
                                self.stats.filtered_records += 1;
                                return Some(Ok(parsed));
                            }
                            self.stats.skipped_records += 1;
                            continue;
                        }
                        Err(e) => {
                            self.stats.error_count += 1;
                            return Some(Err(e));
                        }
                    }
                }
                Ok(false) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Helper functions for parsing vocabulary field values.
pub mod parse {
    use chrono::NaiveDate;
    use omop_types::ConceptId;

    use super::{VocabError, VocabResult};

    /// Parses a concept id.
    pub fn concept_id(value: &str) -> VocabResult<ConceptId> {
        value
            .trim()
            .parse::<ConceptId>()
            .map_err(|_| VocabError::InvalidConceptId {
                value: value.to_string(),
            })
    }

    /// Parses an optional concept id; blank means absent.
    pub fn optional_concept_id(value: &str) -> VocabResult<Option<ConceptId>> {
        if value.trim().is_empty() {
            Ok(None)
        } else {
            concept_id(value).map(Some)
        }
    }

    /// Parses a vocabulary date.
    ///
    /// Athena exports use `YYYYMMDD`; hand-maintained mapping files often use
    /// ISO `YYYY-MM-DD`, which is accepted too.
    pub fn date(value: &str) -> VocabResult<NaiveDate> {
        let value = value.trim();
        let format = match value.len() {
            8 => "%Y%m%d",
            10 => "%Y-%m-%d",
            _ => {
                return Err(VocabError::InvalidDate {
                    value: value.to_string(),
                })
            }
        };
        NaiveDate::parse_from_str(value, format).map_err(|_| VocabError::InvalidDate {
            value: value.to_string(),
        })
    }

    /// Returns the trimmed value, or `None` when blank.
    pub fn optional_text(value: &str) -> Option<String> {
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    /// Reads a required column by position.
    pub fn column<'r>(record: &'r csv::StringRecord, index: usize, name: &str) -> VocabResult<&'r str> {
        record.get(index).ok_or_else(|| VocabError::MissingColumn {
            column: name.to_string(),
        })
    }
}
