//! Run configuration.

use chrono::NaiveDate;

use crate::error::{EtlError, EtlResult};
use crate::stage::Stage;

/// Load mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Replay the whole staging table with a worker pool.
    Bulk,
    /// Process changed resources single-threaded.
    Incremental,
}

/// Configuration for one ETL run. Immutable once the run starts.
#[derive(Debug, Clone)]
pub struct EtlConfig {
    /// Bulk load instead of incremental load.
    pub bulk_load: bool,
    /// Run exactly one stage (bulk load only).
    pub single_step: Option<Stage>,
    /// Whether medication statements are written at all.
    pub write_medication_statements: bool,
    /// Resolve references from in-memory indexes during bulk load.
    pub dictionary_in_ram: bool,
    /// Resources per chunk.
    pub chunk_size: usize,
    /// Worker threads during bulk load.
    pub throttle_limit: usize,
    /// Extra attempts for a chunk that failed with a retryable error.
    pub chunk_retries: u32,
    /// Earliest `last_updated` date to load.
    pub start_date: NaiveDate,
    /// Latest `last_updated` date to load.
    pub end_date: NaiveDate,
}

/// Lower bound meaning "no start filter".
pub fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1800, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Upper bound meaning "no end filter".
pub fn default_end_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2099, 12, 31).unwrap_or(NaiveDate::MAX)
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            bulk_load: false,
            single_step: None,
            write_medication_statements: true,
            dictionary_in_ram: true,
            chunk_size: 5_000,
            throttle_limit: 4,
            chunk_retries: 2,
            start_date: default_start_date(),
            end_date: default_end_date(),
        }
    }
}

impl EtlConfig {
    /// Returns the load mode.
    pub fn load_mode(&self) -> LoadMode {
        if self.bulk_load {
            LoadMode::Bulk
        } else {
            LoadMode::Incremental
        }
    }

    /// Returns true if references are resolved from in-memory indexes.
    pub fn uses_ram_dictionary(&self) -> bool {
        self.bulk_load && self.dictionary_in_ram
    }

    /// Returns true if the date bounds differ from the open default range.
    pub fn has_date_filter(&self) -> bool {
        self.start_date != default_start_date() || self.end_date != default_end_date()
    }

    /// Checks the configuration before a run.
    pub fn validate(&self) -> EtlResult<()> {
        if self.chunk_size == 0 {
            return Err(EtlError::Config("chunk size must be positive".to_string()));
        }
        if self.throttle_limit == 0 {
            return Err(EtlError::Config("throttle limit must be positive".to_string()));
        }
        if self.start_date > self.end_date {
            return Err(EtlError::Config(format!(
                "start date {} is after end date {}",
                self.start_date, self.end_date
            )));
        }
        if !self.bulk_load && self.single_step.is_some() {
            tracing::warn!("single step is ignored during incremental load");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EtlConfig::default();
        assert_eq!(config.load_mode(), LoadMode::Incremental);
        assert!(!config.has_date_filter());
        assert!(!config.uses_ram_dictionary());
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(1800, 1, 1).unwrap());
        assert_eq!(config.end_date, NaiveDate::from_ymd_opt(2099, 12, 31).unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = EtlConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EtlConfig {
            start_date: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(config.has_date_filter());
    }

    #[test]
    fn test_ram_dictionary_only_in_bulk() {
        let config = EtlConfig {
            bulk_load: true,
            ..Default::default()
        };
        assert_eq!(config.load_mode(), LoadMode::Bulk);
        assert!(config.uses_ram_dictionary());
    }
}
