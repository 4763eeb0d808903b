//! Identity records for referenced entities.

use crate::SurrogateId;

/// Surrogate id of a person or visit together with its two natural keys.
///
/// Within one run at most one record exists per logical id and per
/// identifier; when both keys are present they resolve to the same
/// surrogate id.
///
/// # Examples
///
/// ```
/// use omop_types::IdentityRecord;
///
/// let record = IdentityRecord::new(42, Some("pat-7"), Some("mrn-9"));
/// assert!(record.has_keys());
/// assert_eq!(record.logical_id.as_deref(), Some("pat-7"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IdentityRecord {
    /// Internally minted id.
    pub surrogate_id: SurrogateId,
    /// The resource's own id in the source system.
    pub logical_id: Option<String>,
    /// Business identifier (e.g. medical record number).
    pub identifier: Option<String>,
}

impl IdentityRecord {
    /// Creates a record, dropping blank keys.
    pub fn new(surrogate_id: SurrogateId, logical_id: Option<&str>, identifier: Option<&str>) -> Self {
        Self {
            surrogate_id,
            logical_id: non_blank(logical_id),
            identifier: non_blank(identifier),
        }
    }

    /// Returns true if at least one natural key is present.
    pub fn has_keys(&self) -> bool {
        self.logical_id.is_some() || self.identifier.is_some()
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
