//! Staged source resources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One staged FHIR resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResource {
    /// Staging row id.
    pub id: i64,
    /// FHIR resource type (`Patient`, `Encounter`, ...).
    pub resource_type: String,
    /// The resource's own id.
    pub logical_id: Option<String>,
    /// Last change of the staging row; moved forward when rescheduled.
    pub last_updated: DateTime<Utc>,
    /// The resource body.
    pub payload: Value,
}

impl SourceResource {
    /// Builds a staged resource from a FHIR JSON body.
    ///
    /// Type and logical id are read from the body.
    pub fn from_payload(id: i64, last_updated: DateTime<Utc>, payload: Value) -> Self {
        let resource_type = payload
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let logical_id = payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id,
            resource_type,
            logical_id,
            last_updated,
            payload,
        }
    }

    /// Key minting surrogate ids for this resource (`Type/id`).
    ///
    /// Falls back to the staging id when the resource has no logical id.
    pub fn key(&self) -> String {
        match &self.logical_id {
            Some(id) => format!("{}/{}", self.resource_type, id),
            None => format!("{}#{}", self.resource_type, self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_from_payload() {
        let updated = Utc.with_ymd_and_hms(2021, 3, 15, 8, 0, 0).unwrap();
        let resource = SourceResource::from_payload(
            7,
            updated,
            json!({ "resourceType": "Patient", "id": "pat-7" }),
        );

        assert_eq!(resource.resource_type, "Patient");
        assert_eq!(resource.logical_id.as_deref(), Some("pat-7"));
        assert_eq!(resource.key(), "Patient/pat-7");

        let anonymous = SourceResource::from_payload(8, updated, json!({ "resourceType": "Condition" }));
        assert_eq!(anonymous.key(), "Condition#8");
    }
}
