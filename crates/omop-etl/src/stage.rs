//! Load stages.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::source::SourceResource;

/// One chunked load step, mapping one kind of source resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Patient -> person (+ location).
    Patients,
    /// Top-level encounters -> visit_occurrence.
    EncounterInstitution,
    /// Encounters that are part of another encounter -> visit_detail.
    EncounterDepartment,
    /// Medication registrations.
    Medications,
    /// MedicationStatement -> drug_exposure.
    MedicationStatements,
    /// MedicationAdministration -> drug_exposure.
    MedicationAdministrations,
    /// Condition -> condition_occurrence (or the mapped domain's table).
    Conditions,
    /// Observation -> measurement / observation.
    Observations,
    /// Procedure -> procedure_occurrence.
    Procedures,
    /// Immunization -> drug_exposure.
    Immunizations,
    /// Consent -> observation.
    Consents,
    /// DiagnosticReport -> observation.
    DiagnosticReports,
}

impl Stage {
    /// All stages.
    pub const ALL: [Stage; 12] = [
        Self::Patients,
        Self::EncounterInstitution,
        Self::EncounterDepartment,
        Self::Medications,
        Self::MedicationStatements,
        Self::MedicationAdministrations,
        Self::Conditions,
        Self::Observations,
        Self::Procedures,
        Self::Immunizations,
        Self::Consents,
        Self::DiagnosticReports,
    ];

    /// Stage name as used by the single-step selector.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Patients => "patients",
            Self::EncounterInstitution => "encounter_institution",
            Self::EncounterDepartment => "encounter_department",
            Self::Medications => "medications",
            Self::MedicationStatements => "medication_statements",
            Self::MedicationAdministrations => "medication_administrations",
            Self::Conditions => "conditions",
            Self::Observations => "observations",
            Self::Procedures => "procedures",
            Self::Immunizations => "immunizations",
            Self::Consents => "consents",
            Self::DiagnosticReports => "diagnostic_reports",
        }
    }

    /// FHIR resource type the stage reads.
    pub fn resource_type(self) -> &'static str {
        match self {
            Self::Patients => "Patient",
            Self::EncounterInstitution | Self::EncounterDepartment => "Encounter",
            Self::Medications => "Medication",
            Self::MedicationStatements => "MedicationStatement",
            Self::MedicationAdministrations => "MedicationAdministration",
            Self::Conditions => "Condition",
            Self::Observations => "Observation",
            Self::Procedures => "Procedure",
            Self::Immunizations => "Immunization",
            Self::Consents => "Consent",
            Self::DiagnosticReports => "DiagnosticReport",
        }
    }

    /// Returns true if the stage maps this resource.
    ///
    /// Both encounter stages read `Encounter`; a `partOf` reference marks a
    /// department case.
    pub fn selects(self, resource: &SourceResource) -> bool {
        if resource.resource_type != self.resource_type() {
            return false;
        }
        let part_of = resource.payload.get("partOf").is_some_and(|v| !v.is_null());
        match self {
            Self::EncounterInstitution => !part_of,
            Self::EncounterDepartment => part_of,
            _ => true,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown stage name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown stage '{0}'")]
pub struct ParseStageError(pub String);

impl FromStr for Stage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| ParseStageError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn make_resource(resource_type: &str, payload: serde_json::Value) -> SourceResource {
        SourceResource {
            id: 1,
            resource_type: resource_type.to_string(),
            logical_id: Some("x".to_string()),
            last_updated: Utc.with_ymd_and_hms(2021, 3, 15, 0, 0, 0).unwrap(),
            payload,
        }
    }

    #[test]
    fn test_parse_stage() {
        assert_eq!("patients".parse::<Stage>().unwrap(), Stage::Patients);
        assert_eq!(
            "Encounter-Department".parse::<Stage>().unwrap(),
            Stage::EncounterDepartment
        );
        assert!("unknown".parse::<Stage>().is_err());

        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }

    #[test]
    fn test_encounter_stages_split_on_part_of() {
        let institution = make_resource("Encounter", json!({ "id": "enc-1" }));
        let department = make_resource(
            "Encounter",
            json!({ "id": "enc-2", "partOf": { "reference": "Encounter/enc-1" } }),
        );

        assert!(Stage::EncounterInstitution.selects(&institution));
        assert!(!Stage::EncounterDepartment.selects(&institution));
        assert!(Stage::EncounterDepartment.selects(&department));
        assert!(!Stage::Patients.selects(&department));
    }
}
