//! OMOP CDM target records.
//!
//! Only the columns the pipeline populates are modelled. Every clinical row
//! carries the `fhir_logical_id` / `fhir_identifier` of the resource it was
//! mapped from, and the verbatim source value for auditing.

use chrono::NaiveDate;

use crate::{ConceptId, Domain, EntityKind, IdentityRecord, SurrogateId};

/// `person` row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Person {
    pub person_id: SurrogateId,
    pub gender_concept_id: ConceptId,
    pub year_of_birth: Option<i32>,
    pub month_of_birth: Option<u32>,
    pub day_of_birth: Option<u32>,
    pub race_concept_id: ConceptId,
    pub location_id: Option<SurrogateId>,
    pub person_source_value: Option<String>,
    pub gender_source_value: Option<String>,
    pub race_source_value: Option<String>,
    pub fhir_logical_id: Option<String>,
    pub fhir_identifier: Option<String>,
}

/// `location` row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Location {
    pub location_id: SurrogateId,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
    pub location_source_value: String,
}

/// `visit_occurrence` row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VisitOccurrence {
    pub visit_occurrence_id: SurrogateId,
    pub person_id: SurrogateId,
    pub visit_concept_id: ConceptId,
    pub visit_start_date: NaiveDate,
    pub visit_end_date: NaiveDate,
    pub visit_type_concept_id: ConceptId,
    pub visit_source_value: Option<String>,
    pub fhir_logical_id: Option<String>,
    pub fhir_identifier: Option<String>,
}

/// `visit_detail` row, one per department case.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VisitDetail {
    pub visit_detail_id: SurrogateId,
    pub person_id: SurrogateId,
    pub visit_occurrence_id: Option<SurrogateId>,
    pub visit_detail_concept_id: ConceptId,
    pub visit_detail_start_date: NaiveDate,
    pub visit_detail_end_date: NaiveDate,
    pub visit_detail_type_concept_id: ConceptId,
    pub visit_detail_source_value: Option<String>,
    pub fhir_logical_id: Option<String>,
    pub fhir_identifier: Option<String>,
}

/// `condition_occurrence` row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConditionOccurrence {
    pub person_id: SurrogateId,
    pub condition_concept_id: ConceptId,
    pub condition_start_date: NaiveDate,
    pub condition_type_concept_id: ConceptId,
    pub visit_occurrence_id: Option<SurrogateId>,
    pub condition_source_value: String,
    pub condition_source_concept_id: ConceptId,
    pub fhir_logical_id: Option<String>,
    pub fhir_identifier: Option<String>,
}

/// `procedure_occurrence` row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcedureOccurrence {
    pub person_id: SurrogateId,
    pub procedure_concept_id: ConceptId,
    pub procedure_date: NaiveDate,
    pub procedure_type_concept_id: ConceptId,
    pub visit_occurrence_id: Option<SurrogateId>,
    pub procedure_source_value: String,
    pub procedure_source_concept_id: ConceptId,
    pub fhir_logical_id: Option<String>,
    pub fhir_identifier: Option<String>,
}

/// `measurement` row.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Measurement {
    pub person_id: SurrogateId,
    pub measurement_concept_id: ConceptId,
    pub measurement_date: NaiveDate,
    pub measurement_type_concept_id: ConceptId,
    pub value_as_number: Option<f64>,
    pub value_as_concept_id: ConceptId,
    pub unit_concept_id: ConceptId,
    pub unit_source_value: Option<String>,
    pub visit_occurrence_id: Option<SurrogateId>,
    pub measurement_source_value: String,
    pub measurement_source_concept_id: ConceptId,
    pub fhir_logical_id: Option<String>,
    pub fhir_identifier: Option<String>,
}

/// `observation` row.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Observation {
    pub person_id: SurrogateId,
    pub observation_concept_id: ConceptId,
    pub observation_date: NaiveDate,
    pub observation_type_concept_id: ConceptId,
    pub value_as_number: Option<f64>,
    pub value_as_string: Option<String>,
    pub value_as_concept_id: ConceptId,
    pub unit_concept_id: ConceptId,
    pub visit_occurrence_id: Option<SurrogateId>,
    pub observation_source_value: String,
    pub observation_source_concept_id: ConceptId,
    pub fhir_logical_id: Option<String>,
    pub fhir_identifier: Option<String>,
}

/// `drug_exposure` row.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DrugExposure {
    pub drug_exposure_id: SurrogateId,
    pub person_id: SurrogateId,
    pub drug_concept_id: ConceptId,
    pub drug_exposure_start_date: NaiveDate,
    pub drug_exposure_end_date: NaiveDate,
    pub drug_type_concept_id: ConceptId,
    pub quantity: Option<f64>,
    pub route_concept_id: ConceptId,
    pub route_source_value: Option<String>,
    pub visit_occurrence_id: Option<SurrogateId>,
    pub drug_source_value: String,
    pub drug_source_concept_id: ConceptId,
    pub fhir_logical_id: Option<String>,
    pub fhir_identifier: Option<String>,
}

/// A registered medication resource.
///
/// Administrations and statements reference medications; the coded
/// ingredient is resolved to a concept only when the referencing
/// drug exposure is mapped, against that exposure's date.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MedicationRecord {
    pub medication_id: SurrogateId,
    pub system: Option<String>,
    pub code: Option<String>,
    pub version: Option<String>,
    pub fhir_logical_id: Option<String>,
    pub fhir_identifier: Option<String>,
}

/// CDM table a record is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CdmTable {
    Person,
    Location,
    VisitOccurrence,
    VisitDetail,
    ConditionOccurrence,
    ProcedureOccurrence,
    Measurement,
    Observation,
    DrugExposure,
    Medication,
}

impl CdmTable {
    /// All tables, in dependency order.
    pub const ALL: [CdmTable; 10] = [
        Self::Location,
        Self::Person,
        Self::VisitOccurrence,
        Self::VisitDetail,
        Self::Medication,
        Self::ConditionOccurrence,
        Self::ProcedureOccurrence,
        Self::Measurement,
        Self::Observation,
        Self::DrugExposure,
    ];

    /// Returns the table name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Location => "location",
            Self::VisitOccurrence => "visit_occurrence",
            Self::VisitDetail => "visit_detail",
            Self::ConditionOccurrence => "condition_occurrence",
            Self::ProcedureOccurrence => "procedure_occurrence",
            Self::Measurement => "measurement",
            Self::Observation => "observation",
            Self::DrugExposure => "drug_exposure",
            Self::Medication => "medication",
        }
    }
}

/// A record destined for one CDM table.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "table", content = "row", rename_all = "snake_case"))]
pub enum CdmRecord {
    Person(Person),
    Location(Location),
    VisitOccurrence(VisitOccurrence),
    VisitDetail(VisitDetail),
    ConditionOccurrence(ConditionOccurrence),
    ProcedureOccurrence(ProcedureOccurrence),
    Measurement(Measurement),
    Observation(Observation),
    DrugExposure(DrugExposure),
    Medication(MedicationRecord),
}

impl CdmRecord {
    /// Returns the table this record belongs to.
    pub fn table(&self) -> CdmTable {
        match self {
            Self::Person(_) => CdmTable::Person,
            Self::Location(_) => CdmTable::Location,
            Self::VisitOccurrence(_) => CdmTable::VisitOccurrence,
            Self::VisitDetail(_) => CdmTable::VisitDetail,
            Self::ConditionOccurrence(_) => CdmTable::ConditionOccurrence,
            Self::ProcedureOccurrence(_) => CdmTable::ProcedureOccurrence,
            Self::Measurement(_) => CdmTable::Measurement,
            Self::Observation(_) => CdmTable::Observation,
            Self::DrugExposure(_) => CdmTable::DrugExposure,
            Self::Medication(_) => CdmTable::Medication,
        }
    }

    /// Returns the identity this record introduces, if dependents can reference it.
    pub fn identity(&self) -> Option<(EntityKind, IdentityRecord)> {
        let (kind, id, logical_id, identifier) = match self {
            Self::Person(p) => (
                EntityKind::Person,
                p.person_id,
                &p.fhir_logical_id,
                &p.fhir_identifier,
            ),
            Self::VisitOccurrence(v) => (
                EntityKind::VisitOccurrence,
                v.visit_occurrence_id,
                &v.fhir_logical_id,
                &v.fhir_identifier,
            ),
            Self::Medication(m) => (
                EntityKind::Medication,
                m.medication_id,
                &m.fhir_logical_id,
                &m.fhir_identifier,
            ),
            _ => return None,
        };
        Some((
            kind,
            IdentityRecord::new(id, logical_id.as_deref(), identifier.as_deref()),
        ))
    }
}

/// Columns shared by every event-like table.
///
/// Processors build one of these and let the resolved concept's domain decide
/// which table the row lands in.
#[derive(Debug, Clone, PartialEq)]
pub struct ClinicalEvent {
    pub person_id: SurrogateId,
    pub visit_occurrence_id: Option<SurrogateId>,
    pub concept_id: ConceptId,
    pub source_concept_id: ConceptId,
    pub source_value: String,
    pub date: NaiveDate,
    pub type_concept_id: ConceptId,
    pub value_as_number: Option<f64>,
    pub value_as_string: Option<String>,
    pub value_as_concept_id: ConceptId,
    pub unit_concept_id: ConceptId,
    pub unit_source_value: Option<String>,
    pub fhir_logical_id: Option<String>,
    pub fhir_identifier: Option<String>,
}

impl ClinicalEvent {
    /// Routes the event to the table matching `domain`.
    ///
    /// Unknown and non-event domains land in `observation`.
    pub fn into_record(self, domain: Option<Domain>) -> CdmRecord {
        match domain {
            Some(Domain::Condition) => CdmRecord::ConditionOccurrence(ConditionOccurrence {
                person_id: self.person_id,
                condition_concept_id: self.concept_id,
                condition_start_date: self.date,
                condition_type_concept_id: self.type_concept_id,
                visit_occurrence_id: self.visit_occurrence_id,
                condition_source_value: self.source_value,
                condition_source_concept_id: self.source_concept_id,
                fhir_logical_id: self.fhir_logical_id,
                fhir_identifier: self.fhir_identifier,
            }),
            Some(Domain::Procedure) => CdmRecord::ProcedureOccurrence(ProcedureOccurrence {
                person_id: self.person_id,
                procedure_concept_id: self.concept_id,
                procedure_date: self.date,
                procedure_type_concept_id: self.type_concept_id,
                visit_occurrence_id: self.visit_occurrence_id,
                procedure_source_value: self.source_value,
                procedure_source_concept_id: self.source_concept_id,
                fhir_logical_id: self.fhir_logical_id,
                fhir_identifier: self.fhir_identifier,
            }),
            Some(Domain::Measurement) => CdmRecord::Measurement(Measurement {
                person_id: self.person_id,
                measurement_concept_id: self.concept_id,
                measurement_date: self.date,
                measurement_type_concept_id: self.type_concept_id,
                value_as_number: self.value_as_number,
                value_as_concept_id: self.value_as_concept_id,
                unit_concept_id: self.unit_concept_id,
                unit_source_value: self.unit_source_value,
                visit_occurrence_id: self.visit_occurrence_id,
                measurement_source_value: self.source_value,
                measurement_source_concept_id: self.source_concept_id,
                fhir_logical_id: self.fhir_logical_id,
                fhir_identifier: self.fhir_identifier,
            }),
            _ => CdmRecord::Observation(Observation {
                person_id: self.person_id,
                observation_concept_id: self.concept_id,
                observation_date: self.date,
                observation_type_concept_id: self.type_concept_id,
                value_as_number: self.value_as_number,
                value_as_string: self.value_as_string,
                value_as_concept_id: self.value_as_concept_id,
                unit_concept_id: self.unit_concept_id,
                visit_occurrence_id: self.visit_occurrence_id,
                observation_source_value: self.source_value,
                observation_source_concept_id: self.source_concept_id,
                fhir_logical_id: self.fhir_logical_id,
                fhir_identifier: self.fhir_identifier,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event() -> ClinicalEvent {
        ClinicalEvent {
            person_id: 42,
            visit_occurrence_id: Some(7),
            concept_id: 44800001,
            source_concept_id: 44800001,
            source_value: "I12.3".to_string(),
            date: NaiveDate::from_ymd_opt(2021, 3, 15).unwrap(),
            type_concept_id: crate::well_known::EHR,
            value_as_number: None,
            value_as_string: None,
            value_as_concept_id: 0,
            unit_concept_id: 0,
            unit_source_value: None,
            fhir_logical_id: Some("cond-1".to_string()),
            fhir_identifier: None,
        }
    }

    #[test]
    fn test_event_routes_by_domain() {
        let condition = make_event().into_record(Some(Domain::Condition));
        assert_eq!(condition.table(), CdmTable::ConditionOccurrence);

        let procedure = make_event().into_record(Some(Domain::Procedure));
        assert_eq!(procedure.table(), CdmTable::ProcedureOccurrence);

        let measurement = make_event().into_record(Some(Domain::Measurement));
        assert_eq!(measurement.table(), CdmTable::Measurement);

        let fallback = make_event().into_record(None);
        assert_eq!(fallback.table(), CdmTable::Observation);
    }

    #[test]
    fn test_condition_keeps_source_value() {
        match make_event().into_record(Some(Domain::Condition)) {
            CdmRecord::ConditionOccurrence(row) => {
                assert_eq!(row.person_id, 42);
                assert_eq!(row.condition_concept_id, 44800001);
                assert_eq!(row.condition_source_value, "I12.3");
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_identity_of_person() {
        let person = CdmRecord::Person(Person {
            person_id: 42,
            gender_concept_id: crate::well_known::GENDER_FEMALE,
            year_of_birth: Some(1970),
            month_of_birth: None,
            day_of_birth: None,
            race_concept_id: 0,
            location_id: None,
            person_source_value: None,
            gender_source_value: None,
            race_source_value: None,
            fhir_logical_id: Some("pat-7".to_string()),
            fhir_identifier: Some("mrn-9".to_string()),
        });

        let (kind, identity) = person.identity().unwrap();
        assert_eq!(kind, EntityKind::Person);
        assert_eq!(identity.surrogate_id, 42);
        assert_eq!(identity.identifier.as_deref(), Some("mrn-9"));

        let location = CdmRecord::Location(Location {
            location_id: 1,
            city: None,
            zip: None,
            country: None,
            location_source_value: "x".to_string(),
        });
        assert!(location.identity().is_none());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_record_serializes_with_table_tag() {
        let record = make_event().into_record(Some(Domain::Condition));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["table"], "condition_occurrence");
        assert_eq!(json["row"]["person_id"], 42);
    }
}
