//! Conditions, observations and procedures.
//!
//! All three produce a [`ClinicalEvent`] whose table is chosen by the
//! resolved concept's domain.

use chrono::NaiveDate;
use omop_types::{well_known, CdmRecord, ClinicalEvent, ConceptId, Domain, SurrogateId};
use omop_vocab::CodeLookup;

use super::{auxiliary_concept, person_id, required_date, routed_to, visit_id, MappingContext};
use crate::error::{EtlError, EtlResult};
use crate::fhir::{self, Coding};
use crate::source::SourceResource;

const ICD_VOCABULARIES: &[&str] = &["ICD10GM", "ICD10"];
const PROCEDURE_VOCABULARIES: &[&str] = &["OPS", "SNOMED"];
const OBSERVATION_VOCABULARIES: &[&str] = &["LOINC"];

/// ICD-10-GM marks etiology (†), manifestation (*), additional (!) and
/// secondary (+) codes with a trailing character.
const ICD_MARKERS: &[char] = &['†', '*', '!', '+', '‡'];

/// Common part of an event before concept and values are known.
struct EventBase {
    person_id: SurrogateId,
    visit_occurrence_id: Option<SurrogateId>,
    date: NaiveDate,
}

impl EventBase {
    fn read(resource: &SourceResource, ctx: &MappingContext, visit_field: &str, dates: &[&[&str]]) -> EtlResult<Self> {
        Ok(Self {
            person_id: person_id(resource, "subject", ctx)?,
            visit_occurrence_id: visit_id(resource, visit_field, ctx)?,
            date: required_date(resource, dates)?,
        })
    }

    fn event(
        &self,
        resource: &SourceResource,
        concept_id: ConceptId,
        source_concept_id: ConceptId,
        source_value: &str,
    ) -> ClinicalEvent {
        ClinicalEvent {
            person_id: self.person_id,
            visit_occurrence_id: self.visit_occurrence_id,
            concept_id,
            source_concept_id,
            source_value: source_value.to_string(),
            date: self.date,
            type_concept_id: well_known::EHR,
            value_as_number: None,
            value_as_string: None,
            value_as_concept_id: well_known::NO_MATCHING_CONCEPT,
            unit_concept_id: well_known::NO_MATCHING_CONCEPT,
            unit_source_value: None,
            fhir_logical_id: resource.logical_id.clone(),
            fhir_identifier: fhir::first_identifier(&resource.payload).map(str::to_string),
        }
    }
}

fn required_coding<'a>(
    resource: &'a SourceResource,
    field: &str,
    prefer: impl Fn(&str) -> bool,
) -> EtlResult<Coding<'a>> {
    fhir::coding(&resource.payload, field, prefer)
        .ok_or_else(|| EtlError::invalid(&resource.resource_type, resource.id, format!("no coded {field}")))
}

/// Primary code of an ICD-10-GM code string (`E10.3†G63.2*` -> `E10.3`).
pub(crate) fn primary_icd_code(code: &str) -> &str {
    code.split(ICD_MARKERS).next().unwrap_or(code).trim()
}

/// Condition -> one record per SNOMED target of its ICD code.
pub(super) fn map_condition(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let base = EventBase::read(
        resource,
        ctx,
        "encounter",
        &[&["onsetDateTime"], &["onsetPeriod", "start"], &["recordedDate"]],
    )?;
    let coding = required_coding(resource, "code", routed_to(ctx, ICD_VOCABULARIES))?;
    let code = primary_icd_code(coding.code);

    let lookup = CodeLookup::new(coding.system, code, Domain::Condition)
        .version(coding.version)
        .on(Some(base.date));
    let targets = ctx.concepts.resolve_icd_to_snomed(&lookup)?;

    Ok(targets
        .iter()
        .map(|target| {
            base.event(resource, target.target_concept_id, target.source_concept_id, coding.code)
                .into_record(Domain::from_domain_id(&target.target_domain_id))
        })
        .collect())
}

/// Observation -> measurement or observation by the LOINC concept's domain.
pub(super) fn map_observation(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let payload = &resource.payload;
    let base = EventBase::read(
        resource,
        ctx,
        "encounter",
        &[&["effectiveDateTime"], &["effectivePeriod", "start"], &["effectiveInstant"], &["issued"]],
    )?;
    let coding = required_coding(resource, "code", routed_to(ctx, OBSERVATION_VOCABULARIES))?;
    let lookup = CodeLookup::new(coding.system, coding.code, Domain::Measurement)
        .version(coding.version)
        .on(Some(base.date));
    let concept = ctx.concepts.resolve(&lookup)?;

    let mut event = base.event(resource, concept.concept_id, concept.concept_id, coding.code);

    if let Some(quantity) = payload.get("valueQuantity") {
        event.value_as_number = fhir::f64_at(quantity, &["value"]);
        let unit_code = fhir::str_at(quantity, &["code"]);
        event.unit_source_value = fhir::str_at(quantity, &["unit"]).or(unit_code).map(str::to_string);
        if let (Some(system), Some(code)) = (fhir::str_at(quantity, &["system"]), unit_code) {
            let unit = CodeLookup::new(system, code, Domain::Unit).on(Some(base.date));
            event.unit_concept_id = auxiliary_concept(ctx, &unit)?;
        }
    }
    if let Some(value) = fhir::str_at(payload, &["valueString"]) {
        event.value_as_string = Some(value.to_string());
    }
    if let Some(value) = fhir::coding(payload, "valueCodeableConcept", |_| true) {
        let lookup = CodeLookup::new(value.system, value.code, Domain::Observation).on(Some(base.date));
        event.value_as_concept_id = auxiliary_concept(ctx, &lookup)?;
        event.value_as_string.get_or_insert_with(|| value.code.to_string());
    }

    Ok(vec![event.into_record(concept.domain())])
}

/// Procedure -> procedure_occurrence (or the concept's domain table).
pub(super) fn map_procedure(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let base = EventBase::read(
        resource,
        ctx,
        "encounter",
        &[&["performedDateTime"], &["performedPeriod", "start"], &["occurrenceDateTime"]],
    )?;
    let coding = required_coding(resource, "code", routed_to(ctx, PROCEDURE_VOCABULARIES))?;
    let lookup = CodeLookup::new(coding.system, coding.code, Domain::Procedure)
        .version(coding.version)
        .on(Some(base.date));
    let concept = ctx.concepts.resolve(&lookup)?;

    let event = base.event(resource, concept.concept_id, concept.concept_id, coding.code);
    Ok(vec![event.into_record(concept.domain())])
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use omop_types::CdmTable;
    use serde_json::json;

    const ICD: &str = "http://fhir.de/CodeSystem/bfarm/icd-10-gm";

    #[test]
    fn test_primary_icd_code() {
        assert_eq!(primary_icd_code("I12.3"), "I12.3");
        assert_eq!(primary_icd_code("I12.3†"), "I12.3");
        assert_eq!(primary_icd_code("E10.3†G63.2*"), "E10.3");
        assert_eq!(primary_icd_code("U07.1!"), "U07.1");
    }

    #[test]
    fn test_condition_maps_to_condition_occurrence() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "Condition",
            "id": "cond-1",
            "subject": { "reference": "Patient/pat-7" },
            "encounter": { "reference": "Encounter/enc-1" },
            "code": { "coding": [{ "system": ICD, "version": "2021", "code": "I12.3" }] },
            "onsetDateTime": "2021-03-15"
        }));

        let records = map_condition(&resource, &ctx).unwrap();
        assert_eq!(records.len(), 1);
        let CdmRecord::ConditionOccurrence(condition) = &records[0] else {
            panic!("expected condition occurrence");
        };
        assert_eq!(condition.condition_concept_id, 44800001);
        assert_eq!(condition.person_id, 42);
        assert_eq!(condition.visit_occurrence_id, Some(7));
        assert_eq!(condition.condition_source_value, "I12.3");
        assert_eq!(condition.condition_start_date, date(2021, 3, 15));
    }

    #[test]
    fn test_condition_outside_window_is_skipped() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "Condition",
            "id": "cond-2",
            "subject": { "reference": "Patient/pat-7" },
            "code": { "coding": [{ "system": ICD, "code": "I12.3" }] },
            "recordedDate": "2010-06-01"
        }));

        let err = map_condition(&resource, &ctx).unwrap_err();
        assert_eq!(err.skip_reason(), Some("no_valid_concept"));
    }

    #[test]
    fn test_unrouted_condition_keeps_source_value() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "Condition",
            "id": "cond-3",
            "subject": { "reference": "Patient/pat-7" },
            "code": { "coding": [{ "system": "http://example.org/local", "code": "X-1" }] },
            "onsetDateTime": "2021-03-15"
        }));

        let records = map_condition(&resource, &ctx).unwrap();
        let CdmRecord::ConditionOccurrence(condition) = &records[0] else {
            panic!("expected condition occurrence");
        };
        assert_eq!(condition.condition_concept_id, 0);
        assert_eq!(condition.condition_source_value, "X-1");
    }

    #[test]
    fn test_observation_becomes_measurement() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "Observation",
            "id": "obs-1",
            "subject": { "reference": "Patient/pat-7" },
            "code": { "coding": [{ "system": "http://loinc.org", "code": "4548-4" }] },
            "effectiveDateTime": "2021-03-15T09:00:00Z",
            "valueQuantity": { "value": 6.1, "unit": "%", "system": "http://unitsofmeasure.org", "code": "%" }
        }));

        let records = map_observation(&resource, &ctx).unwrap();
        let CdmRecord::Measurement(measurement) = &records[0] else {
            panic!("expected measurement");
        };
        assert_eq!(measurement.measurement_concept_id, 3004410);
        assert_eq!(measurement.value_as_number, Some(6.1));
        assert_eq!(measurement.unit_concept_id, 8554);
        assert_eq!(measurement.unit_source_value.as_deref(), Some("%"));
    }

    #[test]
    fn test_procedure() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "Procedure",
            "id": "proc-1",
            "subject": { "reference": "Patient/pat-7" },
            "code": { "coding": [{ "system": "http://fhir.de/CodeSystem/bfarm/ops", "code": "5-470" }] },
            "performedDateTime": "2021-03-15"
        }));

        let records = map_procedure(&resource, &ctx).unwrap();
        assert_eq!(records[0].table(), CdmTable::ProcedureOccurrence);
    }

    #[test]
    fn test_missing_code_is_invalid() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "Procedure",
            "id": "proc-2",
            "subject": { "reference": "Patient/pat-7" },
            "performedDateTime": "2021-03-15"
        }));

        let err = map_procedure(&resource, &ctx).unwrap_err();
        assert_eq!(err.skip_reason(), Some("invalid_resource"));
    }
}
