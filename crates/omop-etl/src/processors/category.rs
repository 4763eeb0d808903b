//! Consent and DiagnosticReport -> observation, one row per category.
//!
//! Categories are local codes with curated source-to-concept mappings.

use chrono::NaiveDate;
use omop_types::{well_known, CdmRecord, ClinicalEvent, Domain, SurrogateId};

use super::{person_id, required_date, visit_id, MappingContext};
use crate::error::{EtlError, EtlResult};
use crate::fhir;
use crate::source::SourceResource;

/// Vocabulary used for consent categories whose system is not routed.
pub const CONSENT_CATEGORY_VOCABULARY: &str = "ConsentCategory";

/// Vocabulary used for report categories whose system is not routed.
pub const REPORT_CATEGORY_VOCABULARY: &str = "DiagnosticReportCategory";

pub(super) fn map_consent(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let person_id = person_id(resource, "patient", ctx)?;
    let date = required_date(resource, &[&["dateTime"], &["provision", "period", "start"]])?;
    let status = fhir::str_at(&resource.payload, &["status"]);
    map_categories(resource, ctx, CONSENT_CATEGORY_VOCABULARY, person_id, None, date, status)
}

pub(super) fn map_diagnostic_report(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let person_id = person_id(resource, "subject", ctx)?;
    let visit_occurrence_id = visit_id(resource, "encounter", ctx)?;
    let date = required_date(
        resource,
        &[&["effectiveDateTime"], &["effectivePeriod", "start"], &["issued"]],
    )?;
    let code = fhir::coding(&resource.payload, "code", |_| true).map(|c| c.code);
    map_categories(
        resource,
        ctx,
        REPORT_CATEGORY_VOCABULARY,
        person_id,
        visit_occurrence_id,
        date,
        code,
    )
}

fn map_categories(
    resource: &SourceResource,
    ctx: &MappingContext,
    default_vocabulary: &str,
    person_id: SurrogateId,
    visit_occurrence_id: Option<SurrogateId>,
    date: NaiveDate,
    value: Option<&str>,
) -> EtlResult<Vec<CdmRecord>> {
    let categories = fhir::category_codings(&resource.payload, "category");
    if categories.is_empty() {
        return Err(EtlError::invalid(&resource.resource_type, resource.id, "no category"));
    }

    let mut records = Vec::with_capacity(categories.len());
    for category in categories {
        let vocabulary_id = ctx
            .concepts
            .router()
            .vocabulary_id(category.system)
            .unwrap_or(default_vocabulary);
        let entry = ctx.concepts.resolve_source_to_concept(vocabulary_id, category.code)?;

        let event = ClinicalEvent {
            person_id,
            visit_occurrence_id,
            concept_id: entry.target_concept_id,
            source_concept_id: entry.source_concept_id,
            source_value: category.code.to_string(),
            date,
            type_concept_id: well_known::EHR,
            value_as_number: None,
            value_as_string: value.map(str::to_string),
            value_as_concept_id: well_known::NO_MATCHING_CONCEPT,
            unit_concept_id: well_known::NO_MATCHING_CONCEPT,
            unit_source_value: None,
            fhir_logical_id: resource.logical_id.clone(),
            fhir_identifier: fhir::first_identifier(&resource.payload).map(str::to_string),
        };
        records.push(event.into_record(Some(Domain::Observation)));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_consent_category_defaults_to_manually_recorded() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "Consent",
            "id": "consent-1",
            "status": "active",
            "patient": { "reference": "Patient/pat-7" },
            "dateTime": "2021-03-15",
            "category": [{ "coding": [{ "system": "http://example.org/consent", "code": "research" }] }]
        }));

        let records = map_consent(&resource, &ctx).unwrap();
        let CdmRecord::Observation(observation) = &records[0] else {
            panic!("expected observation");
        };
        assert_eq!(observation.observation_concept_id, well_known::MANUALLY_RECORDED);
        assert_eq!(observation.observation_source_value, "research");
        assert_eq!(observation.value_as_string.as_deref(), Some("active"));
    }

    #[test]
    fn test_report_categories() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "DiagnosticReport",
            "id": "rep-1",
            "subject": { "reference": "Patient/pat-7" },
            "effectiveDateTime": "2021-03-15",
            "code": { "coding": [{ "system": "http://loinc.org", "code": "58410-2" }] },
            "category": [
                { "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/v2-0074", "code": "LAB" }] },
                { "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/v2-0074", "code": "HM" }] }
            ]
        }));

        let records = map_diagnostic_report(&resource, &ctx).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| matches!(r, CdmRecord::Observation(_))));
    }

    #[test]
    fn test_report_without_category_is_invalid() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "DiagnosticReport",
            "id": "rep-2",
            "subject": { "reference": "Patient/pat-7" },
            "issued": "2021-03-15T12:00:00Z"
        }));

        let err = map_diagnostic_report(&resource, &ctx).unwrap_err();
        assert_eq!(err.skip_reason(), Some("invalid_resource"));
    }
}
