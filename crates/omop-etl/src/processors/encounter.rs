//! Encounter -> visit_occurrence / visit_detail.

use omop_types::cdm::{VisitDetail, VisitOccurrence};
use omop_types::{well_known, CdmRecord, ConceptId, EntityKind};

use super::{entity_id, person_id, required_date, MappingContext};
use crate::error::EtlResult;
use crate::fhir;
use crate::source::SourceResource;

const START: &[&[&str]] = &[&["period", "start"]];
const END: &[&[&str]] = &[&["period", "end"]];

/// Top-level encounter.
pub(super) fn map_institution(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let payload = &resource.payload;
    let person_id = person_id(resource, "subject", ctx)?;
    let start = required_date(resource, START)?;
    let end = fhir::date_at(payload, END).unwrap_or(start).max(start);
    let class = class_code(resource);

    let visit = VisitOccurrence {
        visit_occurrence_id: entity_id(resource, EntityKind::VisitOccurrence, ctx)?,
        person_id,
        visit_concept_id: visit_concept(class),
        visit_start_date: start,
        visit_end_date: end,
        visit_type_concept_id: well_known::EHR,
        visit_source_value: class.map(str::to_string),
        fhir_logical_id: resource.logical_id.clone(),
        fhir_identifier: fhir::first_identifier(payload).map(str::to_string),
    };
    Ok(vec![CdmRecord::VisitOccurrence(visit)])
}

/// Department case: an encounter that is `partOf` another one.
pub(super) fn map_department(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let payload = &resource.payload;
    let person_id = person_id(resource, "subject", ctx)?;
    let visit_occurrence_id = super::visit_id(resource, "partOf", ctx)?;
    let start = required_date(resource, START)?;
    let end = fhir::date_at(payload, END).unwrap_or(start).max(start);
    let class = class_code(resource);

    let detail = VisitDetail {
        visit_detail_id: entity_id(resource, EntityKind::VisitDetail, ctx)?,
        person_id,
        visit_occurrence_id,
        visit_detail_concept_id: visit_concept(class),
        visit_detail_start_date: start,
        visit_detail_end_date: end,
        visit_detail_type_concept_id: well_known::EHR,
        visit_detail_source_value: class.map(str::to_string),
        fhir_logical_id: resource.logical_id.clone(),
        fhir_identifier: fhir::first_identifier(payload).map(str::to_string),
    };
    Ok(vec![CdmRecord::VisitDetail(detail)])
}

/// `class` is a single Coding in R4 and a CodeableConcept list in R5.
fn class_code(resource: &SourceResource) -> Option<&str> {
    fhir::str_at(&resource.payload, &["class", "code"]).or_else(|| {
        fhir::category_codings(&resource.payload, "class")
            .first()
            .map(|c| c.code)
    })
}

fn visit_concept(class: Option<&str>) -> ConceptId {
    match class.map(str::to_ascii_uppercase).as_deref() {
        Some("IMP" | "ACUTE" | "NONAC" | "SS") => well_known::INPATIENT_VISIT,
        Some("AMB" | "VR" | "HH" | "PRENC") => well_known::OUTPATIENT_VISIT,
        Some("EMER") => well_known::EMERGENCY_ROOM_VISIT,
        _ => well_known::NO_MATCHING_CONCEPT,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_institution_encounter() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "Encounter",
            "id": "enc-2",
            "class": { "system": "http://terminology.hl7.org/CodeSystem/v3-ActCode", "code": "IMP" },
            "subject": { "reference": "Patient/pat-7" },
            "period": { "start": "2021-03-15T08:00:00Z", "end": "2021-03-18" }
        }));

        let records = map_institution(&resource, &ctx).unwrap();
        let CdmRecord::VisitOccurrence(visit) = &records[0] else {
            panic!("expected visit occurrence");
        };
        assert_eq!(visit.person_id, 42);
        assert_eq!(visit.visit_concept_id, well_known::INPATIENT_VISIT);
        assert_eq!(visit.visit_start_date, date(2021, 3, 15));
        assert_eq!(visit.visit_end_date, date(2021, 3, 18));
        assert_eq!(visit.fhir_logical_id.as_deref(), Some("enc-2"));
    }

    #[test]
    fn test_encounter_without_start_is_invalid() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "Encounter",
            "id": "enc-3",
            "subject": { "reference": "Patient/pat-7" }
        }));

        let err = map_institution(&resource, &ctx).unwrap_err();
        assert_eq!(err.skip_reason(), Some("invalid_resource"));
    }

    #[test]
    fn test_department_links_parent_visit() {
        let ctx = make_bulk_context();
        let resource = make_resource(json!({
            "resourceType": "Encounter",
            "id": "enc-1-a",
            "class": { "code": "EMER" },
            "subject": { "reference": "Patient/pat-7" },
            "partOf": { "reference": "Encounter/enc-1" },
            "period": { "start": "2021-03-15" }
        }));

        let records = map_department(&resource, &ctx).unwrap();
        let CdmRecord::VisitDetail(detail) = &records[0] else {
            panic!("expected visit detail");
        };
        assert_eq!(detail.visit_occurrence_id, Some(7));
        assert_eq!(detail.visit_detail_concept_id, well_known::EMERGENCY_ROOM_VISIT);
        assert_eq!(detail.visit_detail_end_date, date(2021, 3, 15));
    }
}
