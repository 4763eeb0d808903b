//! Medication registration and drug exposures from administrations and
//! statements.

use omop_types::cdm::{DrugExposure, MedicationRecord};
use omop_types::{well_known, CdmRecord, ConceptId, Domain, EntityKind};
use omop_vocab::CodeLookup;
use serde_json::Value;

use super::{auxiliary_concept, entity_id, person_id, required_date, routed_to, visit_id, MappingContext};
use crate::error::{EtlError, EtlResult};
use crate::fhir::{self, Coding};
use crate::source::SourceResource;

const DRUG_VOCABULARIES: &[&str] = &["ATC", "EDQM", "SNOMED"];

const EFFECTIVE: &[&[&str]] = &[&["effectiveDateTime"], &["effectivePeriod", "start"]];
const EFFECTIVE_END: &[&[&str]] = &[&["effectivePeriod", "end"]];

pub(super) fn map_medication(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let coding = fhir::coding(&resource.payload, "code", routed_to(ctx, DRUG_VOCABULARIES));
    let record = MedicationRecord {
        medication_id: entity_id(resource, EntityKind::Medication, ctx)?,
        system: coding.map(|c| c.system.to_string()),
        code: coding.map(|c| c.code.to_string()),
        version: coding.and_then(|c| c.version).map(str::to_string),
        fhir_logical_id: resource.logical_id.clone(),
        fhir_identifier: fhir::first_identifier(&resource.payload).map(str::to_string),
    };
    Ok(vec![CdmRecord::Medication(record)])
}

pub(super) fn map_administration(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let dosage = resource.payload.get("dosage");
    let route = dosage.and_then(|d| fhir::coding(d, "route", |_| true));
    let quantity = dosage.and_then(|d| fhir::f64_at(d, &["dose", "value"]));
    map_exposure(resource, ctx, well_known::EHR_ADMINISTRATION_RECORD, route, quantity)
}

pub(super) fn map_statement(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let dosage = resource
        .payload
        .get("dosage")
        .and_then(Value::as_array)
        .and_then(|d| d.first());
    let route = dosage.and_then(|d| fhir::coding(d, "route", |_| true));
    let quantity = dosage
        .and_then(|d| d.get("doseAndRate"))
        .and_then(Value::as_array)
        .and_then(|d| d.first())
        .and_then(|d| fhir::f64_at(d, &["doseQuantity", "value"]));
    map_exposure(resource, ctx, well_known::PATIENT_SELF_REPORTED, route, quantity)
}

fn map_exposure(
    resource: &SourceResource,
    ctx: &MappingContext,
    type_concept_id: ConceptId,
    route: Option<Coding<'_>>,
    quantity: Option<f64>,
) -> EtlResult<Vec<CdmRecord>> {
    let payload = &resource.payload;
    let person_id = person_id(resource, "subject", ctx)?;
    let visit_occurrence_id = visit_id(resource, "context", ctx)?;
    let start = required_date(resource, EFFECTIVE)?;
    let end = fhir::date_at(payload, EFFECTIVE_END).unwrap_or(start).max(start);

    let (system, code, version) = medication_code(resource, ctx)?;
    let lookup = CodeLookup::new(&system, &code, Domain::Drug)
        .version(version.as_deref())
        .on(Some(start));
    let concept = ctx.concepts.resolve(&lookup)?;

    let route_concept_id = match route {
        Some(route) => auxiliary_concept(
            ctx,
            &CodeLookup::new(route.system, route.code, Domain::Route).on(Some(start)),
        )?,
        None => well_known::NO_MATCHING_CONCEPT,
    };

    let exposure = DrugExposure {
        drug_exposure_id: ctx.caches.get_or_create(EntityKind::DrugExposure, &resource.key()),
        person_id,
        drug_concept_id: concept.concept_id,
        drug_exposure_start_date: start,
        drug_exposure_end_date: end,
        drug_type_concept_id: type_concept_id,
        quantity,
        route_concept_id,
        route_source_value: route.map(|r| r.code.to_string()),
        visit_occurrence_id,
        drug_source_value: code,
        drug_source_concept_id: concept.concept_id,
        fhir_logical_id: resource.logical_id.clone(),
        fhir_identifier: fhir::first_identifier(payload).map(str::to_string),
    };
    Ok(vec![CdmRecord::DrugExposure(exposure)])
}

/// The medication code: from the referenced Medication, or inline.
fn medication_code(
    resource: &SourceResource,
    ctx: &MappingContext,
) -> EtlResult<(String, String, Option<String>)> {
    let keys = fhir::reference(&resource.payload, "medicationReference");
    if !keys.is_empty() {
        let medication = ctx
            .references
            .resolve_medication(keys.identifier, keys.logical_id, resource.id)?
            .required(EntityKind::Medication, resource.id)?;
        return match (medication.system, medication.code) {
            (Some(system), Some(code)) => Ok((system, code, medication.version)),
            _ => Err(EtlError::invalid(
                &resource.resource_type,
                resource.id,
                "referenced medication has no code",
            )),
        };
    }

    fhir::coding(&resource.payload, "medicationCodeableConcept", routed_to(ctx, DRUG_VOCABULARIES))
        .map(|c| (c.system.to_string(), c.code.to_string(), c.version.map(str::to_string)))
        .ok_or_else(|| EtlError::invalid(&resource.resource_type, resource.id, "no medication code"))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use serde_json::json;

    const ATC: &str = "http://fhir.de/CodeSystem/bfarm/atc";

    #[test]
    fn test_administration_via_medication_reference() {
        let ctx = make_bulk_context();
        let medication = make_resource(json!({
            "resourceType": "Medication",
            "id": "med-5",
            "code": { "coding": [{ "system": ATC, "code": "C09AA05" }] }
        }));
        let registered = map_medication(&medication, &ctx).unwrap();
        ctx.references.register_committed(&registered).unwrap();

        let administration = make_resource(json!({
            "resourceType": "MedicationAdministration",
            "id": "adm-1",
            "subject": { "reference": "Patient/pat-7" },
            "context": { "reference": "Encounter/enc-1" },
            "medicationReference": { "reference": "Medication/med-5" },
            "effectiveDateTime": "2021-03-15T10:00:00Z",
            "dosage": {
                "route": { "coding": [{ "system": "http://snomed.info/sct", "code": "26643006" }] },
                "dose": { "value": 5.0, "unit": "mg" }
            }
        }));

        let records = map_administration(&administration, &ctx).unwrap();
        let CdmRecord::DrugExposure(exposure) = &records[0] else {
            panic!("expected drug exposure");
        };
        assert_eq!(exposure.person_id, 42);
        assert_eq!(exposure.visit_occurrence_id, Some(7));
        assert_eq!(exposure.drug_concept_id, 1308216);
        assert_eq!(exposure.drug_source_value, "C09AA05");
        assert_eq!(exposure.drug_type_concept_id, well_known::EHR_ADMINISTRATION_RECORD);
        assert_eq!(exposure.route_concept_id, 4132161);
        assert_eq!(exposure.quantity, Some(5.0));
    }

    #[test]
    fn test_statement_with_inline_code() {
        let ctx = make_bulk_context();
        let statement = make_resource(json!({
            "resourceType": "MedicationStatement",
            "id": "st-1",
            "subject": { "identifier": { "value": "mrn-7" } },
            "medicationCodeableConcept": { "coding": [{ "system": ATC, "code": "C09AA05" }] },
            "effectivePeriod": { "start": "2021-03-01", "end": "2021-03-31" },
            "dosage": [{ "doseAndRate": [{ "doseQuantity": { "value": 1 } }] }]
        }));

        let records = map_statement(&statement, &ctx).unwrap();
        let CdmRecord::DrugExposure(exposure) = &records[0] else {
            panic!("expected drug exposure");
        };
        assert_eq!(exposure.person_id, 42);
        assert_eq!(exposure.drug_type_concept_id, well_known::PATIENT_SELF_REPORTED);
        assert_eq!(exposure.drug_exposure_end_date, date(2021, 3, 31));
        assert_eq!(exposure.quantity, Some(1.0));
        assert_eq!(exposure.visit_occurrence_id, None);
    }

    #[test]
    fn test_unknown_medication_reference_is_skipped_in_bulk() {
        let ctx = make_bulk_context();
        let administration = make_resource(json!({
            "resourceType": "MedicationAdministration",
            "id": "adm-2",
            "subject": { "reference": "Patient/pat-7" },
            "medicationReference": { "reference": "Medication/missing" },
            "effectiveDateTime": "2021-03-15"
        }));

        let err = map_administration(&administration, &ctx).unwrap_err();
        assert_eq!(err.skip_reason(), Some("unresolved_reference"));
    }
}
