//! Immunization -> drug_exposure via the vaccine mapping.

use omop_types::cdm::DrugExposure;
use omop_types::{well_known, CdmRecord, Domain, EntityKind};
use omop_vocab::CodeLookup;

use super::{auxiliary_concept, person_id, required_date, routed_to, visit_id, MappingContext};
use crate::error::{EtlError, EtlResult};
use crate::fhir;
use crate::source::SourceResource;

const VACCINE_VOCABULARIES: &[&str] = &["CVX", "ATC"];

pub(super) fn map_immunization(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let payload = &resource.payload;
    let person_id = person_id(resource, "patient", ctx)?;
    let visit_occurrence_id = visit_id(resource, "encounter", ctx)?;
    let date = required_date(resource, &[&["occurrenceDateTime"], &["recorded"]])?;

    let coding = fhir::coding(payload, "vaccineCode", routed_to(ctx, VACCINE_VOCABULARIES))
        .ok_or_else(|| EtlError::invalid(&resource.resource_type, resource.id, "no coded vaccineCode"))?;
    let lookup = CodeLookup::new(coding.system, coding.code, Domain::Drug)
        .version(coding.version)
        .on(Some(date));
    let targets = ctx.concepts.resolve_vaccine_to_standard(&lookup)?;
    let Some(target) = targets.first() else {
        return Err(EtlError::invalid(&resource.resource_type, resource.id, "vaccine code did not map"));
    };

    let route = fhir::coding(payload, "route", |_| true);
    let route_concept_id = match route {
        Some(route) => auxiliary_concept(
            ctx,
            &CodeLookup::new(route.system, route.code, Domain::Route).on(Some(date)),
        )?,
        None => well_known::NO_MATCHING_CONCEPT,
    };

    let exposure = DrugExposure {
        drug_exposure_id: ctx.caches.get_or_create(EntityKind::DrugExposure, &resource.key()),
        person_id,
        drug_concept_id: target.target_concept_id,
        drug_exposure_start_date: date,
        drug_exposure_end_date: date,
        drug_type_concept_id: well_known::EHR,
        quantity: fhir::f64_at(payload, &["doseQuantity", "value"]),
        route_concept_id,
        route_source_value: route.map(|r| r.code.to_string()),
        visit_occurrence_id,
        drug_source_value: coding.code.to_string(),
        drug_source_concept_id: target.source_concept_id,
        fhir_logical_id: resource.logical_id.clone(),
        fhir_identifier: fhir::first_identifier(payload).map(str::to_string),
    };
    Ok(vec![CdmRecord::DrugExposure(exposure)])
}
