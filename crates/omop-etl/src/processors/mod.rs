//! Per-resource mappings from FHIR to CDM records.
//!
//! Each stage has one mapping function. Mappings are pure apart from the
//! shared caches in [`MappingContext`], so a chunk's items can be mapped in
//! parallel.

mod category;
mod clinical;
mod encounter;
mod immunization;
mod medication;
mod patient;

pub use category::{CONSENT_CATEGORY_VOCABULARY, REPORT_CATEGORY_VOCABULARY};

use std::sync::Arc;

use chrono::NaiveDate;
use omop_types::{CdmRecord, ConceptId, EntityKind, SurrogateId};
use omop_vocab::{CodeLookup, ConceptResolver, ResolveError};

use crate::error::{EtlError, EtlResult};
use crate::fhir;
use crate::identity::IdentityCaches;
use crate::reference::ReferenceResolver;
use crate::source::SourceResource;
use crate::stage::Stage;

/// Shared state handed to every mapping.
#[derive(Debug, Clone)]
pub struct MappingContext {
    /// Concept lookups.
    pub concepts: ConceptResolver,
    /// Person, visit and medication references.
    pub references: Arc<ReferenceResolver>,
    /// Surrogate id allocation.
    pub caches: Arc<IdentityCaches>,
}

/// Maps one resource for `stage`.
pub fn process(stage: Stage, resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    match stage {
        Stage::Patients => patient::map_patient(resource, ctx),
        Stage::EncounterInstitution => encounter::map_institution(resource, ctx),
        Stage::EncounterDepartment => encounter::map_department(resource, ctx),
        Stage::Medications => medication::map_medication(resource, ctx),
        Stage::MedicationStatements => medication::map_statement(resource, ctx),
        Stage::MedicationAdministrations => medication::map_administration(resource, ctx),
        Stage::Conditions => clinical::map_condition(resource, ctx),
        Stage::Observations => clinical::map_observation(resource, ctx),
        Stage::Procedures => clinical::map_procedure(resource, ctx),
        Stage::Immunizations => immunization::map_immunization(resource, ctx),
        Stage::Consents => category::map_consent(resource, ctx),
        Stage::DiagnosticReports => category::map_diagnostic_report(resource, ctx),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Surrogate id of the entity `resource` defines: the id it already has in
/// the CDM, the id another resource with the same identifier got earlier in
/// this run, or a newly allocated one.
///
/// Only for kinds fed by a single resource type; logical ids are unique per
/// type, so drug exposures are allocated by key alone. Identifiers are shared
/// only for kinds other resources reference.
fn entity_id(resource: &SourceResource, kind: EntityKind, ctx: &MappingContext) -> EtlResult<SurrogateId> {
    let cache = ctx.caches.cache(kind);
    let key = resource.key();
    if let Some(id) = cache.get(&key) {
        return Ok(id);
    }
    let identifier = fhir::first_identifier(&resource.payload)
        .filter(|s| !s.trim().is_empty())
        .filter(|_| ctx.references.tracks(kind));
    match ctx.references.existing_id(kind, identifier, resource.logical_id.as_deref())? {
        Some(id) => {
            cache.put(&key, id);
            if let Some(identifier) = identifier {
                cache.reserve_identifier(identifier, id);
            }
            Ok(id)
        }
        None => Ok(cache.get_or_create_shared(&key, identifier)),
    }
}

/// Resolves the required person reference at `field`.
fn person_id(resource: &SourceResource, field: &str, ctx: &MappingContext) -> EtlResult<SurrogateId> {
    let keys = fhir::reference(&resource.payload, field);
    ctx.references
        .resolve_person_id(keys.identifier, keys.logical_id, resource.id)?
        .required(EntityKind::Person, resource.id)
}

/// Resolves the optional visit reference at `field`.
fn visit_id(resource: &SourceResource, field: &str, ctx: &MappingContext) -> EtlResult<Option<SurrogateId>> {
    let keys = fhir::reference(&resource.payload, field);
    if keys.is_empty() {
        return Ok(None);
    }
    ctx.references
        .resolve_visit_id(keys.identifier, keys.logical_id, resource.id)?
        .optional(EntityKind::VisitOccurrence, resource.id)
}

/// First full date at `paths`, or an invalid-resource error.
fn required_date(resource: &SourceResource, paths: &[&[&str]]) -> EtlResult<NaiveDate> {
    fhir::date_at(&resource.payload, paths)
        .ok_or_else(|| EtlError::invalid(&resource.resource_type, resource.id, "missing event date"))
}

/// Resolves an auxiliary coded value (route, unit, value concept).
///
/// A code with no window covering the date gives 0 instead of skipping the
/// whole item.
fn auxiliary_concept(ctx: &MappingContext, lookup: &CodeLookup<'_>) -> EtlResult<ConceptId> {
    match ctx.concepts.resolve(lookup) {
        Ok(concept) => Ok(concept.concept_id),
        Err(ResolveError::NoValidConcept { .. }) => Ok(omop_types::well_known::NO_MATCHING_CONCEPT),
        Err(e) => Err(e.into()),
    }
}

/// Returns a predicate matching code systems routed to one of `vocabularies`.
fn routed_to<'a>(ctx: &'a MappingContext, vocabularies: &'a [&'a str]) -> impl Fn(&str) -> bool + 'a {
    move |system| {
        ctx.concepts
            .router()
            .vocabulary_id(system)
            .is_some_and(|vocab| vocabularies.contains(&vocab))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the mapping tests.

    use super::*;
    use crate::collaborators::{IdentityStore, RescheduleHook};
    use crate::config::EtlConfig;
    use chrono::{DateTime, TimeZone, Utc};
    use omop_types::cdm::MedicationRecord;
    use omop_types::{Concept, ConceptRelationship, IdentityRecord};
    use omop_vocab::{VocabularyRouter, VocabularySnapshot};
    use serde_json::Value;

    pub struct EmptyStore;

    impl IdentityStore for EmptyStore {
        fn find_by_logical_id(&self, _: EntityKind, _: &str) -> EtlResult<Option<SurrogateId>> {
            Ok(None)
        }
        fn find_by_identifier(&self, _: EntityKind, _: &str) -> EtlResult<Option<SurrogateId>> {
            Ok(None)
        }
        fn find_medication(&self, _: SurrogateId) -> EtlResult<Option<MedicationRecord>> {
            Ok(None)
        }
        fn max_id(&self, _: EntityKind) -> EtlResult<Option<SurrogateId>> {
            Ok(None)
        }
        fn load_identities(&self, _: EntityKind) -> EtlResult<Vec<IdentityRecord>> {
            Ok(Vec::new())
        }
    }

    pub struct NoopHook;

    impl RescheduleHook for NoopHook {
        fn reschedule(&self, _: i64, _: DateTime<Utc>) -> EtlResult<()> {
            Ok(())
        }
    }

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub fn make_concept(id: ConceptId, vocab: &str, code: &str, domain: &str) -> Concept {
        Concept {
            concept_id: id,
            concept_name: code.to_string(),
            domain_id: domain.to_string(),
            vocabulary_id: vocab.to_string(),
            concept_class_id: "Test".to_string(),
            standard_concept: Some("S".to_string()),
            concept_code: code.to_string(),
            valid_start_date: date(2015, 1, 1),
            valid_end_date: date(2099, 12, 31),
            invalid_reason: None,
        }
    }

    pub fn make_maps_to(source: ConceptId, target: ConceptId) -> ConceptRelationship {
        ConceptRelationship {
            concept_id_1: source,
            concept_id_2: target,
            relationship_id: ConceptRelationship::MAPS_TO.to_string(),
            valid_start_date: date(1970, 1, 1),
            valid_end_date: date(2099, 12, 31),
            invalid_reason: None,
        }
    }

    /// A small vocabulary covering every mapping.
    pub fn make_snapshot() -> VocabularySnapshot {
        let mut snapshot = VocabularySnapshot::new();
        snapshot.insert_concepts([
            make_concept(44800001, "ICD10GM", "I12.3", "Condition"),
            make_concept(320128, "SNOMED", "38341003", "Condition"),
            make_concept(3004410, "LOINC", "4548-4", "Measurement"),
            make_concept(8554, "UCUM", "%", "Unit"),
            make_concept(1308216, "ATC", "C09AA05", "Drug"),
            make_concept(4132161, "SNOMED", "26643006", "Route"),
            make_concept(2211, "OPS", "5-470", "Procedure"),
            make_concept(500, "CVX", "140", "Drug"),
            make_concept(40213154, "CVX", "208", "Drug"),
            make_concept(8527, "Race", "2106-3", "Race"),
        ]);
        snapshot.insert_relationships([make_maps_to(500, 40213154)]);
        snapshot.build_cross_mappings();
        snapshot
    }

    pub fn make_context(config: &EtlConfig) -> MappingContext {
        let resolver = ConceptResolver::new(
            Arc::new(make_snapshot()),
            Arc::new(VocabularyRouter::default()),
        );
        MappingContext {
            concepts: resolver,
            references: Arc::new(ReferenceResolver::new(config, Arc::new(EmptyStore), Arc::new(NoopHook))),
            caches: Arc::new(IdentityCaches::new()),
        }
    }

    /// Bulk context with person `pat-7` = 42 and visit `enc-1` = 7.
    pub fn make_bulk_context() -> MappingContext {
        let config = EtlConfig {
            bulk_load: true,
            ..Default::default()
        };
        let ctx = make_context(&config);
        ctx.references
            .register(EntityKind::Person, &IdentityRecord::new(42, Some("pat-7"), Some("mrn-7")))
            .unwrap();
        ctx.references
            .register(EntityKind::VisitOccurrence, &IdentityRecord::new(7, Some("enc-1"), None))
            .unwrap();
        ctx
    }

    pub fn make_resource(payload: Value) -> SourceResource {
        SourceResource::from_payload(1, Utc.with_ymd_and_hms(2021, 3, 16, 0, 0, 0).unwrap(), payload)
    }
}
