//! Patient -> person (+ location).

use omop_types::cdm::{Location, Person};
use omop_types::{well_known, CdmRecord, ConceptId, Domain, EntityKind};
use omop_vocab::{CodeLookup, ResolveError};
use serde_json::Value;

use super::{entity_id, MappingContext};
use crate::error::EtlResult;
use crate::fhir::{self, Coding};
use crate::source::SourceResource;

pub(super) fn map_patient(resource: &SourceResource, ctx: &MappingContext) -> EtlResult<Vec<CdmRecord>> {
    let payload = &resource.payload;
    let mut records = Vec::with_capacity(2);

    let location = address(payload).map(|(city, zip, country)| {
        let source_value = [city, zip, country].map(Option::unwrap_or_default).join("|");
        Location {
            location_id: ctx.caches.get_or_create(EntityKind::Location, &source_value),
            city: city.map(str::to_string),
            zip: zip.map(str::to_string),
            country: country.map(str::to_string),
            location_source_value: source_value,
        }
    });

    let gender = fhir::str_at(payload, &["gender"]);
    let (year, month, day) = fhir::str_at(payload, &["birthDate"])
        .map(fhir::partial_date)
        .unwrap_or_default();

    let race = race_coding(payload, ctx);
    let race_concept_id = match race {
        Some(coding) => race_concept(ctx, &coding)?,
        None => well_known::NO_MATCHING_CONCEPT,
    };

    let person = Person {
        person_id: entity_id(resource, EntityKind::Person, ctx)?,
        gender_concept_id: gender_concept(gender),
        year_of_birth: year,
        month_of_birth: month,
        day_of_birth: day,
        race_concept_id,
        location_id: location.as_ref().map(|l| l.location_id),
        person_source_value: resource.logical_id.clone(),
        gender_source_value: gender.map(str::to_string),
        race_source_value: race.map(|c| c.code.to_string()),
        fhir_logical_id: resource.logical_id.clone(),
        fhir_identifier: fhir::first_identifier(payload).map(str::to_string),
    };

    if let Some(location) = location {
        records.push(CdmRecord::Location(location));
    }
    records.push(CdmRecord::Person(person));
    Ok(records)
}

fn gender_concept(gender: Option<&str>) -> ConceptId {
    match gender {
        Some("male") => well_known::GENDER_MALE,
        Some("female") => well_known::GENDER_FEMALE,
        Some("other") => well_known::GENDER_OTHER,
        _ => well_known::GENDER_UNKNOWN,
    }
}

type Address<'a> = (Option<&'a str>, Option<&'a str>, Option<&'a str>);

/// City, postal code and country of the first address that has any of them.
fn address(payload: &Value) -> Option<Address<'_>> {
    payload
        .get("address")?
        .as_array()?
        .iter()
        .map(|a| {
            (
                fhir::str_at(a, &["city"]),
                fhir::str_at(a, &["postalCode"]),
                fhir::str_at(a, &["country"]),
            )
        })
        .find(|(city, zip, country)| city.is_some() || zip.is_some() || country.is_some())
}

/// First `valueCoding` in the (possibly nested) extensions whose system
/// routes to the race vocabulary.
fn race_coding<'a>(payload: &'a Value, ctx: &MappingContext) -> Option<Coding<'a>> {
    let extensions = payload.get("extension")?.as_array()?;
    extensions.iter().find_map(|extension| {
        let nested = extension
            .get("extension")
            .and_then(Value::as_array)
            .map(|v| v.as_slice())
            .unwrap_or_default();
        std::iter::once(extension)
            .chain(nested)
            .filter_map(|e| e.get("valueCoding"))
            .find_map(|coding| {
                let coding = Coding {
                    system: fhir::str_at(coding, &["system"])?,
                    code: fhir::str_at(coding, &["code"])?,
                    version: fhir::str_at(coding, &["version"]),
                    display: fhir::str_at(coding, &["display"]),
                };
                let routed = ctx.concepts.router().vocabulary_id(coding.system);
                (routed == Some("Race")).then_some(coding)
            })
    })
}

fn race_concept(ctx: &MappingContext, coding: &Coding<'_>) -> EtlResult<ConceptId> {
    let lookup = CodeLookup::new(coding.system, coding.code, Domain::Race).version(coding.version);
    match ctx.concepts.resolve_race_to_standard(&lookup) {
        Ok(rows) => Ok(rows.first().map_or(well_known::NO_MATCHING_CONCEPT, |r| r.target_concept_id)),
        Err(ResolveError::NoValidConcept { .. }) => Ok(well_known::NO_MATCHING_CONCEPT),
        Err(e) => Err(e.into()),
    }
}
