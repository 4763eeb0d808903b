//! OMOP enumeration types.
//!
//! This module provides enum representations for coded values the pipeline
//! routes on: concept domains, the entity kinds that receive surrogate ids,
//! and the kinds of derived cross-vocabulary mappings.

/// Domain of an OMOP concept.
///
/// Only the domains the pipeline routes records on are enumerated; other
/// domain ids stay available as strings on [`Concept`](crate::Concept).
///
/// # Examples
///
/// ```
/// use omop_types::Domain;
///
/// let domain = Domain::from_domain_id("Measurement");
/// assert_eq!(domain, Some(Domain::Measurement));
/// assert_eq!(Domain::SpecAnatomicSite.as_str(), "Spec Anatomic Site");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Domain {
    /// Diagnoses and findings.
    Condition,
    /// Drugs and vaccines.
    Drug,
    /// Laboratory and vital-sign measurements.
    Measurement,
    /// Catch-all for clinical facts without a dedicated table.
    Observation,
    /// Procedures.
    Procedure,
    /// Visit types.
    Visit,
    /// Devices.
    Device,
    /// Administrative gender.
    Gender,
    /// Race.
    Race,
    /// Units of measure.
    Unit,
    /// Routes of administration.
    Route,
    /// Anatomic sites of specimens.
    SpecAnatomicSite,
    /// Provenance type concepts.
    TypeConcept,
}

impl Domain {
    /// Parses a `domain_id` value from the vocabulary.
    ///
    /// Returns `None` if the value is not a routed domain.
    pub fn from_domain_id(value: &str) -> Option<Self> {
        match value {
            "Condition" => Some(Self::Condition),
            "Drug" => Some(Self::Drug),
            "Measurement" => Some(Self::Measurement),
            "Observation" => Some(Self::Observation),
            "Procedure" => Some(Self::Procedure),
            "Visit" => Some(Self::Visit),
            "Device" => Some(Self::Device),
            "Gender" => Some(Self::Gender),
            "Race" => Some(Self::Race),
            "Unit" => Some(Self::Unit),
            "Route" => Some(Self::Route),
            "Spec Anatomic Site" => Some(Self::SpecAnatomicSite),
            "Type Concept" => Some(Self::TypeConcept),
            _ => None,
        }
    }

    /// Returns the `domain_id` string for this domain.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Condition => "Condition",
            Self::Drug => "Drug",
            Self::Measurement => "Measurement",
            Self::Observation => "Observation",
            Self::Procedure => "Procedure",
            Self::Visit => "Visit",
            Self::Device => "Device",
            Self::Gender => "Gender",
            Self::Race => "Race",
            Self::Unit => "Unit",
            Self::Route => "Route",
            Self::SpecAnatomicSite => "Spec Anatomic Site",
            Self::TypeConcept => "Type Concept",
        }
    }
}

/// Kind of entity that receives an internally minted surrogate id.
///
/// Every kind owns an independent id sequence; ids are never shared
/// across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EntityKind {
    /// `person` rows.
    Person,
    /// `location` rows.
    Location,
    /// `visit_occurrence` rows.
    VisitOccurrence,
    /// Registered medication resources.
    Medication,
    /// `drug_exposure` rows.
    DrugExposure,
    /// `visit_detail` rows.
    VisitDetail,
}

impl EntityKind {
    /// All entity kinds, in allocation order.
    pub const ALL: [EntityKind; 6] = [
        Self::Person,
        Self::Location,
        Self::VisitOccurrence,
        Self::Medication,
        Self::DrugExposure,
        Self::VisitDetail,
    ];

    /// Returns a stable lowercase name, used in logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Location => "location",
            Self::VisitOccurrence => "visit_occurrence",
            Self::Medication => "medication",
            Self::DrugExposure => "drug_exposure",
            Self::VisitDetail => "visit_detail",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of derived cross-vocabulary mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CrossMappingKind {
    /// ICD-10-GM diagnosis codes to SNOMED standard concepts.
    IcdToSnomed,
    /// Vaccine codes (CVX, ATC) to standard drug concepts.
    VaccineToStandard,
    /// Local race codes to standard race concepts.
    RaceToStandard,
}

impl CrossMappingKind {
    /// All mapping kinds.
    pub const ALL: [CrossMappingKind; 3] = [
        Self::IcdToSnomed,
        Self::VaccineToStandard,
        Self::RaceToStandard,
    ];

    /// Source vocabularies whose `Maps to` relationships feed this table.
    pub fn source_vocabularies(self) -> &'static [&'static str] {
        match self {
            Self::IcdToSnomed => &["ICD10GM", "ICD10"],
            Self::VaccineToStandard => &["CVX", "ATC"],
            Self::RaceToStandard => &["Race"],
        }
    }

    /// Domain assumed when a fallback row has to be synthesized.
    pub fn fallback_domain(self) -> crate::Domain {
        match self {
            Self::IcdToSnomed => crate::Domain::Condition,
            Self::VaccineToStandard => crate::Domain::Drug,
            Self::RaceToStandard => crate::Domain::Race,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_conversion() {
        assert_eq!(Domain::from_domain_id("Condition"), Some(Domain::Condition));
        assert_eq!(
            Domain::from_domain_id("Spec Anatomic Site"),
            Some(Domain::SpecAnatomicSite)
        );
        assert_eq!(Domain::from_domain_id("Meas Value"), None);
        assert_eq!(Domain::TypeConcept.as_str(), "Type Concept");
    }

    #[test]
    fn test_domain_roundtrip() {
        for domain in [Domain::Drug, Domain::Observation, Domain::Route] {
            assert_eq!(Domain::from_domain_id(domain.as_str()), Some(domain));
        }
    }

    #[test]
    fn test_entity_kind_names() {
        assert_eq!(EntityKind::Person.to_string(), "person");
        assert_eq!(EntityKind::VisitDetail.as_str(), "visit_detail");
        assert_eq!(EntityKind::ALL.len(), 6);
    }

    #[test]
    fn test_cross_mapping_sources() {
        assert!(CrossMappingKind::IcdToSnomed
            .source_vocabularies()
            .contains(&"ICD10GM"));
        assert_eq!(
            CrossMappingKind::VaccineToStandard.fallback_domain(),
            Domain::Drug
        );
    }
}
