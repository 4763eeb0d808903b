//! Temporally-aware concept resolution.
//!
//! [`ConceptResolver`] turns a (code system url, code) pair into a concept
//! valid on the event's date. Three outcomes matter to callers:
//!
//! - a concept valid on the date;
//! - the "no matching concept" default (id 0) when the code system is not
//!   routed or the code is unknown, which is logged and not an error;
//! - [`ResolveError::NoValidConcept`] when the code is known but no window
//!   covers the date, which callers treat as a signal to skip the item.

use std::sync::Arc;

use chrono::NaiveDate;
use omop_types::{well_known, Concept, CrossMapping, CrossMappingKind, Domain, SourceToConceptEntry};
use thiserror::Error;

use crate::router::VocabularyRouter;
use crate::source::ConceptSource;
use crate::types::VocabError;
use crate::validity::validity_date;

/// Errors from concept resolution.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The code exists but none of its concepts is valid on the date.
    #[error("No concept for {vocabulary_id} code {code} is valid on {date}")]
    NoValidConcept {
        /// Vocabulary of the code.
        vocabulary_id: String,
        /// The source code.
        code: String,
        /// Date the concept had to be valid on.
        date: NaiveDate,
    },

    /// The concept source failed.
    #[error(transparent)]
    Source(#[from] VocabError),
}

/// A coded value to resolve.
#[derive(Debug, Clone, Copy)]
pub struct CodeLookup<'a> {
    /// Code system url.
    pub system: &'a str,
    /// The code.
    pub code: &'a str,
    /// Code system version, if the source recorded one.
    pub version: Option<&'a str>,
    /// Date of the clinical event.
    pub event_date: Option<NaiveDate>,
    /// Domain of the default concept when nothing maps.
    pub domain: Domain,
}

impl<'a> CodeLookup<'a> {
    /// Creates a lookup without version or event date.
    pub fn new(system: &'a str, code: &'a str, domain: Domain) -> Self {
        Self {
            system,
            code,
            version: None,
            event_date: None,
            domain,
        }
    }

    /// Sets the code system version.
    pub fn version(mut self, version: Option<&'a str>) -> Self {
        self.version = version;
        self
    }

    /// Sets the event date.
    pub fn on(mut self, event_date: Option<NaiveDate>) -> Self {
        self.event_date = event_date;
        self
    }
}

/// Resolves source codes to concepts.
///
/// Cheap to clone; all state is shared and read-only.
#[derive(Clone)]
pub struct ConceptResolver {
    source: Arc<dyn ConceptSource>,
    router: Arc<VocabularyRouter>,
}

impl std::fmt::Debug for ConceptResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConceptResolver")
            .field("routes", &self.router.len())
            .finish()
    }
}

impl ConceptResolver {
    /// Creates a resolver over `source` using `router` for url translation.
    pub fn new(source: Arc<dyn ConceptSource>, router: Arc<VocabularyRouter>) -> Self {
        Self { source, router }
    }

    /// Returns the routing table.
    pub fn router(&self) -> &VocabularyRouter {
        &self.router
    }

    /// Resolves a code to the concept valid on the lookup's validity date.
    pub fn resolve(&self, lookup: &CodeLookup<'_>) -> Result<Concept, ResolveError> {
        let Some(vocabulary_id) = self.router.vocabulary_id(lookup.system) else {
            tracing::debug!(system = lookup.system, code = lookup.code, "unrouted code system");
            return Ok(Concept::no_matching(lookup.code, None, lookup.domain));
        };

        let concepts = self.source.concepts(vocabulary_id, lookup.code)?;
        if concepts.is_empty() {
            tracing::debug!(vocabulary_id, code = lookup.code, "unmapped code");
            return Ok(Concept::no_matching(lookup.code, Some(vocabulary_id), lookup.domain));
        }

        match validity_date(lookup.version, lookup.event_date) {
            None => Ok(latest(&concepts, |c| (c.valid_end_date, c.concept_id)).clone()),
            Some(date) => concepts
                .iter()
                .filter(|c| c.is_valid_on(date))
                .min_by_key(|c| c.concept_id)
                .cloned()
                .ok_or_else(|| ResolveError::NoValidConcept {
                    vocabulary_id: vocabulary_id.to_string(),
                    code: lookup.code.to_string(),
                    date,
                }),
        }
    }

    /// Resolves an ICD-10 code to its SNOMED targets.
    pub fn resolve_icd_to_snomed(&self, lookup: &CodeLookup<'_>) -> Result<Vec<CrossMapping>, ResolveError> {
        self.resolve_cross(CrossMappingKind::IcdToSnomed, lookup)
    }

    /// Resolves a vaccine code (CVX, ATC) to its standard drug targets.
    pub fn resolve_vaccine_to_standard(
        &self,
        lookup: &CodeLookup<'_>,
    ) -> Result<Vec<CrossMapping>, ResolveError> {
        self.resolve_cross(CrossMappingKind::VaccineToStandard, lookup)
    }

    /// Resolves a race code to its standard targets.
    pub fn resolve_race_to_standard(&self, lookup: &CodeLookup<'_>) -> Result<Vec<CrossMapping>, ResolveError> {
        self.resolve_cross(CrossMappingKind::RaceToStandard, lookup)
    }

    /// Shared logic of the cross-vocabulary lookups.
    ///
    /// Returns at least one row. When the derived table has no entry for the
    /// code valid on the date, the base code is resolved and a row mapping it
    /// onto itself is synthesized.
    fn resolve_cross(
        &self,
        kind: CrossMappingKind,
        lookup: &CodeLookup<'_>,
    ) -> Result<Vec<CrossMapping>, ResolveError> {
        let vocabulary_id = self.router.vocabulary_id(lookup.system);

        let rows = match vocabulary_id {
            Some(vocab) => self.source.cross_mappings(kind, vocab, lookup.code)?,
            None => Arc::from(Vec::new()),
        };

        let mut valid: Vec<CrossMapping> = match validity_date(lookup.version, lookup.event_date) {
            None => rows.to_vec(),
            Some(date) => rows.iter().filter(|r| r.is_valid_on(date)).cloned().collect(),
        };

        // No row for the code, or none for the date: map the base code.
        if valid.is_empty() {
            let concept = self.resolve(lookup)?;
            return Ok(vec![synthesize(kind, &concept)]);
        }

        valid.sort_by_key(|r| (r.target_concept_id, r.valid_start_date));
        valid.dedup_by_key(|r| r.target_concept_id);
        Ok(valid)
    }

    /// Looks up a curated mapping for a local code.
    ///
    /// Unknown codes get a default entry targeting "manually recorded" for
    /// category-like vocabularies and "no matching concept" otherwise.
    pub fn resolve_source_to_concept(
        &self,
        vocabulary_id: &str,
        code: &str,
    ) -> Result<SourceToConceptEntry, ResolveError> {
        let entries = self.source.source_to_concept(vocabulary_id, code)?;

        let current = entries.iter().filter(|e| e.invalid_reason.is_none());
        if let Some(entry) = current.max_by_key(|e| (e.valid_end_date, e.target_concept_id)) {
            return Ok(entry.clone());
        }
        if !entries.is_empty() {
            return Ok(latest(&entries, |e| (e.valid_end_date, e.target_concept_id)).clone());
        }

        let target = if self.router.is_category_vocabulary(vocabulary_id) {
            well_known::MANUALLY_RECORDED
        } else {
            well_known::NO_MATCHING_CONCEPT
        };
        tracing::debug!(vocabulary_id, code, target, "no curated mapping");
        Ok(SourceToConceptEntry::fallback(vocabulary_id, code, target))
    }
}

/// Picks the element with the greatest key from a non-empty slice.
fn latest<T, K: Ord>(items: &[T], key: impl Fn(&T) -> K) -> &T {
    let mut best = &items[0];
    for item in &items[1..] {
        if key(item) > key(best) {
            best = item;
        }
    }
    best
}

fn synthesize(kind: CrossMappingKind, concept: &Concept) -> CrossMapping {
    CrossMapping {
        kind,
        source_vocabulary_id: concept.vocabulary_id.clone(),
        source_code: concept.concept_code.clone(),
        source_concept_id: concept.concept_id,
        target_concept_id: concept.concept_id,
        target_domain_id: concept.domain_id.clone(),
        valid_start_date: concept.valid_start_date,
        valid_end_date: concept.valid_end_date,
    }
}
