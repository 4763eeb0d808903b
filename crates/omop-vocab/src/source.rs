//! Concept lookup seam.
//!
//! [`ConceptSource`] is what the resolver reads from. Two implementations
//! exist: the preloaded [`VocabularySnapshot`](crate::VocabularySnapshot) and
//! [`CachedConceptSource`], a read-through cache in front of any slower source
//! (typically a live vocabulary database query).

use std::sync::Arc;

use dashmap::DashMap;
use omop_types::{Concept, CrossMapping, CrossMappingKind, SourceToConceptEntry};

use crate::types::VocabResult;

/// Lookup of vocabulary rows by (vocabulary id, code).
///
/// Every method returns an empty slice when nothing matches. Results are in
/// no particular order.
pub trait ConceptSource: Send + Sync {
    /// Returns all concepts carrying `code` in `vocabulary_id`.
    fn concepts(&self, vocabulary_id: &str, code: &str) -> VocabResult<Arc<[Concept]>>;

    /// Returns the derived cross-mapping rows for a source code.
    fn cross_mappings(
        &self,
        kind: CrossMappingKind,
        vocabulary_id: &str,
        code: &str,
    ) -> VocabResult<Arc<[CrossMapping]>>;

    /// Returns the curated source-to-concept rows for a local code.
    fn source_to_concept(
        &self,
        vocabulary_id: &str,
        code: &str,
    ) -> VocabResult<Arc<[SourceToConceptEntry]>>;
}

impl<S: ConceptSource + ?Sized> ConceptSource for Arc<S> {
    fn concepts(&self, vocabulary_id: &str, code: &str) -> VocabResult<Arc<[Concept]>> {
        (**self).concepts(vocabulary_id, code)
    }

    fn cross_mappings(
        &self,
        kind: CrossMappingKind,
        vocabulary_id: &str,
        code: &str,
    ) -> VocabResult<Arc<[CrossMapping]>> {
        (**self).cross_mappings(kind, vocabulary_id, code)
    }

    fn source_to_concept(
        &self,
        vocabulary_id: &str,
        code: &str,
    ) -> VocabResult<Arc<[SourceToConceptEntry]>> {
        (**self).source_to_concept(vocabulary_id, code)
    }
}

type CodeKey = (String, String);

/// Read-through cache over another [`ConceptSource`].
///
/// Vocabulary data does not change during a run, so empty results are
/// cached as well. Errors are never cached.
pub struct CachedConceptSource<Q> {
    inner: Q,
    concepts: DashMap<CodeKey, Arc<[Concept]>>,
    cross: DashMap<(CrossMappingKind, String, String), Arc<[CrossMapping]>>,
    source_to_concept: DashMap<CodeKey, Arc<[SourceToConceptEntry]>>,
}

impl<Q: ConceptSource> CachedConceptSource<Q> {
    /// Wraps `inner` with an empty cache.
    pub fn new(inner: Q) -> Self {
        Self {
            inner,
            concepts: DashMap::new(),
            cross: DashMap::new(),
            source_to_concept: DashMap::new(),
        }
    }

    /// Returns the wrapped source.
    pub fn inner(&self) -> &Q {
        &self.inner
    }

    /// Number of cached keys across all lookups.
    pub fn cached_keys(&self) -> usize {
        self.concepts.len() + self.cross.len() + self.source_to_concept.len()
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.concepts.clear();
        self.cross.clear();
        self.source_to_concept.clear();
    }
}

impl<Q: ConceptSource> ConceptSource for CachedConceptSource<Q> {
    fn concepts(&self, vocabulary_id: &str, code: &str) -> VocabResult<Arc<[Concept]>> {
        let key = (vocabulary_id.to_string(), code.to_string());
        if let Some(hit) = self.concepts.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }
        let rows = self.inner.concepts(vocabulary_id, code)?;
        self.concepts.insert(key, Arc::clone(&rows));
        Ok(rows)
    }

    fn cross_mappings(
        &self,
        kind: CrossMappingKind,
        vocabulary_id: &str,
        code: &str,
    ) -> VocabResult<Arc<[CrossMapping]>> {
        let key = (kind, vocabulary_id.to_string(), code.to_string());
        if let Some(hit) = self.cross.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }
        let rows = self.inner.cross_mappings(kind, vocabulary_id, code)?;
        self.cross.insert(key, Arc::clone(&rows));
        Ok(rows)
    }

    fn source_to_concept(
        &self,
        vocabulary_id: &str,
        code: &str,
    ) -> VocabResult<Arc<[SourceToConceptEntry]>> {
        let key = (vocabulary_id.to_string(), code.to_string());
        if let Some(hit) = self.source_to_concept.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }
        let rows = self.inner.source_to_concept(vocabulary_id, code)?;
        self.source_to_concept.insert(key, Arc::clone(&rows));
        Ok(rows)
    }
}

impl<Q> std::fmt::Debug for CachedConceptSource<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedConceptSource")
            .field("concepts", &self.concepts.len())
            .field("cross", &self.cross.len())
            .field("source_to_concept", &self.source_to_concept.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VocabError;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls so tests can observe cache hits.
    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    impl ConceptSource for CountingSource {
        fn concepts(&self, vocabulary_id: &str, code: &str) -> VocabResult<Arc<[Concept]>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(VocabError::Query("connection reset".to_string()));
            }
            if code == "missing" {
                return Ok(Arc::from(Vec::new()));
            }
            Ok(Arc::from(vec![Concept {
                concept_id: 1,
                concept_name: code.to_string(),
                domain_id: "Condition".to_string(),
                vocabulary_id: vocabulary_id.to_string(),
                concept_class_id: "x".to_string(),
                standard_concept: None,
                concept_code: code.to_string(),
                valid_start_date: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
                valid_end_date: NaiveDate::from_ymd_opt(2099, 12, 31).unwrap(),
                invalid_reason: None,
            }]))
        }

        fn cross_mappings(
            &self,
            _kind: CrossMappingKind,
            _vocabulary_id: &str,
            _code: &str,
        ) -> VocabResult<Arc<[CrossMapping]>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::from(Vec::new()))
        }

        fn source_to_concept(
            &self,
            _vocabulary_id: &str,
            _code: &str,
        ) -> VocabResult<Arc<[SourceToConceptEntry]>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::from(Vec::new()))
        }
    }

    fn make_source(fail: bool) -> CachedConceptSource<CountingSource> {
        CachedConceptSource::new(CountingSource {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[test]
    fn test_hits_and_misses_are_cached() {
        let source = make_source(false);

        assert_eq!(source.concepts("ICD10GM", "I10.90").unwrap().len(), 1);
        assert_eq!(source.concepts("ICD10GM", "I10.90").unwrap().len(), 1);
        assert!(source.concepts("ICD10GM", "missing").unwrap().is_empty());
        assert!(source.concepts("ICD10GM", "missing").unwrap().is_empty());

        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.cached_keys(), 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let source = make_source(true);

        assert!(source.concepts("LOINC", "4548-4").is_err());
        assert!(source.concepts("LOINC", "4548-4").is_err());
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.cached_keys(), 0);
    }

    #[test]
    fn test_clear() {
        let source = make_source(false);
        source
            .cross_mappings(CrossMappingKind::IcdToSnomed, "ICD10GM", "I10.90")
            .unwrap();
        assert_eq!(source.cached_keys(), 1);

        source.clear();
        assert_eq!(source.cached_keys(), 0);
    }
}
