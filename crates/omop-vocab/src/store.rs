//! In-memory vocabulary snapshot.
//!
//! Holds the parsed vocabulary tables indexed by (vocabulary id, code) and the
//! cross-vocabulary tables derived from `Maps to` relationships. Built once
//! before the first stage runs and read-only afterwards, so it can be shared
//! across worker threads behind an `Arc`.
//!
//! ```ignore
//! let files = discover_vocabulary_files("/data/vocabulary")?;
//! let mut snapshot = VocabularySnapshot::new();
//! snapshot.load_all(&files, VocabConfig::default())?;
//!
//! let concepts = snapshot.concepts("ICD10GM", "I12.3")?;
//! ```

use std::collections::HashMap;
#[cfg(feature = "parallel")]
use std::fs::File;
#[cfg(feature = "parallel")]
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use omop_types::{
    Concept, ConceptId, ConceptRelationship, CrossMapping, CrossMappingKind, SourceToConceptEntry,
};

use crate::parser::VocabParser;
#[cfg(feature = "parallel")]
use crate::parser::VocabRecord;
use crate::source::ConceptSource;
use crate::types::{VocabConfig, VocabFiles, VocabResult};

type CodeKey = (String, String);
type CrossKey = (CrossMappingKind, String, String);

/// Row counts from [`VocabularySnapshot::load_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Concepts loaded.
    pub concepts: usize,
    /// `Maps to` relationships loaded.
    pub relationships: usize,
    /// Source-to-concept entries loaded.
    pub source_to_concept: usize,
    /// Cross-mapping rows derived.
    pub cross_mappings: usize,
}

/// In-memory vocabulary store, the preloaded [`ConceptSource`].
#[derive(Default)]
pub struct VocabularySnapshot {
    /// Concepts indexed by (vocabulary id, code).
    concepts_by_code: HashMap<CodeKey, Arc<[Concept]>>,
    /// Reverse index: concept id -> (vocabulary id, code).
    code_by_id: HashMap<ConceptId, CodeKey>,
    /// `Maps to` relationships, input to [`Self::build_cross_mappings`].
    maps_to: Vec<ConceptRelationship>,
    /// Derived cross-vocabulary rows indexed by (kind, vocabulary id, code).
    cross: HashMap<CrossKey, Arc<[CrossMapping]>>,
    /// Curated mappings indexed by (source vocabulary id, source code).
    source_to_concept: HashMap<CodeKey, Arc<[SourceToConceptEntry]>>,
}

impl std::fmt::Debug for VocabularySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VocabularySnapshot")
            .field("codes", &self.concepts_by_code.len())
            .field("concepts", &self.code_by_id.len())
            .field("maps_to", &self.maps_to.len())
            .field("cross", &self.cross.len())
            .field("source_to_concept", &self.source_to_concept.len())
            .finish()
    }
}

impl VocabularySnapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads concepts from a `CONCEPT` file.
    pub fn load_concepts<P: AsRef<Path>>(&mut self, path: P, config: VocabConfig) -> VocabResult<usize> {
        let parser = VocabParser::<_, Concept>::from_path(path, config)?;
        parser.parse_batched(|batch| {
            self.insert_concepts(batch);
            Ok(())
        })
    }

    /// Loads `Maps to` rows from a `CONCEPT_RELATIONSHIP` file.
    ///
    /// Call [`Self::build_cross_mappings`] afterwards.
    pub fn load_relationships<P: AsRef<Path>>(
        &mut self,
        path: P,
        config: VocabConfig,
    ) -> VocabResult<usize> {
        let parser = VocabParser::<_, ConceptRelationship>::from_path(path, config)?;
        parser.parse_batched(|batch| {
            self.insert_relationships(batch);
            Ok(())
        })
    }

    /// Loads curated mappings from a `SOURCE_TO_CONCEPT_MAP` file.
    pub fn load_source_to_concept<P: AsRef<Path>>(
        &mut self,
        path: P,
        config: VocabConfig,
    ) -> VocabResult<usize> {
        let parser = VocabParser::<_, SourceToConceptEntry>::from_path(path, config)?;
        parser.parse_batched(|batch| {
            self.insert_source_to_concept(batch);
            Ok(())
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PARALLEL LOADING METHODS (requires "parallel" feature)
    // ═══════════════════════════════════════════════════════════════════════════

    /// Loads concepts from a `CONCEPT` file using parallel parsing.
    ///
    /// Reads all lines into memory, then parses them in parallel using rayon.
    /// Malformed lines are counted and skipped.
    #[cfg(feature = "parallel")]
    pub fn load_concepts_parallel<P: AsRef<Path>>(
        &mut self,
        path: P,
        config: VocabConfig,
    ) -> VocabResult<usize> {
        let path = path.as_ref();
        // Validates the header the same way the streaming parser does.
        VocabParser::<_, Concept>::from_path(path, config.clone())?;
        let lines = read_lines_skip_header(path)?;

        let parsed: Vec<Option<Concept>> = lines
            .par_iter()
            .map(|line| parse_concept_line(line))
            .collect();

        let malformed = parsed.iter().filter(|c| c.is_none()).count();
        if malformed > 0 {
            tracing::warn!(malformed, path = %path.display(), "skipped malformed concept rows");
        }

        let concepts: Vec<Concept> = parsed
            .into_iter()
            .flatten()
            .filter(|c| c.passes_filter(&config))
            .collect();

        let count = concepts.len();
        self.insert_concepts(concepts);
        Ok(count)
    }

    /// Loads every discovered file and derives the cross-mapping tables.
    pub fn load_all(&mut self, files: &VocabFiles, config: VocabConfig) -> VocabResult<LoadSummary> {
        let mut summary = LoadSummary::default();

        if let Some(ref concept_path) = files.concept_file {
            #[cfg(feature = "parallel")]
            {
                summary.concepts = self.load_concepts_parallel(concept_path, config.clone())?;
            }
            #[cfg(not(feature = "parallel"))]
            {
                summary.concepts = self.load_concepts(concept_path, config.clone())?;
            }
        }

        if let Some(ref relationship_path) = files.concept_relationship_file {
            summary.relationships = self.load_relationships(relationship_path, config.clone())?;
        }

        if let Some(ref stcm_path) = files.source_to_concept_file {
            summary.source_to_concept = self.load_source_to_concept(stcm_path, config)?;
        }

        summary.cross_mappings = self.build_cross_mappings();
        Ok(summary)
    }

    /// Inserts concepts.
    ///
    /// A concept id seen again replaces the earlier row.
    pub fn insert_concepts(&mut self, concepts: impl IntoIterator<Item = Concept>) {
        let mut grouped: HashMap<CodeKey, Vec<Concept>> = HashMap::new();
        for concept in concepts {
            let key = (concept.vocabulary_id.clone(), concept.concept_code.clone());
            grouped.entry(key).or_default().push(concept);
        }

        for (key, fresh) in grouped {
            let mut merged: Vec<Concept> = self
                .concepts_by_code
                .remove(&key)
                .map(|existing| existing.to_vec())
                .unwrap_or_default();

            for concept in fresh {
                merged.retain(|c| c.concept_id != concept.concept_id);
                self.code_by_id.insert(concept.concept_id, key.clone());
                merged.push(concept);
            }

            self.concepts_by_code.insert(key, Arc::from(merged));
        }
    }

    /// Inserts relationships; anything but `Maps to` is ignored.
    pub fn insert_relationships(&mut self, relationships: impl IntoIterator<Item = ConceptRelationship>) {
        self.maps_to
            .extend(relationships.into_iter().filter(ConceptRelationship::is_maps_to));
    }

    /// Inserts curated source-to-concept entries.
    pub fn insert_source_to_concept(&mut self, entries: impl IntoIterator<Item = SourceToConceptEntry>) {
        let mut grouped: HashMap<CodeKey, Vec<SourceToConceptEntry>> = HashMap::new();
        for entry in entries {
            let key = (entry.source_vocabulary_id.clone(), entry.source_code.clone());
            grouped.entry(key).or_default().push(entry);
        }

        for (key, fresh) in grouped {
            let mut merged: Vec<SourceToConceptEntry> = self
                .source_to_concept
                .remove(&key)
                .map(|existing| existing.to_vec())
                .unwrap_or_default();
            merged.extend(fresh);
            self.source_to_concept.insert(key, Arc::from(merged));
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // DERIVED CROSS-VOCABULARY TABLES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Rebuilds the cross-mapping tables from the loaded `Maps to` rows.
    ///
    /// A row is valid where both the source concept and the relationship are
    /// valid. The target's domain is copied onto the row; if the target
    /// concept is not loaded the mapping kind's default domain is used.
    ///
    /// Returns the number of rows derived.
    pub fn build_cross_mappings(&mut self) -> usize {
        let mut grouped: HashMap<CrossKey, Vec<CrossMapping>> = HashMap::new();

        for rel in &self.maps_to {
            let Some(source) = self.get_concept(rel.concept_id_1) else {
                continue;
            };
            let target_domain = self.get_concept(rel.concept_id_2).map(|c| c.domain_id.clone());

            let valid_start_date = source.valid_start_date.max(rel.valid_start_date);
            let valid_end_date = source.valid_end_date.min(rel.valid_end_date);
            if valid_start_date > valid_end_date {
                continue;
            }

            for kind in CrossMappingKind::ALL {
                if !kind.source_vocabularies().contains(&source.vocabulary_id.as_str()) {
                    continue;
                }
                let row = CrossMapping {
                    kind,
                    source_vocabulary_id: source.vocabulary_id.clone(),
                    source_code: source.concept_code.clone(),
                    source_concept_id: source.concept_id,
                    target_concept_id: rel.concept_id_2,
                    target_domain_id: target_domain
                        .clone()
                        .unwrap_or_else(|| kind.fallback_domain().as_str().to_string()),
                    valid_start_date,
                    valid_end_date,
                };
                grouped
                    .entry((kind, row.source_vocabulary_id.clone(), row.source_code.clone()))
                    .or_default()
                    .push(row);
            }
        }

        let count = grouped.values().map(Vec::len).sum();
        self.cross = grouped
            .into_iter()
            .map(|(key, rows)| (key, Arc::from(rows)))
            .collect();

        tracing::debug!(rows = count, keys = self.cross.len(), "derived cross-vocabulary tables");
        count
    }

    // Lookups

    /// Gets a concept by id.
    pub fn get_concept(&self, id: ConceptId) -> Option<&Concept> {
        let key = self.code_by_id.get(&id)?;
        self.concepts_by_code
            .get(key)?
            .iter()
            .find(|c| c.concept_id == id)
    }

    /// Returns true if the snapshot holds a concept with this id.
    pub fn has_concept(&self, id: ConceptId) -> bool {
        self.code_by_id.contains_key(&id)
    }

    // Statistics

    /// Returns the number of concepts in the snapshot.
    pub fn concept_count(&self) -> usize {
        self.code_by_id.len()
    }

    /// Returns the number of `Maps to` relationships loaded.
    pub fn relationship_count(&self) -> usize {
        self.maps_to.len()
    }

    /// Returns the number of derived rows of one mapping kind.
    pub fn cross_mapping_count(&self, kind: CrossMappingKind) -> usize {
        self.cross
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, rows)| rows.len())
            .sum()
    }

    /// Returns the number of curated source-to-concept entries.
    pub fn source_to_concept_count(&self) -> usize {
        self.source_to_concept.values().map(|v| v.len()).sum()
    }

    /// Estimates memory usage in bytes.
    pub fn estimated_memory_bytes(&self) -> usize {
        use std::mem::size_of;

        let concept_size: usize = self
            .concepts_by_code
            .iter()
            .map(|((vocab, code), concepts)| {
                vocab.len()
                    + code.len()
                    + concepts
                        .iter()
                        .map(|c| size_of::<Concept>() + c.concept_name.len())
                        .sum::<usize>()
            })
            .sum();

        let index_size = self.code_by_id.len() * (size_of::<ConceptId>() + size_of::<CodeKey>());
        let rel_size = self.maps_to.len() * size_of::<ConceptRelationship>();
        let cross_size = self.cross.values().map(|rows| rows.len()).sum::<usize>() * size_of::<CrossMapping>();
        let stcm_size = self.source_to_concept_count() * size_of::<SourceToConceptEntry>();

        concept_size + index_size + rel_size + cross_size + stcm_size
    }
}

impl ConceptSource for VocabularySnapshot {
    fn concepts(&self, vocabulary_id: &str, code: &str) -> VocabResult<Arc<[Concept]>> {
        let key = (vocabulary_id.to_string(), code.to_string());
        Ok(self
            .concepts_by_code
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new())))
    }

    fn cross_mappings(
        &self,
        kind: CrossMappingKind,
        vocabulary_id: &str,
        code: &str,
    ) -> VocabResult<Arc<[CrossMapping]>> {
        let key = (kind, vocabulary_id.to_string(), code.to_string());
        Ok(self
            .cross
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new())))
    }

    fn source_to_concept(
        &self,
        vocabulary_id: &str,
        code: &str,
    ) -> VocabResult<Arc<[SourceToConceptEntry]>> {
        let key = (vocabulary_id.to_string(), code.to_string());
        Ok(self
            .source_to_concept
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new())))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARALLEL PARSING HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Reads all lines from a file, skipping the header row.
#[cfg(feature = "parallel")]
fn read_lines_skip_header<P: AsRef<Path>>(path: P) -> VocabResult<Vec<String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.lines().skip(1) {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Parses a single concept line.
#[cfg(feature = "parallel")]
fn parse_concept_line(line: &str) -> Option<Concept> {
    let fields: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
    if fields.len() < Concept::EXPECTED_COLUMNS.len() {
        return None;
    }
    Concept::from_record(&csv::StringRecord::from(fields)).ok()
}
