//! Code system url to vocabulary id routing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;

use serde::Deserialize;

use crate::types::VocabResult;

/// Built-in routes: code system url -> vocabulary id.
const DEFAULT_ROUTES: &[(&str, &str)] = &[
    ("http://fhir.de/CodeSystem/bfarm/icd-10-gm", "ICD10GM"),
    ("http://fhir.de/CodeSystem/dimdi/icd-10-gm", "ICD10GM"),
    ("http://hl7.org/fhir/sid/icd-10", "ICD10"),
    ("http://loinc.org", "LOINC"),
    ("http://fhir.de/CodeSystem/bfarm/atc", "ATC"),
    ("http://fhir.de/CodeSystem/dimdi/atc", "ATC"),
    ("http://www.whocc.no/atc", "ATC"),
    ("http://fhir.de/CodeSystem/bfarm/ops", "OPS"),
    ("http://fhir.de/CodeSystem/dimdi/ops", "OPS"),
    ("http://snomed.info/sct", "SNOMED"),
    ("http://unitsofmeasure.org", "UCUM"),
    ("http://hl7.org/fhir/sid/cvx", "CVX"),
    ("http://standardterms.edqm.eu", "EDQM"),
    ("http://terminology.hl7.org/CodeSystem/v3-Race", "Race"),
    ("urn:oid:2.16.840.1.113883.6.238", "Race"),
    ("http://hl7.org/fhir/administrative-gender", "Gender"),
    ("http://terminology.hl7.org/CodeSystem/observation-category", "ObservationCategory"),
    ("http://terminology.hl7.org/CodeSystem/v2-0074", "DiagnosticReportCategory"),
    ("http://terminology.hl7.org/CodeSystem/consentscope", "ConsentCategory"),
    ("http://terminology.hl7.org/CodeSystem/consentcategorycodes", "ConsentCategory"),
];

/// Local vocabularies whose unmapped codes are recorded as
/// "manually recorded" rather than "no matching concept".
const DEFAULT_CATEGORY_VOCABULARIES: &[&str] = &[
    "ObservationCategory",
    "DiagnosticReportCategory",
    "ConsentCategory",
];

/// On-disk form of a routing table override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteTable {
    /// Start from an empty table instead of the built-in routes.
    pub replace_defaults: bool,
    /// Code system url -> vocabulary id.
    pub routes: BTreeMap<String, String>,
    /// Additional category-like vocabularies.
    pub category_vocabularies: Vec<String>,
}

/// Immutable table translating code system urls to vocabulary ids.
///
/// Built once and handed to the resolver; urls are matched after dropping a
/// trailing `/` and any `|version` suffix.
///
/// # Examples
///
/// ```
/// use omop_vocab::VocabularyRouter;
///
/// let router = VocabularyRouter::default();
/// assert_eq!(router.vocabulary_id("http://loinc.org"), Some("LOINC"));
/// assert_eq!(router.vocabulary_id("http://example.org/local"), None);
/// ```
#[derive(Debug, Clone)]
pub struct VocabularyRouter {
    routes: HashMap<String, String>,
    category_vocabularies: HashSet<String>,
}

impl Default for VocabularyRouter {
    fn default() -> Self {
        Self::new(
            DEFAULT_ROUTES.iter().map(|(url, vocab)| (*url, *vocab)),
            DEFAULT_CATEGORY_VOCABULARIES.iter().copied(),
        )
    }
}

impl VocabularyRouter {
    /// Creates a router from explicit routes and category vocabularies.
    pub fn new<'a>(
        routes: impl IntoIterator<Item = (&'a str, &'a str)>,
        category_vocabularies: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|(url, vocab)| (normalize_url(url).to_string(), vocab.to_string()))
                .collect(),
            category_vocabularies: category_vocabularies.into_iter().map(str::to_string).collect(),
        }
    }

    /// Applies an override table on top of (or instead of) this router.
    pub fn with_overrides(mut self, table: RouteTable) -> Self {
        if table.replace_defaults {
            self.routes.clear();
        }
        for (url, vocab) in table.routes {
            self.routes.insert(normalize_url(&url).to_string(), vocab);
        }
        self.category_vocabularies.extend(table.category_vocabularies);
        self
    }

    /// Builds the default router overridden by a JSON [`RouteTable`].
    pub fn from_json_reader<R: Read>(reader: R) -> VocabResult<Self> {
        let table: RouteTable = serde_json::from_reader(reader)?;
        Ok(Self::default().with_overrides(table))
    }

    /// Translates a code system url.
    pub fn vocabulary_id(&self, system: &str) -> Option<&str> {
        self.routes.get(normalize_url(system)).map(String::as_str)
    }

    /// Returns true if unmapped codes of this vocabulary default to
    /// "manually recorded".
    pub fn is_category_vocabulary(&self, vocabulary_id: &str) -> bool {
        self.category_vocabularies.contains(vocabulary_id)
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if no url is routed.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn normalize_url(url: &str) -> &str {
    let url = url.trim();
    let url = url.split('|').next().unwrap_or(url);
    url.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes() {
        let router = VocabularyRouter::default();
        assert_eq!(
            router.vocabulary_id("http://fhir.de/CodeSystem/bfarm/icd-10-gm"),
            Some("ICD10GM")
        );
        assert_eq!(router.vocabulary_id("http://snomed.info/sct/"), Some("SNOMED"));
        assert_eq!(router.vocabulary_id("http://loinc.org|2.74"), Some("LOINC"));
        assert_eq!(router.vocabulary_id("http://unknown.org"), None);
        assert!(router.is_category_vocabulary("ConsentCategory"));
        assert!(!router.is_category_vocabulary("LOINC"));
    }

    #[test]
    fn test_explicit_routes() {
        let router = VocabularyRouter::new([("http://example.org/lab", "LOCAL_LAB")], Vec::new());
        assert_eq!(router.len(), 1);
        assert_eq!(router.vocabulary_id("http://example.org/lab"), Some("LOCAL_LAB"));
        assert_eq!(router.vocabulary_id("http://loinc.org"), None);
    }

    #[test]
    fn test_json_override() {
        let json = r#"{
            "routes": { "http://example.org/lab": "LOCAL_LAB", "http://loinc.org": "LOINC_DE" },
            "category_vocabularies": ["LOCAL_LAB"]
        }"#;

        let router = VocabularyRouter::from_json_reader(json.as_bytes()).unwrap();
        assert_eq!(router.vocabulary_id("http://loinc.org"), Some("LOINC_DE"));
        assert_eq!(router.vocabulary_id("http://snomed.info/sct"), Some("SNOMED"));
        assert!(router.is_category_vocabulary("LOCAL_LAB"));
    }

    #[test]
    fn test_json_replace_defaults() {
        let json = r#"{ "replace_defaults": true, "routes": { "http://example.org/lab": "LOCAL_LAB" } }"#;

        let router = VocabularyRouter::from_json_reader(json.as_bytes()).unwrap();
        assert_eq!(router.len(), 1);
        assert_eq!(router.vocabulary_id("http://snomed.info/sct"), None);
        assert!(VocabularyRouter::from_json_reader("not json".as_bytes()).is_err());
    }
}
