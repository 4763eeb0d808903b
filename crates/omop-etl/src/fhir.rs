//! Helpers for reading FHIR JSON.
//!
//! Processors work on `serde_json::Value` bodies. These functions pull out
//! the handful of shapes every mapping needs: references, codings,
//! identifiers and dates.

use chrono::NaiveDate;
use serde_json::Value;

/// The two keys a FHIR `Reference` can carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceKeys<'a> {
    /// Target id taken from `reference` (`Patient/123` -> `123`).
    pub logical_id: Option<&'a str>,
    /// `identifier.value` of the reference.
    pub identifier: Option<&'a str>,
}

impl ReferenceKeys<'_> {
    /// Returns true if neither key is present.
    pub fn is_empty(&self) -> bool {
        self.logical_id.is_none() && self.identifier.is_none()
    }
}

/// A `Coding` element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coding<'a> {
    /// Code system url.
    pub system: &'a str,
    /// The code.
    pub code: &'a str,
    /// Code system version.
    pub version: Option<&'a str>,
    /// Display text.
    pub display: Option<&'a str>,
}

/// Follows `path` through nested objects.
pub fn at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(key))
}

/// Non-blank string at `path`.
pub fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    at(value, path)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Number at `path`.
pub fn f64_at(value: &Value, path: &[&str]) -> Option<f64> {
    at(value, path).and_then(Value::as_f64)
}

/// Extracts the logical id from a reference string.
///
/// Handles relative (`Patient/1`), versioned (`Patient/1/_history/2`) and
/// absolute references. Contained references (`#x`) have no logical id.
pub fn logical_id(reference: &str) -> Option<&str> {
    let reference = reference.trim();
    if reference.starts_with('#') {
        return None;
    }
    let without_history = reference
        .split_once("/_history/")
        .map_or(reference, |(head, _)| head);
    let id = without_history.rsplit('/').next().unwrap_or(without_history);
    let id = id.rsplit(':').next().unwrap_or(id);
    (!id.is_empty()).then_some(id)
}

/// Reads the `Reference` element at `field`.
pub fn reference<'a>(payload: &'a Value, field: &str) -> ReferenceKeys<'a> {
    let Some(element) = payload.get(field) else {
        return ReferenceKeys::default();
    };
    ReferenceKeys {
        logical_id: str_at(element, &["reference"]).and_then(logical_id),
        identifier: str_at(element, &["identifier", "value"]),
    }
}

/// Value of the first `identifier` with a value.
pub fn first_identifier(payload: &Value) -> Option<&str> {
    payload
        .get("identifier")?
        .as_array()?
        .iter()
        .find_map(|identifier| str_at(identifier, &["value"]))
}

/// Codings of a `CodeableConcept`. Codings without system or code are
/// dropped.
pub fn codings(concept: &Value) -> Vec<Coding<'_>> {
    let Some(items) = concept.get("coding").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|coding| {
            Some(Coding {
                system: str_at(coding, &["system"])?,
                code: str_at(coding, &["code"])?,
                version: str_at(coding, &["version"]),
                display: str_at(coding, &["display"]),
            })
        })
        .collect()
}

/// First coding of the `CodeableConcept` at `field`, preferring one whose
/// system satisfies `prefer`.
pub fn coding<'a>(payload: &'a Value, field: &str, prefer: impl Fn(&str) -> bool) -> Option<Coding<'a>> {
    let all = codings(payload.get(field)?);
    all.iter()
        .find(|c| prefer(c.system))
        .or_else(|| all.first())
        .copied()
}

/// First coding of each element of a `CodeableConcept` array at `field`.
pub fn category_codings<'a>(payload: &'a Value, field: &str) -> Vec<Coding<'a>> {
    match payload.get(field) {
        Some(Value::Array(items)) => items.iter().flat_map(codings).collect(),
        Some(single) => codings(single),
        None => Vec::new(),
    }
}

/// Parses the date part of a FHIR `date`/`dateTime`/`instant`.
///
/// Only full dates count; `2021` or `2021-03` give `None`.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let day = value.trim().get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// First full date found at any of `paths`.
pub fn date_at(payload: &Value, paths: &[&[&str]]) -> Option<NaiveDate> {
    paths
        .iter()
        .find_map(|path| str_at(payload, path).and_then(parse_date))
}

/// Splits a possibly partial FHIR date (`YYYY`, `YYYY-MM`, `YYYY-MM-DD`).
pub fn partial_date(value: &str) -> (Option<i32>, Option<u32>, Option<u32>) {
    let value = value.trim();
    let mut parts = value.get(..10).unwrap_or(value).split('-');
    let year = parts.next().and_then(|y| y.parse().ok());
    let month = parts.next().and_then(|m| m.parse().ok()).filter(|m| (1..=12).contains(m));
    let day = parts.next().and_then(|d| d.parse().ok()).filter(|d| (1..=31).contains(d));
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logical_id() {
        assert_eq!(logical_id("Patient/pat-7"), Some("pat-7"));
        assert_eq!(logical_id("Patient/pat-7/_history/3"), Some("pat-7"));
        assert_eq!(logical_id("http://example.org/fhir/Encounter/enc-1"), Some("enc-1"));
        assert_eq!(logical_id("urn:uuid:0c3151bd"), Some("0c3151bd"));
        assert_eq!(logical_id("#contained"), None);
        assert_eq!(logical_id("Patient/"), None);
    }

    #[test]
    fn test_reference_keys() {
        let payload = json!({
            "subject": {
                "reference": "Patient/pat-7",
                "identifier": { "system": "urn:mrn", "value": "mrn-7" }
            },
            "encounter": { "identifier": { "value": " " } }
        });

        let subject = reference(&payload, "subject");
        assert_eq!(subject.logical_id, Some("pat-7"));
        assert_eq!(subject.identifier, Some("mrn-7"));

        assert!(reference(&payload, "encounter").is_empty());
        assert!(reference(&payload, "partOf").is_empty());
    }

    #[test]
    fn test_codings_prefer_system() {
        let payload = json!({
            "code": {
                "coding": [
                    { "system": "http://snomed.info/sct", "code": "38341003" },
                    { "system": "http://fhir.de/CodeSystem/bfarm/icd-10-gm", "version": "2021", "code": "I12.3" },
                    { "code": "no-system" }
                ]
            }
        });

        assert_eq!(codings(&payload["code"]).len(), 2);
        let icd = coding(&payload, "code", |s| s.contains("icd-10")).unwrap();
        assert_eq!(icd.code, "I12.3");
        assert_eq!(icd.version, Some("2021"));

        let fallback = coding(&payload, "code", |s| s.contains("loinc")).unwrap();
        assert_eq!(fallback.code, "38341003");
        assert!(coding(&payload, "category", |_| true).is_none());
    }

    #[test]
    fn test_dates() {
        let date = NaiveDate::from_ymd_opt(2021, 3, 15).unwrap();
        assert_eq!(parse_date("2021-03-15T08:30:00+01:00"), Some(date));
        assert_eq!(parse_date("2021-03"), None);

        let payload = json!({ "period": { "start": "2021-03-15" } });
        assert_eq!(date_at(&payload, &[&["effectiveDateTime"], &["period", "start"]]), Some(date));

        assert_eq!(partial_date("1980-07"), (Some(1980), Some(7), None));
        assert_eq!(partial_date("1980"), (Some(1980), None, None));
        assert_eq!(partial_date("1980-07-04"), (Some(1980), Some(7), Some(4)));
    }

    #[test]
    fn test_first_identifier() {
        let payload = json!({ "identifier": [{ "system": "x" }, { "value": "mrn-9" }] });
        assert_eq!(first_identifier(&payload), Some("mrn-9"));
        assert_eq!(first_identifier(&json!({})), None);
    }
}
