//! Claim mapping: locate configured claims in a verified payload and turn them
//! into `(header, value)` pairs.
//!
//! A source path is first looked up as an exact top-level claim name, then as a
//! `.`-separated path into nested JSON objects. Strings are copied verbatim and
//! every other JSON value is rendered as its JSON text.
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use axum::http::{HeaderName, HeaderValue};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::services::auth::decoder::DecodeError;

const PATH_SEPARATOR: char = '.';

#[derive(Debug, Error)]
#[error("invalid destination header {header:?} for claim {claim:?}")]
pub struct InvalidDestination {
    pub claim: String,
    pub header: String,
}

#[derive(Debug, Clone)]
struct ClaimRule {
    source: String,
    header: HeaderName,
}

/// Immutable `source claim path -> destination header` table.
#[derive(Debug, Clone, Default)]
pub struct ClaimMapping {
    rules: Vec<ClaimRule>,
}

impl ClaimMapping {
    /// Build a mapping, rejecting destinations that are not valid header names.
    pub fn new<I, S, H>(entries: I) -> Result<Self, InvalidDestination>
    where
        I: IntoIterator<Item = (S, H)>,
        S: Into<String>,
        H: Into<String>,
    {
        // Sorted and deduplicated by source so evaluation order is stable.
        let entries: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(s, h)| (s.into(), h.into()))
            .collect();

        let rules = entries
            .into_iter()
            .map(|(source, header)| {
                let name = HeaderName::from_bytes(header.trim().as_bytes()).map_err(|_| {
                    InvalidDestination {
                        claim: source.clone(),
                        header: header.clone(),
                    }
                })?;
                Ok(ClaimRule {
                    source,
                    header: name,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// `(source, destination)` pairs in evaluation order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rules
            .iter()
            .map(|rule| (rule.source.as_str(), rule.header.as_str()))
    }

    pub fn maps_to(&self, header: &HeaderName) -> bool {
        self.rules.iter().any(|rule| &rule.header == header)
    }

    /// Extract every mapped claim from `claims`.
    ///
    /// Missing claims (and JSON `null`) are skipped. Two rules that fill the
    /// same header with non-empty values fail with [`DecodeError::ClaimMapping`].
    pub fn apply(&self, claims: &Map<String, Value>) -> Result<BTreeMap<String, String>, DecodeError> {
        let mut filled: BTreeMap<String, (&str, String)> = BTreeMap::new();

        for rule in &self.rules {
            let Some(value) = lookup(claims, &rule.source).filter(|v| !v.is_null()) else {
                continue;
            };
            let text = render(&rule.source, value)?;

            match filled.entry(rule.header.as_str().to_owned()) {
                Entry::Vacant(slot) => {
                    slot.insert((rule.source.as_str(), text));
                }
                Entry::Occupied(mut slot) => {
                    if text.is_empty() {
                        continue;
                    }
                    if slot.get().1.is_empty() {
                        slot.insert((rule.source.as_str(), text));
                        continue;
                    }
                    return Err(DecodeError::ClaimMapping {
                        header: slot.key().clone(),
                        sources: vec![slot.get().0.to_owned(), rule.source.clone()],
                    });
                }
            }
        }

        Ok(filled
            .into_iter()
            .map(|(header, (_, value))| (header, value))
            .collect())
    }
}

fn lookup<'a>(claims: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = claims.get(path) {
        return Some(value);
    }

    let mut segments = path.split(PATH_SEPARATOR);
    let mut current = claims.get(segments.next()?)?;
    for segment in segments {
        // Descending through a non-object is a no-match.
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn render(claim: &str, value: &Value) -> Result<String, DecodeError> {
    let text = match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).map_err(|e| DecodeError::ClaimType {
            claim: claim.to_owned(),
            reason: e.to_string(),
        })?,
    };

    if HeaderValue::from_bytes(text.as_bytes()).is_err() {
        return Err(DecodeError::ClaimType {
            claim: claim.to_owned(),
            reason: "value contains characters not allowed in a header".to_owned(),
        });
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("claims must be an object"),
        }
    }

    #[test]
    fn copies_strings_and_skips_missing_claims() {
        let mapping = ClaimMapping::new([("email", "claim-email"), ("name", "claim-name")]).unwrap();
        let out = mapping
            .apply(&claims(json!({"email": "a@b.com", "exp": 1})))
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out["claim-email"], "a@b.com");
    }

    #[test]
    fn nested_path_and_whole_object() {
        let mapping =
            ClaimMapping::new([("claim2.nested", "x-nested"), ("claim2", "x-whole")]).unwrap();
        let out = mapping
            .apply(&claims(json!({"claim2": {"nested": "email"}})))
            .unwrap();

        assert_eq!(out["x-nested"], "email");
        assert_eq!(out["x-whole"], r#"{"nested":"email"}"#);
    }

    #[test]
    fn non_string_values_are_json_text() {
        let mapping = ClaimMapping::new([
            ("int", "x-int"),
            ("float", "x-float"),
            ("flag", "x-flag"),
            ("roles", "x-roles"),
        ])
        .unwrap();
        let out = mapping
            .apply(&claims(json!({
                "int": 123,
                "float": 123.321,
                "flag": true,
                "roles": ["admin", "dev"],
            })))
            .unwrap();

        assert_eq!(out["x-int"], "123");
        assert_eq!(out["x-float"], "123.321");
        assert_eq!(out["x-flag"], "true");
        assert_eq!(out["x-roles"], r#"["admin","dev"]"#);
    }

    #[test]
    fn traversing_through_a_string_is_no_match() {
        let mapping = ClaimMapping::new([("email.domain", "x-domain")]).unwrap();
        let out = mapping.apply(&claims(json!({"email": "a@b.com"}))).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn exact_claim_name_wins_over_path() {
        let mapping = ClaimMapping::new([("https://example.com/roles", "x-roles")]).unwrap();
        let out = mapping
            .apply(&claims(json!({"https://example.com/roles": "admin"})))
            .unwrap();
        assert_eq!(out["x-roles"], "admin");
    }

    #[test]
    fn null_is_absent() {
        let mapping = ClaimMapping::new([("email", "x-email")]).unwrap();
        let out = mapping.apply(&claims(json!({"email": null}))).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn two_rules_filling_one_header_is_an_error() {
        let mapping = ClaimMapping::new([("email", "x-user"), ("sub", "x-user")]).unwrap();
        let err = mapping
            .apply(&claims(json!({"email": "a@b.com", "sub": "42"})))
            .unwrap_err();

        match err {
            DecodeError::ClaimMapping { header, sources } => {
                assert_eq!(header, "x-user");
                assert_eq!(sources, vec!["email".to_owned(), "sub".to_owned()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shared_header_with_single_value_is_fine() {
        let mapping = ClaimMapping::new([("email", "x-user"), ("sub", "x-user")]).unwrap();

        let out = mapping.apply(&claims(json!({"sub": "42"}))).unwrap();
        assert_eq!(out["x-user"], "42");

        let out = mapping
            .apply(&claims(json!({"email": "", "sub": "42"})))
            .unwrap();
        assert_eq!(out["x-user"], "42");
    }

    #[test]
    fn control_characters_are_rejected() {
        let mapping = ClaimMapping::new([("name", "x-name")]).unwrap();
        let err = mapping
            .apply(&claims(json!({"name": "bob\r\nx-admin: true"})))
            .unwrap_err();
        assert_eq!(err.kind(), "claim_type");
    }

    #[test]
    fn invalid_destination_header_is_rejected() {
        let err = ClaimMapping::new([("email", "bad header")]).unwrap_err();
        assert_eq!(err.claim, "email");
    }

    #[test]
    fn header_names_are_normalised() {
        let mapping = ClaimMapping::new([("email", "Claim-Email")]).unwrap();
        assert_eq!(mapping.entries().collect::<Vec<_>>(), vec![("email", "claim-email")]);
        assert!(mapping.maps_to(&HeaderName::from_static("claim-email")));
    }
}
