//! Compilation of `when` specs into match predicates.
//!
//! A field map compiles to a conjunction of per-field checks resolved once at
//! definition time; evaluation never re-inspects node shapes. A malformed
//! `when` spec disables only its own rule: the compiler logs the error with
//! the rule ordinal and yields a predicate that never matches.

use crate::spec::{DefinitionError, PredicateFn, SpecNode};
use crate::script::RuleScript;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

/// A compiled `when` spec.
pub enum CompiledMatcher {
    /// Definition-error fallback: the rule is disabled, never matches.
    Never,
    /// Native predicate over the full candidate and context.
    Predicate(Arc<PredicateFn>),
    /// Script over the full candidate and context.
    Script(Arc<RuleScript>),
    /// Conjunction of per-field checks.
    Fields(Vec<FieldCheck>),
}

/// One `field name -> check` pair of a field map.
pub struct FieldCheck {
    key: String,
    check: FieldMatcher,
}

enum FieldMatcher {
    /// Exact equality against the field value. A JSON null also matches a
    /// missing field.
    Equals(Value),
    /// Regex against the stringified field value. Missing and non-scalar
    /// field values never match.
    Pattern(Arc<Regex>),
    /// Native predicate over the field value and context.
    Predicate(Arc<PredicateFn>),
    /// Script over the field value and context.
    Script(Arc<RuleScript>),
    /// Nested field map, recursing with the field value as the candidate.
    Fields(Vec<FieldCheck>),
}

/// Compile a `when` spec. Definition errors are logged with the rule ordinal
/// and produce [`CompiledMatcher::Never`].
pub fn compile_matcher(spec: Option<&SpecNode>, ordinal: usize) -> CompiledMatcher {
    match try_compile(spec) {
        Ok(matcher) => matcher,
        Err(e) => {
            error!("rule #{ordinal}: {e}; rule disabled");
            CompiledMatcher::Never
        }
    }
}

fn try_compile(spec: Option<&SpecNode>) -> Result<CompiledMatcher, DefinitionError> {
    let spec = spec.ok_or(DefinitionError::MissingMatchSpec)?;
    match spec {
        SpecNode::Predicate(f) => Ok(CompiledMatcher::Predicate(Arc::clone(f))),
        SpecNode::Script(s) => Ok(CompiledMatcher::Script(Arc::clone(s))),
        SpecNode::Map(fields) => Ok(CompiledMatcher::Fields(compile_fields(fields)?)),
        SpecNode::Value(Value::Object(map)) => {
            let fields: Vec<(String, SpecNode)> = map
                .iter()
                .map(|(k, v)| (k.clone(), SpecNode::from_json(v)))
                .collect();
            Ok(CompiledMatcher::Fields(compile_fields(&fields)?))
        }
        SpecNode::Invalid { reason, .. } => Err(DefinitionError::InvalidLeaf {
            reason: reason.clone(),
        }),
        other => Err(DefinitionError::BadMatchSpec {
            found: other.kind(),
        }),
    }
}

fn compile_fields(fields: &[(String, SpecNode)]) -> Result<Vec<FieldCheck>, DefinitionError> {
    fields
        .iter()
        .map(|(key, node)| {
            Ok(FieldCheck {
                key: key.clone(),
                check: compile_field(node)?,
            })
        })
        .collect()
}

fn compile_field(node: &SpecNode) -> Result<FieldMatcher, DefinitionError> {
    match node {
        SpecNode::Pattern(re) => Ok(FieldMatcher::Pattern(Arc::clone(re))),
        SpecNode::Predicate(f) => Ok(FieldMatcher::Predicate(Arc::clone(f))),
        SpecNode::Script(s) => Ok(FieldMatcher::Script(Arc::clone(s))),
        SpecNode::Map(fields) => Ok(FieldMatcher::Fields(compile_fields(fields)?)),
        SpecNode::Value(Value::Object(map)) => {
            let fields: Vec<(String, SpecNode)> = map
                .iter()
                .map(|(k, v)| (k.clone(), SpecNode::from_json(v)))
                .collect();
            Ok(FieldMatcher::Fields(compile_fields(&fields)?))
        }
        SpecNode::Value(v) => Ok(FieldMatcher::Equals(v.clone())),
        // Sequence leaves mean equality against the rebuilt array; a sequence
        // containing dynamic nodes has no equality semantics.
        SpecNode::Seq(_) => match node.to_json() {
            Some(v) => Ok(FieldMatcher::Equals(v)),
            None => Err(DefinitionError::InvalidLeaf {
                reason: "array match leaf contains dynamic nodes".to_string(),
            }),
        },
        SpecNode::Invalid { reason, .. } => Err(DefinitionError::InvalidLeaf {
            reason: reason.clone(),
        }),
        SpecNode::Generator(_) => Err(DefinitionError::InvalidLeaf {
            reason: "generator leaf is not a match node".to_string(),
        }),
    }
}

impl CompiledMatcher {
    /// Evaluate the candidate against this matcher.
    pub fn matches(&self, candidate: &Value, context: &[Value]) -> bool {
        match self {
            CompiledMatcher::Never => false,
            CompiledMatcher::Predicate(f) => f(candidate, context),
            CompiledMatcher::Script(s) => s.eval_bool(candidate, context).unwrap_or_else(|e| {
                warn!("match script failed: {e}");
                false
            }),
            CompiledMatcher::Fields(checks) => {
                checks.iter().all(|check| check.matches(candidate, context))
            }
        }
    }
}

impl FieldCheck {
    fn matches(&self, candidate: &Value, context: &[Value]) -> bool {
        let field = candidate.get(&self.key);
        match &self.check {
            FieldMatcher::Equals(expected) => match field {
                Some(value) => value == expected,
                None => expected.is_null(),
            },
            FieldMatcher::Pattern(re) => match field.and_then(stringify) {
                Some(text) => re.is_match(&text),
                None => false,
            },
            FieldMatcher::Predicate(f) => f(field.unwrap_or(&Value::Null), context),
            FieldMatcher::Script(s) => s
                .eval_bool(field.unwrap_or(&Value::Null), context)
                .unwrap_or_else(|e| {
                    warn!("match script failed: {e}");
                    false
                }),
            FieldMatcher::Fields(checks) => {
                let nested = field.unwrap_or(&Value::Null);
                checks.iter().all(|check| check.matches(nested, context))
            }
        }
    }
}

/// Scalar field values stringify for pattern matching; containers and null
/// have no sensible string form and never match a pattern.
fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Object(_) | Value::Array(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(spec: SpecNode) -> CompiledMatcher {
        compile_matcher(Some(&spec), 1)
    }

    #[test]
    fn test_literal_equality() {
        let matcher = compile(SpecNode::from_json(&json!({"bidder": "mockBidder"})));
        assert!(matcher.matches(&json!({"bidder": "mockBidder", "bidId": "1"}), &[]));
        assert!(!matcher.matches(&json!({"bidder": "other"}), &[]));
        assert!(!matcher.matches(&json!({}), &[]));
    }

    #[test]
    fn test_conjunction_of_fields() {
        let matcher = compile(SpecNode::from_json(
            &json!({"bidder": "mockBidder", "adUnitCode": "top"}),
        ));
        assert!(matcher.matches(&json!({"bidder": "mockBidder", "adUnitCode": "top"}), &[]));
        // One failing field fails the whole rule.
        assert!(!matcher.matches(&json!({"bidder": "mockBidder", "adUnitCode": "side"}), &[]));
    }

    #[test]
    fn test_nested_mapping_recurses() {
        let matcher = compile(SpecNode::from_json(
            &json!({"params": {"placement": {"id": 42}}}),
        ));
        assert!(matcher.matches(&json!({"params": {"placement": {"id": 42, "x": 1}}}), &[]));
        assert!(!matcher.matches(&json!({"params": {"placement": {"id": 7}}}), &[]));
        assert!(!matcher.matches(&json!({"params": {}}), &[]));
    }

    #[test]
    fn test_pattern_against_stringified_value() {
        let matcher = compile(SpecNode::map([(
            "adUnitCode",
            SpecNode::pattern("^top-").unwrap(),
        )]));
        assert!(matcher.matches(&json!({"adUnitCode": "top-banner"}), &[]));
        assert!(!matcher.matches(&json!({"adUnitCode": "side-rail"}), &[]));
        assert!(!matcher.matches(&json!({}), &[]));

        // Numbers stringify before the pattern test.
        let matcher = compile(SpecNode::map([(
            "zoneId",
            SpecNode::pattern("^12").unwrap(),
        )]));
        assert!(matcher.matches(&json!({"zoneId": 1234}), &[]));
        assert!(!matcher.matches(&json!({"zoneId": 987}), &[]));
    }

    #[test]
    fn test_predicate_leaf_receives_field_and_context() {
        let matcher = compile(SpecNode::map([(
            "cpmFloor",
            SpecNode::predicate(|value, context| {
                let floor = value.as_f64().unwrap_or(0.0);
                let auction = context
                    .first()
                    .and_then(|r| r.get("auctionId"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                floor > 1.0 && auction == "a-1"
            }),
        )]));
        let request = json!({"auctionId": "a-1"});
        assert!(matcher.matches(&json!({"cpmFloor": 2.0}), &[request.clone()]));
        assert!(!matcher.matches(&json!({"cpmFloor": 0.5}), &[request]));
        assert!(!matcher.matches(&json!({"cpmFloor": 2.0}), &[json!({"auctionId": "b"})]));
    }

    #[test]
    fn test_top_level_predicate_spec() {
        let matcher = compile(SpecNode::predicate(|candidate, _| {
            candidate.get("bidder").is_some()
        }));
        assert!(matcher.matches(&json!({"bidder": "x"}), &[]));
        assert!(!matcher.matches(&json!({}), &[]));
    }

    #[test]
    fn test_script_leaf() {
        let matcher = compile(SpecNode::from_json(
            &json!({"bidder": {"$script": r#"value == "mockBidder""#}}),
        ));
        assert!(matcher.matches(&json!({"bidder": "mockBidder"}), &[]));
        assert!(!matcher.matches(&json!({"bidder": "other"}), &[]));
    }

    #[test]
    fn test_null_leaf_matches_missing_field() {
        let matcher = compile(SpecNode::from_json(&json!({"gdprConsent": null})));
        assert!(matcher.matches(&json!({}), &[]));
        assert!(matcher.matches(&json!({"gdprConsent": null}), &[]));
        assert!(!matcher.matches(&json!({"gdprConsent": "given"}), &[]));
    }

    #[test]
    fn test_bad_spec_disables_rule() {
        // Scalars are not valid match specs.
        let matcher = compile(SpecNode::value(json!("mockBidder")));
        assert!(!matcher.matches(&json!({"bidder": "mockBidder"}), &[]));

        let matcher = compile_matcher(None, 3);
        assert!(!matcher.matches(&json!({"bidder": "mockBidder"}), &[]));
    }

    #[test]
    fn test_invalid_sentinel_disables_rule() {
        let matcher = compile(SpecNode::from_json(&json!({"bidder": {"$matches": "("}})));
        assert!(!matcher.matches(&json!({"bidder": "anything"}), &[]));
    }

    #[test]
    fn test_array_leaf_equality() {
        let matcher = compile(SpecNode::from_json(&json!({"sizes": [[300, 250]]})));
        assert!(matcher.matches(&json!({"sizes": [[300, 250]]}), &[]));
        assert!(!matcher.matches(&json!({"sizes": [[728, 90]]}), &[]));
    }
}
