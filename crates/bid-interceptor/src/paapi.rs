//! Compilation of `paapi` specs into auction-config generators.
//!
//! Generator output is always a normalized sequence, never null: an entry
//! carrying keys outside `{config, igb}` wraps as `{config: entry}`, while an
//! entry already shaped `{config, igb}` passes through unchanged.

use crate::script::RuleScript;
use crate::spec::{DefinitionError, GeneratorFn, SpecNode};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, warn};

const PASSTHROUGH_KEYS: [&str; 2] = ["config", "igb"];

/// A compiled `paapi` spec.
pub enum CompiledPaapi {
    /// Sequence input, normalized once at compile time; returned as-is on
    /// every call regardless of arguments.
    Static(Vec<Value>),
    /// Native generator producing a raw sequence, normalized per call.
    Generator(Arc<GeneratorFn>),
    /// Script producing a raw sequence, normalized per call.
    Script(Arc<RuleScript>),
}

/// Compile a `paapi` spec. `None` (and definition errors, after logging with
/// the rule ordinal) yields no generator; callers treat a missing generator
/// as "no auxiliary configs".
pub fn compile_paapi(spec: Option<&SpecNode>, ordinal: usize) -> Option<CompiledPaapi> {
    let spec = spec?;
    match try_compile(spec) {
        Ok(paapi) => Some(paapi),
        Err(e) => {
            error!("rule #{ordinal}: {e}; no auction configs for this rule");
            None
        }
    }
}

fn try_compile(spec: &SpecNode) -> Result<CompiledPaapi, DefinitionError> {
    match spec {
        SpecNode::Generator(f) => Ok(CompiledPaapi::Generator(Arc::clone(f))),
        SpecNode::Script(s) => Ok(CompiledPaapi::Script(Arc::clone(s))),
        node @ (SpecNode::Seq(_) | SpecNode::Value(Value::Array(_))) => {
            // A static sequence must be fully materializable at compile time.
            // Invalid leaves round-trip as their raw JSON, so they must be
            // rejected explicitly before materializing or a broken sentinel
            // would ship as config data.
            if let Some(reason) = find_invalid(node) {
                return Err(DefinitionError::InvalidLeaf {
                    reason: reason.to_string(),
                });
            }
            let raw = node.to_json().ok_or_else(|| DefinitionError::InvalidLeaf {
                reason: "auction config sequence contains dynamic nodes".to_string(),
            })?;
            let Value::Array(entries) = raw else {
                unreachable!("sequence nodes reconstruct as arrays");
            };
            Ok(CompiledPaapi::Static(
                entries.into_iter().map(normalize_entry).collect(),
            ))
        }
        SpecNode::Invalid { reason, .. } => Err(DefinitionError::InvalidLeaf {
            reason: reason.clone(),
        }),
        other => Err(DefinitionError::BadPaapiSpec {
            found: other.kind(),
        }),
    }
}

/// First invalid leaf anywhere in the tree, if any.
fn find_invalid(node: &SpecNode) -> Option<&str> {
    match node {
        SpecNode::Invalid { reason, .. } => Some(reason),
        SpecNode::Map(fields) => fields.iter().find_map(|(_, nested)| find_invalid(nested)),
        SpecNode::Seq(items) => items.iter().find_map(find_invalid),
        _ => None,
    }
}

impl CompiledPaapi {
    /// Normalized auction configs for a matched bid. Always a sequence,
    /// possibly empty.
    pub fn configs(&self, bid: &Value, context: &[Value]) -> Vec<Value> {
        match self {
            CompiledPaapi::Static(entries) => entries.clone(),
            CompiledPaapi::Generator(f) => normalize_sequence(f(bid, context)),
            CompiledPaapi::Script(s) => match s.eval_value(bid, context) {
                Ok(raw) => normalize_sequence(raw),
                Err(e) => {
                    warn!("auction config script failed: {e}");
                    Vec::new()
                }
            },
        }
    }
}

fn normalize_sequence(raw: Value) -> Vec<Value> {
    match raw {
        Value::Array(entries) => entries.into_iter().map(normalize_entry).collect(),
        Value::Null => Vec::new(),
        other => {
            warn!("auction config generator returned a non-sequence ({other}); ignoring");
            Vec::new()
        }
    }
}

/// Normalize one auction-config entry.
fn normalize_entry(entry: Value) -> Value {
    match &entry {
        Value::Object(map) if map.keys().all(|k| PASSTHROUGH_KEYS.contains(&k.as_str())) => entry,
        _ => json!({ "config": entry }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_entry_is_wrapped() {
        assert_eq!(
            normalize_entry(json!({"seller": "x"})),
            json!({"config": {"seller": "x"}})
        );
    }

    #[test]
    fn test_shaped_entry_passes_through() {
        let shaped = json!({"config": {"seller": "x"}, "igb": [{"origin": "o"}]});
        assert_eq!(normalize_entry(shaped.clone()), shaped);

        let config_only = json!({"config": {"seller": "x"}});
        assert_eq!(normalize_entry(config_only.clone()), config_only);
    }

    #[test]
    fn test_static_sequence_same_output_regardless_of_args() {
        let spec = SpecNode::from_json(&json!([{"seller": "a"}, {"config": {"seller": "b"}}]));
        let paapi = compile_paapi(Some(&spec), 1).unwrap();
        let expected = json!([
            {"config": {"seller": "a"}},
            {"config": {"seller": "b"}},
        ]);
        assert_eq!(Value::Array(paapi.configs(&json!({"bidId": "1"}), &[])), expected);
        assert_eq!(
            Value::Array(paapi.configs(&json!({"bidId": "other"}), &[json!({})])),
            expected
        );
    }

    #[test]
    fn test_generator_output_normalized_per_call() {
        let spec = SpecNode::generator(|bid, _| json!([{"seller": bid["bidder"]}]));
        let paapi = compile_paapi(Some(&spec), 1).unwrap();
        assert_eq!(
            Value::Array(paapi.configs(&json!({"bidder": "mockBidder"}), &[])),
            json!([{"config": {"seller": "mockBidder"}}])
        );
    }

    #[test]
    fn test_non_sequence_generator_output_is_empty() {
        let spec = SpecNode::generator(|_, _| json!({"seller": "x"}));
        let paapi = compile_paapi(Some(&spec), 1).unwrap();
        assert!(paapi.configs(&json!({}), &[]).is_empty());
    }

    #[test]
    fn test_invalid_sentinel_in_sequence_yields_no_generator() {
        // A broken pattern sentinel must not ship as literal config data.
        let spec = SpecNode::from_json(&json!([{"$matches": "("}]));
        assert!(compile_paapi(Some(&spec), 1).is_none());

        // Same for a sentinel buried inside an entry.
        let spec = SpecNode::from_json(&json!([{"seller": {"$matches": "("}}]));
        assert!(compile_paapi(Some(&spec), 1).is_none());
    }

    #[test]
    fn test_bad_spec_yields_no_generator() {
        assert!(compile_paapi(Some(&SpecNode::value(json!("nope"))), 2).is_none());
        assert!(compile_paapi(None, 2).is_none());
    }
}
