//! Compilation of `then` specs into mock response generators.
//!
//! A generator computes the baseline response for the bid, deep-merges the
//! evaluated rule template on top (override wins on scalar conflicts, nested
//! objects merge field by field), runs the media-type post-processor if one is
//! registered, and stamps the synthetic marker. An explicit JSON null template
//! short-circuits to "no response".

use crate::defaults::{response_defaults, ResponseProcessors, SYNTHETIC_MARKER};
use crate::script::RuleScript;
use crate::spec::{DefinitionError, GeneratorFn, SpecNode};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

/// A compiled `then` spec.
pub enum CompiledReplacer {
    /// Explicit null template: intercepted, but no response is synthesized.
    NoResponse,
    /// Native generator yielding the full override object.
    Generator(Arc<GeneratorFn>),
    /// Script yielding the full override object.
    Script(Arc<RuleScript>),
    /// Recursive template; an omitted or malformed `then` compiles to the
    /// empty template (defaults only).
    Template(CompiledTemplate),
}

/// Shape-preserving template tree: arrays rebuild as arrays, objects as
/// objects, function and script leaves evaluate per bid.
pub enum CompiledTemplate {
    Literal(Value),
    Dynamic(Arc<GeneratorFn>),
    Script(Arc<RuleScript>),
    Object(Vec<(String, CompiledTemplate)>),
    Array(Vec<CompiledTemplate>),
}

/// Compile a `then` spec. Definition errors are logged with the rule ordinal
/// and degrade to the empty template, never disabling the match.
pub fn compile_replacer(spec: Option<&SpecNode>, ordinal: usize) -> CompiledReplacer {
    match spec {
        None => CompiledReplacer::Template(CompiledTemplate::Object(Vec::new())),
        Some(SpecNode::Value(Value::Null)) => CompiledReplacer::NoResponse,
        Some(SpecNode::Generator(f)) => CompiledReplacer::Generator(Arc::clone(f)),
        Some(SpecNode::Script(s)) => CompiledReplacer::Script(Arc::clone(s)),
        Some(node @ (SpecNode::Map(_) | SpecNode::Seq(_))) => {
            CompiledReplacer::Template(compile_template(node, ordinal))
        }
        Some(node @ SpecNode::Value(Value::Object(_) | Value::Array(_))) => {
            CompiledReplacer::Template(compile_template(node, ordinal))
        }
        Some(other) => {
            let err = match other {
                SpecNode::Invalid { reason, .. } => DefinitionError::InvalidLeaf {
                    reason: reason.clone(),
                },
                _ => DefinitionError::BadReplacerSpec {
                    found: other.kind(),
                },
            };
            error!("rule #{ordinal}: {err}; using empty response template");
            CompiledReplacer::Template(CompiledTemplate::Object(Vec::new()))
        }
    }
}

fn compile_template(node: &SpecNode, ordinal: usize) -> CompiledTemplate {
    match node {
        SpecNode::Value(Value::Object(map)) => CompiledTemplate::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), compile_template(&SpecNode::from_json(v), ordinal)))
                .collect(),
        ),
        SpecNode::Value(Value::Array(items)) => CompiledTemplate::Array(
            items
                .iter()
                .map(|v| compile_template(&SpecNode::from_json(v), ordinal))
                .collect(),
        ),
        SpecNode::Value(v) => CompiledTemplate::Literal(v.clone()),
        SpecNode::Generator(f) => CompiledTemplate::Dynamic(Arc::clone(f)),
        SpecNode::Script(s) => CompiledTemplate::Script(Arc::clone(s)),
        SpecNode::Map(fields) => CompiledTemplate::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), compile_template(v, ordinal)))
                .collect(),
        ),
        SpecNode::Seq(items) => CompiledTemplate::Array(
            items
                .iter()
                .map(|v| compile_template(v, ordinal))
                .collect(),
        ),
        SpecNode::Pattern(_) | SpecNode::Predicate(_) => {
            error!(
                "rule #{ordinal}: {} leaf is not a template value; using null",
                node.kind()
            );
            CompiledTemplate::Literal(Value::Null)
        }
        SpecNode::Invalid { reason, .. } => {
            error!("rule #{ordinal}: invalid template leaf ({reason}); using null");
            CompiledTemplate::Literal(Value::Null)
        }
    }
}

impl CompiledReplacer {
    /// Synthesize the response for a matched bid, or `None` for an explicit
    /// no-response rule.
    pub fn generate(
        &self,
        bid: &Value,
        context: &[Value],
        processors: &ResponseProcessors,
    ) -> Option<Value> {
        let overrides = match self {
            CompiledReplacer::NoResponse => return None,
            CompiledReplacer::Generator(f) => f(bid, context),
            CompiledReplacer::Script(s) => s.eval_value(bid, context).unwrap_or_else(|e| {
                warn!("response script failed: {e}");
                Value::Null
            }),
            CompiledReplacer::Template(template) => template.evaluate(bid, context),
        };

        let mut response = response_defaults(bid);
        deep_merge(&mut response, overrides);

        let media_type = response
            .get("mediaType")
            .and_then(Value::as_str)
            .map(str::to_owned);
        if let Some(processor) = media_type.as_deref().and_then(|mt| processors.get(mt)) {
            processor(&mut response, bid);
        }

        if let Some(obj) = response.as_object_mut() {
            obj.insert(SYNTHETIC_MARKER.to_string(), Value::Bool(true));
        }
        Some(response)
    }
}

impl CompiledTemplate {
    fn evaluate(&self, bid: &Value, context: &[Value]) -> Value {
        match self {
            CompiledTemplate::Literal(v) => v.clone(),
            CompiledTemplate::Dynamic(f) => f(bid, context),
            CompiledTemplate::Script(s) => s.eval_value(bid, context).unwrap_or_else(|e| {
                warn!("template script failed: {e}");
                Value::Null
            }),
            CompiledTemplate::Object(fields) => {
                let mut map = serde_json::Map::new();
                for (key, node) in fields {
                    map.insert(key.clone(), node.evaluate(bid, context));
                }
                Value::Object(map)
            }
            CompiledTemplate::Array(items) => Value::Array(
                items.iter().map(|node| node.evaluate(bid, context)).collect(),
            ),
        }
    }
}

/// Structural merge: object base + object override merge field-wise; any
/// other conflict replaces the base wholesale. A null override is a no-op at
/// the top level only (an absent override object), not per field.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
