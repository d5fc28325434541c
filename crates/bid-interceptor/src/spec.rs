//! Rule definition language.
//!
//! A rule is authored as `{ when, then, options?, paapi? }`. Each section is a
//! tree of [`SpecNode`]s: plain JSON subtrees, regex patterns, Rhai scripts,
//! or native Rust closures. The shape of every node is resolved once here, at
//! definition time, so the compilers in `matcher`/`replacer`/`paapi` never
//! re-branch on node type per match.
//!
//! JSON rule definitions use two sentinel forms for dynamic leaves:
//!
//! - `{"$matches": "<regex>"}` compiles to a [`SpecNode::Pattern`]
//! - `{"$script": "<rhai source>"}` compiles to a [`SpecNode::Script`]
//!
//! Native closures ([`SpecNode::Predicate`], [`SpecNode::Generator`]) are only
//! reachable through the builder API and, like patterns, are not serializable.

use crate::script::RuleScript;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Sentinel key for regex leaves in JSON rule definitions.
pub const PATTERN_KEY: &str = "$matches";
/// Sentinel key for Rhai script leaves in JSON rule definitions.
pub const SCRIPT_KEY: &str = "$script";

/// Native predicate leaf: `(candidate or field value, context) -> bool`.
pub type PredicateFn = dyn Fn(&Value, &[Value]) -> bool + Send + Sync;

/// Native generator leaf: `(bid, context) -> value`.
pub type GeneratorFn = dyn Fn(&Value, &[Value]) -> Value + Send + Sync;

/// Malformed rule sections. Never fatal: the registry logs the error with the
/// rule's ordinal and substitutes a safe default for the offending section.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("`when` must be a predicate, script, or field map (got {found})")]
    BadMatchSpec { found: &'static str },

    #[error("missing `when` spec")]
    MissingMatchSpec,

    #[error("`then` must be null, a generator, or an object/array template (got {found})")]
    BadReplacerSpec { found: &'static str },

    #[error("`paapi` must be a sequence or generator (got {found})")]
    BadPaapiSpec { found: &'static str },

    #[error("invalid rule leaf: {reason}")]
    InvalidLeaf { reason: String },
}

/// One node of a `when`/`then`/`paapi` spec tree.
#[derive(Clone)]
pub enum SpecNode {
    /// Plain JSON. Scalars mean equality (matcher) or literal copy (template);
    /// objects and arrays recurse.
    Value(Value),
    /// Regex tested against the stringified field value.
    Pattern(Arc<Regex>),
    /// Native match predicate.
    Predicate(Arc<PredicateFn>),
    /// Native value generator.
    Generator(Arc<GeneratorFn>),
    /// Rhai expression evaluated with `value` and `args` in scope.
    Script(Arc<RuleScript>),
    /// Field-name to nested node mapping.
    Map(Vec<(String, SpecNode)>),
    /// Ordered sequence of nested nodes.
    Seq(Vec<SpecNode>),
    /// A sentinel leaf that failed to compile. Kept with its raw JSON so the
    /// definition still round-trips; compilers treat it as a definition error.
    Invalid { raw: Value, reason: String },
}

impl SpecNode {
    /// Wrap any plain JSON value.
    pub fn value(value: impl Into<Value>) -> Self {
        SpecNode::Value(value.into())
    }

    /// Compile a regex pattern leaf.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(SpecNode::Pattern(Arc::new(Regex::new(pattern)?)))
    }

    /// Wrap a native predicate closure.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> bool + Send + Sync + 'static,
    {
        SpecNode::Predicate(Arc::new(f))
    }

    /// Wrap a native generator closure.
    pub fn generator<F>(f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Value + Send + Sync + 'static,
    {
        SpecNode::Generator(Arc::new(f))
    }

    /// Compile a Rhai script leaf.
    pub fn script(source: &str) -> anyhow::Result<Self> {
        Ok(SpecNode::Script(Arc::new(RuleScript::compile(source)?)))
    }

    /// Build a field map from `(name, node)` pairs.
    pub fn map<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, SpecNode)>,
        K: Into<String>,
    {
        SpecNode::Map(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Convert authored JSON into a spec tree, recognizing sentinel leaves.
    /// Never fails: an unparseable sentinel becomes [`SpecNode::Invalid`].
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(pattern) = map.get(PATTERN_KEY).and_then(Value::as_str) {
                        return match Regex::new(pattern) {
                            Ok(re) => SpecNode::Pattern(Arc::new(re)),
                            Err(e) => SpecNode::Invalid {
                                raw: value.clone(),
                                reason: format!("invalid pattern: {e}"),
                            },
                        };
                    }
                    if let Some(source) = map.get(SCRIPT_KEY).and_then(Value::as_str) {
                        return match RuleScript::compile(source) {
                            Ok(script) => SpecNode::Script(Arc::new(script)),
                            Err(e) => SpecNode::Invalid {
                                raw: value.clone(),
                                reason: format!("invalid script: {e}"),
                            },
                        };
                    }
                }
                SpecNode::Map(
                    map.iter()
                        .map(|(k, v)| (k.clone(), SpecNode::from_json(v)))
                        .collect(),
                )
            }
            Value::Array(items) => SpecNode::Seq(items.iter().map(SpecNode::from_json).collect()),
            other => SpecNode::Value(other.clone()),
        }
    }

    /// Reconstruct JSON for persistence. `None` means the node (or one of its
    /// children) is not serializable: regex patterns and native closures.
    pub fn to_json(&self) -> Option<Value> {
        match self {
            SpecNode::Value(v) => Some(v.clone()),
            SpecNode::Pattern(_) | SpecNode::Predicate(_) | SpecNode::Generator(_) => None,
            SpecNode::Script(script) => Some(json!({ SCRIPT_KEY: script.source() })),
            SpecNode::Map(fields) => {
                let mut map = serde_json::Map::new();
                for (key, node) in fields {
                    map.insert(key.clone(), node.to_json()?);
                }
                Some(Value::Object(map))
            }
            SpecNode::Seq(items) => Some(Value::Array(
                items.iter().map(SpecNode::to_json).collect::<Option<_>>()?,
            )),
            SpecNode::Invalid { raw, .. } => Some(raw.clone()),
        }
    }

    /// Whether the full tree survives a persisted-configuration round trip.
    pub fn is_serializable(&self) -> bool {
        self.to_json().is_some()
    }

    /// Short description of the node's shape, for definition-error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            SpecNode::Value(Value::Null) => "null",
            SpecNode::Value(Value::Bool(_)) => "boolean",
            SpecNode::Value(Value::Number(_)) => "number",
            SpecNode::Value(Value::String(_)) => "string",
            SpecNode::Value(Value::Object(_)) | SpecNode::Map(_) => "object",
            SpecNode::Value(Value::Array(_)) | SpecNode::Seq(_) => "array",
            SpecNode::Pattern(_) => "pattern",
            SpecNode::Predicate(_) => "predicate",
            SpecNode::Generator(_) => "generator",
            SpecNode::Script(_) => "script",
            SpecNode::Invalid { .. } => "invalid leaf",
        }
    }
}

impl fmt::Debug for SpecNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecNode::Value(v) => f.debug_tuple("Value").field(v).finish(),
            SpecNode::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            SpecNode::Predicate(_) => f.write_str("Predicate(<fn>)"),
            SpecNode::Generator(_) => f.write_str("Generator(<fn>)"),
            SpecNode::Script(s) => f.debug_tuple("Script").field(&s.source()).finish(),
            SpecNode::Map(fields) => f.debug_tuple("Map").field(fields).finish(),
            SpecNode::Seq(items) => f.debug_tuple("Seq").field(items).finish(),
            SpecNode::Invalid { reason, .. } => f.debug_tuple("Invalid").field(reason).finish(),
        }
    }
}

impl From<Value> for SpecNode {
    fn from(value: Value) -> Self {
        SpecNode::from_json(&value)
    }
}

/// Delivery delay for a matched rule, in milliseconds. A bare number is a
/// fixed delay; `{min, max}` resolves to a uniform sample per delivery.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Delay {
    Fixed(u64),
    Range { min: u64, max: u64 },
}

impl Default for Delay {
    fn default() -> Self {
        Delay::Fixed(0)
    }
}

impl Delay {
    /// Resolve the delay for one delivery.
    pub fn duration_ms(&self) -> u64 {
        match self {
            Delay::Fixed(ms) => *ms,
            Delay::Range { min, max } => {
                use rand::Rng;
                let (lo, hi) = if min <= max { (*min, *max) } else { (*max, *min) };
                rand::thread_rng().gen_range(lo..=hi)
            }
        }
    }
}

/// Per-rule options.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleOptions {
    /// Simulated network latency applied before delivery.
    pub delay: Delay,
    /// Skip the serializability warning for this rule.
    pub suppress_warnings: bool,
}

/// An authored interception rule, prior to compilation.
#[derive(Clone, Default)]
pub struct RuleDefinition {
    /// Match spec. `None` is a definition error at compile time.
    pub when: Option<SpecNode>,
    /// Response template. `None` means "defaults only"; an explicit JSON null
    /// (`SpecNode::Value(Value::Null)`) means "intercept but no response".
    pub then: Option<SpecNode>,
    pub options: RuleOptions,
    /// Auxiliary auction-config spec.
    pub paapi: Option<SpecNode>,
}

impl RuleDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, node: impl Into<SpecNode>) -> Self {
        self.when = Some(node.into());
        self
    }

    pub fn then(mut self, node: impl Into<SpecNode>) -> Self {
        self.then = Some(node.into());
        self
    }

    /// Intercept matching bids without synthesizing any response.
    pub fn no_response(mut self) -> Self {
        self.then = Some(SpecNode::Value(Value::Null));
        self
    }

    pub fn paapi(mut self, node: impl Into<SpecNode>) -> Self {
        self.paapi = Some(node.into());
        self
    }

    pub fn options(mut self, options: RuleOptions) -> Self {
        self.options = options;
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.options.delay = Delay::Fixed(ms);
        self
    }

    /// Parse an authored JSON rule object. Never fails: malformed sections
    /// become [`SpecNode::Invalid`] leaves and are reported (with the rule's
    /// ordinal) when the registry compiles them.
    pub fn from_json(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return RuleDefinition {
                when: Some(SpecNode::Invalid {
                    raw: value.clone(),
                    reason: "rule definition must be an object".to_string(),
                }),
                ..Default::default()
            };
        };

        let options = match obj.get("options") {
            None => RuleOptions::default(),
            Some(raw) => serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
                warn!("ignoring malformed rule options ({e}): {raw}");
                RuleOptions::default()
            }),
        };

        RuleDefinition {
            when: obj.get("when").map(SpecNode::from_json),
            then: obj.get("then").map(SpecNode::from_json),
            options,
            paapi: obj.get("paapi").map(SpecNode::from_json),
        }
    }

    /// Reconstruct the authored JSON. `None` when any section contains a
    /// non-serializable node.
    pub fn to_json(&self) -> Option<Value> {
        let mut map = serde_json::Map::new();
        if let Some(when) = &self.when {
            map.insert("when".to_string(), when.to_json()?);
        }
        if let Some(then) = &self.then {
            map.insert("then".to_string(), then.to_json()?);
        }
        if self.options != RuleOptions::default() {
            map.insert(
                "options".to_string(),
                serde_json::to_value(&self.options).ok()?,
            );
        }
        if let Some(paapi) = &self.paapi {
            map.insert("paapi".to_string(), paapi.to_json()?);
        }
        Some(Value::Object(map))
    }

    /// Whether the whole definition survives a persisted round trip.
    pub fn is_serializable(&self) -> bool {
        self.to_json().is_some()
    }
}

impl fmt::Debug for RuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleDefinition")
            .field("when", &self.when)
            .field("then", &self.then)
            .field("options", &self.options)
            .field("paapi", &self.paapi)
            .finish()
    }
}
