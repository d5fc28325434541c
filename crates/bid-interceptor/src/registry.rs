//! Compiled rule set and matching engine.
//!
//! The registry owns an immutable snapshot of compiled rules behind a single
//! indirection. `update_config` compiles the full authored list (ordinals
//! assigned 1..N) and swaps the snapshot atomically: readers holding the
//! previous snapshot, or rules cloned out of it, are unaffected.

use crate::defaults::ResponseProcessors;
use crate::matcher::{compile_matcher, CompiledMatcher};
use crate::paapi::{compile_paapi, CompiledPaapi};
use crate::replacer::{compile_replacer, CompiledReplacer};
use crate::spec::{RuleDefinition, RuleOptions};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One rule compiled for matching. Immutable once built; lives until the next
/// configuration update replaces the snapshot it belongs to.
pub struct CompiledRule {
    ordinal: usize,
    matcher: CompiledMatcher,
    replacer: CompiledReplacer,
    paapi: Option<CompiledPaapi>,
    options: RuleOptions,
}

impl CompiledRule {
    /// Compile an authored definition. Malformed sections degrade per the
    /// definition-error taxonomy; compilation itself never fails.
    pub fn compile(def: &RuleDefinition, ordinal: usize) -> Self {
        Self {
            ordinal,
            matcher: compile_matcher(def.when.as_ref(), ordinal),
            replacer: compile_replacer(def.then.as_ref(), ordinal),
            paapi: compile_paapi(def.paapi.as_ref(), ordinal),
            options: def.options.clone(),
        }
    }

    /// 1-based position in the authored list; diagnostics only.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn options(&self) -> &RuleOptions {
        &self.options
    }

    /// Resolve this rule's delivery delay.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.options.delay.duration_ms())
    }

    pub fn matches(&self, candidate: &Value, context: &[Value]) -> bool {
        self.matcher.matches(candidate, context)
    }

    /// Synthesize the mock response, or `None` for a no-response rule.
    pub fn response(
        &self,
        bid: &Value,
        context: &[Value],
        processors: &ResponseProcessors,
    ) -> Option<Value> {
        self.replacer.generate(bid, context, processors)
    }

    /// Normalized auction configs; empty when the rule has no generator.
    pub fn paapi_configs(&self, bid: &Value, context: &[Value]) -> Vec<Value> {
        self.paapi
            .as_ref()
            .map(|paapi| paapi.configs(bid, context))
            .unwrap_or_default()
    }
}

/// A matched bid paired with its rule; produced per `match_all` invocation.
pub struct MatchResult {
    pub bid: Value,
    pub rule: Arc<CompiledRule>,
}

/// Holds the current compiled rule snapshot.
pub struct RuleRegistry {
    rules: RwLock<Arc<Vec<Arc<CompiledRule>>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Replace the whole rule list, compiling in authoring order.
    pub fn update_config(&self, defs: &[RuleDefinition]) {
        let compiled: Vec<Arc<CompiledRule>> = defs
            .iter()
            .enumerate()
            .map(|(i, def)| Arc::new(CompiledRule::compile(def, i + 1)))
            .collect();
        debug!("installed {} interception rule(s)", compiled.len());
        *self.rules.write() = Arc::new(compiled);
    }

    /// Replace the rule list from a raw JSON array of rule objects. Anything
    /// that is not an array installs an empty list.
    pub fn update_config_json(&self, raw: &Value) {
        let defs: Vec<RuleDefinition> = match raw.as_array() {
            Some(items) => items.iter().map(RuleDefinition::from_json).collect(),
            None => {
                if !raw.is_null() {
                    warn!("intercept config must be an array of rules; clearing rules");
                }
                Vec::new()
            }
        };
        self.update_config(&defs);
    }

    /// Current snapshot; unaffected by later updates.
    pub fn snapshot(&self) -> Arc<Vec<Arc<CompiledRule>>> {
        Arc::clone(&self.rules.read())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// First rule (in ordinal order) matching the candidate.
    pub fn match_rule(&self, candidate: &Value, context: &[Value]) -> Option<Arc<CompiledRule>> {
        self.snapshot()
            .iter()
            .find(|rule| rule.matches(candidate, context))
            .cloned()
    }

    /// Partition a batch into matched and unmatched, preserving input order
    /// within each partition.
    pub fn match_all(&self, bids: &[Value], context: &[Value]) -> (Vec<MatchResult>, Vec<Value>) {
        let rules = self.snapshot();
        let mut matches = Vec::new();
        let mut unmatched = Vec::new();
        for bid in bids {
            match rules.iter().find(|rule| rule.matches(bid, context)) {
                Some(rule) => matches.push(MatchResult {
                    bid: bid.clone(),
                    rule: Arc::clone(rule),
                }),
                None => unmatched.push(bid.clone()),
            }
        }
        (matches, unmatched)
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter rule definitions down to those that survive a persisted round trip.
/// Advisory only: non-serializable rules stay active in memory, they are just
/// excluded from persisted output, with one warning per rule (naming its
/// position) unless the rule opts out via `options.suppressWarnings`.
pub fn serialize_config(defs: &[RuleDefinition]) -> Vec<Value> {
    defs.iter()
        .enumerate()
        .filter_map(|(i, def)| match def.to_json() {
            Some(json) => Some(json),
            None => {
                if !def.options.suppress_warnings {
                    warn!(
                        "intercept rule #{} is not serializable and will be lost \
                         when the configuration is persisted",
                        i + 1
                    );
                }
                None
            }
        })
        .collect()
}
