//! Debugging configuration envelope.
//!
//! The engine's rules arrive wrapped in a small config object so a host can
//! toggle interception without discarding its rule set. Rules are kept as raw
//! JSON here; compilation happens when the config is applied to an engine.

use crate::spec::RuleDefinition;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level debugging config. `enabled: false` turns interception off
/// entirely; `intercept` carries the raw rule definitions in priority order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DebuggingConfig {
    pub enabled: bool,
    pub intercept: Vec<Value>,
}

impl Default for DebuggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            intercept: Vec::new(),
        }
    }
}

impl DebuggingConfig {
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("failed to parse debugging config JSON")
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(raw).context("failed to parse debugging config YAML")
    }

    /// Parse the raw rule entries. Malformed entries are preserved as rules
    /// whose match section is invalid, so they disable themselves with a
    /// diagnostic instead of shifting the ordinals of later rules.
    pub fn rules(&self) -> Vec<RuleDefinition> {
        self.intercept.iter().map(RuleDefinition::from_json).collect()
    }
}
