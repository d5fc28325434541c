//! Rhai-backed dynamic rule leaves.
//!
//! Rule configs persisted as JSON cannot carry native closures, so dynamic
//! behavior in persisted rules is expressed as Rhai expressions. A script leaf
//! is compiled once at definition time; each evaluation runs against a fresh
//! engine with two scope variables:
//!
//! - `value` — the candidate (top-level matcher), field value (nested
//!   matcher), or bid (template/paapi position)
//! - `args`  — the positional match context (the enclosing bidder request)
//!
//! In matcher position the script result is truthy-tested; in template and
//! paapi position it is converted back to JSON.

use anyhow::{anyhow, Result};
use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::Value;
use std::fmt;

/// A compiled Rhai rule leaf. The AST is kept alongside the source so the
/// definition can round-trip through serialized config.
pub struct RuleScript {
    source: String,
    ast: AST,
}

impl RuleScript {
    pub fn compile(source: &str) -> Result<Self> {
        let engine = Engine::new();
        let ast = engine
            .compile(source)
            .map_err(|e| anyhow!("failed to compile rule script: {e}"))?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn eval(&self, value: &Value, args: &[Value]) -> Result<Dynamic> {
        let engine = Engine::new();
        let mut scope = Scope::new();
        scope.push_dynamic(
            "value",
            rhai::serde::to_dynamic(value).map_err(|e| anyhow!("script scope error: {e}"))?,
        );
        scope.push_dynamic(
            "args",
            rhai::serde::to_dynamic(args).map_err(|e| anyhow!("script scope error: {e}"))?,
        );
        engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|e| anyhow!("script evaluation failed: {e}"))
    }

    /// Evaluate in matcher position: the result is truthy-tested.
    pub fn eval_bool(&self, value: &Value, args: &[Value]) -> Result<bool> {
        Ok(truthy(self.eval(value, args)?))
    }

    /// Evaluate in template/paapi position: the result converts to JSON.
    /// A unit result (script with no value) maps to JSON null.
    pub fn eval_value(&self, value: &Value, args: &[Value]) -> Result<Value> {
        let result = self.eval(value, args)?;
        if result.is_unit() {
            return Ok(Value::Null);
        }
        rhai::serde::from_dynamic(&result).map_err(|e| anyhow!("script result error: {e}"))
    }
}

impl fmt::Debug for RuleScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RuleScript").field(&self.source).finish()
    }
}

/// Truthiness for matcher-position script results: unit, `false`, zero, and
/// the empty string are falsy; everything else (maps, arrays, ...) is truthy.
fn truthy(value: Dynamic) -> bool {
    if value.is_unit() {
        return false;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return b;
    }
    if let Some(n) = value.clone().try_cast::<i64>() {
        return n != 0;
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return f != 0.0;
    }
    if let Some(s) = value.try_cast::<String>() {
        return !s.is_empty();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eval_bool_on_field_value() {
        let script = RuleScript::compile(r#"value == "mockBidder""#).unwrap();
        assert!(script.eval_bool(&json!("mockBidder"), &[]).unwrap());
        assert!(!script.eval_bool(&json!("other"), &[]).unwrap());
    }

    #[test]
    fn test_eval_bool_truthiness() {
        let cases = [
            ("1", true),
            ("0", false),
            ("0.0", false),
            (r#""""#, false),
            (r#""x""#, true),
            ("#{ a: 1 }", true),
            ("()", false),
        ];
        for (source, expected) in cases {
            let script = RuleScript::compile(source).unwrap();
            assert_eq!(
                script.eval_bool(&Value::Null, &[]).unwrap(),
                expected,
                "source: {source}"
            );
        }
    }

    #[test]
    fn test_eval_sees_args() {
        let script = RuleScript::compile(r#"args[0].bidderCode == "mockBidder""#).unwrap();
        let request = json!({"bidderCode": "mockBidder"});
        assert!(script.eval_bool(&Value::Null, &[request]).unwrap());
    }

    #[test]
    fn test_eval_value_object() {
        let script = RuleScript::compile(r#"#{ cpm: value.floor * 2.0 }"#).unwrap();
        let bid = json!({"floor": 1.25});
        assert_eq!(script.eval_value(&bid, &[]).unwrap(), json!({"cpm": 2.5}));
    }

    #[test]
    fn test_eval_value_unit_is_null() {
        let script = RuleScript::compile("()").unwrap();
        assert_eq!(script.eval_value(&Value::Null, &[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_compile_error() {
        assert!(RuleScript::compile("#{ broken").is_err());
    }

    #[test]
    fn test_eval_error_is_contained() {
        let script = RuleScript::compile("value.no_such_method()").unwrap();
        assert!(script.eval_bool(&json!(1), &[]).is_err());
    }
}
