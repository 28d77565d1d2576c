//! Sandboxed value transform for MQTT publisher mappings
//!
//! A transform is a small expression over a single `value` input, parsed
//! once at configuration time and evaluated per publish. Evaluation is
//! deterministic and produces primitives only; anything else is rejected.
//!
//! Supported surface (evalexpr): arithmetic `+ - * / %`, power `^`,
//! comparison, boolean operators, `if(cond, a, b)`, `min`/`max`,
//! `floor`/`ceil`/`round` and the `math::*` function set.

use evalexpr::{ContextWithMutableVariables, HashMapContext, Node};

use crate::error::ModelError;
use crate::value::Value;

/// A compiled value transform
#[derive(Debug, Clone)]
pub struct Transform {
    source: String,
    node: Node,
}

impl Transform {
    /// Parse an expression; syntax errors reject the transform outright
    pub fn parse(source: &str) -> Result<Self, ModelError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(ModelError::Expression("Empty expression".to_string()));
        }
        let node = evalexpr::build_operator_tree(trimmed)
            .map_err(|e| ModelError::Expression(format!("Parse '{}': {}", trimmed, e)))?;
        Ok(Self {
            source: trimmed.to_string(),
            node,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a single input value
    pub fn apply(&self, input: &Value) -> Result<Value, ModelError> {
        let mut context = HashMapContext::new();
        let injected = match input {
            Value::Bool(b) => evalexpr::Value::Boolean(*b),
            Value::Int(i) => evalexpr::Value::Int(*i),
            Value::Float(f) => evalexpr::Value::Float(*f),
            Value::Text(s) => evalexpr::Value::String(s.clone()),
            Value::Null => evalexpr::Value::Empty,
        };
        context
            .set_value("value".to_string(), injected)
            .map_err(|e| ModelError::Expression(format!("Context: {}", e)))?;

        let result = self
            .node
            .eval_with_context(&context)
            .map_err(|e| ModelError::Expression(format!("Eval '{}': {}", self.source, e)))?;

        match result {
            evalexpr::Value::Boolean(b) => Ok(Value::Bool(b)),
            evalexpr::Value::Int(i) => Ok(Value::Int(i)),
            evalexpr::Value::Float(f) => Ok(Value::Float(f)),
            evalexpr::Value::String(s) => Ok(Value::Text(s)),
            evalexpr::Value::Empty => Ok(Value::Null),
            other => Err(ModelError::Expression(format!(
                "Non-primitive result from '{}': {:?}",
                self.source, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let t = Transform::parse("value * 0.1").unwrap();
        assert_eq!(t.apply(&Value::Float(250.0)).unwrap(), Value::Float(25.0));
    }

    #[test]
    fn test_integer_passthrough() {
        let t = Transform::parse("value + 1").unwrap();
        assert_eq!(t.apply(&Value::Int(41)).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_comparison_and_if() {
        let t = Transform::parse("if(value > 100.0, 100.0, value)").unwrap();
        assert_eq!(t.apply(&Value::Float(250.0)).unwrap(), Value::Float(100.0));
        assert_eq!(t.apply(&Value::Float(50.0)).unwrap(), Value::Float(50.0));
    }

    #[test]
    fn test_parse_error_rejected() {
        assert!(Transform::parse("value + +").is_err());
        assert!(Transform::parse("").is_err());
    }

    #[test]
    fn test_deterministic() {
        let t = Transform::parse("value ^ 2 - 1").unwrap();
        let a = t.apply(&Value::Float(3.0)).unwrap();
        let b = t.apply(&Value::Float(3.0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, Value::Float(8.0));
    }

    #[test]
    fn test_tuple_result_rejected() {
        let t = Transform::parse("(value, 1)").unwrap();
        assert!(t.apply(&Value::Float(1.0)).is_err());
    }
}
