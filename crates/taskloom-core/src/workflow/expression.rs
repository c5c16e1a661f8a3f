//! JEXL expression evaluator for concurrency keys, rate-limit keys and event
//! filters.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of string transforms and
//! provides the three shapes Taskloom needs: a boolean (event filters), a raw
//! value, and a group/bucket key (concurrency and dynamic rate limits).
//!
//! Payloads are always passed as context objects, never interpolated into
//! expression strings.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,

    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression did not evaluate to a usable key: got {result}")]
    NotAKey { result: Value },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

impl ExpressionError {
    /// Whether the failure is independent of the data evaluated against
    /// (syntax errors, unknown transforms).
    pub fn is_static(&self) -> bool {
        match self {
            ExpressionError::Empty => true,
            ExpressionError::EvalFailed(message) => {
                let m = message.to_ascii_lowercase();
                m.contains("pars") || m.contains("unrecognized") || m.contains("unknown transform")
            }
            ExpressionError::NotAKey { .. } | ExpressionError::InvalidContext(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms registered.
///
/// Construct one where it is needed; the underlying evaluator holds boxed
/// transform closures and is not meant to be shared across threads.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Stringify anything so keys can be composed: `input.a|string + ':' + input.b`
            .with_transform("string", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(value_to_key(&val).unwrap_or_default()))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if expression.trim().is_empty() {
            return Err(ExpressionError::Empty);
        }
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        let result = self.evaluate_value(expression, context)?;
        Ok(is_truthy(&result))
    }

    /// Evaluate an expression to a group or bucket key.
    ///
    /// Strings map to themselves, numbers and booleans to their text form.
    /// Null, arrays and objects are rejected.
    pub fn evaluate_key(&self, expression: &str, context: &Value) -> Result<String, ExpressionError> {
        let result = self.evaluate_value(expression, context)?;
        value_to_key(&result).ok_or(ExpressionError::NotAKey { result })
    }

    /// Check an expression against a sample context, reporting only failures
    /// that no real input could avoid.
    pub fn check(&self, expression: &str, sample: &Value) -> Result<(), ExpressionError> {
        match self.evaluate_value(expression, sample) {
            Ok(_) => Ok(()),
            Err(err) if err.is_static() => Err(err),
            Err(_) => Ok(()),
        }
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a scalar JSON value as a key.
pub fn value_to_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Some((f as i64).to_string())
                } else {
                    Some(f.to_string())
                }
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> ExpressionEvaluator {
        ExpressionEvaluator::new()
    }

    #[test]
    fn test_key_from_string_field() {
        let ctx = json!({ "input": { "user_id": "u-42" } });
        assert_eq!(evaluator().evaluate_key("input.user_id", &ctx).unwrap(), "u-42");
    }

    #[test]
    fn test_key_from_number_and_bool() {
        let ctx = json!({ "input": { "tenant": 7, "ratio": 2.5, "vip": true } });
        let eval = evaluator();
        assert_eq!(eval.evaluate_key("input.tenant", &ctx).unwrap(), "7");
        assert_eq!(eval.evaluate_key("input.ratio", &ctx).unwrap(), "2.5");
        assert_eq!(eval.evaluate_key("input.vip", &ctx).unwrap(), "true");
    }

    #[test]
    fn test_key_rejects_null_and_objects() {
        let ctx = json!({ "input": { "nested": { "a": 1 } } });
        let eval = evaluator();
        assert!(matches!(
            eval.evaluate_key("input.missing", &ctx),
            Err(ExpressionError::NotAKey { .. })
        ));
        assert!(matches!(
            eval.evaluate_key("input.nested", &ctx),
            Err(ExpressionError::NotAKey { .. })
        ));
    }

    #[test]
    fn test_key_with_transform() {
        let ctx = json!({ "input": { "region": "EU-West" } });
        assert_eq!(
            evaluator().evaluate_key("input.region|lower", &ctx).unwrap(),
            "eu-west"
        );
    }

    #[test]
    fn test_bool_filter_on_payload() {
        let ctx = json!({ "payload": { "status": "paid" } });
        let eval = evaluator();
        assert!(eval.evaluate_bool("payload.status == 'paid'", &ctx).unwrap());
        assert!(!eval.evaluate_bool("payload.status == 'void'", &ctx).unwrap());
    }

    #[test]
    fn test_empty_expression_is_static_error() {
        let err = evaluator().evaluate_value("   ", &json!({})).unwrap_err();
        assert_eq!(err, ExpressionError::Empty);
        assert!(err.is_static());
    }

    #[test]
    fn test_check_rejects_syntax_errors() {
        let sample = json!({ "payload": {} });
        let eval = evaluator();
        assert!(eval.check("payload.id == ", &sample).is_err());
        assert!(eval.check("payload.id == 'a'", &sample).is_ok());
    }

    #[test]
    fn test_non_object_context_rejected() {
        let err = evaluator().evaluate_bool("true", &json!("nope")).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
        assert!(!err.is_static());
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!("x")));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0.0)));
        assert!(is_truthy(&json!([])));
        assert!(!is_truthy(&Value::Null));
    }

    #[test]
    fn test_value_to_key_integral_float() {
        assert_eq!(value_to_key(&json!(3.0)).as_deref(), Some("3"));
    }
}
