//! Readiness checks evaluated against observed state.

use keel_core::types::ReadinessCheck;
use serde_json::Value;

use crate::fieldpath;

/// `true` when every check passes. No checks means ready.
pub fn is_ready(checks: &[ReadinessCheck], observed: &Value) -> bool {
    checks.iter().all(|check| passes(check, observed))
}

fn passes(check: &ReadinessCheck, observed: &Value) -> bool {
    match check {
        ReadinessCheck::MatchString { field_path, value } => {
            fieldpath::get(observed, field_path).and_then(Value::as_str) == Some(value.as_str())
        }
        ReadinessCheck::MatchTrue { field_path } => {
            fieldpath::get(observed, field_path).and_then(Value::as_bool) == Some(true)
        }
        ReadinessCheck::NonEmpty { field_path } => match fieldpath::get(observed, field_path) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        },
    }
}
