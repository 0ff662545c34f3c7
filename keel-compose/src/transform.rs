//! Value transforms applied along a patch: `map`, `format`, `math`, `convert`.
//!
//! `format` and `combine` templates are rendered with tera over a context
//! holding only the patch's own source values.

use keel_core::types::{ConvertTarget, Transform};
use serde_json::{Number, Value};
use tera::{Context, Tera};

/// Run `transforms` over `value` in order.
pub fn apply_all(value: Value, transforms: &[Transform]) -> Result<Value, String> {
    transforms.iter().try_fold(value, |v, t| apply(v, t))
}

pub fn apply(value: Value, transform: &Transform) -> Result<Value, String> {
    match transform {
        Transform::Map { pairs, fallback } => {
            let key = scalar_key(&value);
            match pairs.get(&key) {
                Some(mapped) => Ok(mapped.clone()),
                None => fallback
                    .clone()
                    .ok_or_else(|| format!("map transform has no entry for '{key}'")),
            }
        }
        Transform::Format { template } => {
            let mut ctx = Context::new();
            ctx.insert("value", &value);
            render(template, &ctx).map(Value::String)
        }
        Transform::Math { multiply, add } => {
            let n = value
                .as_f64()
                .ok_or_else(|| format!("math transform expects a number, got {value}"))?;
            let out = n * multiply.unwrap_or(1.0) + add.unwrap_or(0.0);
            number(out)
        }
        Transform::Convert { to } => convert(value, *to),
    }
}

/// Render a `combine` template; sources are bound as `v0`, `v1`, ...
pub fn combine(template: &str, sources: &[Value]) -> Result<Value, String> {
    let mut ctx = Context::new();
    for (i, v) in sources.iter().enumerate() {
        ctx.insert(format!("v{i}"), v);
    }
    render(template, &ctx).map(Value::String)
}

fn render(template: &str, ctx: &Context) -> Result<String, String> {
    Tera::one_off(template, ctx, false).map_err(|e| {
        let mut msg = e.to_string();
        let mut source = std::error::Error::source(&e);
        while let Some(inner) = source {
            msg.push_str(": ");
            msg.push_str(&inner.to_string());
            source = inner.source();
        }
        msg
    })
}

fn scalar_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Integral results stay integers so `replicas * 2` remains an int.
fn number(n: f64) -> Result<Value, String> {
    if !n.is_finite() {
        return Err(format!("math transform produced {n}"));
    }
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Ok(Value::from(n as i64));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| format!("math transform produced {n}"))
}

fn convert(value: Value, to: ConvertTarget) -> Result<Value, String> {
    let fail = |v: &Value| format!("cannot convert {v} to {to:?}");
    match to {
        ConvertTarget::String => Ok(Value::String(scalar_key(&value))),
        ConvertTarget::Int => match &value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .map(Value::from)
                .ok_or_else(|| fail(&value)),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| fail(&value)),
            Value::Bool(b) => Ok(Value::from(i64::from(*b))),
            _ => Err(fail(&value)),
        },
        ConvertTarget::Float => match &value {
            Value::Number(n) => n
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| fail(&value)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| fail(&value)),
            _ => Err(fail(&value)),
        },
        ConvertTarget::Bool => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(fail(&value)),
            },
            Value::Number(n) => Ok(Value::Bool(n.as_f64().map_or(false, |f| f != 0.0))),
            _ => Err(fail(&value)),
        },
    }
}
