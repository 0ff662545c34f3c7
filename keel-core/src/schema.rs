//! Claim parameter schemas.
//!
//! A deliberately small structural schema: typed properties, required keys,
//! defaults, enums and array items. Enough to validate claim parameters and
//! to decide whether a definition update is additive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Object,
    String,
    Integer,
    Number,
    Boolean,
    Array,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::Object => value.is_object(),
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaProps {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SchemaProps>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaProps>>,
}

impl SchemaProps {
    pub fn object() -> Self {
        Self {
            field_type: FieldType::Object,
            properties: BTreeMap::new(),
            required: Vec::new(),
            default: None,
            allowed: Vec::new(),
            items: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Fill absent object properties from their schema defaults, recursively.
pub fn apply_defaults(schema: &SchemaProps, value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, prop) in &schema.properties {
                if !map.contains_key(key) {
                    if let Some(default) = &prop.default {
                        map.insert(key.clone(), default.clone());
                    }
                }
                if let Some(child) = map.get_mut(key) {
                    apply_defaults(prop, child);
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = &schema.items {
                for item in items {
                    apply_defaults(item_schema, item);
                }
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Every violation found in `value`, as `path: reason` strings. Empty means valid.
pub fn validate(schema: &SchemaProps, value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    validate_at(schema, value, "spec", &mut violations);
    violations
}

fn validate_at(schema: &SchemaProps, value: &Value, path: &str, out: &mut Vec<String>) {
    if !schema.field_type.matches(value) {
        out.push(format!(
            "{path}: expected {:?}, found {}",
            schema.field_type,
            json_type_name(value)
        ));
        return;
    }
    if !schema.allowed.is_empty() && !schema.allowed.contains(value) {
        out.push(format!("{path}: value {value} is not one of the allowed values"));
    }
    match value {
        Value::Object(map) => {
            for key in &schema.required {
                if map.get(key).map_or(true, Value::is_null) {
                    out.push(format!("{path}.{key}: required field missing"));
                }
            }
            for (key, child) in map {
                match schema.properties.get(key) {
                    Some(prop) => validate_at(prop, child, &format!("{path}.{key}"), out),
                    None if !schema.properties.is_empty() => {
                        out.push(format!("{path}.{key}: unknown field"));
                    }
                    None => {}
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = &schema.items {
                for (i, item) in items.iter().enumerate() {
                    validate_at(item_schema, item, &format!("{path}[{i}]"), out);
                }
            }
        }
        _ => {}
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Additive-change check
// ---------------------------------------------------------------------------

/// Reasons why `new` is not a purely additive extension of `old`.
///
/// Removing a property, changing a type, or newly requiring a key all break
/// existing claims. Adding optional properties is fine.
pub fn non_additive_changes(old: &SchemaProps, new: &SchemaProps) -> Vec<String> {
    let mut reasons = Vec::new();
    compare_at(old, new, "spec", &mut reasons);
    reasons
}

fn compare_at(old: &SchemaProps, new: &SchemaProps, path: &str, out: &mut Vec<String>) {
    if old.field_type != new.field_type {
        out.push(format!(
            "{path}: type changed from {:?} to {:?}",
            old.field_type, new.field_type
        ));
        return;
    }
    for key in &new.required {
        if !old.required.contains(key) {
            out.push(format!("{path}.{key}: newly required"));
        }
    }
    for (key, old_prop) in &old.properties {
        match new.properties.get(key) {
            Some(new_prop) => compare_at(old_prop, new_prop, &format!("{path}.{key}"), out),
            None => out.push(format!("{path}.{key}: field removed")),
        }
    }
    if let (Some(old_items), Some(new_items)) = (&old.items, &new.items) {
        compare_at(old_items, new_items, &format!("{path}[]"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db_schema() -> SchemaProps {
        serde_yaml::from_str(
            r#"
type: object
required: [size]
properties:
  size:
    type: string
    enum: [small, large]
  replicas:
    type: integer
    default: 1
  tags:
    type: array
    items:
      type: string
"#,
        )
        .expect("schema")
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let mut v = json!({"size": "small"});
        apply_defaults(&db_schema(), &mut v);
        assert_eq!(v["replicas"], json!(1));
    }

    #[test]
    fn validate_reports_each_violation() {
        let v = json!({"replicas": "two", "tags": ["a", 3], "extra": true});
        let errs = validate(&db_schema(), &v);
        assert!(errs.iter().any(|e| e.contains("spec.size: required")));
        assert!(errs.iter().any(|e| e.contains("spec.replicas: expected Integer")));
        assert!(errs.iter().any(|e| e.contains("spec.tags[1]")));
        assert!(errs.iter().any(|e| e.contains("spec.extra: unknown field")));
    }

    #[test]
    fn enum_is_enforced() {
        let errs = validate(&db_schema(), &json!({"size": "medium"}));
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn adding_optional_field_is_additive() {
        let old = db_schema();
        let mut new = db_schema();
        new.properties.insert(
            "zone".into(),
            SchemaProps {
                field_type: FieldType::String,
                ..SchemaProps::object()
            },
        );
        assert!(non_additive_changes(&old, &new).is_empty());
    }

    #[test]
    fn removal_type_change_and_new_required_are_rejected() {
        let old = db_schema();
        let mut new = db_schema();
        new.properties.remove("tags");
        if let Some(p) = new.properties.get_mut("replicas") {
            p.field_type = FieldType::String;
        }
        new.required.push("replicas".into());
        let reasons = non_additive_changes(&old, &new);
        assert_eq!(reasons.len(), 3, "{reasons:?}");
    }
}
