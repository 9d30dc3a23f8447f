//! Property bags attached to graph nodes, relationships and meta-graph rows.
//!
//! The frontend contract is a flat `string -> string` map. Persisted JSON columns may hold
//! any JSON value, so every value crossing the persistence boundary goes through
//! [`PropertyValue`] and is coerced with the same rules:
//!
//! | JSON value        | coerced string          |
//! |-------------------|-------------------------|
//! | `null`            | `""`                    |
//! | `true` / `false`  | `"true"` / `"false"`    |
//! | number            | its decimal rendering   |
//! | string            | unchanged               |
//! | array / object    | compact JSON text       |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
};

pub type Properties = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
    Structured(Value),
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => PropertyValue::Null,
            Value::Bool(b) => PropertyValue::Bool(b),
            Value::Number(n) => PropertyValue::Number(n),
            Value::String(s) => PropertyValue::Text(s),
            structured => PropertyValue::Structured(structured),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl Display for PropertyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Null => Ok(()),
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Number(n) => write!(f, "{n}"),
            PropertyValue::Text(s) => f.write_str(s),
            PropertyValue::Structured(v) => write!(f, "{v}"),
        }
    }
}

impl PropertyValue {
    pub fn coerce(&self) -> String {
        self.to_string()
    }
}

/// Coerce a JSON property column into the string map the frontend expects.
///
/// Anything other than an object (including `null`) yields an empty map.
pub fn coerce_properties(value: &Value) -> Properties {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), PropertyValue::from(v.clone()).coerce()))
            .collect(),
        _ => Properties::new(),
    }
}

/// Parse a stored JSON property column. Malformed text is treated as an empty bag.
pub fn parse_properties(raw: Option<&str>) -> Properties {
    match raw.map(serde_json::from_str::<Value>) {
        Some(Ok(value)) => coerce_properties(&value),
        Some(Err(e)) => {
            tracing::warn!("[properties] Discarding malformed property column: {e}");
            Properties::new()
        }
        None => Properties::new(),
    }
}

pub fn properties_to_json(props: &Properties) -> Value {
    Value::Object(
        props
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<String, Value>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_every_primitive_kind() {
        let raw = json!({
            "name": "Ada",
            "age": 36,
            "ratio": 0.5,
            "active": true,
            "missing": null,
            "tags": ["a", "b"],
        });
        let props = coerce_properties(&raw);
        assert_eq!(props["name"], "Ada");
        assert_eq!(props["age"], "36");
        assert_eq!(props["ratio"], "0.5");
        assert_eq!(props["active"], "true");
        assert_eq!(props["missing"], "");
        assert_eq!(props["tags"], r#"["a","b"]"#);
    }

    #[test]
    fn non_object_columns_yield_empty_maps() {
        assert!(coerce_properties(&Value::Null).is_empty());
        assert!(coerce_properties(&json!([1, 2])).is_empty());
        assert!(parse_properties(Some("not json")).is_empty());
        assert!(parse_properties(None).is_empty());
    }

    #[test]
    fn string_maps_survive_json_encoding() {
        let mut props = Properties::new();
        props.insert("size".into(), "4".into());
        props.insert("memberCount".into(), "4".into());
        let text = properties_to_json(&props).to_string();
        assert_eq!(parse_properties(Some(&text)), props);
    }
}
