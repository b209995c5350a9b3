//! Structured items and their shape validation.
//!
//! Parse callbacks emit items for the output pipelines. An item's runtime
//! shape is validated once per Rust type: the serialized form must be a map
//! whose fields are strings, sequences of strings, or maps recursively
//! satisfying the same rule. Valid types are memoised by `TypeId` on the
//! owning task, so the second item of a type costs one map lookup.

use std::sync::Arc;

use serde_json::Value;

use crate::task::Task;

/// A structured record emitted by a parse callback, bound to its task.
#[derive(Debug, Clone)]
pub struct Item {
    task: Arc<Task>,
    data: Value,
}

impl Item {
    pub(crate) fn new(task: Arc<Task>, data: Value) -> Self {
        Self { task, data }
    }

    /// The task this item belongs to.
    #[must_use]
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// The item's serialized data.
    #[must_use]
    pub fn data(&self) -> &Value {
        &self.data
    }
}

/// Checks the pipelinable-shape rule on a serialized item.
///
/// Returns a human-readable description of the first violation.
pub(crate) fn validate_item_shape(value: &Value) -> Result<(), String> {
    let Value::Object(map) = value else {
        return Err("top-level value must be a struct or map".to_string());
    };
    validate_fields(map, "")
}

fn validate_fields(map: &serde_json::Map<String, Value>, prefix: &str) -> Result<(), String> {
    for (name, field) in map {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match field {
            Value::String(_) => {}
            Value::Array(elements) => {
                if let Some(bad) = elements.iter().find(|e| !e.is_string()) {
                    return Err(format!(
                        "field {path} is a sequence containing a non-string ({})",
                        type_name_of(bad)
                    ));
                }
            }
            Value::Object(nested) => validate_fields(nested, &path)?,
            other => {
                return Err(format!("field {path} has type {}", type_name_of(other)));
            }
        }
    }
    Ok(())
}

fn type_name_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_string_struct_is_valid() {
        let value = json!({"title": "T1", "link": "http://fixture.test/1"});
        assert!(validate_item_shape(&value).is_ok());
    }

    #[test]
    fn test_string_sequences_are_valid() {
        let value = json!({"tags": ["a", "b"], "title": "x"});
        assert!(validate_item_shape(&value).is_ok());
    }

    #[test]
    fn test_nested_maps_recurse() {
        let value = json!({"meta": {"author": "a", "links": ["l1"]}, "title": "x"});
        assert!(validate_item_shape(&value).is_ok());

        let bad = json!({"meta": {"count": 3}});
        let err = validate_item_shape(&bad).unwrap_err();
        assert!(err.contains("meta.count"), "got: {err}");
        assert!(err.contains("number"), "got: {err}");
    }

    #[test]
    fn test_non_map_top_level_is_invalid() {
        assert!(validate_item_shape(&json!("just a string")).is_err());
        assert!(validate_item_shape(&json!(["a", "b"])).is_err());
        assert!(validate_item_shape(&json!(42)).is_err());
    }

    #[test]
    fn test_numeric_field_is_invalid() {
        let err = validate_item_shape(&json!({"year": 1999})).unwrap_err();
        assert!(err.contains("year"));
    }

    #[test]
    fn test_mixed_sequence_is_invalid() {
        let err = validate_item_shape(&json!({"tags": ["a", 1]})).unwrap_err();
        assert!(err.contains("tags"));
        assert!(err.contains("non-string"));
    }

    #[test]
    fn test_empty_map_is_valid() {
        assert!(validate_item_shape(&json!({})).is_ok());
    }
}
