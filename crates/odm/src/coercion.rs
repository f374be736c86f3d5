//! Field coercion collaborator
//!
//! Foreign keys and type discriminators are coerced to the declared field type
//! of the side that stores them before they are written.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OdmError, OdmResult};
use crate::model::ModelRegistry;

/// Declared type of a document field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Any,
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    Time,
}

impl FieldType {
    /// Coerce a raw value to this type; `null` always passes through
    pub fn coerce(&self, field: &str, value: Value) -> OdmResult<Value> {
        if value.is_null() {
            return Ok(value);
        }

        let invalid = |value: &Value| OdmError::invalid_value(field, value, self.expected());

        match self {
            FieldType::Any => Ok(value),
            FieldType::String => match value {
                Value::String(_) => Ok(value),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(invalid(&other)),
            },
            FieldType::Integer => match &value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                    _ => Err(invalid(&value)),
                },
                Value::String(s) => {
                    s.trim().parse::<i64>().map(Value::from).map_err(|_| invalid(&value))
                }
                _ => Err(invalid(&value)),
            },
            FieldType::Float => match &value {
                Value::Number(n) => n.as_f64().map(Value::from).ok_or_else(|| invalid(&value)),
                Value::String(s) => {
                    s.trim().parse::<f64>().map(Value::from).map_err(|_| invalid(&value))
                }
                _ => Err(invalid(&value)),
            },
            FieldType::Boolean => match &value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "1" => Ok(Value::Bool(true)),
                    "false" | "0" => Ok(Value::Bool(false)),
                    _ => Err(invalid(&value)),
                },
                _ => Err(invalid(&value)),
            },
            FieldType::Array => match value {
                Value::Array(_) => Ok(value),
                other => Err(invalid(&other)),
            },
            FieldType::Object => match value {
                Value::Object(_) => Ok(value),
                other => Err(invalid(&other)),
            },
            FieldType::Time => match &value {
                Value::String(s) => DateTime::parse_from_rfc3339(s)
                    .map(|time| Value::String(time.to_rfc3339()))
                    .map_err(|_| invalid(&value)),
                _ => Err(invalid(&value)),
            },
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            FieldType::Any => "any value",
            FieldType::String => "a string",
            FieldType::Integer => "an integer",
            FieldType::Float => "a number",
            FieldType::Boolean => "a boolean",
            FieldType::Array => "an array",
            FieldType::Object => "an embedded document",
            FieldType::Time => "an RFC 3339 timestamp",
        }
    }
}

/// Field coercion service
pub trait FieldCoercer: Send + Sync {
    fn coerce(&self, model: &str, field: &str, value: Value) -> OdmResult<Value>;
}

/// Coerces against the field types declared on registered model definitions
#[derive(Debug, Clone)]
pub struct SchemaCoercer {
    registry: ModelRegistry,
}

impl SchemaCoercer {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }
}

impl FieldCoercer for SchemaCoercer {
    fn coerce(&self, model: &str, field: &str, value: Value) -> OdmResult<Value> {
        let field_type = self
            .registry
            .get(model)
            .and_then(|definition| definition.field_type(field))
            .unwrap_or(FieldType::Any);
        field_type.coerce(field, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_coercion() {
        assert_eq!(FieldType::Integer.coerce("n", json!("42")).unwrap(), json!(42));
        assert_eq!(FieldType::Integer.coerce("n", json!(3.0)).unwrap(), json!(3));
        assert!(FieldType::Integer.coerce("n", json!("abc")).is_err());
    }

    #[test]
    fn test_string_and_null_coercion() {
        assert_eq!(FieldType::String.coerce("s", json!(7)).unwrap(), json!("7"));
        assert_eq!(FieldType::String.coerce("s", Value::Null).unwrap(), Value::Null);
        assert!(FieldType::String.coerce("s", json!({"a": 1})).is_err());
    }

    #[test]
    fn test_invalid_value_carries_field() {
        let err = FieldType::Array.coerce("tag_ids", json!("t1")).unwrap_err();
        assert!(matches!(err, OdmError::InvalidValue { ref field, .. } if field == "tag_ids"));
    }

    #[test]
    fn test_time_coercion_normalizes() {
        let value = FieldType::Time.coerce("at", json!("2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(value, json!("2024-01-01T00:00:00+00:00"));
    }
}
