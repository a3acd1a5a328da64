//! Message schema validation
//!
//! A compiled subset of JSON Schema Draft-6, enough for the presence and
//! chat message contracts: `type`, `required`, `properties`,
//! `additionalProperties` (boolean), `enum`, `minLength`, `maxLength`,
//! `minimum`, `maximum` and `format` (`date-time`, `unix-time`).
//!
//! Schemas are parsed once at startup into [`Schema`] trees and shared
//! read-only afterwards. Validation stops at the first violation.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{SchemaError, ValidationError};

/// Message kinds that carry a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    Presence,
    Chat,
}

impl SchemaKind {
    /// The schema compiled into the binary
    fn builtin(self) -> &'static str {
        match self {
            SchemaKind::Presence => include_str!("../schemas/presence.json"),
            SchemaKind::Chat => include_str!("../schemas/msg.json"),
        }
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaKind::Presence => write!(f, "presence"),
            SchemaKind::Chat => write!(f, "msg"),
        }
    }
}

/// JSON primitive type names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl JsonType {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "null" => Some(Self::Null),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Null => "null",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Object, Value::Object(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            // Draft-6 counts 1.0 as an integer
            (Self::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Null, Value::Null) => true,
            _ => false,
        }
    }
}

/// Checked string/number formats; unknown names are ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    /// RFC 3339 timestamp string
    DateTime,
    /// Non-negative number of seconds since the epoch
    UnixTime,
}

impl Format {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "date-time" => Some(Self::DateTime),
            "unix-time" => Some(Self::UnixTime),
            _ => None,
        }
    }

    /// `None` when `value` conforms or the format does not apply to its type
    fn check(self, value: &Value) -> Option<&'static str> {
        match (self, value) {
            (Self::DateTime, Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
                .is_err()
                .then_some("is not a \"date-time\""),
            (Self::UnixTime, Value::Number(n)) => n
                .as_f64()
                .filter(|secs| *secs >= 0.0)
                .is_none()
                .then_some("is not a \"unix-time\""),
            _ => None,
        }
    }
}

/// A compiled schema node
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    types: Option<Vec<JsonType>>,
    required: Vec<String>,
    properties: BTreeMap<String, Schema>,
    additional_properties: bool,
    enum_values: Option<Vec<Value>>,
    min_length: Option<u64>,
    max_length: Option<u64>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    format: Option<Format>,
}

/// Append one segment to a JSON-pointer style path
fn child_path(parent: &str, key: &str) -> String {
    if parent == "/" {
        format!("/{}", key)
    } else {
        format!("{}/{}", parent, key)
    }
}

impl Schema {
    /// Parse a schema document
    pub fn parse(kind: SchemaKind, text: &str) -> Result<Self, SchemaError> {
        let value: Value =
            serde_json::from_str(text).map_err(|source| SchemaError::Parse { kind, source })?;
        Self::from_value(kind, "/", &value)
    }

    /// Compile a schema node, reporting the first malformed keyword
    fn from_value(kind: SchemaKind, path: &str, value: &Value) -> Result<Self, SchemaError> {
        let invalid = |at: &str, reason: &str| SchemaError::Invalid {
            kind,
            path: at.to_string(),
            reason: reason.to_string(),
        };

        let Value::Object(node) = value else {
            return Err(invalid(path, "schema must be an object"));
        };

        let mut schema = Schema {
            additional_properties: true,
            ..Schema::default()
        };

        if let Some(types) = node.get("type") {
            let at = child_path(path, "type");
            let names: Vec<&Value> = match types {
                Value::Array(list) => list.iter().collect(),
                other => vec![other],
            };
            let parsed = names
                .into_iter()
                .map(|name| name.as_str().and_then(JsonType::parse))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| invalid(&at, "unknown type name"))?;
            schema.types = Some(parsed);
        }

        if let Some(required) = node.get("required") {
            let at = child_path(path, "required");
            schema.required = required
                .as_array()
                .and_then(|list| {
                    list.iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                })
                .ok_or_else(|| invalid(&at, "must be an array of strings"))?;
        }

        if let Some(properties) = node.get("properties") {
            let at = child_path(path, "properties");
            let properties = properties
                .as_object()
                .ok_or_else(|| invalid(&at, "must be an object"))?;
            for (name, sub) in properties {
                let sub_path = child_path(&at, name);
                schema
                    .properties
                    .insert(name.clone(), Self::from_value(kind, &sub_path, sub)?);
            }
        }

        if let Some(additional) = node.get("additionalProperties") {
            schema.additional_properties = additional.as_bool().ok_or_else(|| {
                invalid(
                    &child_path(path, "additionalProperties"),
                    "only the boolean form is supported",
                )
            })?;
        }

        if let Some(values) = node.get("enum") {
            let values = values
                .as_array()
                .filter(|list| !list.is_empty())
                .ok_or_else(|| invalid(&child_path(path, "enum"), "must be a non-empty array"))?;
            schema.enum_values = Some(values.clone());
        }

        schema.min_length = Self::length_keyword(node, "minLength", path, &invalid)?;
        schema.max_length = Self::length_keyword(node, "maxLength", path, &invalid)?;
        schema.minimum = Self::bound_keyword(node, "minimum", path, &invalid)?;
        schema.maximum = Self::bound_keyword(node, "maximum", path, &invalid)?;

        if let Some(format) = node.get("format") {
            let name = format
                .as_str()
                .ok_or_else(|| invalid(&child_path(path, "format"), "must be a string"))?;
            schema.format = Format::parse(name);
        }

        Ok(schema)
    }

    fn length_keyword(
        node: &Map<String, Value>,
        key: &str,
        path: &str,
        invalid: &impl Fn(&str, &str) -> SchemaError,
    ) -> Result<Option<u64>, SchemaError> {
        node.get(key)
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| invalid(&child_path(path, key), "must be a non-negative integer"))
            })
            .transpose()
    }

    fn bound_keyword(
        node: &Map<String, Value>,
        key: &str,
        path: &str,
        invalid: &impl Fn(&str, &str) -> SchemaError,
    ) -> Result<Option<f64>, SchemaError> {
        node.get(key)
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| invalid(&child_path(path, key), "must be a number"))
            })
            .transpose()
    }

    /// Validate `candidate`, returning the first violation
    pub fn validate(&self, candidate: &Value) -> Result<(), ValidationError> {
        self.validate_at("/", candidate)
    }

    fn validate_at(&self, path: &str, value: &Value) -> Result<(), ValidationError> {
        if let Some(types) = &self.types {
            if !types.iter().any(|t| t.matches(value)) {
                let names: Vec<&str> = types.iter().map(|t| t.name()).collect();
                return Err(ValidationError::new(
                    path,
                    format!("is not of type \"{}\"", names.join("\", \"")),
                ));
            }
        }

        if let Some(allowed) = &self.enum_values {
            if !allowed.contains(value) {
                return Err(ValidationError::new(
                    path,
                    format!("is not one of {}", Value::Array(allowed.clone())),
                ));
            }
        }

        if let Value::String(s) = value {
            let len = s.chars().count() as u64;
            if let Some(min) = self.min_length.filter(|min| len < *min) {
                return Err(ValidationError::new(
                    path,
                    format!("is shorter than {} characters", min),
                ));
            }
            if let Some(max) = self.max_length.filter(|max| len > *max) {
                return Err(ValidationError::new(
                    path,
                    format!("is longer than {} characters", max),
                ));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum.filter(|min| n < *min) {
                return Err(ValidationError::new(
                    path,
                    format!("is less than the minimum of {}", min),
                ));
            }
            if let Some(max) = self.maximum.filter(|max| n > *max) {
                return Err(ValidationError::new(
                    path,
                    format!("is greater than the maximum of {}", max),
                ));
            }
        }

        if let Some(reason) = self.format.and_then(|f| f.check(value)) {
            return Err(ValidationError::new(path, reason));
        }

        if let Value::Object(fields) = value {
            for name in &self.required {
                if !fields.contains_key(name) {
                    return Err(ValidationError::new(
                        child_path(path, name),
                        "is a required property",
                    ));
                }
            }

            for (name, field) in fields {
                match self.properties.get(name) {
                    Some(sub) => sub.validate_at(&child_path(path, name), field)?,
                    None if !self.additional_properties => {
                        return Err(ValidationError::new(
                            child_path(path, name),
                            "additional properties are not allowed",
                        ));
                    }
                    None => {}
                }
            }
        }

        Ok(())
    }
}

/// The schemas for every schema-carrying message kind
///
/// Construction fails unless both are present and well-formed.
#[derive(Debug, Clone)]
pub struct SchemaSet {
    presence: Schema,
    chat: Schema,
}

impl SchemaSet {
    /// The schemas compiled into the binary
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::load(None, None)
    }

    /// Load schemas from files, falling back to the built-in ones
    pub fn load(presence: Option<&Path>, chat: Option<&Path>) -> Result<Self, SchemaError> {
        Ok(Self {
            presence: Self::load_one(SchemaKind::Presence, presence)?,
            chat: Self::load_one(SchemaKind::Chat, chat)?,
        })
    }

    fn load_one(kind: SchemaKind, path: Option<&Path>) -> Result<Schema, SchemaError> {
        match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| SchemaError::Read {
                    kind,
                    path: path.to_path_buf(),
                    source,
                })?;
                Schema::parse(kind, &text)
            }
            None => Schema::parse(kind, kind.builtin()),
        }
    }

    pub fn get(&self, kind: SchemaKind) -> &Schema {
        match kind {
            SchemaKind::Presence => &self.presence,
            SchemaKind::Chat => &self.chat,
        }
    }

    /// Validate `candidate` against the schema for `kind`
    pub fn validate(&self, kind: SchemaKind, candidate: &Value) -> Result<(), ValidationError> {
        self.get(kind).validate(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schemas() -> SchemaSet {
        SchemaSet::builtin().unwrap()
    }

    #[test]
    fn test_builtin_schemas_load() {
        let set = schemas();
        assert!(set.get(SchemaKind::Presence).required.contains(&"user".to_string()));
        assert!(set.get(SchemaKind::Chat).required.contains(&"message".to_string()));
    }

    #[test]
    fn test_valid_presence() {
        let presence = json!({
            "action": "presence",
            "time": 1_700_000_000.5,
            "type": "status",
            "user": {"account_name": "alice", "status": "hi"}
        });
        assert!(schemas().validate(SchemaKind::Presence, &presence).is_ok());
    }

    #[test]
    fn test_minimal_presence() {
        let presence = json!({"action": "presence", "user": {"account_name": "alice", "status": "hi"}});
        assert!(schemas().validate(SchemaKind::Presence, &presence).is_ok());
    }

    #[test]
    fn test_missing_nested_field() {
        let presence = json!({"action": "presence", "user": {"status": "hi"}});
        let err = schemas()
            .validate(SchemaKind::Presence, &presence)
            .unwrap_err();
        assert_eq!(err.path, "/user/account_name");
        assert_eq!(err.reason, "is a required property");
    }

    #[test]
    fn test_wrong_type() {
        let msg = json!({"action": "msg", "to": "bob", "from": "alice", "message": 42});
        let err = schemas().validate(SchemaKind::Chat, &msg).unwrap_err();
        assert_eq!(err.path, "/message");
        assert_eq!(err.reason, "is not of type \"string\"");
    }

    #[test]
    fn test_enum_violation() {
        let msg = json!({"action": "presence", "to": "bob", "from": "alice", "message": "hi"});
        let err = schemas().validate(SchemaKind::Chat, &msg).unwrap_err();
        assert_eq!(err.path, "/action");
        assert!(err.reason.starts_with("is not one of"));
    }

    #[test]
    fn test_first_error_wins() {
        // Both "to" and "from" are missing; only the first required one is reported
        let msg = json!({"action": "msg", "message": "hi"});
        let err = schemas().validate(SchemaKind::Chat, &msg).unwrap_err();
        assert_eq!(err.path, "/to");
    }

    #[test]
    fn test_root_type() {
        let err = schemas()
            .validate(SchemaKind::Chat, &json!(["msg"]))
            .unwrap_err();
        assert_eq!(err.path, "/");
    }

    #[test]
    fn test_length_bounds() {
        let presence = json!({"action": "presence", "user": {"account_name": ""}});
        let err = schemas()
            .validate(SchemaKind::Presence, &presence)
            .unwrap_err();
        assert_eq!(err.path, "/user/account_name");
        assert_eq!(err.reason, "is shorter than 1 characters");
    }

    #[test]
    fn test_unix_time_format() {
        let msg = json!({"action": "msg", "time": -3, "to": "b", "from": "a", "message": "m"});
        let err = schemas().validate(SchemaKind::Chat, &msg).unwrap_err();
        assert_eq!(err.path, "/time");
    }

    #[test]
    fn test_date_time_format() {
        let schema = Schema::parse(
            SchemaKind::Chat,
            r#"{"type": "string", "format": "date-time"}"#,
        )
        .unwrap();
        assert!(schema.validate(&json!("2024-05-01T10:00:00Z")).is_ok());
        assert!(schema.validate(&json!("yesterday")).is_err());
        // format does not constrain other types
        assert!(Schema::parse(SchemaKind::Chat, r#"{"format": "date-time"}"#)
            .unwrap()
            .validate(&json!(5))
            .is_ok());
    }

    #[test]
    fn test_integer_and_bounds() {
        let schema = Schema::parse(
            SchemaKind::Chat,
            r#"{"type": "integer", "minimum": 1, "maximum": 10}"#,
        )
        .unwrap();
        assert!(schema.validate(&json!(3)).is_ok());
        assert!(schema.validate(&json!(3.0)).is_ok());
        assert!(schema.validate(&json!(3.5)).is_err());
        assert!(schema.validate(&json!(0)).is_err());
        assert!(schema.validate(&json!(11)).is_err());
    }

    #[test]
    fn test_type_list() {
        let schema =
            Schema::parse(SchemaKind::Chat, r#"{"type": ["string", "null"]}"#).unwrap();
        assert!(schema.validate(&json!(null)).is_ok());
        assert!(schema.validate(&json!("x")).is_ok());
        let err = schema.validate(&json!(1)).unwrap_err();
        assert_eq!(err.reason, "is not of type \"string\", \"null\"");
    }

    #[test]
    fn test_additional_properties_false() {
        let schema = Schema::parse(
            SchemaKind::Chat,
            r#"{"type": "object", "properties": {"a": {}}, "additionalProperties": false}"#,
        )
        .unwrap();
        assert!(schema.validate(&json!({"a": 1})).is_ok());
        let err = schema.validate(&json!({"a": 1, "b": 2})).unwrap_err();
        assert_eq!(err.path, "/b");
    }

    #[test]
    fn test_unknown_keywords_ignored() {
        let schema =
            Schema::parse(SchemaKind::Chat, r#"{"type": "string", "pattern": "^a"}"#).unwrap();
        assert!(schema.validate(&json!("b")).is_ok());
    }

    #[test]
    fn test_malformed_schema_rejected() {
        let err = Schema::parse(SchemaKind::Presence, r#"{"type": "text"}"#).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { ref path, .. } if path == "/type"));

        let err = Schema::parse(
            SchemaKind::Presence,
            r#"{"properties": {"user": {"required": "account_name"}}}"#,
        )
        .unwrap_err();
        assert!(
            matches!(err, SchemaError::Invalid { ref path, .. } if path == "/properties/user/required")
        );

        let err = Schema::parse(SchemaKind::Presence, "{").unwrap_err();
        assert!(matches!(err, SchemaError::Parse { .. }));
    }

    #[test]
    fn test_missing_schema_file() {
        let err = SchemaSet::load(Some(Path::new("/nonexistent/presence.json")), None)
            .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::Read {
                kind: SchemaKind::Presence,
                ..
            }
        ));
    }
}
