//! Machine-checkable module configuration schemas.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Type of one configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Float {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Boolean,
    Object,
    Array,
    Enum { values: Vec<String> },
}

impl FieldKind {
    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer { .. } => "integer",
            Self::Float { .. } => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Enum { .. } => "enum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ConfigField {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            description: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer { min: None, max: None })
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float { min: None, max: None })
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Object)
    }

    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Array)
    }

    pub fn enumeration<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            FieldKind::Enum {
                values: values.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Inclusive bounds; applies to integer and float fields.
    pub fn bounds(mut self, min: i64, max: i64) -> Self {
        match &mut self.kind {
            FieldKind::Integer { min: lo, max: hi } => {
                *lo = Some(min);
                *hi = Some(max);
            }
            FieldKind::Float { min: lo, max: hi } => {
                *lo = Some(min as f64);
                *hi = Some(max as f64);
            }
            _ => {}
        }
        self
    }

    fn check(&self, value: &Value) -> Result<(), SchemaError> {
        let wrong_type = || SchemaError::WrongType {
            field: self.name.clone(),
            expected: self.kind.name(),
        };
        let out_of_range = || SchemaError::OutOfRange {
            field: self.name.clone(),
            value: value.to_string(),
        };
        match &self.kind {
            FieldKind::String if value.is_string() => Ok(()),
            FieldKind::Integer { min, max } => {
                let n = value.as_i64().ok_or_else(wrong_type)?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(out_of_range());
                }
                Ok(())
            }
            FieldKind::Float { min, max } => {
                let n = value.as_f64().ok_or_else(wrong_type)?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(out_of_range());
                }
                Ok(())
            }
            FieldKind::Boolean if value.is_boolean() => Ok(()),
            FieldKind::Object if value.is_object() => Ok(()),
            FieldKind::Array if value.is_array() => Ok(()),
            FieldKind::Enum { values } => {
                let s = value.as_str().ok_or_else(wrong_type)?;
                if values.iter().any(|v| v == s) {
                    Ok(())
                } else {
                    Err(SchemaError::NotInEnum {
                        field: self.name.clone(),
                        value: s.to_string(),
                    })
                }
            }
            _ => Err(wrong_type()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("configuration must be an object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("field `{field}` must be of type {expected}")]
    WrongType { field: String, expected: &'static str },
    #[error("field `{field}` is out of range: {value}")]
    OutOfRange { field: String, value: String },
    #[error("field `{field}` has unsupported value `{value}`")]
    NotInEnum { field: String, value: String },
    #[error("unknown field `{0}`")]
    UnknownField(String),
}

/// Declared configuration shape of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub fields: Vec<ConfigField>,
    /// Accept fields not listed in `fields`.
    #[serde(default)]
    pub allow_unknown: bool,
}

impl Default for ConfigSchema {
    fn default() -> Self {
        Self::any()
    }
}

impl ConfigSchema {
    /// A strict schema with no fields yet.
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            allow_unknown: false,
        }
    }

    /// Accepts any value.
    pub fn any() -> Self {
        Self {
            fields: Vec::new(),
            allow_unknown: true,
        }
    }

    pub fn field(mut self, field: ConfigField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    fn is_any(&self) -> bool {
        self.fields.is_empty() && self.allow_unknown
    }

    pub fn validate(&self, config: &Value) -> Result<(), SchemaError> {
        self.normalize(config).map(|_| ())
    }

    /// Validate and fill in defaults. `null` counts as an empty object.
    pub fn normalize(&self, config: &Value) -> Result<Value, SchemaError> {
        if self.is_any() {
            return Ok(config.clone());
        }
        let empty = Map::new();
        let object = match config {
            Value::Null => &empty,
            Value::Object(map) => map,
            _ => return Err(SchemaError::NotAnObject),
        };

        if !self.allow_unknown {
            if let Some(unknown) = object
                .keys()
                .find(|k| !self.fields.iter().any(|f| &f.name == *k))
            {
                return Err(SchemaError::UnknownField(unknown.clone()));
            }
        }

        let mut normalized = object.clone();
        for field in &self.fields {
            match object.get(&field.name) {
                Some(value) => field.check(value)?,
                None => match &field.default {
                    Some(default) => {
                        normalized.insert(field.name.clone(), default.clone());
                    }
                    None if field.required => {
                        return Err(SchemaError::MissingField(field.name.clone()));
                    }
                    None => {}
                },
            }
        }
        Ok(Value::Object(normalized))
    }

    /// JSON Schema rendering for admin tooling.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let mut prop = match &field.kind {
                FieldKind::Integer { min, max } => {
                    json!({ "type": "integer", "minimum": min, "maximum": max })
                }
                FieldKind::Float { min, max } => {
                    json!({ "type": "number", "minimum": min, "maximum": max })
                }
                FieldKind::Enum { values } => json!({ "type": "string", "enum": values }),
                other => json!({ "type": other.name() }),
            };
            if let Some(obj) = prop.as_object_mut() {
                obj.retain(|_, v| !v.is_null());
                if let Some(default) = &field.default {
                    obj.insert("default".into(), default.clone());
                }
                if let Some(description) = &field.description {
                    obj.insert("description".into(), json!(description));
                }
            }
            properties.insert(field.name.clone(), prop);
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": self.allow_unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ConfigSchema {
        ConfigSchema::new()
            .field(ConfigField::string("endpoint").required())
            .field(ConfigField::integer("retention_days").bounds(1, 365).default_value(json!(30)))
            .field(ConfigField::enumeration("mode", ["batch", "stream"]))
            .field(ConfigField::boolean("verbose"))
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let normalized = schema()
            .normalize(&json!({"endpoint": "https://collector", "mode": "batch"}))
            .unwrap();
        assert_eq!(normalized["retention_days"], json!(30));
        assert_eq!(normalized["mode"], json!("batch"));
    }

    #[test]
    fn test_rejects_invalid_configs() {
        let s = schema();
        assert_eq!(
            s.validate(&json!({})),
            Err(SchemaError::MissingField("endpoint".into()))
        );
        assert!(matches!(
            s.validate(&json!({"endpoint": 5})),
            Err(SchemaError::WrongType { expected: "string", .. })
        ));
        assert!(matches!(
            s.validate(&json!({"endpoint": "x", "retention_days": 0})),
            Err(SchemaError::OutOfRange { .. })
        ));
        assert!(matches!(
            s.validate(&json!({"endpoint": "x", "mode": "live"})),
            Err(SchemaError::NotInEnum { .. })
        ));
        assert_eq!(
            s.validate(&json!({"endpoint": "x", "colour": "red"})),
            Err(SchemaError::UnknownField("colour".into()))
        );
        assert_eq!(s.validate(&json!([1])), Err(SchemaError::NotAnObject));
    }

    #[test]
    fn test_any_schema_accepts_everything() {
        let any = ConfigSchema::any();
        assert!(any.validate(&json!(null)).is_ok());
        assert!(any.validate(&json!([1, 2])).is_ok());
        assert_eq!(any.normalize(&json!({"a": 1})).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_null_is_empty_object() {
        let s = ConfigSchema::new().field(ConfigField::integer("n").default_value(json!(1)));
        assert_eq!(s.normalize(&Value::Null).unwrap(), json!({"n": 1}));
    }

    #[test]
    fn test_json_schema_rendering() {
        let rendered = schema().to_json_schema();
        assert_eq!(rendered["required"], json!(["endpoint"]));
        assert_eq!(rendered["properties"]["retention_days"]["minimum"], json!(1));
        assert_eq!(rendered["properties"]["mode"]["enum"], json!(["batch", "stream"]));
        assert_eq!(rendered["additionalProperties"], json!(false));
        assert!(rendered["properties"]["verbose"].get("minimum").is_none());
    }
}
