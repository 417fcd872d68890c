//! Typed variable values.
//!
//! Runbook variables and plugin parameters carry one of six declared types.
//! Values arrive as strings (CLI overrides, environment, rendered templates)
//! and are coerced against the declared type; values from structured sources
//! (variables files, spec defaults) are already typed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The declared type of a variable or plugin parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    String,
    Int,
    Float,
    Bool,
    List,
    Dict,
}

impl VarType {
    /// Returns the type name as it appears in runbook files.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Dict => "dict",
        }
    }

    /// Parses a type name from a runbook file.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" | "str" => Some(Self::String),
            "int" | "integer" => Some(Self::Int),
            "float" => Some(Self::Float),
            "bool" | "boolean" => Some(Self::Bool),
            "list" => Some(Self::List),
            "dict" => Some(Self::Dict),
            _ => None,
        }
    }

    /// Coerces a string input to this type.
    ///
    /// Rules:
    /// - `bool`: "true"/"false"/"1"/"0"/"yes"/"no" (case-insensitive)
    /// - `int`: decimal digits with optional sign
    /// - `float`: decimal number, fractional part allowed
    /// - `list`/`dict`: JSON-looking strings are parsed as JSON
    /// - `string`: identity
    ///
    /// # Errors
    ///
    /// Returns a `CoerceError` when the input does not match the declared type.
    pub fn coerce(&self, raw: &str) -> Result<VarValue, CoerceError> {
        let fail = || CoerceError {
            value: raw.to_string(),
            expected: *self,
        };
        match self {
            Self::String => Ok(VarValue::Str(raw.to_string())),
            Self::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(VarValue::Bool(true)),
                "false" | "0" | "no" => Ok(VarValue::Bool(false)),
                _ => Err(fail()),
            },
            Self::Int => raw.trim().parse::<i64>().map(VarValue::Int).map_err(|_| fail()),
            Self::Float => raw
                .trim()
                .parse::<f64>()
                .map(VarValue::Float)
                .map_err(|_| fail()),
            Self::List => {
                let trimmed = raw.trim();
                if !trimmed.starts_with('[') {
                    return Err(fail());
                }
                let json: serde_json::Value = serde_json::from_str(trimmed).map_err(|_| fail())?;
                match VarValue::from_json(json) {
                    VarValue::List(items) => Ok(VarValue::List(items)),
                    _ => Err(fail()),
                }
            }
            Self::Dict => {
                let trimmed = raw.trim();
                if !trimmed.starts_with('{') {
                    return Err(fail());
                }
                let json: serde_json::Value = serde_json::from_str(trimmed).map_err(|_| fail())?;
                match VarValue::from_json(json) {
                    VarValue::Dict(map) => Ok(VarValue::Dict(map)),
                    _ => Err(fail()),
                }
            }
        }
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<VarValue>),
    Dict(BTreeMap<String, VarValue>),
}

impl VarValue {
    /// Returns the type of this value.
    #[must_use]
    pub fn type_of(&self) -> VarType {
        match self {
            Self::Str(_) => VarType::String,
            Self::Int(_) => VarType::Int,
            Self::Float(_) => VarType::Float,
            Self::Bool(_) => VarType::Bool,
            Self::List(_) => VarType::List,
            Self::Dict(_) => VarType::Dict,
        }
    }

    /// Converts a JSON value into a variable value.
    ///
    /// JSON `null` becomes the empty string; there is no null variable.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Str(String::new()),
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Dict(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts this value into JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Int(i) => serde_json::Value::Number((*i).into()),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Dict(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Returns the numeric magnitude for range checks, if this is a number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for VarValue {
    /// Scalars render plainly; lists and dicts render as JSON.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::List(_) | Self::Dict(_) => write!(f, "{}", self.to_json()),
        }
    }
}

/// Error returned when a string input cannot be coerced to a declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoerceError {
    /// The input that failed to coerce.
    pub value: String,
    /// The declared type it was coerced against.
    pub expected: VarType,
}

impl fmt::Display for CoerceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot coerce '{}' to {}", self.value, self.expected)
    }
}

impl std::error::Error for CoerceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_coercion_accepts_all_spellings() {
        for raw in ["true", "True", "1", "yes", "YES"] {
            assert_eq!(VarType::Bool.coerce(raw).unwrap(), VarValue::Bool(true));
        }
        for raw in ["false", "0", "no", "No"] {
            assert_eq!(VarType::Bool.coerce(raw).unwrap(), VarValue::Bool(false));
        }
        assert!(VarType::Bool.coerce("maybe").is_err());
    }

    #[test]
    fn int_coercion() {
        assert_eq!(VarType::Int.coerce("42").unwrap(), VarValue::Int(42));
        assert_eq!(VarType::Int.coerce("-7").unwrap(), VarValue::Int(-7));
        assert!(VarType::Int.coerce("4.2").is_err());
        assert!(VarType::Int.coerce("abc").is_err());
    }

    #[test]
    fn float_coercion() {
        assert_eq!(VarType::Float.coerce("4.25").unwrap(), VarValue::Float(4.25));
        assert_eq!(VarType::Float.coerce("3").unwrap(), VarValue::Float(3.0));
        assert!(VarType::Float.coerce("x").is_err());
    }

    #[test]
    fn list_coercion_requires_json() {
        let value = VarType::List.coerce(r#"["a", "b"]"#).unwrap();
        assert_eq!(
            value,
            VarValue::List(vec![
                VarValue::Str("a".to_string()),
                VarValue::Str("b".to_string())
            ])
        );
        assert!(VarType::List.coerce("a, b").is_err());
        assert!(VarType::List.coerce(r#"{"a": 1}"#).is_err());
    }

    #[test]
    fn dict_coercion_requires_json() {
        let value = VarType::Dict.coerce(r#"{"region": "eu", "count": 3}"#).unwrap();
        let VarValue::Dict(map) = value else {
            panic!("expected dict");
        };
        assert_eq!(map.get("region"), Some(&VarValue::Str("eu".to_string())));
        assert_eq!(map.get("count"), Some(&VarValue::Int(3)));
        assert!(VarType::Dict.coerce("region=eu").is_err());
    }

    #[test]
    fn string_coercion_is_identity() {
        assert_eq!(
            VarType::String.coerce("4.2").unwrap(),
            VarValue::Str("4.2".to_string())
        );
    }

    #[test]
    fn coercion_round_trips_through_display() {
        for (ty, value) in [
            (VarType::Int, VarValue::Int(17)),
            (VarType::Float, VarValue::Float(2.5)),
            (VarType::Bool, VarValue::Bool(true)),
            (
                VarType::List,
                VarValue::List(vec![VarValue::Int(1), VarValue::Int(2)]),
            ),
        ] {
            let rendered = value.to_string();
            assert_eq!(ty.coerce(&rendered).unwrap(), value);
        }
    }

    #[test]
    fn json_round_trip() {
        let value = VarValue::Dict(
            [
                ("name".to_string(), VarValue::Str("deploy".to_string())),
                ("count".to_string(), VarValue::Int(2)),
                (
                    "hosts".to_string(),
                    VarValue::List(vec![VarValue::Str("a".to_string())]),
                ),
            ]
            .into_iter()
            .collect(),
        );
        let json = value.to_json();
        assert_eq!(VarValue::from_json(json), value);
    }

    #[test]
    fn type_parse_aliases() {
        assert_eq!(VarType::parse("integer"), Some(VarType::Int));
        assert_eq!(VarType::parse("boolean"), Some(VarType::Bool));
        assert_eq!(VarType::parse("str"), Some(VarType::String));
        assert_eq!(VarType::parse("tuple"), None);
    }

    #[test]
    fn serde_untagged_round_trip() {
        let value = VarValue::List(vec![
            VarValue::Int(1),
            VarValue::Str("two".to_string()),
            VarValue::Bool(false),
        ]);
        let json = serde_json::to_string(&value).expect("serialize");
        let parsed: VarValue = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(value, parsed);
    }
}
