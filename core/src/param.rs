//! Typed configuration parameters.
//!
//! A parameter map is semantically a mapping from name to a *list* of typed
//! entries: duplicates are preserved in insertion order and never deduped.
//! The reader configuration relies on this (repeated `sax-handler`
//! entries), so [`ParameterMap`] is a plain vector with lookup helpers.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Declared value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamType {
    /// Plain text (the default when no `type` attribute is present).
    #[default]
    String,
    /// Signed integer.
    Int,
    /// Floating point.
    Float,
    /// Boolean (`true`/`false`).
    Bool,
}

impl FromStr for ParamType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "int" | "integer" => Ok(Self::Int),
            "float" | "double" => Ok(Self::Float),
            "bool" | "boolean" => Ok(Self::Bool),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A decoded parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Plain text.
    String(String),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Boolean.
    Bool(bool),
}

/// A single named parameter entry.
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Parameter name. Not unique within a map.
    pub name: String,
    /// Raw value text.
    pub value: String,
    /// Declared type; decoding happens on demand.
    pub param_type: ParamType,
}

impl Parameter {
    /// Create a string-typed parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            param_type: ParamType::String,
        }
    }

    /// Create a parameter with an explicit type.
    #[must_use]
    pub fn typed(name: impl Into<String>, value: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            param_type,
        }
    }

    /// Decode the raw value against the declared type.
    pub fn decode(&self) -> Result<ParamValue, ConfigError> {
        let fail = || ConfigError::ParamDecode {
            name: self.name.clone(),
            value: self.value.clone(),
            param_type: self.param_type.to_string(),
        };
        match self.param_type {
            ParamType::String => Ok(ParamValue::String(self.value.clone())),
            ParamType::Int => self
                .value
                .trim()
                .parse()
                .map(ParamValue::Int)
                .map_err(|_| fail()),
            ParamType::Float => self
                .value
                .trim()
                .parse()
                .map(ParamValue::Float)
                .map_err(|_| fail()),
            ParamType::Bool => match self.value.trim() {
                "true" => Ok(ParamValue::Bool(true)),
                "false" => Ok(ParamValue::Bool(false)),
                _ => Err(fail()),
            },
        }
    }
}

/// Insertion-ordered, duplicate-preserving parameter container.
#[derive(Debug, Clone, Default)]
pub struct ParameterMap {
    params: Vec<Parameter>,
}

impl ParameterMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string parameter. Existing entries with the same name are
    /// kept; the new entry goes last.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.push(Parameter::new(name, value));
    }

    /// Append a typed parameter.
    pub fn set_typed(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        param_type: ParamType,
    ) {
        self.params.push(Parameter::typed(name, value, param_type));
    }

    /// The first entry with the given name, if any.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    /// All entries with the given name, in insertion order.
    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Parameter> {
        self.params.iter().filter(move |p| p.name == name)
    }

    /// All entries, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Number of entries (duplicates counted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Merge another map's entries after this one's.
    pub fn extend_from(&mut self, other: &ParameterMap) {
        self.params.extend(other.params.iter().cloned());
    }

    /// Decode the first entry with the given name as an integer, falling
    /// back to `default` when absent.
    pub fn int(&self, name: &str, default: i64) -> Result<i64, ConfigError> {
        match self.first(name) {
            None => Ok(default),
            Some(param) => {
                let decoded = Parameter::typed(&param.name, &param.value, ParamType::Int).decode()?;
                match decoded {
                    ParamValue::Int(v) => Ok(v),
                    _ => unreachable!("int decode produced a non-int"),
                }
            }
        }
    }
}

impl<'a> IntoIterator for &'a ParameterMap {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_preserved_in_insertion_order() {
        let mut params = ParameterMap::new();
        params.set("sax-handler", "first.Handler");
        params.set("sax-handler", "second.Handler");
        params.set("other", "x");
        params.set("sax-handler", "third.Handler");

        let handlers: Vec<&str> = params.all("sax-handler").map(|p| p.value.as_str()).collect();
        assert_eq!(handlers, ["first.Handler", "second.Handler", "third.Handler"]);
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn typed_decode() {
        assert_eq!(
            Parameter::typed("n", "42", ParamType::Int).decode().unwrap(),
            ParamValue::Int(42)
        );
        assert_eq!(
            Parameter::typed("b", "true", ParamType::Bool).decode().unwrap(),
            ParamValue::Bool(true)
        );
        let err = Parameter::typed("n", "forty-two", ParamType::Int)
            .decode()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParamDecode { .. }));
    }

    #[test]
    fn int_helper_defaults_when_absent() {
        let mut params = ParameterMap::new();
        assert_eq!(params.int("reader-pool-size", 1).unwrap(), 1);
        params.set("reader-pool-size", "8");
        assert_eq!(params.int("reader-pool-size", 1).unwrap(), 8);
    }
}
