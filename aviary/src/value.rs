//! Free-form values passed between configuration, requests, resources and
//! transactions.
//!
//! The framework core never interprets payload data; it only moves it
//! around, derives cache keys from it and expands configuration macros
//! through it, so a single self-describing enum is enough.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use faststr::FastStr;
use linked_hash_map::LinkedHashMap;

use crate::error::{Error, Result};

/// An ordered (insertion-order) string-keyed map of values.
pub type ValueMap = LinkedHashMap<FastStr, Value>;

#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(FastStr),
    Bytes(Bytes),
    Seq(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    pub fn str(s: impl Into<FastStr>) -> Value {
        Value::Str(s.into())
    }

    pub fn bytes(b: impl Into<Bytes>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Seq(_) => "seq",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Mapping member lookup; `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Seconds expressed as an integer or float, as config files carry them.
    pub fn as_duration(&self) -> Option<std::time::Duration> {
        let secs = self.as_float()?;
        if secs >= 0.0 && secs.is_finite() {
            Some(std::time::Duration::from_secs_f64(secs))
        } else {
            None
        }
    }

    /// Writes a deterministic textual encoding of the value, independent of
    /// map insertion order. Used to derive result-cache keys.
    pub fn write_canonical(&self, out: &mut String) {
        use std::fmt::Write;
        match self {
            Value::Null => out.push('~'),
            Value::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Value::Int(i) => {
                let _ = write!(out, "i{i}");
            }
            Value::Float(f) => {
                let _ = write!(out, "f{f:?}");
            }
            Value::Str(s) => {
                let _ = write!(out, "s{}:{s}", s.len());
            }
            Value::Bytes(b) => {
                let _ = write!(out, "b{}:", b.len());
                for byte in b.iter() {
                    let _ = write!(out, "{byte:02x}");
                }
            }
            Value::Seq(items) => {
                out.push('[');
                for item in items {
                    item.write_canonical(out);
                    out.push(',');
                }
                out.push(']');
            }
            Value::Map(map) => {
                let mut keys: Vec<&FastStr> = map.keys().collect();
                keys.sort_unstable_by(|a, b| a.as_str().cmp(b.as_str()));
                out.push('{');
                for key in keys {
                    let _ = write!(out, "s{}:{key}=", key.len());
                    map[key].write_canonical(out);
                    out.push(',');
                }
                out.push('}');
            }
        }
    }

    pub fn canonical(&self) -> FastStr {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out.into()
    }

    /// Converts a parsed YAML document into a `Value`.
    ///
    /// Mapping keys must be strings. A `!binary` (or `!bytes`) tagged scalar
    /// holding base64 text becomes `Value::Bytes`; any other tag is
    /// transparent.
    pub fn from_yaml(yaml: serde_yaml::Value) -> Result<Value> {
        Ok(match yaml {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(b),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    return Err(Error::config(format!("unrepresentable number {n}")));
                }
            }
            serde_yaml::Value::String(s) => Value::Str(s.into()),
            serde_yaml::Value::Sequence(items) => Value::Seq(
                items
                    .into_iter()
                    .map(Value::from_yaml)
                    .collect::<Result<_>>()?,
            ),
            serde_yaml::Value::Mapping(mapping) => {
                let mut map = ValueMap::new();
                for (key, value) in mapping {
                    let key = match key {
                        serde_yaml::Value::String(s) => FastStr::from(s),
                        other => {
                            return Err(Error::config(format!(
                                "mapping key must be a string, got {other:?}"
                            )))
                        }
                    };
                    map.insert(key, Value::from_yaml(value)?);
                }
                Value::Map(map)
            }
            serde_yaml::Value::Tagged(tagged) => {
                let tag = tagged.tag.to_string();
                let tag = tag.trim_start_matches('!');
                match (tag, tagged.value) {
                    ("binary" | "bytes", serde_yaml::Value::String(s)) => {
                        let compact: String = s.split_whitespace().collect();
                        let bytes = BASE64.decode(compact.as_bytes()).map_err(|e| {
                            Error::config(format!("invalid base64 in !{tag} scalar: {e}"))
                        })?;
                        Value::Bytes(bytes.into())
                    }
                    (_, inner) => Value::from_yaml(inner)?,
                }
            }
        })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(FastStr::new(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v.into())
    }
}

impl From<FastStr> for Value {
    fn from(v: FastStr) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Seq(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}

/// Builds a `ValueMap` from `key => value` pairs.
#[macro_export]
macro_rules! value_map {
    () => { $crate::value::ValueMap::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::value::ValueMap::new();
        $(map.insert($crate::FastStr::from($key), $crate::Value::from($value));)+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_scalars() {
        let v = Value::from_yaml(serde_yaml::from_str("123").unwrap()).unwrap();
        assert_eq!(v, Value::Int(123));
        let v = Value::from_yaml(serde_yaml::from_str("1.5").unwrap()).unwrap();
        assert_eq!(v, Value::Float(1.5));
        let v = Value::from_yaml(serde_yaml::from_str("\"foo\"").unwrap()).unwrap();
        assert_eq!(v.as_str(), Some("foo"));
        let v = Value::from_yaml(serde_yaml::from_str("~").unwrap()).unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn yaml_binary_tag() {
        let v = Value::from_yaml(serde_yaml::from_str("!binary AA==").unwrap()).unwrap();
        assert_eq!(v, Value::Bytes(Bytes::from_static(b"\x00")));
    }

    #[test]
    fn yaml_nested() {
        let v = Value::from_yaml(serde_yaml::from_str("a: [1, {b: x}]").unwrap()).unwrap();
        let seq = v.get("a").and_then(Value::as_seq).unwrap();
        assert_eq!(seq[0], Value::Int(1));
        assert_eq!(seq[1].get("b").and_then(Value::as_str), Some("x"));
    }

    #[test]
    fn yaml_rejects_non_string_keys() {
        assert!(Value::from_yaml(serde_yaml::from_str("1: x").unwrap()).is_err());
    }

    #[test]
    fn canonical_ignores_map_order() {
        let a = Value::Map(value_map! { "x" => 1, "y" => 2 });
        let b = Value::Map(value_map! { "y" => 2, "x" => 1 });
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn canonical_distinguishes_kinds() {
        assert_ne!(Value::Int(1).canonical(), Value::from("1").canonical());
        assert_ne!(
            Value::from("ab").canonical(),
            Value::Seq(vec!["a".into(), "b".into()]).canonical()
        );
    }

    #[test]
    fn duration_view() {
        assert_eq!(
            Value::Float(1.5).as_duration(),
            Some(std::time::Duration::from_millis(1500))
        );
        assert_eq!(
            Value::Int(2).as_duration(),
            Some(std::time::Duration::from_secs(2))
        );
        assert_eq!(Value::Float(-1.0).as_duration(), None);
    }
}
