//! The dynamic value sum type circulated below the event-ingress boundary.
//!
//! Wire-level dynamic values (JSON `any`) are confined to the event builder;
//! everything below it works with [`Value`]. The hand-written serde
//! implementations double as the codec's normalization pass: every integer
//! width collapses to `i64` and every float width to `f64` on deserialize.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Character string.
    String(String),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Interned factor index. Only produced by the event builder between
    /// factorization and encoding; encodes as a plain integer on disk.
    FactorIndex(u64),
}

impl Value {
    /// Returns the string contents if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer contents if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::String(v) => serializer.serialize_str(v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::FactorIndex(v) => serializer.serialize_u64(*v),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string, integer, float, or boolean")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        // Sign-collapsing promotion: unsigned widths fold into i64.
        Ok(Value::Int(v as i64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        // Raw byte blobs decode as strings; string columns tolerate
        // non-UTF-8 bytes via lossy conversion.
        Ok(Value::String(String::from_utf8_lossy(v).into_owned()))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths_normalize() {
        // Narrow integer widths on the wire all come back as Int.
        let v: Value = serde_json::from_str("42").unwrap();
        assert_eq!(v, Value::Int(42));
        let v: Value = serde_json::from_str("-7").unwrap();
        assert_eq!(v, Value::Int(-7));
    }

    #[test]
    fn test_float_normalizes() {
        let v: Value = serde_json::from_str("1.5").unwrap();
        assert_eq!(v, Value::Float(1.5));
    }

    #[test]
    fn test_string_and_bool() {
        let v: Value = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(v, Value::String("abc".to_string()));
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn test_factor_index_serializes_as_integer() {
        let json = serde_json::to_string(&Value::FactorIndex(3)).unwrap();
        assert_eq!(json, "3");
    }
}
