//! Schema property definitions.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{DataType, PropertyId};
use crate::validation::validate_property_name;
use crate::value::Value;

/// A single property in a table's schema.
///
/// The identifier is stable for the life of the table: renames preserve it
/// and deletes never free it for reuse. Serialization matches the on-disk
/// meta JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Stable identifier. Positive for permanent properties, negative for
    /// transient properties.
    pub id: PropertyId,
    /// Current bound name.
    pub name: String,
    /// Data type governing value casting and encoding.
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    /// Whether the property is transient. Transient properties participate
    /// in storage identically to permanent ones; the distinction is
    /// application-defined.
    pub transient: bool,
}

impl Property {
    /// Checks that the property is valid: the name must be non-empty and
    /// contain only word characters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPropertyName`] on violation.
    pub fn validate(&self) -> Result<()> {
        validate_property_name(&self.name)?;
        Ok(())
    }

    /// Coerces a raw input value into the property's data type.
    ///
    /// Mismatched inputs fall back to the type's zero value: `""` for
    /// strings and factors, `0` for integers, `0.0` for floats, `false`
    /// for booleans. Numeric promotion is sign-preserving.
    pub fn cast(&self, value: Value) -> Value {
        match self.data_type {
            DataType::String | DataType::Factor => match value {
                Value::String(_) => value,
                _ => Value::String(String::new()),
            },
            DataType::Integer => match value {
                Value::Int(_) => value,
                Value::Float(v) => Value::Int(v as i64),
                _ => Value::Int(0),
            },
            DataType::Float => match value {
                Value::Float(_) => value,
                Value::Int(v) => Value::Float(v as f64),
                _ => Value::Float(0.0),
            },
            DataType::Boolean => match value {
                Value::Bool(_) => value,
                _ => Value::Bool(false),
            },
        }
    }
}

/// Convenience constructor used by tests and the schema builder.
impl Property {
    /// Creates an unvalidated property. Callers run [`Property::validate`]
    /// before binding it into a schema.
    pub fn new(
        id: PropertyId,
        name: impl Into<String>,
        data_type: DataType,
        transient: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            transient,
        }
    }

    /// Parses a property whose data type arrives as a wire string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDataType`] for unknown type names and
    /// [`Error::InvalidPropertyName`] for invalid names.
    pub fn parse(
        id: PropertyId,
        name: impl Into<String>,
        data_type: &str,
        transient: bool,
    ) -> Result<Self, Error> {
        let property = Self::new(id, name, DataType::parse(data_type)?, transient);
        property.validate()?;
        Ok(property)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_json_shape() {
        let p = Property::new(1, "lastName", DataType::Factor, false);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(
            json,
            r#"{"id":1,"name":"lastName","dataType":"factor","transient":false}"#
        );
        let back: Property = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_parse_from_wire_strings() {
        let p = Property::parse(-1, "count", "integer", true).unwrap();
        assert_eq!(p.data_type, DataType::Integer);
        assert!(p.transient);

        assert!(matches!(
            Property::parse(1, "count", "decimal", false),
            Err(Error::InvalidDataType { .. })
        ));
        assert!(matches!(
            Property::parse(1, "bad name", "integer", false),
            Err(Error::InvalidPropertyName { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let p = Property::new(1, "my•prop", DataType::Integer, false);
        assert!(matches!(
            p.validate(),
            Err(Error::InvalidPropertyName { .. })
        ));

        let p = Property::new(1, "", DataType::Integer, false);
        assert!(matches!(
            p.validate(),
            Err(Error::InvalidPropertyName { .. })
        ));
    }

    #[test]
    fn test_cast_string() {
        let p = Property::new(1, "p", DataType::String, false);
        assert_eq!(
            p.cast(Value::String("x".into())),
            Value::String("x".into())
        );
        assert_eq!(p.cast(Value::Int(3)), Value::String(String::new()));
    }

    #[test]
    fn test_cast_numeric_promotion() {
        let p = Property::new(1, "p", DataType::Integer, false);
        assert_eq!(p.cast(Value::Float(3.9)), Value::Int(3));
        assert_eq!(p.cast(Value::Bool(true)), Value::Int(0));

        let p = Property::new(1, "p", DataType::Float, false);
        assert_eq!(p.cast(Value::Int(2)), Value::Float(2.0));
        assert_eq!(p.cast(Value::String("x".into())), Value::Float(0.0));
    }

    #[test]
    fn test_cast_boolean() {
        let p = Property::new(1, "p", DataType::Boolean, false);
        assert_eq!(p.cast(Value::Bool(true)), Value::Bool(true));
        assert_eq!(p.cast(Value::Int(1)), Value::Bool(false));
    }
}
