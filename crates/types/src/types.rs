//! Type aliases, constants, and the property data-type enum.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Stable schema property identifier.
///
/// Positive identifiers are permanent properties, negative identifiers are
/// transient properties. Identifiers are never reused, even after a property
/// is deleted.
pub type PropertyId = i64;

/// Wall-clock timestamp carried by events. Normalized to microsecond
/// precision on insert.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// The size, in bytes, of the largest key the storage substrate accepts.
/// Factor strings are truncated to this length before being used as keys.
pub const MAX_KEY_SIZE: usize = 500;

/// The number of factors stored in the LRU cache. This cache size is
/// per-property.
pub const FACTOR_CACHE_SIZE: usize = 1000;

/// Data type of a schema property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Character string data.
    String,
    /// String data interned into per-property integer indexes.
    Factor,
    /// Whole-number numeric data, stored as 64-bit signed.
    Integer,
    /// Floating-point numeric data, stored as 64-bit.
    Float,
    /// True/false data.
    Boolean,
}

impl DataType {
    /// Returns the canonical lowercase name of the data type, as it appears
    /// in table meta JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Factor => "factor",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
        }
    }

    /// Parses a data type from its canonical name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDataType`] for any other input. This is the
    /// boundary where untyped wire strings enter the schema.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "string" => Ok(DataType::String),
            "factor" => Ok(DataType::Factor),
            "integer" => Ok(DataType::Integer),
            "float" => Ok(DataType::Float),
            "boolean" => Ok(DataType::Boolean),
            _ => Err(Error::InvalidDataType {
                name: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
