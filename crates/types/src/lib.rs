//! Core types for the Sky behavioral event database.
//!
//! This crate provides the foundational types used by the table storage
//! engine:
//! - Data type and value sum types for dynamic event properties
//! - Schema property definitions with stable identifiers
//! - The shifted-timestamp codec used as the intra-object sort key
//! - FNV-1a hashing for shard routing
//! - Storage options with validated builders
//! - Error types using snafu

pub mod config;
pub mod error;
pub mod event;
pub mod hash;
pub mod property;
pub mod timestamp;
pub mod types;
pub mod validation;
pub mod value;

// Re-export commonly used types at crate root
pub use config::{ConfigError, StorageOptions};
pub use error::{Error, Result};
pub use event::Event;
pub use hash::{fnv1a_64, local_hash};
pub use property::Property;
pub use timestamp::{shift_time, shift_time_bytes, unshift_time, unshift_time_bytes};
pub use types::{DataType, PropertyId, Timestamp, FACTOR_CACHE_SIZE, MAX_KEY_SIZE};
pub use value::Value;
