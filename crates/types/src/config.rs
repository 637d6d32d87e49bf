//! Storage engine configuration.
//!
//! Options validate their values at construction time via a fallible
//! builder. Post-deserialization validation is available via the
//! `validate()` method.

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Default limit of sub-databases a table environment can hold.
pub const DEFAULT_MAX_SUB_DBS: u32 = 1024;

/// Default limit of concurrent readers per table environment.
pub const DEFAULT_MAX_READERS: u32 = 126;

/// Default substrate cache size: 64 MiB.
const DEFAULT_CACHE_SIZE_BYTES: usize = 64 * 1024 * 1024;

/// Minimum substrate cache size: 1 MiB.
const MIN_CACHE_SIZE_BYTES: usize = 1024 * 1024;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Options shared by a database and every table it opens.
///
/// # Validation Rules
///
/// - `max_sub_dbs` must be >= 2 (the meta sub-database plus at least one
///   shard)
/// - `max_readers` must be >= 1
/// - `cache_size_bytes` must be >= 1 MiB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Maximum number of named sub-databases per table environment.
    /// Enforced when shard and factor sub-databases are materialized.
    #[serde(default = "default_max_sub_dbs")]
    pub max_sub_dbs: u32,
    /// Maximum number of concurrent readers per table environment.
    /// Advisory under substrates that do not bound reader slots.
    #[serde(default = "default_max_readers")]
    pub max_readers: u32,
    /// Substrate cache size in bytes.
    #[serde(default = "default_cache_size")]
    pub cache_size_bytes: usize,
    /// Whether writes flush to disk at commit. Disabling trades durability
    /// for throughput.
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

#[bon::bon]
impl StorageOptions {
    /// Creates storage options with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_max_sub_dbs())] max_sub_dbs: u32,
        #[builder(default = default_max_readers())] max_readers: u32,
        #[builder(default = default_cache_size())] cache_size_bytes: usize,
        #[builder(default = default_fsync())] fsync: bool,
    ) -> Result<Self, ConfigError> {
        let options = Self {
            max_sub_dbs,
            max_readers,
            cache_size_bytes,
            fsync,
        };
        options.validate()?;
        Ok(options)
    }
}

impl StorageOptions {
    /// Validates the option values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sub_dbs < 2 {
            return Err(ConfigError::Validation {
                message: format!("max_sub_dbs must be >= 2, got {}", self.max_sub_dbs),
            });
        }
        if self.max_readers == 0 {
            return Err(ConfigError::Validation {
                message: "max_readers must be >= 1".to_string(),
            });
        }
        if self.cache_size_bytes < MIN_CACHE_SIZE_BYTES {
            return Err(ConfigError::Validation {
                message: format!(
                    "cache_size_bytes must be >= {} (1 MiB), got {}",
                    MIN_CACHE_SIZE_BYTES, self.cache_size_bytes
                ),
            });
        }
        Ok(())
    }
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            max_sub_dbs: default_max_sub_dbs(),
            max_readers: default_max_readers(),
            cache_size_bytes: default_cache_size(),
            fsync: default_fsync(),
        }
    }
}

fn default_max_sub_dbs() -> u32 {
    DEFAULT_MAX_SUB_DBS
}

fn default_max_readers() -> u32 {
    DEFAULT_MAX_READERS
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE_BYTES
}

fn default_fsync() -> bool {
    true
}
