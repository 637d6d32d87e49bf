//! The per-property factor dictionary.
//!
//! Factor properties intern their string values into strictly positive
//! integers, persisted in the property's `factors/{pid}` sub-database and
//! fronted by an LRU cache. The empty string is always index 0 and is
//! never stored. Index assignment is monotonically increasing starting at
//! 1. Strings are truncated to the substrate's key limit before keying, so
//! distinct strings sharing a 500-byte prefix map to the same index.

use sky_types::error::CodecSnafu;
use sky_types::{Error, PropertyId, Result, FACTOR_CACHE_SIZE};

use crate::cache::FactorCache;
use crate::engine::Env;
use crate::tables::{factor_dbi, factor_key, reverse_factor_key, truncate_factor, FACTOR_SEQ_KEY};

/// How a factor lookup was satisfied, for statistics attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorOutcome {
    /// The empty string or index 0; never touches storage.
    Blank,
    /// Served from the LRU cache.
    CacheHit,
    /// Served from the sub-database.
    FetchHit,
    /// A new index was assigned.
    Created,
}

/// The factor dictionary for one property.
#[derive(Debug)]
pub struct FactorDict {
    property_id: PropertyId,
    cache: FactorCache,
}

impl FactorDict {
    /// Creates the dictionary with a cold cache.
    pub fn new(property_id: PropertyId) -> Self {
        Self {
            property_id,
            cache: FactorCache::new(FACTOR_CACHE_SIZE),
        }
    }

    /// Returns the property this dictionary belongs to.
    pub fn property_id(&self) -> PropertyId {
        self.property_id
    }

    /// Converts a factor value to its integer index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FactorNotFound`] if the value has no index and
    /// `create_if_missing` is false.
    pub fn factorize(
        &mut self,
        env: &Env,
        value: &str,
        create_if_missing: bool,
    ) -> Result<(i64, FactorOutcome)> {
        if value.is_empty() {
            return Ok((0, FactorOutcome::Blank));
        }

        if let Some(index) = self.cache.get_by_value(value) {
            return Ok((index, FactorOutcome::CacheHit));
        }

        let dbi = factor_dbi(self.property_id);
        let key = factor_key(value);
        let existing = env.view(|txn| Ok(txn.get(&dbi, &key)?))?;
        if let Some(bytes) = existing {
            let index = decode_index(&bytes)?;
            // Cache the truncated form, the form the dictionary stores, so
            // reverse lookups stay consistent with the sub-database.
            self.cache.insert(
                String::from_utf8_lossy(truncate_factor(value)).into_owned(),
                index,
            );
            return Ok((index, FactorOutcome::FetchHit));
        }

        if !create_if_missing {
            return Err(Error::FactorNotFound {
                property_id: self.property_id,
                factor: value.to_string(),
            });
        }

        let index = env.update(|txn| {
            // Read and advance the sequence counter.
            let next = match txn.get(&dbi, FACTOR_SEQ_KEY)? {
                Some(bytes) => decode_index(&bytes)?,
                None => 0,
            } + 1;
            txn.put(&dbi, FACTOR_SEQ_KEY, &(next as u64).to_be_bytes())?;

            // Forward and reverse mappings use the truncated value.
            txn.put(&dbi, &key, &(next as u64).to_be_bytes())?;
            txn.put(&dbi, &reverse_factor_key(next), truncate_factor(value))?;
            Ok(next)
        })?;

        self.cache.insert(
            String::from_utf8_lossy(truncate_factor(value)).into_owned(),
            index,
        );
        Ok((index, FactorOutcome::Created))
    }

    /// Converts a factor index back to its string value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FactorNotFound`] if the index was never assigned.
    pub fn defactorize(&mut self, env: &Env, index: i64) -> Result<(String, FactorOutcome)> {
        if index == 0 {
            return Ok((String::new(), FactorOutcome::Blank));
        }

        if let Some(value) = self.cache.get_by_index(index) {
            return Ok((value, FactorOutcome::CacheHit));
        }

        let dbi = factor_dbi(self.property_id);
        let bytes = env.view(|txn| Ok(txn.get(&dbi, &reverse_factor_key(index))?))?;
        match bytes {
            Some(bytes) => {
                let value = String::from_utf8_lossy(&bytes).into_owned();
                self.cache.insert(value.clone(), index);
                Ok((value, FactorOutcome::FetchHit))
            }
            None => Err(Error::FactorNotFound {
                property_id: self.property_id,
                factor: index.to_string(),
            }),
        }
    }
}

fn decode_index(bytes: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
        CodecSnafu {
            message: format!("invalid factor index width: {} bytes", bytes.len()),
        }
        .build()
    })?;
    Ok(u64::from_be_bytes(bytes) as i64)
}
