//! Sub-database naming and key encoding.
//!
//! One table environment holds:
//! - `meta` — a single `meta` key with the JSON schema snapshot
//! - `shards/{i}` — duplicate-sort event storage, one per shard
//! - `factors/{pid}` — the factor dictionary for each factor property
//!
//! Factor dictionary keys inside `factors/{pid}`:
//! - `+` → 8-byte big-endian next available index
//! - `>` + truncated string → 8-byte big-endian index
//! - `<` + decimal index → truncated string

use sky_types::{PropertyId, MAX_KEY_SIZE};

/// Name of the meta sub-database.
pub const META_DBI: &str = "meta";

/// Key of the single meta record.
pub const META_KEY: &[u8] = b"meta";

/// Key of a factor dictionary's sequence counter.
pub const FACTOR_SEQ_KEY: &[u8] = b"+";

/// Returns the name of a shard sub-database.
pub fn shard_dbi(index: usize) -> String {
    format!("shards/{index}")
}

/// Returns the name of a property's factor sub-database.
pub fn factor_dbi(property_id: PropertyId) -> String {
    format!("factors/{property_id}")
}

/// Returns the string-to-index key for a factor value.
pub fn factor_key(value: &str) -> Vec<u8> {
    let truncated = truncate_factor(value);
    let mut key = Vec::with_capacity(1 + truncated.len());
    key.push(b'>');
    key.extend_from_slice(truncated);
    key
}

/// Returns the index-to-string key for a factor index.
pub fn reverse_factor_key(index: i64) -> Vec<u8> {
    format!("<{index}").into_bytes()
}

/// Truncates a factor value to the largest key the substrate accepts.
///
/// Two distinct strings sharing a 500-byte prefix collide in the forward
/// map; that is a documented property of the dictionary, not corrected
/// here.
pub fn truncate_factor(value: &str) -> &[u8] {
    let bytes = value.as_bytes();
    &bytes[..bytes.len().min(MAX_KEY_SIZE)]
}
