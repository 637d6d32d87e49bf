//! The binary event codec.
//!
//! A stored event value is `u64 big-endian shifted timestamp || msgpack
//! map<property id, value>`. The timestamp is duplicated at the start of
//! the value precisely so events can be addressed by their leading 8 bytes
//! without decoding the map. Decoding normalizes every leaf through
//! [`Value`]'s deserializer: all integer widths collapse to `i64`, all
//! float widths to `f64`.

use std::collections::HashMap;

use sky_types::error::CodecSnafu;
use sky_types::{PropertyId, Result, Value};

/// Length of the big-endian timestamp header.
pub const TIMESTAMP_LEN: usize = 8;

/// The internal representation of an event: a shifted timestamp plus a map
/// from property id to typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Shifted timestamp, the intra-object sort key.
    pub timestamp: i64,
    /// Property values keyed by property id. Factor values are stored as
    /// integer indexes.
    pub data: HashMap<PropertyId, Value>,
}

impl RawEvent {
    /// Creates a raw event with no data.
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            data: HashMap::new(),
        }
    }

    /// Encodes the raw event into its stored byte form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the value map cannot be encoded.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut buf = (self.timestamp as u64).to_be_bytes().to_vec();
        let payload = rmp_serde::to_vec(&self.data).map_err(|e| {
            CodecSnafu {
                message: format!("event marshal error: {e}"),
            }
            .build()
        })?;
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decodes a raw event from its stored byte form, normalizing every
    /// value leaf.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the bytes are shorter than the timestamp
    /// header or the value map cannot be decoded.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let header: [u8; TIMESTAMP_LEN] = bytes
            .get(..TIMESTAMP_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| {
                CodecSnafu {
                    message: format!("event too short: {} bytes", bytes.len()),
                }
                .build()
            })?;
        let timestamp = u64::from_be_bytes(header) as i64;
        let data = rmp_serde::from_slice(&bytes[TIMESTAMP_LEN..]).map_err(|e| {
            CodecSnafu {
                message: format!("event unmarshal error: {e}"),
            }
            .build()
        })?;
        Ok(Self { timestamp, data })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sky_types::Error;

    #[test]
    fn test_timestamp_header_is_addressable() {
        let mut event = RawEvent::new(0x17a120);
        event.data.insert(1, Value::Int(20));
        let bytes = event.marshal().expect("marshal");
        assert_eq!(&bytes[..8], &0x17a120u64.to_be_bytes());
    }

    #[test]
    fn test_round_trip() {
        let mut event = RawEvent::new(42);
        event.data.insert(1, Value::Int(-5));
        event.data.insert(2, Value::Float(1.25));
        event.data.insert(-1, Value::String("bob".to_string()));
        event.data.insert(3, Value::Bool(true));

        let bytes = event.marshal().expect("marshal");
        let back = RawEvent::unmarshal(&bytes).expect("unmarshal");
        assert_eq!(back, event);
    }

    #[test]
    fn test_factor_index_decodes_as_integer() {
        let mut event = RawEvent::new(1);
        event.data.insert(1, Value::FactorIndex(7));
        let bytes = event.marshal().expect("marshal");
        let back = RawEvent::unmarshal(&bytes).expect("unmarshal");
        assert_eq!(back.data.get(&1), Some(&Value::Int(7)));
    }

    #[test]
    fn test_negative_timestamp_round_trips() {
        let event = RawEvent::new(-0x100000);
        let bytes = event.marshal().expect("marshal");
        let back = RawEvent::unmarshal(&bytes).expect("unmarshal");
        assert_eq!(back.timestamp, -0x100000);
    }

    #[test]
    fn test_truncated_bytes_error() {
        let err = RawEvent::unmarshal(&[1, 2, 3]);
        assert!(matches!(err, Err(Error::Codec { .. })));
    }
}
