//! The external event representation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;
use crate::value::Value;

/// The state for an object at a given point in time.
///
/// This is the wire form: property values are keyed by property *name* and
/// the timestamp is wall-clock UTC. The storage engine converts to and from
/// the internal id-keyed raw form on insert and read. Events returned to
/// callers are detached copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event occurred, microsecond precision.
    pub timestamp: Timestamp,
    /// Property values keyed by property name.
    pub data: HashMap<String, Value>,
}

impl Event {
    /// Creates an event with no data.
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            data: HashMap::new(),
        }
    }

    /// Adds a property value, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.data.insert(name.into(), value);
        self
    }
}
