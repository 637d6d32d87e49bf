//! Table statistics.
//!
//! A [`Stat`] snapshot merges the substrate's tree statistics with the
//! table's cumulative per-operation counters and durations. Consumers
//! subtract two snapshots with [`Stat::diff`] to measure an interval.
//! Serialization uses the camelCase field names of the wire protocol.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// A snapshot of table statistics.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stat {
    /// Number of stored events across all shards.
    pub entries: u64,
    /// Bytes of stored key-value data.
    pub size: u64,
    /// Depth (height) of the B-tree.
    pub depth: u32,
    /// Page-level storage statistics.
    pub pages: PageStat,
    /// Cumulative per-operation counters.
    pub event: EventStat,
}

/// Page-level storage statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageStat {
    /// Total pages allocated.
    pub allocated: u64,
    /// Internal (non-leaf) pages.
    pub branch: u64,
    /// Leaf pages.
    pub leaf: u64,
    /// Size of a database page.
    pub size: u64,
}

/// Cumulative event operation statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStat {
    /// Event reads that found a value.
    pub fetch: OpStat,
    /// Event writes.
    pub insert: OpStat,
    /// Event deletes.
    pub delete: OpStat,
    /// Event encodes.
    pub marshal: OpStat,
    /// Event decodes.
    pub unmarshal: OpStat,
    /// String-to-index conversions.
    pub factorize: FactorizeStat,
    /// Index-to-string conversions.
    pub defactorize: DefactorizeStat,
}

/// Factorize statistics, split by how the lookup was satisfied.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorizeStat {
    /// Served from the LRU cache.
    pub cache_hit: CountStat,
    /// Served from the factor sub-database.
    pub fetch_hit: OpStat,
    /// Missing from cache and sub-database.
    pub fetch_miss: OpStat,
    /// New index assignments.
    pub create: OpStat,
}

/// Defactorize statistics, split by how the lookup was satisfied.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefactorizeStat {
    /// Served from the LRU cache.
    pub cache_hit: CountStat,
    /// Served from the factor sub-database.
    pub fetch_hit: OpStat,
    /// Missing from cache and sub-database.
    pub fetch_miss: OpStat,
}

/// A counter with an accumulated duration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpStat {
    /// Number of operations.
    pub count: u64,
    /// Total time spent, serialized as nanoseconds.
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
}

/// A bare counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountStat {
    /// Number of operations.
    pub count: u64,
}

impl Stat {
    /// Returns the componentwise difference between this snapshot and an
    /// earlier one.
    #[must_use]
    pub fn diff(&self, other: &Stat) -> Stat {
        Stat {
            entries: self.entries.saturating_sub(other.entries),
            size: self.size.saturating_sub(other.size),
            depth: self.depth.saturating_sub(other.depth),
            pages: PageStat {
                allocated: self.pages.allocated.saturating_sub(other.pages.allocated),
                branch: self.pages.branch.saturating_sub(other.pages.branch),
                leaf: self.pages.leaf.saturating_sub(other.pages.leaf),
                size: self.pages.size.saturating_sub(other.pages.size),
            },
            event: EventStat {
                fetch: self.event.fetch.diff(&other.event.fetch),
                insert: self.event.insert.diff(&other.event.insert),
                delete: self.event.delete.diff(&other.event.delete),
                marshal: self.event.marshal.diff(&other.event.marshal),
                unmarshal: self.event.unmarshal.diff(&other.event.unmarshal),
                factorize: FactorizeStat {
                    cache_hit: CountStat {
                        count: self
                            .event
                            .factorize
                            .cache_hit
                            .count
                            .saturating_sub(other.event.factorize.cache_hit.count),
                    },
                    fetch_hit: self
                        .event
                        .factorize
                        .fetch_hit
                        .diff(&other.event.factorize.fetch_hit),
                    fetch_miss: self
                        .event
                        .factorize
                        .fetch_miss
                        .diff(&other.event.factorize.fetch_miss),
                    create: self.event.factorize.create.diff(&other.event.factorize.create),
                },
                defactorize: DefactorizeStat {
                    cache_hit: CountStat {
                        count: self
                            .event
                            .defactorize
                            .cache_hit
                            .count
                            .saturating_sub(other.event.defactorize.cache_hit.count),
                    },
                    fetch_hit: self
                        .event
                        .defactorize
                        .fetch_hit
                        .diff(&other.event.defactorize.fetch_hit),
                    fetch_miss: self
                        .event
                        .defactorize
                        .fetch_miss
                        .diff(&other.event.defactorize.fetch_miss),
                },
            },
        }
    }
}

impl OpStat {
    fn diff(&self, other: &OpStat) -> OpStat {
        OpStat {
            count: self.count.saturating_sub(other.count),
            duration: self.duration.saturating_sub(other.duration),
        }
    }
}

/// A running timer applied to an [`OpStat`] when an operation completes.
pub(crate) struct Bench(Instant);

/// Starts a timer.
pub(crate) fn bench() -> Bench {
    Bench(Instant::now())
}

impl Bench {
    /// Adds `count` operations and the elapsed time to a counter.
    pub(crate) fn apply(&self, op: &mut OpStat, count: u64) {
        op.count += count;
        op.duration += self.0.elapsed();
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_nanos() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_is_componentwise() {
        let mut later = Stat::default();
        later.entries = 10;
        later.event.insert.count = 7;
        later.event.insert.duration = Duration::from_micros(500);
        later.event.factorize.cache_hit.count = 3;

        let mut earlier = Stat::default();
        earlier.entries = 4;
        earlier.event.insert.count = 2;
        earlier.event.insert.duration = Duration::from_micros(100);
        earlier.event.factorize.cache_hit.count = 1;

        let diff = later.diff(&earlier);
        assert_eq!(diff.entries, 6);
        assert_eq!(diff.event.insert.count, 5);
        assert_eq!(diff.event.insert.duration, Duration::from_micros(400));
        assert_eq!(diff.event.factorize.cache_hit.count, 2);
    }

    #[test]
    fn test_json_shape_is_camel_case() {
        let mut stat = Stat::default();
        stat.event.factorize.fetch_hit.count = 1;
        let json = serde_json::to_string(&stat).expect("serialize");
        assert!(json.contains("\"fetchHit\""));
        assert!(json.contains("\"cacheHit\""));
        assert!(json.contains("\"defactorize\""));

        let back: Stat = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, stat);
    }
}
