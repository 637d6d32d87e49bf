//! Table storage engine for the Sky behavioral event database.
//!
//! This crate provides:
//! - A transactional key-value substrate over redb with duplicate-sort
//!   addressing for per-object event groups
//! - The binary event codec (big-endian timestamp header + msgpack map)
//! - The per-property factor dictionary with its LRU cache
//! - Deterministic shard routing by object identifier
//! - [`Table`], the central aggregate owning schema, shards, and factors
//! - [`Database`], the process-level registry of open tables

pub mod cache;
pub mod codec;
pub mod database;
pub mod engine;
pub mod factors;
pub mod shard;
pub mod stat;
pub mod table;
pub mod tables;

pub use cache::FactorCache;
pub use codec::RawEvent;
pub use database::Database;
pub use engine::{Cursor, CursorEntry, DbiKind, Env, ReadTxn, WriteTxn};
pub use factors::{FactorDict, FactorOutcome};
pub use shard::shard_index;
pub use stat::Stat;
pub use table::Table;

// Re-export the core types so callers only need one crate.
pub use sky_types::{
    DataType, Error, Event, Property, PropertyId, Result, StorageOptions, Timestamp, Value,
};
