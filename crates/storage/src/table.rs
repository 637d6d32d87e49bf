//! The table aggregate.
//!
//! A [`Table`] owns one key-value environment, the schema (an ordered
//! property list with stable ids), one factor dictionary per factor
//! property, N duplicate-sort shard sub-databases, and cumulative
//! statistics. All public operations serialize through the table's
//! reader-writer lock; the substrate additionally serializes writers and
//! snapshot-isolates readers underneath.
//!
//! Schema changes are copy-on-write: a new property map is assembled and
//! the meta record persisted before the published map is swapped. If the
//! meta write fails, the previous map stays published.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, warn};

use sky_types::error::{
    CodecSnafu, IoSnafu, PropertyExistsSnafu, PropertyNotFoundSnafu, StorageSnafu,
    TableNotFoundSnafu,
};
use sky_types::validation::validate_property_name;
use sky_types::{
    shift_time, shift_time_bytes, unshift_time, DataType, Error, Event, Property, PropertyId,
    Result, StorageOptions, Timestamp, Value,
};

use crate::codec::RawEvent;
use crate::engine::{Cursor, DbiKind, Env};
use crate::factors::{FactorDict, FactorOutcome};
use crate::shard::shard_index;
use crate::stat::{bench, PageStat, Stat};
use crate::tables::{factor_dbi, shard_dbi, META_DBI, META_KEY};

/// A named collection of objects and their chronologically ordered events.
pub struct Table {
    name: String,
    path: PathBuf,
    options: StorageOptions,
    requested_shard_count: usize,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    env: Option<Env>,
    schema: Arc<Schema>,
    dicts: HashMap<PropertyId, FactorDict>,
    shard_count: usize,
    max_permanent_id: i64,
    max_transient_id: i64,
    stat: Stat,
}

/// The published property map. Replaced wholesale on schema changes.
#[derive(Debug, Default, Clone)]
struct Schema {
    by_name: HashMap<String, Property>,
    by_id: HashMap<PropertyId, Property>,
}

impl Schema {
    fn insert(&mut self, property: Property) {
        self.by_id.insert(property.id, property.clone());
        self.by_name.insert(property.name.clone(), property);
    }

    fn factor_ids(&self) -> Vec<PropertyId> {
        let mut ids: Vec<PropertyId> = self
            .by_id
            .values()
            .filter(|p| p.data_type == DataType::Factor)
            .map(|p| p.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// The persisted meta record. Field names are the stable on-disk JSON
/// shape.
#[derive(Debug, Serialize, Deserialize)]
struct TableMeta {
    name: String,
    #[serde(rename = "shardCount")]
    shard_count: usize,
    #[serde(rename = "maxPermanentID")]
    max_permanent_id: i64,
    #[serde(rename = "maxTransientID")]
    max_transient_id: i64,
    properties: Vec<Property>,
}

impl Table {
    /// Creates an unopened table handle. `requested_shard_count = 0`
    /// selects the number of logical CPUs at creation time.
    pub(crate) fn new(
        name: impl Into<String>,
        path: PathBuf,
        options: StorageOptions,
        requested_shard_count: usize,
    ) -> Self {
        Self {
            name: name.into(),
            path,
            options,
            requested_shard_count,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Returns the name of the table.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the location of the table on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether the table exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns the number of shards in the table.
    pub fn shard_count(&self) -> usize {
        self.inner.read().shard_count
    }

    fn not_open(&self) -> Error {
        Error::TableNotOpen {
            name: self.name.clone(),
        }
    }

    /// Creates the table directory, opens the environment, and persists the
    /// initial meta record.
    pub(crate) fn create(&self) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        fs::create_dir_all(&self.path).context(IoSnafu)?;
        if inner.shard_count == 0 {
            inner.shard_count = if self.requested_shard_count > 0 {
                self.requested_shard_count
            } else {
                default_shard_count()
            };
        }
        self.open_inner(inner)?;
        self.save_meta(inner)?;
        debug!(table = %self.name, shards = inner.shard_count, "created table");
        Ok(())
    }

    /// Opens the table, loading persisted meta and building factor caches.
    /// Opening an already-open table is a no-op.
    pub(crate) fn open(&self) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.env.is_some() {
            return Ok(());
        }
        if !self.exists() {
            return TableNotFoundSnafu { name: &self.name }.fail();
        }
        self.open_inner(inner)?;
        debug!(table = %self.name, "opened table");
        Ok(())
    }

    fn open_inner(&self, inner: &mut Inner) -> Result<()> {
        if inner.env.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.path).context(IoSnafu)?;
        let env = Env::open(&self.path, &self.options)?;
        env.update(|txn| {
            txn.ensure_dbi(META_DBI, DbiKind::Plain)?;
            Ok(())
        })?;

        // Load persisted meta. A fresh environment has none.
        if let Some(bytes) = env.view(|txn| Ok(txn.get(META_DBI, META_KEY)?))? {
            let meta: TableMeta =
                serde_json::from_slice(&bytes).map_err(|e| Error::TableMeta {
                    message: e.to_string(),
                })?;
            inner.shard_count = meta.shard_count;
            inner.max_permanent_id = meta.max_permanent_id;
            inner.max_transient_id = meta.max_transient_id;
            let mut schema = Schema::default();
            for property in meta.properties {
                schema.insert(property);
            }
            inner.schema = Arc::new(schema);
        }

        let factor_ids = inner.schema.factor_ids();
        let dbi_count = 1 + inner.shard_count + factor_ids.len();
        if dbi_count > self.options.max_sub_dbs as usize {
            return StorageSnafu {
                message: format!(
                    "sub-database limit exceeded: {dbi_count} > {}",
                    self.options.max_sub_dbs
                ),
            }
            .fail();
        }

        env.update(|txn| {
            for index in 0..inner.shard_count {
                txn.ensure_dbi(&shard_dbi(index), DbiKind::DupSort)?;
            }
            for id in &factor_ids {
                txn.ensure_dbi(&factor_dbi(*id), DbiKind::Plain)?;
            }
            Ok(())
        })?;

        inner.dicts = factor_ids
            .into_iter()
            .map(|id| (id, FactorDict::new(id)))
            .collect();
        inner.env = Some(env);
        Ok(())
    }

    /// Closes the table, releasing the environment. Idempotent.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.write();
        if inner.env.take().is_some() {
            debug!(table = %self.name, "closed table");
        }
    }

    /// Closes the table and removes its directory. Terminal.
    pub(crate) fn destroy(&self) -> Result<()> {
        self.close();
        fs::remove_dir_all(&self.path).context(IoSnafu)?;
        Ok(())
    }

    fn save_meta(&self, inner: &Inner) -> Result<()> {
        let Some(env) = inner.env.as_ref() else {
            return Err(self.not_open());
        };
        let mut properties: Vec<Property> = inner.schema.by_id.values().cloned().collect();
        properties.sort_by_key(|p| p.id);
        let meta = TableMeta {
            name: self.name.clone(),
            shard_count: inner.shard_count,
            max_permanent_id: inner.max_permanent_id,
            max_transient_id: inner.max_transient_id,
            properties,
        };
        let bytes = serde_json::to_vec(&meta).map_err(|e| Error::TableMeta {
            message: e.to_string(),
        })?;
        env.update(|txn| Ok(txn.put(META_DBI, META_KEY, &bytes)?))
    }

    // =========================================================================
    // Schema operations
    // =========================================================================

    /// Creates a new property and persists the updated schema.
    ///
    /// Transient properties receive the next negative id, permanent ones
    /// the next positive id. Factor properties get their sub-database and
    /// a fresh cache before the meta record is committed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PropertyExists`] for duplicate names and
    /// [`Error::InvalidPropertyName`] for invalid ones.
    pub fn create_property(
        &self,
        name: &str,
        data_type: DataType,
        transient: bool,
    ) -> Result<Property> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.env.is_none() {
            return Err(self.not_open());
        }
        if inner.schema.by_name.contains_key(name) {
            return PropertyExistsSnafu { name }.fail();
        }
        validate_property_name(name)?;

        let id = if transient {
            inner.max_transient_id -= 1;
            inner.max_transient_id
        } else {
            inner.max_permanent_id += 1;
            inner.max_permanent_id
        };
        let property = Property::new(id, name, data_type, transient);

        if data_type == DataType::Factor {
            let Some(env) = inner.env.as_ref() else {
                return Err(self.not_open());
            };
            let dbi_count = 2 + inner.shard_count + inner.schema.factor_ids().len();
            if dbi_count > self.options.max_sub_dbs as usize {
                return StorageSnafu {
                    message: format!(
                        "sub-database limit exceeded: {dbi_count} > {}",
                        self.options.max_sub_dbs
                    ),
                }
                .fail();
            }
            env.update(|txn| {
                txn.ensure_dbi(&factor_dbi(id), DbiKind::Plain)?;
                Ok(())
            })?;
        }

        let mut schema = (*inner.schema).clone();
        schema.insert(property.clone());
        let previous = std::mem::replace(&mut inner.schema, Arc::new(schema));
        if let Err(err) = self.save_meta(inner) {
            warn!(table = %self.name, property = name, error = %err,
                "meta save failed, rolling back schema change");
            inner.schema = previous;
            return Err(err);
        }

        if data_type == DataType::Factor {
            inner.dicts.insert(id, FactorDict::new(id));
        }
        Ok(property)
    }

    /// Renames a property, preserving its id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PropertyNotFound`] if `old_name` is unbound and
    /// [`Error::PropertyExists`] if `new_name` is already bound.
    pub fn rename_property(&self, old_name: &str, new_name: &str) -> Result<Property> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.env.is_none() {
            return Err(self.not_open());
        }
        let existing = match inner.schema.by_name.get(old_name) {
            Some(property) => property.clone(),
            None => return PropertyNotFoundSnafu { name: old_name }.fail(),
        };
        if inner.schema.by_name.contains_key(new_name) {
            return PropertyExistsSnafu { name: new_name }.fail();
        }

        let mut renamed = existing;
        renamed.name = new_name.to_string();

        let mut schema = (*inner.schema).clone();
        schema.by_name.remove(old_name);
        schema.insert(renamed.clone());
        let previous = std::mem::replace(&mut inner.schema, Arc::new(schema));
        if let Err(err) = self.save_meta(inner) {
            warn!(table = %self.name, property = old_name, error = %err,
                "meta save failed, rolling back schema change");
            inner.schema = previous;
            return Err(err);
        }
        Ok(renamed)
    }

    /// Deletes a property's name binding. The id is never reused and any
    /// on-disk data keyed by it remains; readers drop the orphaned id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PropertyNotFound`] if the name is unbound.
    pub fn delete_property(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.env.is_none() {
            return Err(self.not_open());
        }
        let property = match inner.schema.by_name.get(name) {
            Some(property) => property.clone(),
            None => return PropertyNotFoundSnafu { name }.fail(),
        };

        let mut schema = (*inner.schema).clone();
        schema.by_name.remove(name);
        schema.by_id.remove(&property.id);
        let previous = std::mem::replace(&mut inner.schema, Arc::new(schema));
        if let Err(err) = self.save_meta(inner) {
            warn!(table = %self.name, property = name, error = %err,
                "meta save failed, rolling back schema change");
            inner.schema = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Returns a property by name, or `None` if unbound.
    pub fn property(&self, name: &str) -> Result<Option<Property>> {
        let inner = self.inner.read();
        if inner.env.is_none() {
            return Err(self.not_open());
        }
        Ok(inner.schema.by_name.get(name).cloned())
    }

    /// Returns a property by id, or `None` if unknown.
    pub fn property_by_id(&self, id: PropertyId) -> Result<Option<Property>> {
        let inner = self.inner.read();
        if inner.env.is_none() {
            return Err(self.not_open());
        }
        Ok(inner.schema.by_id.get(&id).cloned())
    }

    /// Returns all bound properties keyed by name.
    pub fn properties(&self) -> Result<HashMap<String, Property>> {
        let inner = self.inner.read();
        if inner.env.is_none() {
            return Err(self.not_open());
        }
        Ok(inner.schema.by_name.clone())
    }

    /// Returns all bound properties keyed by id.
    pub fn properties_by_id(&self) -> Result<HashMap<PropertyId, Property>> {
        let inner = self.inner.read();
        if inner.env.is_none() {
            return Err(self.not_open());
        }
        Ok(inner.schema.by_id.clone())
    }

    // =========================================================================
    // Event operations
    // =========================================================================

    /// Returns the event for an object at a given timestamp, or `None`.
    pub fn get_event(&self, id: &str, timestamp: Timestamp) -> Result<Option<Event>> {
        let mut guard = self.inner.write();
        let Inner {
            env,
            schema,
            dicts,
            stat,
            shard_count,
            ..
        } = &mut *guard;
        let Some(env) = env.as_ref() else {
            return Err(self.not_open());
        };
        let schema = Arc::clone(schema);
        match get_raw_event(env, *shard_count, stat, id, shift_time(timestamp))? {
            Some(raw) => Ok(Some(to_event(env, &schema, dicts, stat, raw)?)),
            None => Ok(None),
        }
    }

    /// Returns all events for an object in ascending timestamp order.
    pub fn get_events(&self, id: &str) -> Result<Vec<Event>> {
        let mut guard = self.inner.write();
        let Inner {
            env,
            schema,
            dicts,
            stat,
            shard_count,
            ..
        } = &mut *guard;
        let Some(env) = env.as_ref() else {
            return Err(self.not_open());
        };
        let schema = Arc::clone(schema);
        let raws = get_raw_events(env, *shard_count, stat, id)?;
        let mut events = Vec::with_capacity(raws.len());
        for raw in raws {
            events.push(to_event(env, &schema, dicts, stat, raw)?);
        }
        Ok(events)
    }

    /// Inserts an event for an object.
    ///
    /// If an event already exists at the same shifted timestamp, the two
    /// are merged per property id with the new values winning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectIdRequired`] for an empty id and
    /// [`Error::PropertyNotFound`] for unknown property names.
    pub fn insert_event(&self, id: &str, event: &Event) -> Result<()> {
        let mut guard = self.inner.write();
        let Inner {
            env,
            schema,
            dicts,
            stat,
            shard_count,
            ..
        } = &mut *guard;
        let Some(env) = env.as_ref() else {
            return Err(self.not_open());
        };
        insert_one(env, schema, dicts, stat, *shard_count, id, event)
    }

    /// Inserts multiple events for one object. Each insert runs in its own
    /// transaction; the first failure stops the fold.
    pub fn insert_events(&self, id: &str, events: &[Event]) -> Result<()> {
        let mut guard = self.inner.write();
        let Inner {
            env,
            schema,
            dicts,
            stat,
            shard_count,
            ..
        } = &mut *guard;
        let Some(env) = env.as_ref() else {
            return Err(self.not_open());
        };
        for event in events {
            insert_one(env, schema, dicts, stat, *shard_count, id, event)?;
        }
        Ok(())
    }

    /// Inserts events for many objects. Same per-insert transaction
    /// granularity as [`Table::insert_events`].
    pub fn insert_objects(&self, objects: &HashMap<String, Vec<Event>>) -> Result<()> {
        let mut guard = self.inner.write();
        let Inner {
            env,
            schema,
            dicts,
            stat,
            shard_count,
            ..
        } = &mut *guard;
        let Some(env) = env.as_ref() else {
            return Err(self.not_open());
        };
        for (id, events) in objects {
            for event in events {
                insert_one(env, schema, dicts, stat, *shard_count, id, event)?;
            }
        }
        Ok(())
    }

    /// Deletes the event for an object at a given timestamp. A missing
    /// event is not an error.
    pub fn delete_event(&self, id: &str, timestamp: Timestamp) -> Result<()> {
        let mut guard = self.inner.write();
        let Inner {
            env,
            stat,
            shard_count,
            ..
        } = &mut *guard;
        let Some(env) = env.as_ref() else {
            return Err(self.not_open());
        };
        let prefix = shift_time_bytes(timestamp);
        let dbi = shard_dbi(shard_index(id.as_bytes(), *shard_count));
        let timer = bench();
        env.update(|txn| Ok(txn.del_at(&dbi, id.as_bytes(), &prefix)?))?;
        timer.apply(&mut stat.event.delete, 1);
        Ok(())
    }

    /// Deletes all events for an object.
    pub fn delete_events(&self, id: &str) -> Result<()> {
        let mut guard = self.inner.write();
        let Inner {
            env, shard_count, ..
        } = &mut *guard;
        let Some(env) = env.as_ref() else {
            return Err(self.not_open());
        };
        let dbi = shard_dbi(shard_index(id.as_bytes(), *shard_count));
        env.update(|txn| Ok(txn.del(&dbi, id.as_bytes())?))
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Executes a function once for each shard, handing it a cursor over
    /// the shard's events. The cursor owns its read transaction, which is
    /// released when the cursor is dropped.
    ///
    /// Cursors are opened before the first callback runs and the table
    /// lock is not held during callbacks, so a callback may call back into
    /// the table (e.g. to dereference factors).
    pub fn for_each_shard<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Cursor) -> Result<()>,
    {
        let cursors = {
            let inner = self.inner.read();
            let Some(env) = inner.env.as_ref() else {
                return Err(self.not_open());
            };
            let mut cursors = Vec::with_capacity(inner.shard_count);
            for index in 0..inner.shard_count {
                cursors.push(env.cursor(&shard_dbi(index))?);
            }
            cursors
        };
        for cursor in cursors {
            f(cursor)?;
        }
        Ok(())
    }

    /// Returns all distinct object ids in the table in ascending sorted
    /// order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.for_each_shard(|mut cursor| {
            while let Some(entry) = cursor.next_no_dup()? {
                keys.push(String::from_utf8_lossy(&entry.key).into_owned());
            }
            Ok(())
        })?;
        keys.sort();
        Ok(keys)
    }

    // =========================================================================
    // Factor access
    // =========================================================================

    /// Converts a factor value to its integer index without creating a
    /// missing factor. Returns `None` if the value was never factorized.
    pub fn factorize(&self, property_id: PropertyId, value: &str) -> Result<Option<i64>> {
        let mut guard = self.inner.write();
        let Inner {
            env, dicts, stat, ..
        } = &mut *guard;
        let Some(env) = env.as_ref() else {
            return Err(self.not_open());
        };
        match factorize_counted(env, dicts, stat, property_id, value, false) {
            Ok(index) => Ok(Some(index)),
            Err(Error::FactorNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Converts a factor index back to its string value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FactorNotFound`] if the index was never assigned.
    pub fn defactorize(&self, property_id: PropertyId, index: i64) -> Result<String> {
        let mut guard = self.inner.write();
        let Inner {
            env, dicts, stat, ..
        } = &mut *guard;
        let Some(env) = env.as_ref() else {
            return Err(self.not_open());
        };
        defactorize_counted(env, dicts, stat, property_id, index)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Returns a statistics snapshot: substrate tree statistics plus the
    /// cumulative per-operation counters.
    pub fn stat(&self) -> Result<Stat> {
        let inner = self.inner.read();
        let Some(env) = inner.env.as_ref() else {
            return Err(self.not_open());
        };
        let env_stats = env.stats()?;
        let mut stat = inner.stat.clone();
        stat.size = env_stats.stored_bytes;
        stat.depth = env_stats.tree_height;
        stat.pages = PageStat {
            allocated: env_stats.allocated_pages,
            branch: env_stats.branch_pages,
            leaf: env_stats.leaf_pages,
            size: env_stats.page_size,
        };
        stat.entries = env.view(|txn| {
            let mut total = 0;
            for index in 0..inner.shard_count {
                total += txn.len(&shard_dbi(index))?;
            }
            Ok(total)
        })?;
        Ok(stat)
    }
}

fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn insert_one(
    env: &Env,
    schema: &Arc<Schema>,
    dicts: &mut HashMap<PropertyId, FactorDict>,
    stat: &mut Stat,
    shard_count: usize,
    id: &str,
    event: &Event,
) -> Result<()> {
    if id.is_empty() {
        return Err(Error::ObjectIdRequired);
    }
    let schema = Arc::clone(schema);
    let mut raw = to_raw_event(env, &schema, dicts, stat, event)?;

    // Merge with any existing event at the same shifted timestamp; the
    // incoming values win per property id.
    if let Some(current) = get_raw_event(env, shard_count, stat, id, raw.timestamp)? {
        let mut merged = current.data;
        merged.extend(raw.data);
        raw.data = merged;
    }

    let timer = bench();
    let bytes = raw.marshal()?;
    timer.apply(&mut stat.event.marshal, 1);

    let prefix = (raw.timestamp as u64).to_be_bytes();
    let dbi = shard_dbi(shard_index(id.as_bytes(), shard_count));
    let timer = bench();
    env.update(|txn| Ok(txn.put_at(&dbi, id.as_bytes(), &prefix, &bytes)?))?;
    timer.apply(&mut stat.event.insert, 1);
    Ok(())
}

fn get_raw_event(
    env: &Env,
    shard_count: usize,
    stat: &mut Stat,
    id: &str,
    timestamp: i64,
) -> Result<Option<RawEvent>> {
    if id.is_empty() {
        return Err(Error::ObjectIdRequired);
    }
    let prefix = (timestamp as u64).to_be_bytes();
    let dbi = shard_dbi(shard_index(id.as_bytes(), shard_count));
    let timer = bench();
    let Some(bytes) = env.view(|txn| Ok(txn.get_at(&dbi, id.as_bytes(), &prefix)?))? else {
        return Ok(None);
    };
    timer.apply(&mut stat.event.fetch, 1);

    let timer = bench();
    let raw = RawEvent::unmarshal(&bytes)?;
    timer.apply(&mut stat.event.unmarshal, 1);
    Ok(Some(raw))
}

fn get_raw_events(
    env: &Env,
    shard_count: usize,
    stat: &mut Stat,
    id: &str,
) -> Result<Vec<RawEvent>> {
    if id.is_empty() {
        return Err(Error::ObjectIdRequired);
    }
    let dbi = shard_dbi(shard_index(id.as_bytes(), shard_count));
    let timer = bench();
    let slices = env.view(|txn| Ok(txn.get_all(&dbi, id.as_bytes())?))?;
    timer.apply(&mut stat.event.fetch, slices.len() as u64);

    let timer = bench();
    let mut raws = Vec::with_capacity(slices.len());
    for bytes in &slices {
        raws.push(RawEvent::unmarshal(bytes)?);
    }
    timer.apply(&mut stat.event.unmarshal, raws.len() as u64);
    Ok(raws)
}

/// Converts an external event to the raw id-keyed form: resolves names,
/// casts values, and factorizes factor values (creating missing factors).
fn to_raw_event(
    env: &Env,
    schema: &Schema,
    dicts: &mut HashMap<PropertyId, FactorDict>,
    stat: &mut Stat,
    event: &Event,
) -> Result<RawEvent> {
    let mut raw = RawEvent::new(shift_time(event.timestamp));
    for (name, value) in &event.data {
        let Some(property) = schema.by_name.get(name) else {
            return PropertyNotFoundSnafu { name }.fail();
        };
        let mut value = property.cast(value.clone());
        if property.data_type == DataType::Factor {
            let text = match &value {
                Value::String(text) => text.clone(),
                _ => String::new(),
            };
            let index = factorize_counted(env, dicts, stat, property.id, &text, true)?;
            value = Value::FactorIndex(index as u64);
        }
        raw.data.insert(property.id, value);
    }
    Ok(raw)
}

/// Converts a raw event back to the external name-keyed form. Ids of
/// deleted properties are dropped; factor indexes are dereferenced.
fn to_event(
    env: &Env,
    schema: &Schema,
    dicts: &mut HashMap<PropertyId, FactorDict>,
    stat: &mut Stat,
    raw: RawEvent,
) -> Result<Event> {
    let mut event = Event::new(unshift_time(raw.timestamp));
    for (id, value) in raw.data {
        let Some(property) = schema.by_id.get(&id) else {
            continue;
        };
        let value = if property.data_type == DataType::Factor {
            match value {
                Value::Int(index) => {
                    Value::String(defactorize_counted(env, dicts, stat, id, index)?)
                }
                other => {
                    return CodecSnafu {
                        message: format!("invalid factor value: {other:?}"),
                    }
                    .fail()
                }
            }
        } else {
            value
        };
        event.data.insert(property.name.clone(), value);
    }
    Ok(event)
}

fn factorize_counted(
    env: &Env,
    dicts: &mut HashMap<PropertyId, FactorDict>,
    stat: &mut Stat,
    property_id: PropertyId,
    value: &str,
    create_if_missing: bool,
) -> Result<i64> {
    let dict = dicts
        .entry(property_id)
        .or_insert_with(|| FactorDict::new(property_id));
    let timer = bench();
    match dict.factorize(env, value, create_if_missing) {
        Ok((index, outcome)) => {
            match outcome {
                FactorOutcome::Blank => {}
                FactorOutcome::CacheHit => stat.event.factorize.cache_hit.count += 1,
                FactorOutcome::FetchHit => timer.apply(&mut stat.event.factorize.fetch_hit, 1),
                FactorOutcome::Created => {
                    stat.event.factorize.fetch_miss.count += 1;
                    timer.apply(&mut stat.event.factorize.create, 1);
                }
            }
            Ok(index)
        }
        Err(err @ Error::FactorNotFound { .. }) => {
            timer.apply(&mut stat.event.factorize.fetch_miss, 1);
            Err(err)
        }
        Err(err) => Err(err),
    }
}

fn defactorize_counted(
    env: &Env,
    dicts: &mut HashMap<PropertyId, FactorDict>,
    stat: &mut Stat,
    property_id: PropertyId,
    index: i64,
) -> Result<String> {
    let dict = dicts
        .entry(property_id)
        .or_insert_with(|| FactorDict::new(property_id));
    let timer = bench();
    match dict.defactorize(env, index) {
        Ok((value, outcome)) => {
            match outcome {
                FactorOutcome::Blank | FactorOutcome::Created => {}
                FactorOutcome::CacheHit => stat.event.defactorize.cache_hit.count += 1,
                FactorOutcome::FetchHit => timer.apply(&mut stat.event.defactorize.fetch_hit, 1),
            }
            Ok(value)
        }
        Err(err @ Error::FactorNotFound { .. }) => {
            timer.apply(&mut stat.event.defactorize.fetch_miss, 1);
            Err(err)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    fn create_table() -> (Table, TempDir) {
        let dir = TempDir::new().expect("create temp dir");
        let table = Table::new(
            "foo",
            dir.path().join("foo"),
            StorageOptions::default(),
            4,
        );
        table.create().expect("create table");
        (table, dir)
    }

    fn parse(s: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(s)
            .expect("parse timestamp")
            .with_timezone(&Utc)
    }

    fn event_at(s: &str, pairs: &[(&str, Value)]) -> Event {
        let mut event = Event::new(parse(s));
        for (name, value) in pairs {
            event.data.insert((*name).to_string(), value.clone());
        }
        event
    }

    #[test]
    fn test_create_property_assigns_dense_ids() {
        let (table, _dir) = create_table();

        let p = table
            .create_property("firstName", DataType::String, false)
            .expect("create property");
        assert_eq!((p.id, p.name.as_str()), (1, "firstName"));
        assert!(!p.transient);

        let p = table
            .create_property("lastName", DataType::Factor, false)
            .expect("create property");
        assert_eq!(p.id, 2);

        let p = table
            .create_property("myNum", DataType::Integer, true)
            .expect("create property");
        assert_eq!(p.id, -1);

        let p = table
            .create_property("myFloat", DataType::Float, true)
            .expect("create property");
        assert_eq!(p.id, -2);

        let p = table
            .create_property("myBool", DataType::Boolean, false)
            .expect("create property");
        assert_eq!(p.id, 3);
    }

    #[test]
    fn test_create_property_duplicate_name() {
        let (table, _dir) = create_table();
        table
            .create_property("prop", DataType::Integer, false)
            .expect("create property");
        let err = table.create_property("prop", DataType::Float, false);
        assert!(matches!(err, Err(Error::PropertyExists { .. })));
    }

    #[test]
    fn test_create_property_invalid_name() {
        let (table, _dir) = create_table();
        let err = table.create_property("my•prop", DataType::Integer, false);
        assert!(matches!(err, Err(Error::InvalidPropertyName { .. })));
    }

    #[test]
    fn test_rename_property_preserves_id() {
        let (table, _dir) = create_table();
        table
            .create_property("prop", DataType::Integer, false)
            .expect("create property");
        let p = table.rename_property("prop", "prop2").expect("rename");
        assert_eq!((p.id, p.name.as_str()), (1, "prop2"));

        assert!(table.property("prop").expect("lookup").is_none());
        let p = table.property("prop2").expect("lookup").expect("bound");
        assert_eq!(p.id, 1);
    }

    #[test]
    fn test_rename_property_errors() {
        let (table, _dir) = create_table();
        let err = table.rename_property("prop", "prop2");
        assert!(matches!(err, Err(Error::PropertyNotFound { .. })));

        table
            .create_property("prop", DataType::Integer, false)
            .expect("create property");
        table
            .create_property("prop2", DataType::Integer, false)
            .expect("create property");
        let err = table.rename_property("prop", "prop2");
        assert!(matches!(err, Err(Error::PropertyExists { .. })));
    }

    #[test]
    fn test_delete_property_frees_name_not_id() {
        let (table, _dir) = create_table();
        table
            .create_property("prop", DataType::Integer, false)
            .expect("create property");
        table.rename_property("prop", "prop2").expect("rename");
        table.delete_property("prop2").expect("delete");

        assert!(table.property("prop2").expect("lookup").is_none());

        // The freed name binds to a fresh id, never the old one.
        let p = table
            .create_property("prop2", DataType::Float, false)
            .expect("create property");
        assert_eq!(p.id, 2);
    }

    #[test]
    fn test_delete_property_not_found() {
        let (table, _dir) = create_table();
        let err = table.delete_property("prop2");
        assert!(matches!(err, Err(Error::PropertyNotFound { .. })));
    }

    #[test]
    fn test_property_lookups() {
        let (table, _dir) = create_table();
        table
            .create_property("prop1", DataType::String, true)
            .expect("create property");
        table
            .create_property("prop2", DataType::Factor, false)
            .expect("create property");

        let by_name = table.properties().expect("properties");
        assert_eq!(by_name["prop1"].id, -1);
        assert_eq!(by_name["prop2"].id, 1);

        let by_id = table.properties_by_id().expect("properties by id");
        assert_eq!(by_id[&-1].name, "prop1");
        assert_eq!(by_id[&1].name, "prop2");

        assert!(table.property_by_id(2).expect("lookup").is_none());
    }

    #[test]
    fn test_operations_require_open_table() {
        let (table, _dir) = create_table();
        table.close();

        assert!(matches!(
            table.create_property("prop", DataType::Integer, false),
            Err(Error::TableNotOpen { .. })
        ));
        assert!(matches!(
            table.properties(),
            Err(Error::TableNotOpen { .. })
        ));
        assert!(matches!(
            table.get_event("user1", parse("2000-01-01T00:00:01Z")),
            Err(Error::TableNotOpen { .. })
        ));
        assert!(matches!(
            table.insert_event("user1", &event_at("2000-01-01T00:00:01Z", &[])),
            Err(Error::TableNotOpen { .. })
        ));
        assert!(matches!(table.keys(), Err(Error::TableNotOpen { .. })));
        assert!(matches!(table.stat(), Err(Error::TableNotOpen { .. })));
    }

    #[test]
    fn test_insert_and_get_event() {
        let (table, _dir) = create_table();
        table
            .create_property("prop1", DataType::Integer, false)
            .expect("create property");
        table
            .create_property("prop2", DataType::String, true)
            .expect("create property");

        table
            .insert_event(
                "user1",
                &event_at(
                    "2000-01-01T00:00:01Z",
                    &[("prop1", Value::Int(20)), ("prop2", Value::String("bob".into()))],
                ),
            )
            .expect("insert");
        table
            .insert_event(
                "user2",
                &event_at("2000-01-01T00:00:01Z", &[("prop1", Value::Int(100))]),
            )
            .expect("insert");
        table
            .insert_event(
                "user1",
                &event_at(
                    "2000-01-01T00:00:00Z",
                    &[("prop2", Value::String("susy".into()))],
                ),
            )
            .expect("insert");

        let e = table
            .get_event("user1", parse("2000-01-01T00:00:01Z"))
            .expect("get")
            .expect("present");
        assert_eq!(e.timestamp, parse("2000-01-01T00:00:01Z"));
        assert_eq!(e.data["prop1"], Value::Int(20));
        assert_eq!(e.data["prop2"], Value::String("bob".into()));

        let e = table
            .get_event("user1", parse("2000-01-01T00:00:00Z"))
            .expect("get")
            .expect("present");
        assert!(!e.data.contains_key("prop1"));
        assert_eq!(e.data["prop2"], Value::String("susy".into()));

        // Unknown object and unknown timestamp read as absent.
        assert!(table
            .get_event("no-such-user", parse("2000-01-01T00:00:00Z"))
            .expect("get")
            .is_none());
        assert!(table
            .get_event("user1", parse("1999-01-01T00:00:00Z"))
            .expect("get")
            .is_none());
    }

    #[test]
    fn test_insert_empty_object_id() {
        let (table, _dir) = create_table();
        let err = table.insert_event("", &event_at("2000-01-01T00:00:00Z", &[]));
        assert!(matches!(err, Err(Error::ObjectIdRequired)));
    }

    #[test]
    fn test_insert_unknown_property() {
        let (table, _dir) = create_table();
        let err = table.insert_event(
            "user1",
            &event_at("2000-01-01T00:00:00Z", &[("nope", Value::Int(1))]),
        );
        assert!(matches!(err, Err(Error::PropertyNotFound { .. })));
    }

    #[test]
    fn test_get_events_ascending_order() {
        let (table, _dir) = create_table();
        table
            .create_property("prop1", DataType::Integer, false)
            .expect("create property");

        for (ts, v) in [
            ("2000-01-01T00:00:02Z", 2),
            ("2000-01-01T00:00:00Z", 0),
            ("2000-01-01T00:00:01Z", 1),
        ] {
            table
                .insert_event("user1", &event_at(ts, &[("prop1", Value::Int(v))]))
                .expect("insert");
        }

        let events = table.get_events("user1").expect("get events");
        assert_eq!(events.len(), 3);
        for window in events.windows(2) {
            assert!(window[0].timestamp < window[1].timestamp);
        }
        assert_eq!(events[0].data["prop1"], Value::Int(0));
        assert_eq!(events[2].data["prop1"], Value::Int(2));
    }

    #[test]
    fn test_delete_event_preserves_rest() {
        let (table, _dir) = create_table();
        table
            .create_property("prop1", DataType::Integer, false)
            .expect("create property");
        table
            .insert_event(
                "xyz",
                &event_at("2000-01-01T02:00:00Z", &[("prop1", Value::Int(1))]),
            )
            .expect("insert");
        table
            .insert_event(
                "xyz",
                &event_at("2000-01-01T03:00:00Z", &[("prop1", Value::Int(2))]),
            )
            .expect("insert");

        table
            .delete_event("xyz", parse("2000-01-01T02:00:00Z"))
            .expect("delete");
        // Deleting an absent event is a no-op.
        table
            .delete_event("xyz", parse("2000-01-01T02:00:00Z"))
            .expect("delete");

        let events = table.get_events("xyz").expect("get events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, parse("2000-01-01T03:00:00Z"));
    }

    #[test]
    fn test_delete_events_leaves_other_objects() {
        let (table, _dir) = create_table();
        table
            .create_property("prop1", DataType::Integer, false)
            .expect("create property");
        table
            .insert_event(
                "a",
                &event_at("2000-01-01T00:00:00Z", &[("prop1", Value::Int(1))]),
            )
            .expect("insert");
        table
            .insert_event(
                "b",
                &event_at("2000-01-01T00:00:00Z", &[("prop1", Value::Int(2))]),
            )
            .expect("insert");

        table.delete_events("a").expect("delete events");
        assert!(table.get_events("a").expect("get").is_empty());
        assert_eq!(table.get_events("b").expect("get").len(), 1);
    }

    #[test]
    fn test_keys_are_sorted_across_shards() {
        let (table, _dir) = create_table();
        table
            .create_property("prop1", DataType::Integer, false)
            .expect("create property");
        for id in ["c", "a", "b"] {
            table
                .insert_event(
                    id,
                    &event_at("2000-01-01T00:00:00Z", &[("prop1", Value::Int(1))]),
                )
                .expect("insert");
        }

        let keys = table.keys().expect("keys");
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_deleted_property_ids_are_dropped_on_read() {
        let (table, _dir) = create_table();
        table
            .create_property("keep", DataType::Integer, false)
            .expect("create property");
        table
            .create_property("gone", DataType::Integer, false)
            .expect("create property");
        table
            .insert_event(
                "user1",
                &event_at(
                    "2000-01-01T00:00:00Z",
                    &[("keep", Value::Int(1)), ("gone", Value::Int(2))],
                ),
            )
            .expect("insert");

        table.delete_property("gone").expect("delete property");

        let events = table.get_events("user1").expect("get events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["keep"], Value::Int(1));
        assert!(!events[0].data.contains_key("gone"));
    }

    #[test]
    fn test_public_factorize_is_lookup_only() {
        let (table, _dir) = create_table();
        let p = table
            .create_property("page", DataType::Factor, false)
            .expect("create property");

        assert!(table.factorize(p.id, "nope").expect("factorize").is_none());

        table
            .insert_event(
                "user1",
                &event_at(
                    "2000-01-01T00:00:00Z",
                    &[("page", Value::String("/index.html".into()))],
                ),
            )
            .expect("insert");

        assert_eq!(table.factorize(p.id, "/index.html").expect("factorize"), Some(1));
        assert_eq!(table.defactorize(p.id, 1).expect("defactorize"), "/index.html");
        assert!(matches!(
            table.defactorize(p.id, 42),
            Err(Error::FactorNotFound { .. })
        ));
    }

    #[test]
    fn test_stat_counters_accumulate() {
        let (table, _dir) = create_table();
        table
            .create_property("page", DataType::Factor, false)
            .expect("create property");

        let before = table.stat().expect("stat");

        table
            .insert_event(
                "user1",
                &event_at(
                    "2000-01-01T00:00:00Z",
                    &[("page", Value::String("/a".into()))],
                ),
            )
            .expect("insert");
        table
            .insert_event(
                "user1",
                &event_at(
                    "2000-01-01T00:00:01Z",
                    &[("page", Value::String("/a".into()))],
                ),
            )
            .expect("insert");
        let _ = table.get_events("user1").expect("get events");

        let after = table.stat().expect("stat");
        let diff = after.diff(&before);
        assert_eq!(diff.entries, 2);
        assert_eq!(diff.event.insert.count, 2);
        assert_eq!(diff.event.marshal.count, 2);
        assert_eq!(diff.event.factorize.create.count, 1);
        assert_eq!(diff.event.factorize.cache_hit.count, 1);
        // get_events decoded two events; both dereferenced the same factor.
        assert_eq!(diff.event.unmarshal.count, 2);
        assert_eq!(diff.event.defactorize.cache_hit.count, 2);
    }

    #[test]
    fn test_merge_uses_microsecond_tick() {
        let (table, _dir) = create_table();
        table
            .create_property("n", DataType::Integer, false)
            .expect("create property");

        // Sub-microsecond digits collapse into the same shifted timestamp.
        table
            .insert_event(
                "xyz",
                &event_at("2012-01-01T02:00:00.123456111Z", &[("n", Value::Int(1))]),
            )
            .expect("insert");
        table
            .insert_event(
                "xyz",
                &event_at("2012-01-01T02:00:00.123456222Z", &[("n", Value::Int(2))]),
            )
            .expect("insert");

        let events = table.get_events("xyz").expect("get events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, parse("2012-01-01T02:00:00.123456Z"));
        assert_eq!(events[0].data["n"], Value::Int(2));
    }
}
