//! Transactional key-value substrate over redb.
//!
//! One [`Env`] wraps one `redb::Database` file inside a table directory.
//! Named sub-databases ("DBIs") materialize as redb tables. Duplicate-sort
//! DBIs are modeled as tables keyed by the tuple `(key, prefix)`, where
//! `prefix` is the stored value's leading 8 timestamp bytes: redb orders
//! tuple keys component-wise, so iteration inside one key group yields
//! values in ascending byte order. The stored value keeps its redundant
//! 8-byte header, so events remain addressable by prefix without decoding.
//!
//! Readers are snapshot-isolated, writers are serialized by redb. Every
//! write transaction either commits or aborts; cursors own their read
//! transaction and release it on drop.

use std::path::Path;

use redb::{
    Builder, Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition,
    TableError,
};
use snafu::{ResultExt, Snafu};

use sky_types::{Error, StorageOptions};

/// Name of the substrate's data file inside a table directory.
const DATA_FILENAME: &str = "data.redb";

/// Key type of a duplicate-sort DBI: `(key, value-prefix)`.
pub(crate) type DupKey = (&'static [u8], &'static [u8]);

type PlainDef<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;
type DupDef<'a> = TableDefinition<'a, DupKey, &'static [u8]>;

fn plain_def(name: &str) -> PlainDef<'_> {
    TableDefinition::new(name)
}

fn dup_def(name: &str) -> DupDef<'_> {
    TableDefinition::new(name)
}

/// Errors surfaced by the substrate, preserving the redb cause.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// The environment could not be opened or created.
    #[snafu(display("failed to open environment at {path}: {source}"))]
    Open {
        /// Environment file path.
        path: String,
        /// The underlying redb error.
        source: redb::DatabaseError,
    },

    /// A transaction could not be started.
    #[snafu(display("transaction error: {source}"))]
    Transaction {
        /// The underlying redb error.
        source: redb::TransactionError,
    },

    /// A transaction could not be committed.
    #[snafu(display("commit error: {source}"))]
    Commit {
        /// The underlying redb error.
        source: redb::CommitError,
    },

    /// A sub-database could not be opened or created.
    #[snafu(display("sub-database error: {source}"))]
    Dbi {
        /// The underlying redb error.
        source: redb::TableError,
    },

    /// A storage operation failed.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying redb error.
        source: redb::StorageError,
    },
}

/// Result type for substrate operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl From<EngineError> for Error {
    #[track_caller]
    fn from(err: EngineError) -> Self {
        let loc = std::panic::Location::caller();
        Error::Storage {
            message: err.to_string(),
            location: snafu::Location::new(loc.file(), loc.line(), loc.column()),
        }
    }
}

/// Kind of a named sub-database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbiKind {
    /// One value per key.
    Plain,
    /// Multiple values per key, kept sorted by value bytes.
    DupSort,
}

/// A key-value environment backing one table.
pub struct Env {
    db: Database,
    durability: Durability,
}

impl Env {
    /// Opens or creates the environment inside the given table directory.
    ///
    /// `fsync = false` trades durability for throughput by deferring
    /// flushes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Open`] if the data file cannot be opened.
    pub fn open(dir: &Path, options: &StorageOptions) -> EngineResult<Self> {
        let path = dir.join(DATA_FILENAME);
        let db = Builder::new()
            .set_cache_size(options.cache_size_bytes)
            .create(&path)
            .context(OpenSnafu {
                path: path.display().to_string(),
            })?;
        let durability = if options.fsync {
            Durability::Immediate
        } else {
            Durability::Eventual
        };
        Ok(Self { db, durability })
    }

    /// Begins a snapshot-isolated read transaction.
    pub fn begin_read(&self) -> EngineResult<ReadTxn> {
        Ok(ReadTxn {
            txn: self.db.begin_read().context(TransactionSnafu)?,
        })
    }

    /// Begins a write transaction. Writers are serialized by the substrate.
    pub fn begin_write(&self) -> EngineResult<WriteTxn> {
        let mut txn = self.db.begin_write().context(TransactionSnafu)?;
        txn.set_durability(self.durability);
        Ok(WriteTxn { txn })
    }

    /// Runs a closure inside a read transaction.
    pub fn view<T>(&self, f: impl FnOnce(&ReadTxn) -> Result<T, Error>) -> Result<T, Error> {
        let txn = self.begin_read()?;
        f(&txn)
    }

    /// Runs a closure inside a write transaction, committing on success and
    /// aborting on error.
    pub fn update<T>(&self, f: impl FnOnce(&WriteTxn) -> Result<T, Error>) -> Result<T, Error> {
        let txn = self.begin_write()?;
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Opens a cursor over a duplicate-sort DBI.
    ///
    /// The cursor owns its read transaction; dropping the cursor releases
    /// it. A DBI that has never been materialized yields an empty cursor.
    pub fn cursor(&self, dbi: &str) -> EngineResult<Cursor> {
        let txn = self.db.begin_read().context(TransactionSnafu)?;
        let iter = match txn.open_table(dup_def(dbi)) {
            Ok(table) => Some(
                table
                    .range::<DupKey>(..)
                    .context(StorageSnafu)?,
            ),
            Err(TableError::TableDoesNotExist(_)) => None,
            Err(source) => return Err(EngineError::Dbi { source }),
        };
        Ok(Cursor {
            iter,
            lookahead: None,
            current: None,
        })
    }

    /// Returns a snapshot of the substrate's tree statistics.
    pub fn stats(&self) -> EngineResult<EnvStats> {
        let txn = self.db.begin_write().context(TransactionSnafu)?;
        let stats = txn.stats().context(StorageSnafu)?;
        let snapshot = EnvStats {
            tree_height: stats.tree_height() as u32,
            allocated_pages: stats.allocated_pages() as u64,
            branch_pages: stats.branch_pages() as u64,
            leaf_pages: stats.leaf_pages() as u64,
            stored_bytes: stats.stored_bytes() as u64,
            page_size: stats.page_size() as u64,
        };
        txn.abort().context(StorageSnafu)?;
        Ok(snapshot)
    }
}

/// Tree statistics reported by the substrate.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvStats {
    /// Height of the B-tree.
    pub tree_height: u32,
    /// Total pages allocated.
    pub allocated_pages: u64,
    /// Internal (non-leaf) pages.
    pub branch_pages: u64,
    /// Leaf pages.
    pub leaf_pages: u64,
    /// Bytes of stored key-value data.
    pub stored_bytes: u64,
    /// Size of a database page.
    pub page_size: u64,
}

/// A snapshot-isolated read transaction.
pub struct ReadTxn {
    txn: redb::ReadTransaction,
}

impl ReadTxn {
    /// Returns the value for a key in a plain DBI.
    pub fn get(&self, dbi: &str, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        match self.txn.open_table(plain_def(dbi)) {
            Ok(table) => table_get(&table, key),
            Err(TableError::TableDoesNotExist(_)) => Ok(None),
            Err(source) => Err(EngineError::Dbi { source }),
        }
    }

    /// Returns the first value under `key` whose bytes start with `prefix`
    /// in a duplicate-sort DBI.
    pub fn get_at(&self, dbi: &str, key: &[u8], prefix: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        match self.txn.open_table(dup_def(dbi)) {
            Ok(table) => table_get_at(&table, key, prefix),
            Err(TableError::TableDoesNotExist(_)) => Ok(None),
            Err(source) => Err(EngineError::Dbi { source }),
        }
    }

    /// Returns every value under a duplicate key, in ascending value byte
    /// order.
    pub fn get_all(&self, dbi: &str, key: &[u8]) -> EngineResult<Vec<Vec<u8>>> {
        match self.txn.open_table(dup_def(dbi)) {
            Ok(table) => table_get_all(&table, key),
            Err(TableError::TableDoesNotExist(_)) => Ok(Vec::new()),
            Err(source) => Err(EngineError::Dbi { source }),
        }
    }

    /// Returns the number of entries in a duplicate-sort DBI.
    pub fn len(&self, dbi: &str) -> EngineResult<u64> {
        match self.txn.open_table(dup_def(dbi)) {
            Ok(table) => table.len().context(StorageSnafu),
            Err(TableError::TableDoesNotExist(_)) => Ok(0),
            Err(source) => Err(EngineError::Dbi { source }),
        }
    }
}

/// A write transaction. Dropped without [`WriteTxn::commit`], all changes
/// are discarded.
pub struct WriteTxn {
    txn: redb::WriteTransaction,
}

impl WriteTxn {
    /// Idempotently materializes a named sub-database.
    pub fn ensure_dbi(&self, dbi: &str, kind: DbiKind) -> EngineResult<()> {
        match kind {
            DbiKind::Plain => {
                self.txn.open_table(plain_def(dbi)).context(DbiSnafu)?;
            }
            DbiKind::DupSort => {
                self.txn.open_table(dup_def(dbi)).context(DbiSnafu)?;
            }
        }
        Ok(())
    }

    /// Returns the number of materialized sub-databases.
    pub fn dbi_count(&self) -> EngineResult<usize> {
        Ok(self.txn.list_tables().context(StorageSnafu)?.count())
    }

    /// Returns the value for a key in a plain DBI.
    pub fn get(&self, dbi: &str, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(plain_def(dbi)).context(DbiSnafu)?;
        table_get(&table, key)
    }

    /// Sets the value for a key in a plain DBI.
    pub fn put(&self, dbi: &str, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let mut table = self.txn.open_table(plain_def(dbi)).context(DbiSnafu)?;
        table.insert(key, value).context(StorageSnafu)?;
        Ok(())
    }

    /// Returns the first value under `key` whose bytes start with `prefix`
    /// in a duplicate-sort DBI.
    pub fn get_at(&self, dbi: &str, key: &[u8], prefix: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(dup_def(dbi)).context(DbiSnafu)?;
        table_get_at(&table, key, prefix)
    }

    /// Replaces the value addressed by `(key, prefix)` in a duplicate-sort
    /// DBI, guaranteeing at most one value per prefix. The delete and the
    /// insert happen in this same transaction.
    pub fn put_at(&self, dbi: &str, key: &[u8], prefix: &[u8], value: &[u8]) -> EngineResult<()> {
        let mut table = self.txn.open_table(dup_def(dbi)).context(DbiSnafu)?;
        delete_located(&mut table, key, prefix)?;
        table.insert((key, prefix), value).context(StorageSnafu)?;
        Ok(())
    }

    /// Deletes the value addressed by `(key, prefix)` in a duplicate-sort
    /// DBI. A missing value is not an error.
    pub fn del_at(&self, dbi: &str, key: &[u8], prefix: &[u8]) -> EngineResult<()> {
        let mut table = self.txn.open_table(dup_def(dbi)).context(DbiSnafu)?;
        delete_located(&mut table, key, prefix)
    }

    /// Deletes every value under a duplicate key.
    pub fn del(&self, dbi: &str, key: &[u8]) -> EngineResult<()> {
        let mut table = self.txn.open_table(dup_def(dbi)).context(DbiSnafu)?;
        let positions = {
            let mut positions = Vec::new();
            let empty: &[u8] = &[];
            for item in table.range((key, empty)..).context(StorageSnafu)? {
                let (k, _) = item.context(StorageSnafu)?;
                let (group, position) = k.value();
                if group != key {
                    break;
                }
                positions.push(position.to_vec());
            }
            positions
        };
        for position in positions {
            table
                .remove((key, position.as_slice()))
                .context(StorageSnafu)?;
        }
        Ok(())
    }

    /// Commits the transaction.
    pub fn commit(self) -> EngineResult<()> {
        self.txn.commit().context(CommitSnafu)
    }

    /// Aborts the transaction, discarding all changes.
    pub fn abort(self) {
        let _ = self.txn.abort();
    }
}

fn table_get(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
) -> EngineResult<Option<Vec<u8>>> {
    Ok(table
        .get(key)
        .context(StorageSnafu)?
        .map(|guard| guard.value().to_vec()))
}

fn table_get_at(
    table: &impl ReadableTable<DupKey, &'static [u8]>,
    key: &[u8],
    prefix: &[u8],
) -> EngineResult<Option<Vec<u8>>> {
    let mut range = table.range((key, prefix)..).context(StorageSnafu)?;
    match range.next() {
        Some(item) => {
            let (k, v) = item.context(StorageSnafu)?;
            let (group, _) = k.value();
            if group != key {
                return Ok(None);
            }
            let value = v.value();
            if !value.starts_with(prefix) {
                return Ok(None);
            }
            Ok(Some(value.to_vec()))
        }
        None => Ok(None),
    }
}

fn table_get_all(
    table: &impl ReadableTable<DupKey, &'static [u8]>,
    key: &[u8],
) -> EngineResult<Vec<Vec<u8>>> {
    let empty: &[u8] = &[];
    let mut values = Vec::new();
    for item in table.range((key, empty)..).context(StorageSnafu)? {
        let (k, v) = item.context(StorageSnafu)?;
        let (group, _) = k.value();
        if group != key {
            break;
        }
        values.push(v.value().to_vec());
    }
    Ok(values)
}

/// Positions at the first value `>= (key, prefix)` and deletes it if it
/// belongs to `key` and starts with `prefix`.
fn delete_located(
    table: &mut redb::Table<'_, DupKey, &'static [u8]>,
    key: &[u8],
    prefix: &[u8],
) -> EngineResult<()> {
    let located = {
        let mut range = table.range((key, prefix)..).context(StorageSnafu)?;
        match range.next() {
            Some(item) => {
                let (k, v) = item.context(StorageSnafu)?;
                let (group, position) = k.value();
                if group == key && v.value().starts_with(prefix) {
                    Some(position.to_vec())
                } else {
                    None
                }
            }
            None => None,
        }
    };
    if let Some(position) = located {
        table
            .remove((key, position.as_slice()))
            .context(StorageSnafu)?;
    }
    Ok(())
}

/// An entry yielded by a [`Cursor`]: an owned copy of the duplicate key and
/// the stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorEntry {
    /// The duplicate key (object identifier bytes).
    pub key: Vec<u8>,
    /// The stored value bytes.
    pub value: Vec<u8>,
}

/// A cursor over one duplicate-sort DBI.
///
/// The cursor owns its enclosing read transaction; dropping the cursor
/// releases it. Entries are owned copies, safe to retain past the cursor's
/// lifetime.
pub struct Cursor {
    iter: Option<redb::Range<'static, DupKey, &'static [u8]>>,
    lookahead: Option<CursorEntry>,
    current: Option<CursorEntry>,
}

impl Cursor {
    fn advance(&mut self) -> EngineResult<Option<CursorEntry>> {
        if let Some(entry) = self.lookahead.take() {
            return Ok(Some(entry));
        }
        let Some(iter) = self.iter.as_mut() else {
            return Ok(None);
        };
        match iter.next() {
            Some(item) => {
                let (k, v) = item.context(StorageSnafu)?;
                let (group, _) = k.value();
                Ok(Some(CursorEntry {
                    key: group.to_vec(),
                    value: v.value().to_vec(),
                }))
            }
            None => Ok(None),
        }
    }

    /// Moves to the first value of the next duplicate key, skipping any
    /// remaining values of the current key.
    pub fn next_no_dup(&mut self) -> EngineResult<Option<CursorEntry>> {
        loop {
            match self.advance()? {
                None => {
                    self.current = None;
                    return Ok(None);
                }
                Some(entry) => {
                    let is_new_key = self
                        .current
                        .as_ref()
                        .map_or(true, |current| current.key != entry.key);
                    if is_new_key {
                        self.current = Some(entry.clone());
                        return Ok(Some(entry));
                    }
                }
            }
        }
    }

    /// Moves to the next value of the current duplicate key. Returns `None`
    /// at the end of the key group without consuming the next key's first
    /// value.
    pub fn next_dup(&mut self) -> EngineResult<Option<CursorEntry>> {
        match self.advance()? {
            None => Ok(None),
            Some(entry) => match &self.current {
                Some(current) if current.key != entry.key => {
                    self.lookahead = Some(entry);
                    Ok(None)
                }
                _ => {
                    self.current = Some(entry.clone());
                    Ok(Some(entry))
                }
            },
        }
    }

    /// Returns the entry the cursor is currently positioned on.
    pub fn get_current(&self) -> Option<&CursorEntry> {
        self.current.as_ref()
    }
}
