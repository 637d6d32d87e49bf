//! The process-level database: a filesystem root and a registry of open
//! tables.
//!
//! The registry lock is held only for the duration of create, open, drop,
//! and close, so table I/O never serializes through it. Each table lives
//! in its own directory under the root and exclusively owns its
//! environment.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::info;

use sky_types::error::{IoSnafu, TableExistsSnafu, TableNotFoundSnafu};
use sky_types::{Error, Result, StorageOptions};

use crate::table::Table;

/// The file-backed data store: a root directory holding one subdirectory
/// per table.
pub struct Database {
    options: StorageOptions,
    inner: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    path: Option<PathBuf>,
    tables: HashMap<String, Arc<Table>>,
}

impl Database {
    /// Creates an unopened database with the given options.
    pub fn new(options: StorageOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(Registry::default()),
        }
    }

    /// Opens the database rooted at `path`, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseOpen`] if the database is already open.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut registry = self.inner.lock();
        if registry.path.is_some() {
            return Err(Error::DatabaseOpen);
        }
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).context(IoSnafu)?;
        info!(path = %path.display(), "opened database");
        registry.path = Some(path);
        Ok(())
    }

    /// Closes every open table and detaches from the root path. Idempotent.
    pub fn close(&self) {
        let mut registry = self.inner.lock();
        for table in registry.tables.values() {
            table.close();
        }
        registry.tables.clear();
        if let Some(path) = registry.path.take() {
            info!(path = %path.display(), "closed database");
        }
    }

    /// Returns the root path, or `None` if the database is not open.
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().path.clone()
    }

    /// Returns the directory a named table lives in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseNotOpen`] if the database is not open.
    pub fn table_path(&self, name: &str) -> Result<PathBuf> {
        let registry = self.inner.lock();
        match &registry.path {
            Some(path) => Ok(path.join(name)),
            None => Err(Error::DatabaseNotOpen),
        }
    }

    /// Creates, opens, and initializes a table. `shard_count = 0` selects
    /// the number of logical CPUs; the count is fixed for the life of the
    /// table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableExists`] if the table already exists and
    /// [`Error::TableNameRequired`] for an empty name.
    pub fn create_table(&self, name: &str, shard_count: usize) -> Result<Arc<Table>> {
        let mut registry = self.inner.lock();
        let root = match &registry.path {
            Some(path) => path.clone(),
            None => return Err(Error::DatabaseNotOpen),
        };
        if name.is_empty() {
            return Err(Error::TableNameRequired);
        }

        let table = table_entry(&mut registry, &self.options, &root, name, shard_count);
        if table.exists() {
            return TableExistsSnafu { name }.fail();
        }
        table.create()?;
        registry.tables.insert(name.to_string(), Arc::clone(&table));
        info!(table = name, "created table");
        Ok(table)
    }

    /// Opens an existing table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotFound`] if no table directory exists.
    pub fn open_table(&self, name: &str) -> Result<Arc<Table>> {
        let mut registry = self.inner.lock();
        let root = match &registry.path {
            Some(path) => path.clone(),
            None => return Err(Error::DatabaseNotOpen),
        };
        if name.is_empty() {
            return Err(Error::TableNameRequired);
        }

        let table = table_entry(&mut registry, &self.options, &root, name, 0);
        table.open()?;
        registry.tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Closes a table and removes its directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotFound`] if no table directory exists.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut registry = self.inner.lock();
        let root = match &registry.path {
            Some(path) => path.clone(),
            None => return Err(Error::DatabaseNotOpen),
        };

        let table = table_entry(&mut registry, &self.options, &root, name, 0);
        if !table.exists() {
            return TableNotFoundSnafu { name }.fail();
        }
        table.destroy()?;
        registry.tables.remove(name);
        info!(table = name, "dropped table");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

/// Returns the registered table handle, or builds a fresh unopened one.
fn table_entry(
    registry: &mut Registry,
    options: &StorageOptions,
    root: &Path,
    name: &str,
    shard_count: usize,
) -> Arc<Table> {
    if let Some(table) = registry.tables.get(name) {
        return Arc::clone(table);
    }
    Arc::new(Table::new(
        name,
        root.join(name),
        options.clone(),
        shard_count,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db() -> (Database, TempDir) {
        let dir = TempDir::new().expect("create temp dir");
        let db = Database::new(StorageOptions::default());
        db.open(dir.path()).expect("open database");
        (db, dir)
    }

    #[test]
    fn test_open_sets_path() {
        let (db, dir) = open_db();
        assert_eq!(db.path().expect("path"), dir.path());
    }

    #[test]
    fn test_double_open_errors() {
        let (db, dir) = open_db();
        let err = db.open(dir.path());
        assert!(matches!(err, Err(Error::DatabaseOpen)));
    }

    #[test]
    fn test_operations_require_open_database() {
        let db = Database::new(StorageOptions::default());
        assert!(matches!(
            db.create_table("foo", 0),
            Err(Error::DatabaseNotOpen)
        ));
        assert!(matches!(db.open_table("foo"), Err(Error::DatabaseNotOpen)));
        assert!(matches!(db.drop_table("foo"), Err(Error::DatabaseNotOpen)));
        assert!(db.path().is_none());
    }

    #[test]
    fn test_create_table() {
        let (db, dir) = open_db();
        let table = db.create_table("foo", 4).expect("create table");
        assert_eq!(table.name(), "foo");
        assert_eq!(table.path(), dir.path().join("foo"));
        assert_eq!(table.shard_count(), 4);
        assert!(table.exists());
    }

    #[test]
    fn test_create_table_defaults_shard_count_to_cpus() {
        let (db, _dir) = open_db();
        let table = db.create_table("foo", 0).expect("create table");
        assert!(table.shard_count() >= 1);
    }

    #[test]
    fn test_create_duplicate_table_errors() {
        let (db, _dir) = open_db();
        db.create_table("foo", 2).expect("create table");
        let err = db.create_table("foo", 2);
        assert!(matches!(err, Err(Error::TableExists { .. })));
    }

    #[test]
    fn test_create_table_requires_name() {
        let (db, _dir) = open_db();
        let err = db.create_table("", 2);
        assert!(matches!(err, Err(Error::TableNameRequired)));
    }

    #[test]
    fn test_open_missing_table_errors() {
        let (db, _dir) = open_db();
        let err = db.open_table("nope");
        assert!(matches!(err, Err(Error::TableNotFound { .. })));
    }

    #[test]
    fn test_drop_table_removes_directory() {
        let (db, dir) = open_db();
        db.create_table("foo", 2).expect("create table");
        assert!(dir.path().join("foo").exists());

        db.drop_table("foo").expect("drop table");
        assert!(!dir.path().join("foo").exists());
        assert!(matches!(
            db.open_table("foo"),
            Err(Error::TableNotFound { .. })
        ));
    }

    #[test]
    fn test_drop_missing_table_errors() {
        let (db, _dir) = open_db();
        let err = db.drop_table("nope");
        assert!(matches!(err, Err(Error::TableNotFound { .. })));
    }

    #[test]
    fn test_close_invalidates_table_handles() {
        let (db, _dir) = open_db();
        let table = db.create_table("foo", 2).expect("create table");
        db.close();
        assert!(matches!(
            table.properties(),
            Err(Error::TableNotOpen { .. })
        ));
        assert!(db.path().is_none());
    }
}
