//! Database: a named group of tables guarded by one reader/writer lock
//!
//! The database lock is the "table lock" of the alter protocol: it is always
//! acquired before any job's own lock.

use crate::catalog::entity::OlapTable;
use crate::common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub type Tables = BTreeMap<i64, OlapTable>;

#[derive(Debug)]
pub struct Database {
    id: i64,
    name: String,
    tables: RwLock<Tables>,
}

impl Database {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            tables: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the reader lock
    pub fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::Internal(format!("db[{}] lock poisoned", self.id)))
    }

    /// Acquire the writer lock
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::Internal(format!("db[{}] lock poisoned", self.id)))
    }

    pub fn create_table(&self, table: OlapTable) -> Result<()> {
        let mut tables = self.write()?;
        if tables.contains_key(&table.id) {
            return Err(Error::InvalidArgument(format!(
                "table[{}] already exists in db[{}]",
                table.id, self.id
            )));
        }
        tables.insert(table.id, table);
        Ok(())
    }

    pub fn drop_table(&self, table_id: i64) -> Result<Option<OlapTable>> {
        Ok(self.write()?.remove(&table_id))
    }
}
