//! Metadata catalog consumed by alter jobs
//!
//! Stores:
//! - Databases and their tables (entity hierarchy down to replicas)
//! - The inverted index of staged/current schema hashes
//! - The backend registry (liveness, report versions)
//! - The global transaction id generator

pub mod backend;
pub mod column;
pub mod database;
pub mod entity;
pub mod inverted_index;

pub use backend::{Backend, BackendRegistry};
pub use column::{AggregateType, BloomFilterInfo, Column, ColumnType, KeysType, StorageEncoding};
pub use database::{Database, Tables};
pub use entity::{
    IndexMeta, IndexState, MaterializedIndex, OlapTable, Partition, PartitionState, Replica,
    ReplicaState, TableState, Tablet,
};
pub use inverted_index::{InvertedIndex, SchemaHashes};

use crate::common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct Catalog {
    databases: RwLock<BTreeMap<i64, Arc<Database>>>,
    inverted_index: InvertedIndex,
    backends: BackendRegistry,
    next_transaction_id: AtomicI64,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            databases: RwLock::new(BTreeMap::new()),
            inverted_index: InvertedIndex::new(),
            backends: BackendRegistry::new(),
            next_transaction_id: AtomicI64::new(1),
        }
    }

    pub fn add_db(&self, db: Database) -> Result<Arc<Database>> {
        let mut dbs = self
            .databases
            .write()
            .map_err(|_| Error::Internal("catalog lock poisoned".into()))?;
        let db = Arc::new(db);
        dbs.insert(db.id(), db.clone());
        Ok(db)
    }

    pub fn get_db(&self, db_id: i64) -> Option<Arc<Database>> {
        let dbs = self.databases.read().unwrap_or_else(|e| e.into_inner());
        dbs.get(&db_id).cloned()
    }

    pub fn drop_db(&self, db_id: i64) -> Option<Arc<Database>> {
        let mut dbs = self.databases.write().unwrap_or_else(|e| e.into_inner());
        dbs.remove(&db_id)
    }

    pub fn inverted_index(&self) -> &InvertedIndex {
        &self.inverted_index
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Mint a fresh, strictly increasing transaction id
    pub fn next_transaction_id(&self) -> i64 {
        self.next_transaction_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure future ids are above `seen` (after loading persisted jobs)
    pub fn observe_transaction_id(&self, seen: i64) {
        self.next_transaction_id.fetch_max(seen + 1, Ordering::SeqCst);
    }
}
