//! Table → partition → materialized index → tablet → replica hierarchy
//!
//! The catalog owns these entities. An active alter job mutates them in place
//! while holding the owning database's writer lock.

use crate::catalog::column::{BloomFilterInfo, Column, KeysType, StorageEncoding};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Normal,
    SchemaChange,
    Rollup,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Normal,
    SchemaChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Normal,
    SchemaChange,
    Rollup,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexState::Normal => write!(f, "NORMAL"),
            IndexState::SchemaChange => write!(f, "SCHEMA_CHANGE"),
            IndexState::Rollup => write!(f, "ROLLUP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Normal,
    SchemaChange,
    Clone,
}

/// One copy of a tablet, hosted on one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: i64,
    pub backend_id: i64,
    pub state: ReplicaState,
    pub version: i64,
    pub version_hash: i64,
    pub data_size: i64,
    pub row_count: i64,
    pub last_failed_version: i64,
    pub last_failed_version_hash: i64,
    pub last_success_version: i64,
    pub last_success_version_hash: i64,
}

impl Replica {
    pub fn new(id: i64, backend_id: i64, version: i64, version_hash: i64) -> Self {
        Self {
            id,
            backend_id,
            state: ReplicaState::Normal,
            version,
            version_hash,
            data_size: 0,
            row_count: 0,
            last_failed_version: -1,
            last_failed_version_hash: 0,
            last_success_version: version,
            last_success_version_hash: version_hash,
        }
    }

    /// Apply a backend-confirmed conversion result.
    pub fn update_info(&mut self, version: i64, version_hash: i64, data_size: i64, row_count: i64) {
        self.version = version;
        self.version_hash = version_hash;
        self.data_size = data_size;
        self.row_count = row_count;
    }

    /// Apply a replayed version record, including the failure/success watermarks.
    #[allow(clippy::too_many_arguments)]
    pub fn update_version_info(
        &mut self,
        version: i64,
        version_hash: i64,
        data_size: i64,
        row_count: i64,
        last_failed_version: i64,
        last_failed_version_hash: i64,
        last_success_version: i64,
        last_success_version_hash: i64,
    ) {
        self.update_info(version, version_hash, data_size, row_count);
        self.last_failed_version = last_failed_version;
        self.last_failed_version_hash = last_failed_version_hash;
        self.last_success_version = last_success_version;
        self.last_success_version_hash = last_success_version_hash;
    }
}

/// One shard of a materialized index within a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub id: i64,
    pub replicas: Vec<Replica>,
}

impl Tablet {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            replicas: Vec::new(),
        }
    }

    pub fn add_replica(&mut self, replica: Replica) {
        self.replicas.push(replica);
    }

    pub fn replica_by_id(&self, replica_id: i64) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.id == replica_id)
    }

    pub fn replica_by_id_mut(&mut self, replica_id: i64) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.id == replica_id)
    }

    pub fn replica_by_backend_mut(&mut self, backend_id: i64) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.backend_id == backend_id)
    }

    /// Returns true if a replica was hosted on `backend_id`.
    pub fn delete_replica_by_backend(&mut self, backend_id: i64) -> bool {
        let before = self.replicas.len();
        self.replicas.retain(|r| r.backend_id != backend_id);
        before != self.replicas.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedIndex {
    pub id: i64,
    pub state: IndexState,
    pub tablets: Vec<Tablet>,
}

impl MaterializedIndex {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            state: IndexState::Normal,
            tablets: Vec::new(),
        }
    }

    pub fn tablet(&self, tablet_id: i64) -> Option<&Tablet> {
        self.tablets.iter().find(|t| t.id == tablet_id)
    }

    pub fn tablet_mut(&mut self, tablet_id: i64) -> Option<&mut Tablet> {
        self.tablets.iter_mut().find(|t| t.id == tablet_id)
    }

    pub fn replica_count(&self) -> usize {
        self.tablets.iter().map(|t| t.replicas.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: i64,
    pub name: String,
    pub state: PartitionState,
    pub indices: BTreeMap<i64, MaterializedIndex>,
}

impl Partition {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            state: PartitionState::Normal,
            indices: BTreeMap::new(),
        }
    }

    pub fn index(&self, index_id: i64) -> Option<&MaterializedIndex> {
        self.indices.get(&index_id)
    }

    pub fn index_mut(&mut self, index_id: i64) -> Option<&mut MaterializedIndex> {
        self.indices.get_mut(&index_id)
    }
}

/// Live schema of one materialized index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    pub schema: Vec<Column>,
    pub schema_version: i32,
    pub schema_hash: i32,
    pub short_key_column_count: i16,
    pub storage_encoding: StorageEncoding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlapTable {
    pub id: i64,
    pub name: String,
    pub state: TableState,
    pub keys_type: KeysType,
    /// Full column list of the base index (whose id equals the table id)
    pub base_schema: Vec<Column>,
    pub bloom_filter: Option<BloomFilterInfo>,
    index_metas: BTreeMap<i64, IndexMeta>,
    partitions: BTreeMap<i64, Partition>,
    /// partition id → configured replication factor
    replication_nums: BTreeMap<i64, usize>,
}

impl OlapTable {
    pub fn new(id: i64, name: &str, keys_type: KeysType, base_schema: Vec<Column>) -> Self {
        Self {
            id,
            name: name.to_string(),
            state: TableState::Normal,
            keys_type,
            base_schema,
            bloom_filter: None,
            index_metas: BTreeMap::new(),
            partitions: BTreeMap::new(),
            replication_nums: BTreeMap::new(),
        }
    }

    pub fn base_index_id(&self) -> i64 {
        self.id
    }

    pub fn add_partition(&mut self, partition: Partition, replication_num: usize) {
        self.replication_nums.insert(partition.id, replication_num);
        self.partitions.insert(partition.id, partition);
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    pub fn partitions_mut(&mut self) -> impl Iterator<Item = &mut Partition> {
        self.partitions.values_mut()
    }

    pub fn partition(&self, partition_id: i64) -> Option<&Partition> {
        self.partitions.get(&partition_id)
    }

    pub fn partition_mut(&mut self, partition_id: i64) -> Option<&mut Partition> {
        self.partitions.get_mut(&partition_id)
    }

    pub fn replication_num(&self, partition_id: i64) -> usize {
        self.replication_nums.get(&partition_id).copied().unwrap_or(0)
    }

    pub fn set_replication_num(&mut self, partition_id: i64, replication_num: usize) {
        self.replication_nums.insert(partition_id, replication_num);
    }

    pub fn put_index_meta(&mut self, index_id: i64, meta: IndexMeta) {
        self.index_metas.insert(index_id, meta);
    }

    pub fn index_meta(&self, index_id: i64) -> Option<&IndexMeta> {
        self.index_metas.get(&index_id)
    }

    pub fn index_name(&self, index_id: i64) -> Option<&str> {
        self.index_metas.get(&index_id).map(|m| m.name.as_str())
    }

    pub fn schema_hash_by_index(&self, index_id: i64) -> Option<i32> {
        self.index_metas.get(&index_id).map(|m| m.schema_hash)
    }

    pub fn storage_encoding_by_index(&self, index_id: i64) -> Option<StorageEncoding> {
        self.index_metas.get(&index_id).map(|m| m.storage_encoding)
    }

    /// Swap in a new live schema for an index. Missing indices are ignored.
    pub fn set_index_schema_info(
        &mut self,
        index_id: i64,
        schema: Vec<Column>,
        schema_version: i32,
        schema_hash: i32,
        short_key_column_count: i16,
    ) {
        if let Some(meta) = self.index_metas.get_mut(&index_id) {
            meta.schema = schema;
            meta.schema_version = schema_version;
            meta.schema_hash = schema_hash;
            meta.short_key_column_count = short_key_column_count;
        }
    }

    pub fn set_index_storage_encoding(&mut self, index_id: i64, encoding: StorageEncoding) {
        if let Some(meta) = self.index_metas.get_mut(&index_id) {
            meta.storage_encoding = encoding;
        }
    }

    pub fn set_new_base_schema(&mut self, schema: Vec<Column>) {
        self.base_schema = schema;
    }

    pub fn set_bloom_filter_info(&mut self, info: Option<BloomFilterInfo>) {
        self.bloom_filter = info;
    }
}
