//! Schema hashes visible to tablet report validation, per (partition, index)
//!
//! While a schema change is in flight the new hash is staged next to the
//! current one so that reports carrying either are accepted. On commit the
//! two swap places and the old hash stays staged until it is deleted.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaHashes {
    pub current: Option<i32>,
    pub staged: Option<i32>,
}

#[derive(Debug, Default)]
pub struct InvertedIndex {
    hashes: Mutex<HashMap<(i64, i64), SchemaHashes>>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        partition_id: i64,
        index_id: i64,
        f: impl FnOnce(&mut SchemaHashes) -> T,
    ) -> T {
        let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        f(hashes.entry((partition_id, index_id)).or_default())
    }

    /// Record the live schema hash of an index (table creation or load)
    pub fn register(&self, partition_id: i64, index_id: i64, schema_hash: i32) {
        self.with_entry(partition_id, index_id, |h| h.current = Some(schema_hash));
    }

    pub fn set_new_schema_hash(&self, partition_id: i64, index_id: i64, schema_hash: i32) {
        self.with_entry(partition_id, index_id, |h| h.staged = Some(schema_hash));
    }

    /// Promote the staged hash. The previous hash remains staged.
    pub fn update_to_new_schema_hash(&self, partition_id: i64, index_id: i64) {
        self.with_entry(partition_id, index_id, |h| {
            if let Some(new_hash) = h.staged {
                h.staged = h.current;
                h.current = Some(new_hash);
            }
        });
    }

    pub fn delete_new_schema_hash(&self, partition_id: i64, index_id: i64) {
        self.with_entry(partition_id, index_id, |h| h.staged = None);
    }

    pub fn schema_hashes(&self, partition_id: i64, index_id: i64) -> SchemaHashes {
        let hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        hashes
            .get(&(partition_id, index_id))
            .copied()
            .unwrap_or_default()
    }

    /// Would a tablet report carrying `schema_hash` be accepted?
    pub fn is_valid_schema_hash(&self, partition_id: i64, index_id: i64, schema_hash: i32) -> bool {
        let h = self.schema_hashes(partition_id, index_id);
        h.current == Some(schema_hash) || h.staged == Some(schema_hash)
    }
}
