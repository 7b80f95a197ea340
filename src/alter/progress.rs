//! Transient replica-completion bookkeeping of a running job
//!
//! Nothing here is persisted. The tracker is rebuilt from the catalog every
//! time tasks are dispatched.

use crate::common::{Error, Result};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    unfinished_replica_ids: HashSet<i64>,
    total_replicas_by_index: HashMap<i64, HashSet<i64>>,
    finished_count_by_index: HashMap<i64, usize>,
    finished_indices_by_partition: HashMap<i64, HashSet<i64>>,
    /// backend id → replica ids dispatched to it and not evicted since
    backend_to_replica_ids: HashMap<i64, HashSet<i64>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched replica. A replica id may appear once per index.
    pub fn add_replica(&mut self, index_id: i64, replica_id: i64, backend_id: i64) -> Result<()> {
        let replicas = self.total_replicas_by_index.entry(index_id).or_default();
        if !replicas.insert(replica_id) {
            return Err(Error::InvariantViolation(format!(
                "replica {} registered twice for index {}",
                replica_id, index_id
            )));
        }
        self.unfinished_replica_ids.insert(replica_id);
        self.backend_to_replica_ids
            .entry(backend_id)
            .or_default()
            .insert(replica_id);
        Ok(())
    }

    /// Mark a replica finished. Returns true only the first time.
    ///
    /// `index_id` may be omitted by legacy finish marks; the owning index is
    /// then found by scanning, but only when `allow_index_scan` is set.
    pub fn mark_finished(
        &mut self,
        index_id: Option<i64>,
        replica_id: i64,
        allow_index_scan: bool,
    ) -> bool {
        if !self.unfinished_replica_ids.contains(&replica_id) {
            return false;
        }

        let index_id = match index_id {
            Some(id) => id,
            None if allow_index_scan => match self.owning_index(replica_id) {
                Some(id) => id,
                None => {
                    tracing::warn!("replica {} is not owned by any tracked index", replica_id);
                    return false;
                }
            },
            None => {
                tracing::warn!(
                    "finish mark for replica {} carries no index id, legacy lookup disabled",
                    replica_id
                );
                return false;
            }
        };

        let owned = self
            .total_replicas_by_index
            .get(&index_id)
            .is_some_and(|ids| ids.contains(&replica_id));
        if !owned {
            tracing::warn!("replica {} does not belong to index {}", replica_id, index_id);
            return false;
        }

        self.unfinished_replica_ids.remove(&replica_id);
        *self.finished_count_by_index.entry(index_id).or_default() += 1;
        true
    }

    fn owning_index(&self, replica_id: i64) -> Option<i64> {
        self.total_replicas_by_index
            .iter()
            .find(|(_, ids)| ids.contains(&replica_id))
            .map(|(index_id, _)| *index_id)
    }

    /// Was this replica dispatched to this backend and not evicted since?
    pub fn is_tracked(&self, backend_id: i64, replica_id: i64) -> bool {
        self.backend_to_replica_ids
            .get(&backend_id)
            .is_some_and(|ids| ids.contains(&replica_id))
    }

    pub fn evict(&mut self, backend_id: i64, replica_id: i64) -> bool {
        self.backend_to_replica_ids
            .get_mut(&backend_id)
            .is_some_and(|ids| ids.remove(&replica_id))
    }

    pub fn total_replicas(&self, index_id: i64) -> usize {
        self.total_replicas_by_index
            .get(&index_id)
            .map_or(0, HashSet::len)
    }

    pub fn finished_replicas(&self, index_id: i64) -> usize {
        self.finished_count_by_index
            .get(&index_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_index_finished(&self, index_id: i64) -> bool {
        self.finished_replicas(index_id) >= self.total_replicas(index_id)
    }

    pub fn is_partition_index_finished(&self, partition_id: i64, index_id: i64) -> bool {
        self.finished_indices_by_partition
            .get(&partition_id)
            .is_some_and(|ids| ids.contains(&index_id))
    }

    /// Returns true if the index was not yet recorded as finished in this partition.
    pub fn mark_partition_index_finished(&mut self, partition_id: i64, index_id: i64) -> bool {
        self.finished_indices_by_partition
            .entry(partition_id)
            .or_default()
            .insert(index_id)
    }

    pub fn unfinished_count(&self) -> usize {
        self.unfinished_replica_ids.len()
    }

    pub fn is_unfinished(&self, replica_id: i64) -> bool {
        self.unfinished_replica_ids.contains(&replica_id)
    }
}
