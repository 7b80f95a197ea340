//! Durable per-replica outcomes of a committed schema change
//!
//! Deltas are only consumed when a follower replays the finishing record;
//! live progress never reads them.

use crate::catalog::Replica;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: i64,
    pub version_hash: i64,
    pub data_size: i64,
    pub row_count: i64,
    pub last_failed_version: i64,
    pub last_failed_version_hash: i64,
    pub last_success_version: i64,
    pub last_success_version_hash: i64,
}

impl From<&Replica> for VersionInfo {
    fn from(r: &Replica) -> Self {
        Self {
            version: r.version,
            version_hash: r.version_hash,
            data_size: r.data_size,
            row_count: r.row_count,
            last_failed_version: r.last_failed_version,
            last_failed_version_hash: r.last_failed_version_hash,
            last_success_version: r.last_success_version,
            last_success_version_hash: r.last_success_version_hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOp {
    /// Replica converted; adopt these version fields
    Update(VersionInfo),
    /// Replica never converted; drop it from its tablet
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDelta {
    pub partition_id: i64,
    pub index_id: i64,
    pub tablet_id: i64,
    pub backend_id: i64,
    pub op: DeltaOp,
}

impl ReplicaDelta {
    pub fn updated(partition_id: i64, index_id: i64, tablet_id: i64, replica: &Replica) -> Self {
        Self {
            partition_id,
            index_id,
            tablet_id,
            backend_id: replica.backend_id,
            op: DeltaOp::Update(VersionInfo::from(replica)),
        }
    }

    pub fn deleted(partition_id: i64, index_id: i64, tablet_id: i64, backend_id: i64) -> Self {
        Self {
            partition_id,
            index_id,
            tablet_id,
            backend_id,
            op: DeltaOp::Delete,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.op, DeltaOp::Delete)
    }
}
