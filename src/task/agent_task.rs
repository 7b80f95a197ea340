//! Work items dispatched to backends
//!
//! Task kinds form a closed set; consumers validate the tag once through
//! [`AgentTask::as_schema_change`] / [`AgentTask::as_clear_alter`].

use crate::catalog::{Column, KeysType, StorageEncoding};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SchemaChange,
    ClearAlter,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::SchemaChange => write!(f, "SCHEMA_CHANGE"),
            TaskType::ClearAlter => write!(f, "CLEAR_ALTER_TASK"),
        }
    }
}

/// Convert one replica of a tablet to the target schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChangePayload {
    pub db_id: i64,
    pub table_id: i64,
    pub partition_id: i64,
    pub index_id: i64,
    pub tablet_id: i64,
    pub replica_id: i64,
    pub columns: Vec<Column>,
    pub new_schema_hash: i32,
    /// Schema hash of the data being converted
    pub base_schema_hash: i32,
    pub short_key_column_count: i16,
    pub storage_encoding: StorageEncoding,
    pub bloom_filter_columns: Option<BTreeSet<String>>,
    pub bloom_filter_fpp: f64,
    pub keys_type: KeysType,
}

/// Purge data stored under a superseded schema hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearAlterPayload {
    pub db_id: i64,
    pub table_id: i64,
    pub partition_id: i64,
    pub index_id: i64,
    pub tablet_id: i64,
    pub schema_hash: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskKind {
    SchemaChange(SchemaChangePayload),
    ClearAlter(ClearAlterPayload),
}

#[derive(Debug)]
pub struct AgentTask {
    backend_id: i64,
    signature: i64,
    kind: TaskKind,
    finished: AtomicBool,
}

impl AgentTask {
    pub fn schema_change(backend_id: i64, payload: SchemaChangePayload) -> Self {
        Self {
            backend_id,
            signature: payload.tablet_id,
            kind: TaskKind::SchemaChange(payload),
            finished: AtomicBool::new(false),
        }
    }

    pub fn clear_alter(backend_id: i64, payload: ClearAlterPayload) -> Self {
        Self {
            backend_id,
            signature: payload.tablet_id,
            kind: TaskKind::ClearAlter(payload),
            finished: AtomicBool::new(false),
        }
    }

    pub fn backend_id(&self) -> i64 {
        self.backend_id
    }

    /// Queue key component; one task per (backend, type, tablet)
    pub fn signature(&self) -> i64 {
        self.signature
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn task_type(&self) -> TaskType {
        match self.kind {
            TaskKind::SchemaChange(_) => TaskType::SchemaChange,
            TaskKind::ClearAlter(_) => TaskType::ClearAlter,
        }
    }

    pub fn tablet_id(&self) -> i64 {
        match &self.kind {
            TaskKind::SchemaChange(p) => p.tablet_id,
            TaskKind::ClearAlter(p) => p.tablet_id,
        }
    }

    pub fn as_schema_change(&self) -> Result<&SchemaChangePayload> {
        match &self.kind {
            TaskKind::SchemaChange(p) => Ok(p),
            other => Err(Error::InvalidArgument(format!(
                "expected schema change task, got {:?}",
                task_type_of(other)
            ))),
        }
    }

    pub fn as_clear_alter(&self) -> Result<&ClearAlterPayload> {
        match &self.kind {
            TaskKind::ClearAlter(p) => Ok(p),
            other => Err(Error::InvalidArgument(format!(
                "expected clear alter task, got {:?}",
                task_type_of(other)
            ))),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

fn task_type_of(kind: &TaskKind) -> TaskType {
    match kind {
        TaskKind::SchemaChange(_) => TaskType::SchemaChange,
        TaskKind::ClearAlter(_) => TaskType::ClearAlter,
    }
}
