//! Schema change job record
//!
//! A job carries the desired end state of a table (per-index target schemas,
//! bloom filter settings, storage encoding), the durable replica deltas written
//! at commit, and the transient progress tracker of the running dispatch.
//!
//! Everything mutable sits behind one mutex. Callers that also need the
//! owning database lock must take it first.

use crate::alter::delta::ReplicaDelta;
use crate::alter::progress::ProgressTracker;
use crate::catalog::{BloomFilterInfo, Column, StorageEncoding};
use crate::common::{timestamp_now_millis, Error, Result};
use crate::task::AgentTask;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Finishing,
    Finished,
    Cancelled,
}

impl JobState {
    pub fn code(self) -> u8 {
        match self {
            JobState::Pending => 1,
            JobState::Running => 2,
            JobState::Finishing => 3,
            JobState::Finished => 4,
            JobState::Cancelled => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(JobState::Pending),
            2 => Some(JobState::Running),
            3 => Some(JobState::Finishing),
            4 => Some(JobState::Finished),
            5 => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Cancelled)
    }

    /// Forward-only transitions; FINISHED and CANCELLED are absorbing.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Running, JobState::Finishing)
                | (JobState::Finishing, JobState::Finished)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Cancelled)
                | (JobState::Finishing, JobState::Cancelled)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Finishing => "FINISHING",
            JobState::Finished => "FINISHED",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Version, hash and short-key count of a target schema. Always set together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub schema_version: i32,
    pub schema_hash: i32,
    pub short_key_column_count: i16,
}

/// Requested bloom filter alteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BloomFilterChange {
    /// Maintain filters on these columns
    Set(BloomFilterInfo),
    /// Drop every bloom filter of the table
    Drop,
}

impl BloomFilterChange {
    pub fn target(&self) -> Option<&BloomFilterInfo> {
        match self {
            BloomFilterChange::Set(info) => Some(info),
            BloomFilterChange::Drop => None,
        }
    }
}

/// Live payload of a job that has not been retired
#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    pub(crate) changed_schema: BTreeMap<i64, Vec<Column>>,
    pub(crate) schema_info: BTreeMap<i64, SchemaInfo>,
    pub(crate) bloom_filter_change: Option<BloomFilterChange>,
    /// The only expressible storage change is a conversion to columnar.
    pub(crate) convert_to_columnar: bool,
    pub(crate) replica_deltas: BTreeMap<i64, Vec<ReplicaDelta>>,
    pub(crate) tracker: ProgressTracker,
    pub(crate) clear_batch: Option<Vec<Arc<AgentTask>>>,
}

impl ChangeSet {
    pub(crate) fn new_storage_encoding(&self) -> Option<StorageEncoding> {
        self.convert_to_columnar.then_some(StorageEncoding::Column)
    }

    /// Every changed index must have its schema info, and nothing else may.
    pub(crate) fn check_schema_info(&self) -> Result<()> {
        for index_id in self.changed_schema.keys() {
            if !self.schema_info.contains_key(index_id) {
                return Err(Error::InvariantViolation(format!(
                    "index[{}] has a changed schema but no schema info",
                    index_id
                )));
            }
        }
        for index_id in self.schema_info.keys() {
            if !self.changed_schema.contains_key(index_id) {
                return Err(Error::InvariantViolation(format!(
                    "index[{}] has schema info but no changed schema",
                    index_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum JobBody {
    Live(Box<ChangeSet>),
    /// Dropped by the history retention policy
    Retired,
}

#[derive(Debug)]
pub(crate) struct JobCore {
    pub(crate) state: JobState,
    pub(crate) transaction_id: i64,
    pub(crate) finished_time: i64,
    pub(crate) cancel_msg: String,
    pub(crate) body: JobBody,
}

impl JobCore {
    pub(crate) fn set_state(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "illegal transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Debug)]
pub struct SchemaChangeJob {
    pub(crate) db_id: i64,
    pub(crate) table_id: i64,
    pub(crate) table_name: String,
    pub(crate) create_time: i64,
    pub(crate) core: Mutex<JobCore>,
}

impl SchemaChangeJob {
    pub fn new(db_id: i64, table_id: i64, table_name: &str, transaction_id: i64) -> Self {
        Self::from_parts(
            db_id,
            table_id,
            table_name.to_string(),
            timestamp_now_millis(),
            JobCore {
                state: JobState::Pending,
                transaction_id,
                finished_time: -1,
                cancel_msg: String::new(),
                body: JobBody::Live(Box::default()),
            },
        )
    }

    pub(crate) fn from_parts(
        db_id: i64,
        table_id: i64,
        table_name: String,
        create_time: i64,
        core: JobCore,
    ) -> Self {
        Self {
            db_id,
            table_id,
            table_name,
            create_time,
            core: Mutex::new(core),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, JobCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn live<'a>(&self, core: &'a JobCore) -> Result<&'a ChangeSet> {
        match &core.body {
            JobBody::Live(body) => Ok(body),
            JobBody::Retired => Err(Error::JobRetired(self.table_id)),
        }
    }

    pub(crate) fn live_mut<'a>(&self, core: &'a mut JobCore) -> Result<&'a mut ChangeSet> {
        match &mut core.body {
            JobBody::Live(body) => Ok(body),
            JobBody::Retired => Err(Error::JobRetired(self.table_id)),
        }
    }

    fn with_pending_body<T>(&self, f: impl FnOnce(&mut ChangeSet) -> Result<T>) -> Result<T> {
        let mut core = self.lock();
        if core.state != JobState::Pending {
            return Err(Error::InvalidState(format!(
                "job for table[{}] is {}, target can only change while PENDING",
                self.table_id, core.state
            )));
        }
        f(self.live_mut(&mut core)?)
    }

    // === Target registration ===

    /// Record the target column list of an index.
    pub fn put_changed_schema(&self, index_id: i64, columns: Vec<Column>) -> Result<()> {
        self.with_pending_body(|body| {
            body.changed_schema.insert(index_id, columns);
            Ok(())
        })
    }

    /// Record version, hash and short-key count of an index's target schema.
    pub fn set_schema_info(
        &self,
        index_id: i64,
        schema_version: i32,
        schema_hash: i32,
        short_key_column_count: i16,
    ) -> Result<()> {
        self.with_pending_body(|body| {
            body.schema_info.insert(
                index_id,
                SchemaInfo {
                    schema_version,
                    schema_hash,
                    short_key_column_count,
                },
            );
            Ok(())
        })
    }

    pub fn set_bloom_filter_change(&self, change: BloomFilterChange) -> Result<()> {
        self.with_pending_body(|body| {
            if body.bloom_filter_change.is_some() {
                return Err(Error::InvalidArgument(
                    "bloom filter change already set".into(),
                ));
            }
            body.bloom_filter_change = Some(change);
            Ok(())
        })
    }

    /// Only a conversion to the columnar encoding can be requested.
    pub fn set_storage_encoding(&self, encoding: StorageEncoding) -> Result<()> {
        if encoding != StorageEncoding::Column {
            return Err(Error::InvalidArgument(format!(
                "storage encoding can only be changed to column, got {:?}",
                encoding
            )));
        }
        self.with_pending_body(|body| {
            if body.convert_to_columnar {
                return Err(Error::InvalidArgument(
                    "storage encoding change already set".into(),
                ));
            }
            body.convert_to_columnar = true;
            Ok(())
        })
    }

    // === Accessors ===

    pub fn db_id(&self) -> i64 {
        self.db_id
    }

    pub fn table_id(&self) -> i64 {
        self.table_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn create_time(&self) -> i64 {
        self.create_time
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn transaction_id(&self) -> i64 {
        self.lock().transaction_id
    }

    pub fn finished_time(&self) -> i64 {
        self.lock().finished_time
    }

    pub fn cancel_msg(&self) -> String {
        self.lock().cancel_msg.clone()
    }

    pub fn is_retired(&self) -> bool {
        matches!(self.lock().body, JobBody::Retired)
    }

    fn read_body<T>(&self, default: T, f: impl FnOnce(&ChangeSet) -> T) -> T {
        match &self.lock().body {
            JobBody::Live(body) => f(body),
            JobBody::Retired => default,
        }
    }

    pub fn changed_index_ids(&self) -> Vec<i64> {
        self.read_body(Vec::new(), |b| b.changed_schema.keys().copied().collect())
    }

    pub fn changed_schema(&self, index_id: i64) -> Option<Vec<Column>> {
        self.read_body(None, |b| b.changed_schema.get(&index_id).cloned())
    }

    pub fn schema_info(&self, index_id: i64) -> Option<SchemaInfo> {
        self.read_body(None, |b| b.schema_info.get(&index_id).copied())
    }

    pub fn schema_version_by_index(&self, index_id: i64) -> Option<i32> {
        self.schema_info(index_id).map(|i| i.schema_version)
    }

    pub fn schema_hash_by_index(&self, index_id: i64) -> Option<i32> {
        self.schema_info(index_id).map(|i| i.schema_hash)
    }

    pub fn short_key_column_count_by_index(&self, index_id: i64) -> Option<i16> {
        self.schema_info(index_id).map(|i| i.short_key_column_count)
    }

    pub fn bloom_filter_change(&self) -> Option<BloomFilterChange> {
        self.read_body(None, |b| b.bloom_filter_change.clone())
    }

    pub fn new_storage_encoding(&self) -> Option<StorageEncoding> {
        self.read_body(None, |b| b.new_storage_encoding())
    }

    /// Does `schema_hash` belong to one of this job's target schemas?
    pub fn is_schema_hash_related(&self, schema_hash: i32) -> bool {
        self.read_body(false, |b| {
            b.schema_info.values().any(|i| i.schema_hash == schema_hash)
        })
    }

    pub fn replica_deltas(&self, partition_id: i64) -> Vec<ReplicaDelta> {
        self.read_body(Vec::new(), |b| {
            b.replica_deltas
                .get(&partition_id)
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn total_replica_num(&self, index_id: i64) -> usize {
        self.read_body(0, |b| b.tracker.total_replicas(index_id))
    }

    pub fn finished_replica_num(&self, index_id: i64) -> usize {
        self.read_body(0, |b| b.tracker.finished_replicas(index_id))
    }

    pub fn unfinished_replica_count(&self) -> usize {
        self.read_body(0, |b| b.tracker.unfinished_count())
    }

    /// Drop schema maps, deltas and tracker of a terminal job.
    pub fn clear(&self) -> Result<()> {
        let mut core = self.lock();
        if !core.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "cannot retire job for table[{}] in state {}",
                self.table_id, core.state
            )));
        }
        core.body = JobBody::Retired;
        Ok(())
    }
}

impl std::fmt::Display for SchemaChangeJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.lock();
        write!(
            f,
            "SchemaChangeJob [table_name={}, state={}, db_id={}, table_id={}, transaction_id={}, create_time={}, finished_time={}]",
            self.table_name,
            core.state,
            self.db_id,
            self.table_id,
            core.transaction_id,
            self.create_time,
            core.finished_time
        )
    }
}
