//! Explicit metadata-store handle passed to every job operation

use crate::catalog::{Catalog, Database};
use crate::common::{AlterConfig, Error, Result};
use crate::journal::{EditLog, JournalOp};
use crate::task::{TaskExecutor, TaskQueue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct AlterContext {
    pub catalog: Arc<Catalog>,
    pub task_queue: Arc<TaskQueue>,
    pub executor: Arc<dyn TaskExecutor>,
    pub edit_log: Arc<dyn EditLog>,
    pub config: AlterConfig,
    /// Only the elected coordinator dispatches tasks and reports real progress.
    is_coordinator: AtomicBool,
}

impl AlterContext {
    pub fn new(
        catalog: Arc<Catalog>,
        task_queue: Arc<TaskQueue>,
        executor: Arc<dyn TaskExecutor>,
        edit_log: Arc<dyn EditLog>,
        config: AlterConfig,
    ) -> Self {
        Self {
            catalog,
            task_queue,
            executor,
            edit_log,
            config,
            is_coordinator: AtomicBool::new(true),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.is_coordinator.load(Ordering::SeqCst)
    }

    pub fn set_coordinator(&self, is_coordinator: bool) {
        self.is_coordinator.store(is_coordinator, Ordering::SeqCst);
    }

    pub(crate) fn db(&self, db_id: i64) -> Result<Arc<Database>> {
        self.catalog
            .get_db(db_id)
            .ok_or_else(|| Error::NotFound(format!("database[{}]", db_id)))
    }

    pub(crate) fn log(&self, op: JournalOp, payload: &[u8]) -> Result<u64> {
        let sequence = self.edit_log.append(op, payload)?;
        tracing::debug!("logged {} at sequence {}", op, sequence);
        Ok(sequence)
    }
}

impl std::fmt::Debug for AlterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlterContext")
            .field("config", &self.config)
            .field("is_coordinator", &self.is_coordinator())
            .finish()
    }
}
