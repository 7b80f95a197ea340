//! Owner of every schema change job of the cluster
//!
//! The coordinator drives active jobs from a periodic poll; followers only
//! replay log records. Terminal jobs move to the history list and are retired
//! once the retention period has passed.

use crate::alter::codec;
use crate::alter::context::AlterContext;
use crate::alter::job::{JobState, SchemaChangeJob};
use crate::alter::job_info::JobInfoRow;
use crate::alter::schema_change::ClearStatus;
use crate::common::{timestamp_now_millis, Error, Result};
use crate::journal::{FileEditLog, JournalEntry, JournalOp};
use crate::task::{AgentTask, TabletReport};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::MissedTickBehavior;

pub struct AlterHandler {
    ctx: Arc<AlterContext>,
    /// table id → job
    active: Mutex<BTreeMap<i64, Arc<SchemaChangeJob>>>,
    history: Mutex<Vec<Arc<SchemaChangeJob>>>,
}

impl AlterHandler {
    pub fn new(ctx: Arc<AlterContext>) -> Self {
        Self {
            ctx,
            active: Mutex::new(BTreeMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<AlterContext> {
        &self.ctx
    }

    /// Start a new job. A table runs at most one schema change at a time.
    pub fn submit_job(&self, job: SchemaChangeJob) -> Result<Arc<SchemaChangeJob>> {
        let table_id = job.table_id();
        if self.active_job(table_id).is_some() {
            return Err(Error::InvalidState(format!(
                "table[{}] already has a running schema change",
                table_id
            )));
        }

        job.begin(&self.ctx)?;
        let job = Arc::new(job);
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table_id, job.clone());
        Ok(job)
    }

    pub fn active_job(&self, table_id: i64) -> Option<Arc<SchemaChangeJob>> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.get(&table_id).cloned()
    }

    /// Active job of the table, else its most recent historical one
    pub fn get_job(&self, table_id: i64) -> Option<Arc<SchemaChangeJob>> {
        self.active_job(table_id).or_else(|| {
            let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history
                .iter()
                .rev()
                .find(|j| j.table_id() == table_id)
                .cloned()
        })
    }

    pub fn active_jobs(&self) -> Vec<Arc<SchemaChangeJob>> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.values().cloned().collect()
    }

    pub fn history_jobs(&self) -> Vec<Arc<SchemaChangeJob>> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// User-requested cancellation of the table's active job
    pub fn cancel_job(&self, table_id: i64, msg: &str) -> Result<()> {
        let job = self
            .active_job(table_id)
            .ok_or_else(|| Error::NotFound(format!("schema change job of table[{}]", table_id)))?;
        self.cancel_with_table_lock(&job, msg)?;
        self.archive(table_id);
        Ok(())
    }

    fn cancel_with_table_lock(&self, job: &SchemaChangeJob, msg: &str) -> Result<()> {
        let db = self.ctx.db(job.db_id())?;
        let mut tables = db.write()?;
        job.cancel(&self.ctx, tables.get_mut(&job.table_id()), msg)
    }

    /// Route a backend's finish report to the owning job.
    pub fn handle_finished_replica(&self, task: &AgentTask, report: &TabletReport) -> Result<()> {
        let payload = task.as_schema_change()?;
        let job = self.active_job(payload.table_id).ok_or_else(|| {
            Error::NotFound(format!(
                "schema change job of table[{}]",
                payload.table_id
            ))
        })?;
        job.handle_finished_replica(&self.ctx, task, report)
    }

    /// One polling round over every active job
    pub fn run_once(&self) {
        if !self.ctx.is_coordinator() {
            return;
        }

        for job in self.active_jobs() {
            if let Err(e) = self.process(&job) {
                self.handle_failure(&job, e);
            }
        }

        self.archive_terminal();
        self.retire_expired(timestamp_now_millis());
    }

    fn process(&self, job: &SchemaChangeJob) -> Result<()> {
        match job.state() {
            JobState::Pending => job.send_tasks(&self.ctx),
            JobState::Running => job.try_finish_job(&self.ctx).map(|_| ()),
            JobState::Finishing => match job.check_or_resend_clear_tasks(&self.ctx)? {
                ClearStatus::Done => job.finish(&self.ctx),
                ClearStatus::Pending => Ok(()),
            },
            JobState::Finished | JobState::Cancelled => Ok(()),
        }
    }

    fn handle_failure(&self, job: &SchemaChangeJob, e: Error) {
        if e.is_retryable() {
            tracing::warn!(
                "schema change job[{}] will retry: {}",
                job.table_id(),
                e
            );
            return;
        }
        if e.is_fatal_to_job() && !job.state().is_terminal() {
            let msg = format!("schema change job[{}] cancelled: {}", job.table_id(), e);
            if let Err(cancel_err) = self.cancel_with_table_lock(job, &msg) {
                tracing::error!(
                    "failed to cancel schema change job[{}]: {}",
                    job.table_id(),
                    cancel_err
                );
            }
            return;
        }
        tracing::warn!("schema change job[{}]: {}", job.table_id(), e);
    }

    fn archive(&self, table_id: i64) {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&table_id);
        if let Some(job) = removed {
            self.history
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(job);
        }
    }

    fn archive_terminal(&self) {
        let terminal: Vec<i64> = self
            .active_jobs()
            .iter()
            .filter(|j| j.state().is_terminal())
            .map(|j| j.table_id())
            .collect();
        for table_id in terminal {
            self.archive(table_id);
        }
    }

    /// Retire and drop historical jobs older than the retention period.
    pub fn retire_expired(&self, now_millis: i64) -> usize {
        let retention = self.ctx.config.history_retention().as_millis() as i64;
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let before = history.len();
        history.retain(|job| {
            if now_millis - job.finished_time() <= retention {
                return true;
            }
            if let Err(e) = job.clear() {
                tracing::warn!("cannot retire schema change job[{}]: {}", job.table_id(), e);
                return true;
            }
            tracing::info!("retired schema change job[{}]", job.table_id());
            false
        });
        before - history.len()
    }

    /// Spawn the periodic poll on the current tokio runtime.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.ctx.config.poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("alter handler polling every {:?}", period);

            loop {
                ticker.tick().await;
                let handler = self.clone();
                // job operations block on catalog locks
                if let Err(e) = tokio::task::spawn_blocking(move || handler.run_once()).await {
                    tracing::error!("alter handler poll panicked: {}", e);
                }
            }
        })
    }

    /// Apply one log record on a follower (or on a restarting coordinator).
    pub fn replay(&self, entry: &JournalEntry) -> Result<()> {
        let job = codec::decode(&entry.payload, entry.meta_version)?;
        let db = self.ctx.db(job.db_id())?;
        let catalog = &self.ctx.catalog;
        catalog.observe_transaction_id(job.transaction_id());

        let table_id = job.table_id();
        match entry.op {
            JournalOp::StartSchemaChange => {
                job.replay_init_job(catalog, &db)?;
                self.active
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(table_id, Arc::new(job));
            }
            JournalOp::FinishingSchemaChange => {
                job.replay_finishing(catalog, &db)?;
                self.active
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(table_id, Arc::new(job));
            }
            JournalOp::FinishSchemaChange => {
                job.replay_finish(catalog, &db)?;
                self.replace_with_terminal(table_id, job);
            }
            JournalOp::CancelSchemaChange => {
                job.replay_cancel(catalog, &db)?;
                self.replace_with_terminal(table_id, job);
            }
        }
        tracing::debug!("replayed {} for table[{}]", entry.op, table_id);
        Ok(())
    }

    fn replace_with_terminal(&self, table_id: i64, job: SchemaChangeJob) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&table_id);
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(job));
    }

    /// Replay every record of an on-disk edit log.
    pub fn recover_from(&self, path: impl AsRef<Path>) -> Result<usize> {
        let mut applied = 0;
        FileEditLog::replay(path, |entry| {
            self.replay(&entry)?;
            applied += 1;
            Ok(())
        })?;
        tracing::info!("recovered {} alter records", applied);
        Ok(applied)
    }

    /// Status rows of every known job in a database
    pub fn job_infos(&self, db_id: i64) -> Result<Vec<JobInfoRow>> {
        let db = self.ctx.db(db_id)?;
        let mut jobs = self.history_jobs();
        jobs.extend(self.active_jobs());

        let tables = db.read()?;
        let mut rows = Vec::new();
        for job in jobs.iter().filter(|j| j.db_id() == db_id && !j.is_retired()) {
            if let Some(table) = tables.get(&job.table_id()) {
                rows.extend(job.job_info(&self.ctx, table));
            }
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for AlterHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlterHandler")
            .field("active", &self.active_jobs().len())
            .field("history", &self.history_jobs().len())
            .finish()
    }
}
