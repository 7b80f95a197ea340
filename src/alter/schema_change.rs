//! Coordinator side of a schema change job
//!
//! Every operation takes the owning database lock before the job lock. Errors
//! that leave the job unable to progress (quorum loss, vanished entities,
//! broken invariants) cancel the job before they are returned.

use crate::alter::codec;
use crate::alter::context::AlterContext;
use crate::alter::delta::ReplicaDelta;
use crate::alter::job::{ChangeSet, JobBody, JobCore, JobState, SchemaChangeJob};
use crate::alter::progress::ProgressTracker;
use crate::catalog::{
    IndexState, InvertedIndex, OlapTable, PartitionState, ReplicaState, StorageEncoding,
    TableState, Tables,
};
use crate::common::{quorum, timestamp_now_millis, Error, Result};
use crate::journal::{JournalOp, CURRENT_META_VERSION};
use crate::task::{
    AgentTask, ClearAlterPayload, SchemaChangePayload, TabletReport, TaskQueue, TaskType,
};
use std::sync::Arc;

/// Outcome of one convergence poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    /// Job is not RUNNING, nothing was done
    NotRunning,
    /// Some replica is still converting
    Pending,
    /// All replicas converged and the new schema is live; job is FINISHING
    Committed,
}

/// Outcome of one clear handshake poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearStatus {
    Pending,
    Done,
}

struct TaskPlan {
    tasks: Vec<Arc<AgentTask>>,
    tracker: ProgressTracker,
}

fn table_mut(tables: &mut Tables, table_id: i64) -> Result<&mut OlapTable> {
    tables
        .get_mut(&table_id)
        .ok_or_else(|| Error::NotFound(format!("table[{}]", table_id)))
}

impl SchemaChangeJob {
    /// Move the table into SCHEMA_CHANGE and record the job in the edit log.
    ///
    /// Every changed index must have schema info and exist in every partition.
    pub fn begin(&self, ctx: &AlterContext) -> Result<()> {
        let db = ctx.db(self.db_id)?;
        let mut tables = db.write()?;
        let table = table_mut(&mut tables, self.table_id)?;
        let core = self.lock();

        if core.state != JobState::Pending {
            return Err(Error::InvalidState(format!(
                "schema change job[{}] is {}, expected PENDING",
                self.table_id, core.state
            )));
        }
        if table.state != TableState::Normal {
            return Err(Error::InvalidState(format!(
                "table[{}] is in state {:?}",
                self.table_id, table.state
            )));
        }

        let body = self.live(&core)?;
        if body.changed_schema.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "schema change job[{}] changes no index",
                self.table_id
            )));
        }
        body.check_schema_info()?;
        for index_id in body.changed_schema.keys() {
            if table.index_meta(*index_id).is_none() {
                return Err(Error::NotFound(format!(
                    "index[{}] in table[{}]",
                    index_id, self.table_id
                )));
            }
        }

        mark_schema_change(ctx.catalog.inverted_index(), table, body)?;

        let payload = codec::encode_locked(self, &core, CURRENT_META_VERSION)?;
        ctx.log(JournalOp::StartSchemaChange, &payload)?;
        tracing::info!(
            "schema change job[{}] started on table {}, {} changed indices",
            self.table_id,
            self.table_name,
            body.changed_schema.len()
        );
        Ok(())
    }

    /// Build one migration task per SCHEMA_CHANGE replica and hand them to the
    /// executor. PENDING → RUNNING on success.
    ///
    /// A tablet below quorum cancels the job. A task registration conflict
    /// rolls back the batch and leaves the job PENDING.
    pub fn send_tasks(&self, ctx: &AlterContext) -> Result<()> {
        let db = ctx.db(self.db_id)?;
        let mut tables = db.write()?;
        let mut core = self.lock();

        if core.state != JobState::Pending {
            return Err(Error::InvalidState(format!(
                "schema change job[{}] is {}, tasks are only sent while PENDING",
                self.table_id, core.state
            )));
        }

        let Some(table) = tables.get_mut(&self.table_id) else {
            let err = Error::NotFound(format!("table[{}]", self.table_id));
            return self.cancel_on_fatal(ctx, &mut core, None, Err(err));
        };

        let plan = match self.live(&core) {
            Ok(body) => plan_tasks(self.db_id, table, body),
            Err(e) => Err(e),
        };
        let plan = self.cancel_on_fatal(ctx, &mut core, Some(table), plan)?;

        let mut registered: Vec<&Arc<AgentTask>> = Vec::with_capacity(plan.tasks.len());
        for task in &plan.tasks {
            if !ctx.task_queue.add_task(task.clone()) {
                rollback(&ctx.task_queue, registered.iter().copied());
                tracing::warn!(
                    "schema change job[{}]: task for tablet {} on backend {} already queued, rolled back {} tasks",
                    self.table_id,
                    task.tablet_id(),
                    task.backend_id(),
                    registered.len()
                );
                return Err(Error::DispatchFailure(format!(
                    "conflicting task for tablet {} on backend {}",
                    task.tablet_id(),
                    task.backend_id()
                )));
            }
            registered.push(task);
        }

        let task_count = plan.tasks.len();
        self.live_mut(&mut core)?.tracker = plan.tracker;
        ctx.executor.submit(plan.tasks);
        core.set_state(JobState::Running)?;

        tracing::info!(
            "schema change job[{}] sent {} tasks",
            self.table_id,
            task_count
        );
        Ok(())
    }

    /// Apply a backend-confirmed conversion result.
    ///
    /// A report whose schema hash differs from the task's is stale and has no
    /// effect. Marking an already finished replica is a no-op.
    pub fn handle_finished_replica(
        &self,
        ctx: &AlterContext,
        task: &AgentTask,
        report: &TabletReport,
    ) -> Result<()> {
        let payload = task.as_schema_change()?;

        if report.schema_hash != payload.new_schema_hash {
            tracing::warn!(
                "stale report for tablet {} from backend {}: schema hash {} != {}",
                payload.tablet_id,
                task.backend_id(),
                report.schema_hash,
                payload.new_schema_hash
            );
            return Err(Error::StaleReport {
                tablet_id: payload.tablet_id,
                reported: report.schema_hash,
                expected: payload.new_schema_hash,
            });
        }
        if report.tablet_id != payload.tablet_id {
            return Err(Error::InvalidArgument(format!(
                "report for tablet {} answers task for tablet {}",
                report.tablet_id, payload.tablet_id
            )));
        }
        if payload.table_id != self.table_id {
            return Err(Error::InvalidArgument(format!(
                "task for table[{}] routed to job of table[{}]",
                payload.table_id, self.table_id
            )));
        }

        let db = ctx.db(payload.db_id)?;
        {
            let mut tables = db.write()?;
            let table = table_mut(&mut tables, payload.table_id)?;
            let partition = table.partition_mut(payload.partition_id).ok_or_else(|| {
                Error::NotFound(format!("partition[{}]", payload.partition_id))
            })?;
            if partition.state != PartitionState::SchemaChange {
                return Err(Error::InvalidState(format!(
                    "partition[{}] is not under schema change",
                    payload.partition_id
                )));
            }
            let index = partition
                .index_mut(payload.index_id)
                .ok_or_else(|| Error::NotFound(format!("index[{}]", payload.index_id)))?;
            if index.state != IndexState::SchemaChange {
                return Err(Error::InvalidState(format!(
                    "index[{}] is not under schema change",
                    payload.index_id
                )));
            }
            let tablet = index
                .tablet_mut(payload.tablet_id)
                .ok_or_else(|| Error::NotFound(format!("tablet[{}]", payload.tablet_id)))?;
            let replica = tablet
                .replica_by_id_mut(payload.replica_id)
                .ok_or_else(|| Error::NotFound(format!("replica[{}]", payload.replica_id)))?;

            // no monotonicity check: the job is the only writer while converting
            replica.update_info(
                report.version,
                report.version_hash,
                report.data_size,
                report.row_count,
            );
        }

        ctx.catalog.backends().update_report_version(
            task.backend_id(),
            report.report_version,
            payload.db_id,
        );

        let mut core = self.lock();
        let allow_index_scan = ctx.config.legacy_report_index_lookup;
        let body = self.live_mut(&mut core)?;
        if body
            .tracker
            .mark_finished(Some(payload.index_id), payload.replica_id, allow_index_scan)
        {
            tracing::info!(
                "finished schema change replica[{}], index[{}], tablet[{}], backend[{}]",
                payload.replica_id,
                payload.index_id,
                payload.tablet_id,
                task.backend_id()
            );
        } else {
            tracing::debug!(
                "replica[{}] was already finished",
                payload.replica_id
            );
        }
        Ok(())
    }

    /// Recompute replica health and commit once every changed index converged.
    pub fn try_finish_job(&self, ctx: &AlterContext) -> Result<FinishStatus> {
        let db = ctx.db(self.db_id)?;
        let mut tables = db.write()?;
        let mut core = self.lock();

        if core.state != JobState::Running {
            tracing::debug!("schema change job[{}] is not running", self.table_id);
            return Ok(FinishStatus::NotRunning);
        }

        let Some(table) = tables.get_mut(&self.table_id) else {
            let err = Error::NotFound(format!("table[{}]", self.table_id));
            return self.cancel_on_fatal(ctx, &mut core, None, Err(err));
        };

        let result = self.poll_locked(ctx, table, &mut core);
        self.cancel_on_fatal(ctx, &mut core, Some(table), result)
    }

    fn poll_locked(
        &self,
        ctx: &AlterContext,
        table: &mut OlapTable,
        core: &mut JobCore,
    ) -> Result<FinishStatus> {
        {
            let body = self.live_mut(core)?;
            if !converge(ctx, table, body)? {
                return Ok(FinishStatus::Pending);
            }
            validate_commit(table, body)?;
            commit_replicas(ctx, table, body);
            apply_schema_swap(table, body);
        }

        core.set_state(JobState::Finishing)?;
        core.finished_time = timestamp_now_millis();
        core.transaction_id = ctx.catalog.next_transaction_id();

        let payload = codec::encode_locked(self, core, CURRENT_META_VERSION)?;
        ctx.log(JournalOp::FinishingSchemaChange, &payload)?;
        tracing::info!(
            "schema change job[{}] committed, transaction id {}",
            self.table_id,
            core.transaction_id
        );
        Ok(FinishStatus::Committed)
    }

    /// Drive the clear handshake of a FINISHING job.
    ///
    /// Dispatches one clear task per replica of every changed index, naming the
    /// superseded schema hash, and reports `Done` once every task of the batch
    /// has been marked finished. A batch with unfinished tasks is dequeued and
    /// sent again as a fresh batch.
    pub fn check_or_resend_clear_tasks(&self, ctx: &AlterContext) -> Result<ClearStatus> {
        let db = ctx.db(self.db_id)?;
        let tables = db.read()?;
        let mut core = self.lock();

        if core.state != JobState::Finishing {
            return Err(Error::InvalidState(format!(
                "schema change job[{}] is {}, clear tasks need FINISHING",
                self.table_id, core.state
            )));
        }

        let body = self.live_mut(&mut core)?;
        if let Some(batch) = &body.clear_batch {
            rollback(&ctx.task_queue, batch.iter());
            let unfinished = batch.iter().filter(|t| !t.is_finished()).count();
            if unfinished == 0 {
                return Ok(ClearStatus::Done);
            }
            tracing::info!(
                "schema change job[{}]: {}/{} clear tasks unfinished, resending",
                self.table_id,
                unfinished,
                batch.len()
            );
        }
        body.clear_batch = None;

        let table = tables
            .get(&self.table_id)
            .ok_or_else(|| Error::NotFound(format!("table[{}]", self.table_id)))?;
        let inverted = ctx.catalog.inverted_index();

        let mut batch: Vec<Arc<AgentTask>> = Vec::new();
        for partition in table.partitions() {
            for index_id in body.changed_schema.keys() {
                let Some(index) = partition.index(*index_id) else {
                    tracing::warn!(
                        "index[{}] does not exist in partition[{}]",
                        index_id,
                        partition.id
                    );
                    continue;
                };
                let Some(old_hash) = inverted.schema_hashes(partition.id, *index_id).staged
                else {
                    continue;
                };
                for tablet in &index.tablets {
                    for replica in &tablet.replicas {
                        let task = Arc::new(AgentTask::clear_alter(
                            replica.backend_id,
                            ClearAlterPayload {
                                db_id: self.db_id,
                                table_id: self.table_id,
                                partition_id: partition.id,
                                index_id: *index_id,
                                tablet_id: tablet.id,
                                schema_hash: old_hash,
                            },
                        ));
                        if !ctx.task_queue.add_task(task.clone()) {
                            rollback(&ctx.task_queue, batch.iter());
                            tracing::warn!(
                                "schema change job[{}]: clear task for tablet {} on backend {} already queued",
                                self.table_id,
                                tablet.id,
                                replica.backend_id
                            );
                            return Err(Error::DispatchFailure(format!(
                                "conflicting clear task for tablet {} on backend {}",
                                tablet.id, replica.backend_id
                            )));
                        }
                        batch.push(task);
                    }
                }
            }
        }

        tracing::info!(
            "schema change job[{}] sending {} clear tasks",
            self.table_id,
            batch.len()
        );
        ctx.executor.submit(batch.clone());
        body.clear_batch = Some(batch);
        Ok(ClearStatus::Pending)
    }

    /// FINISHING → FINISHED; drops the superseded schema hashes.
    pub fn finish(&self, ctx: &AlterContext) -> Result<()> {
        let db = ctx.db(self.db_id)?;
        let tables = db.read()?;
        let mut core = self.lock();

        if core.state != JobState::Finishing {
            return Err(Error::InvalidState(format!(
                "schema change job[{}] is {}, only FINISHING jobs finish",
                self.table_id, core.state
            )));
        }
        core.set_state(JobState::Finished)?;

        let index_ids: Vec<i64> = self.live(&core)?.changed_schema.keys().copied().collect();
        match tables.get(&self.table_id) {
            Some(table) => {
                delete_all_table_history_schema(ctx.catalog.inverted_index(), table, &index_ids)
            }
            None => tracing::warn!(
                "table[{}] does not exist in db[{}]",
                self.table_id,
                self.db_id
            ),
        }

        let payload = codec::encode_locked(self, &core, CURRENT_META_VERSION)?;
        ctx.log(JournalOp::FinishSchemaChange, &payload)?;
        tracing::info!("schema change job[{}] finished", self.table_id);
        Ok(())
    }

    /// Cancel a non-terminal job. The caller must hold the database writer lock
    /// and pass the table if it still exists.
    pub fn cancel(
        &self,
        ctx: &AlterContext,
        table: Option<&mut OlapTable>,
        msg: &str,
    ) -> Result<()> {
        let mut core = self.lock();
        self.cancel_locked(ctx, &mut core, table, msg)
    }

    fn cancel_locked(
        &self,
        ctx: &AlterContext,
        core: &mut JobCore,
        table: Option<&mut OlapTable>,
        msg: &str,
    ) -> Result<()> {
        if core.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "schema change job[{}] is already {}",
                self.table_id, core.state
            )));
        }

        let committed = core.state == JobState::Finishing;
        if let JobBody::Live(body) = &mut core.body {
            if let Some(batch) = body.clear_batch.take() {
                rollback(&ctx.task_queue, batch.iter());
            }
        }

        if let Some(table) = table {
            let index_ids: Vec<i64> = match &core.body {
                JobBody::Live(body) => body.changed_schema.keys().copied().collect(),
                JobBody::Retired => Vec::new(),
            };
            let inverted = ctx.catalog.inverted_index();
            revert_schema_change(inverted, Some(&*ctx.task_queue), table, &index_ids);
            // the old tablets were never cleared
            if committed {
                delete_all_table_history_schema(inverted, table, &index_ids);
            }
        }

        core.set_state(JobState::Cancelled)?;
        core.cancel_msg = msg.to_string();
        core.finished_time = timestamp_now_millis();

        let payload = codec::encode_locked(self, core, CURRENT_META_VERSION)?;
        ctx.log(JournalOp::CancelSchemaChange, &payload)?;
        tracing::info!("schema change job[{}] cancelled: {}", self.table_id, msg);
        Ok(())
    }

    fn cancel_on_fatal<T>(
        &self,
        ctx: &AlterContext,
        core: &mut JobCore,
        table: Option<&mut OlapTable>,
        result: Result<T>,
    ) -> Result<T> {
        match result {
            Err(e) if e.is_fatal_to_job() => {
                let msg = format!("schema change job[{}] cancelled: {}", self.table_id, e);
                tracing::warn!("{}", msg);
                if let Err(cancel_err) = self.cancel_locked(ctx, core, table, &msg) {
                    tracing::error!(
                        "failed to cancel schema change job[{}]: {}",
                        self.table_id,
                        cancel_err
                    );
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Forget a replica dropped out from under a running job.
    ///
    /// Without `index_id` the owning index is found by scanning, if the legacy
    /// lookup is enabled.
    pub fn remove_replica_related_task(
        &self,
        ctx: &AlterContext,
        index_id: Option<i64>,
        tablet_id: i64,
        replica_id: i64,
        backend_id: i64,
    ) -> Result<()> {
        let mut core = self.lock();
        let allow_index_scan = ctx.config.legacy_report_index_lookup;
        let body = self.live_mut(&mut core)?;
        body.tracker.mark_finished(index_id, replica_id, allow_index_scan);
        body.tracker.evict(backend_id, replica_id);
        ctx.task_queue.remove_task(backend_id, TaskType::SchemaChange, tablet_id);
        Ok(())
    }
}

fn rollback<'a>(queue: &TaskQueue, tasks: impl Iterator<Item = &'a Arc<AgentTask>>) {
    for task in tasks {
        queue.remove_task(task.backend_id(), task.task_type(), task.signature());
    }
}

fn plan_tasks(db_id: i64, table: &OlapTable, body: &ChangeSet) -> Result<TaskPlan> {
    let mut tasks = Vec::new();
    let mut tracker = ProgressTracker::new();

    let bloom_filter = match &body.bloom_filter_change {
        Some(change) => change.target().cloned(),
        None => table.bloom_filter.clone(),
    };

    for partition in table.partitions() {
        let quorum = quorum(table.replication_num(partition.id));
        for (index_id, columns) in &body.changed_schema {
            let info = body.schema_info.get(index_id).ok_or_else(|| {
                Error::InvariantViolation(format!("index[{}] has no schema info", index_id))
            })?;
            let meta = table
                .index_meta(*index_id)
                .ok_or_else(|| Error::NotFound(format!("schema of index[{}]", index_id)))?;
            let index = partition.index(*index_id).ok_or_else(|| {
                Error::NotFound(format!(
                    "index[{}] in partition[{}]",
                    index_id, partition.id
                ))
            })?;
            let storage_encoding: StorageEncoding = body
                .new_storage_encoding()
                .unwrap_or(meta.storage_encoding);

            for tablet in &index.tablets {
                let mut eligible = 0;
                for replica in &tablet.replicas {
                    if replica.state != ReplicaState::SchemaChange {
                        continue;
                    }
                    tasks.push(Arc::new(AgentTask::schema_change(
                        replica.backend_id,
                        SchemaChangePayload {
                            db_id,
                            table_id: table.id,
                            partition_id: partition.id,
                            index_id: *index_id,
                            tablet_id: tablet.id,
                            replica_id: replica.id,
                            columns: columns.clone(),
                            new_schema_hash: info.schema_hash,
                            base_schema_hash: meta.schema_hash,
                            short_key_column_count: info.short_key_column_count,
                            storage_encoding,
                            bloom_filter_columns: bloom_filter.as_ref().map(|b| b.columns.clone()),
                            bloom_filter_fpp: bloom_filter
                                .as_ref()
                                .map_or(0.0, |b| b.false_positive_probability),
                            keys_type: table.keys_type,
                        },
                    )));
                    tracker.add_replica(*index_id, replica.id, replica.backend_id)?;
                    eligible += 1;
                }

                if eligible < quorum {
                    tracing::warn!(
                        "tablet {} has {} replicas under schema change, quorum is {}",
                        tablet.id,
                        eligible,
                        quorum
                    );
                    return Err(Error::QuorumViolation {
                        tablet_id: tablet.id,
                        healthy: eligible,
                        quorum,
                    });
                }
            }
        }
    }

    Ok(TaskPlan { tasks, tracker })
}

/// Health scan and convergence check. Returns true once every changed index
/// of every partition is finished.
fn converge(ctx: &AlterContext, table: &OlapTable, body: &mut ChangeSet) -> Result<bool> {
    let backends = ctx.catalog.backends();
    let allow_index_scan = ctx.config.legacy_report_index_lookup;
    let mut all_finished = true;

    for partition in table.partitions() {
        let quorum = quorum(table.replication_num(partition.id));
        for index_id in body.changed_schema.keys() {
            let index = partition.index(*index_id).ok_or_else(|| {
                Error::NotFound(format!(
                    "index[{}] in partition[{}]",
                    index_id, partition.id
                ))
            })?;

            for tablet in &index.tablets {
                let mut healthy = 0;
                let mut error_replicas = Vec::new();
                for replica in &tablet.replicas {
                    if replica.state != ReplicaState::SchemaChange {
                        continue;
                    }
                    if !body.tracker.is_tracked(replica.backend_id, replica.id) {
                        tracing::warn!(
                            "dead replica[{}] of tablet {}, skipped",
                            replica.id,
                            tablet.id
                        );
                        continue;
                    }
                    if !backends.is_alive(replica.backend_id) {
                        tracing::warn!(
                            "backend {} is down, replica[{}] of tablet {} is bad",
                            replica.backend_id,
                            replica.id,
                            tablet.id
                        );
                        error_replicas.push((replica.id, replica.backend_id));
                        continue;
                    }
                    if replica.last_failed_version > 0 {
                        continue;
                    }
                    healthy += 1;
                }

                if healthy < quorum {
                    tracing::warn!(
                        "tablet {} has {} healthy replicas, quorum is {}",
                        tablet.id,
                        healthy,
                        quorum
                    );
                    return Err(Error::QuorumViolation {
                        tablet_id: tablet.id,
                        healthy,
                        quorum,
                    });
                }

                for (replica_id, backend_id) in error_replicas {
                    body.tracker.mark_finished(Some(*index_id), replica_id, allow_index_scan);
                    body.tracker.evict(backend_id, replica_id);
                    ctx.task_queue.remove_task(backend_id, TaskType::SchemaChange, tablet.id);
                }
            }

            if body.tracker.is_partition_index_finished(partition.id, *index_id) {
                continue;
            }
            if !body.tracker.is_index_finished(*index_id) {
                tracing::debug!(
                    "index[{}] has unfinished replicas: {}/{}",
                    index_id,
                    body.tracker.finished_replicas(*index_id),
                    body.tracker.total_replicas(*index_id)
                );
                all_finished = false;
                continue;
            }

            if index.state != IndexState::SchemaChange {
                return Err(Error::InvariantViolation(format!(
                    "finished index[{}] is in state {}",
                    index_id, index.state
                )));
            }
            // tasks can linger if a backend went down mid-conversion
            for tablet in &index.tablets {
                for replica in &tablet.replicas {
                    ctx.task_queue
                        .remove_task(replica.backend_id, TaskType::SchemaChange, tablet.id);
                }
            }
            body.tracker.mark_partition_index_finished(partition.id, *index_id);
            tracing::debug!(
                "schema change of index[{}] finished in partition[{}]",
                index_id,
                partition.id
            );
        }
    }

    Ok(all_finished)
}

/// Checked before any commit mutation so a failing commit leaves nothing behind.
fn validate_commit(table: &OlapTable, body: &ChangeSet) -> Result<()> {
    body.check_schema_info()?;
    if body.tracker.unfinished_count() != 0 {
        return Err(Error::InvariantViolation(format!(
            "{} replicas still unfinished at commit",
            body.tracker.unfinished_count()
        )));
    }
    if table.state != TableState::SchemaChange {
        return Err(Error::InvariantViolation(format!(
            "table[{}] is in state {:?} at commit",
            table.id, table.state
        )));
    }
    for index_id in body.changed_schema.keys() {
        if table.index_meta(*index_id).is_none() {
            return Err(Error::NotFound(format!("schema of index[{}]", index_id)));
        }
    }
    for partition in table.partitions() {
        if partition.state != PartitionState::SchemaChange {
            return Err(Error::InvariantViolation(format!(
                "partition[{}] is in state {:?} at commit",
                partition.id, partition.state
            )));
        }
        for index_id in body.changed_schema.keys() {
            let index = partition.index(*index_id).ok_or_else(|| {
                Error::NotFound(format!(
                    "index[{}] in partition[{}]",
                    index_id, partition.id
                ))
            })?;
            if index.state != IndexState::SchemaChange {
                return Err(Error::InvariantViolation(format!(
                    "index[{}] is in state {} at commit",
                    index_id, index.state
                )));
            }
        }
    }
    Ok(())
}

/// Flip converted replicas to NORMAL, drop the rest, and record a delta for each.
fn commit_replicas(ctx: &AlterContext, table: &mut OlapTable, body: &mut ChangeSet) {
    let inverted = ctx.catalog.inverted_index();
    let index_ids: Vec<i64> = body.changed_schema.keys().copied().collect();

    for partition in table.partitions_mut() {
        let partition_id = partition.id;
        for index_id in &index_ids {
            let Some(index) = partition.index_mut(*index_id) else {
                continue;
            };
            for tablet in &mut index.tablets {
                let tablet_id = tablet.id;
                let deltas = body.replica_deltas.entry(partition_id).or_default();
                let mut unconverted = Vec::new();
                for replica in &mut tablet.replicas {
                    ctx.task_queue
                        .remove_task(replica.backend_id, TaskType::SchemaChange, tablet_id);
                    if replica.state == ReplicaState::SchemaChange
                        && body.tracker.is_tracked(replica.backend_id, replica.id)
                    {
                        replica.state = ReplicaState::Normal;
                        deltas.push(ReplicaDelta::updated(
                            partition_id,
                            *index_id,
                            tablet_id,
                            replica,
                        ));
                    } else {
                        deltas.push(ReplicaDelta::deleted(
                            partition_id,
                            *index_id,
                            tablet_id,
                            replica.backend_id,
                        ));
                        unconverted.push(replica.backend_id);
                    }
                }
                for backend_id in unconverted {
                    tracing::warn!(
                        "dropping unconverted replica of tablet {} on backend {}",
                        tablet_id,
                        backend_id
                    );
                    tablet.delete_replica_by_backend(backend_id);
                }
            }
            inverted.update_to_new_schema_hash(partition_id, *index_id);
            index.state = IndexState::Normal;
        }
        partition.state = PartitionState::Normal;
    }
    table.state = TableState::Normal;
}

/// Put every changed index (with its non-CLONE replicas), every partition and
/// the table into SCHEMA_CHANGE, and stage the new schema hashes.
pub(crate) fn mark_schema_change(
    inverted: &InvertedIndex,
    table: &mut OlapTable,
    body: &ChangeSet,
) -> Result<()> {
    for partition in table.partitions() {
        for index_id in body.schema_info.keys() {
            if partition.index(*index_id).is_none() {
                return Err(Error::NotFound(format!(
                    "index[{}] in partition[{}]",
                    index_id, partition.id
                )));
            }
        }
    }

    for partition in table.partitions_mut() {
        let partition_id = partition.id;
        for (index_id, info) in &body.schema_info {
            let Some(index) = partition.index_mut(*index_id) else {
                continue;
            };
            for tablet in &mut index.tablets {
                for replica in &mut tablet.replicas {
                    // a cloning replica still carries the old schema and is dropped at commit
                    if replica.state == ReplicaState::Clone {
                        continue;
                    }
                    replica.state = ReplicaState::SchemaChange;
                }
            }
            index.state = IndexState::SchemaChange;
            inverted.set_new_schema_hash(partition_id, *index_id, info.schema_hash);
        }
        partition.state = PartitionState::SchemaChange;
    }
    table.state = TableState::SchemaChange;
    Ok(())
}

/// Swap in the target schemas, storage encoding and bloom filter settings.
pub(crate) fn apply_schema_swap(table: &mut OlapTable, body: &ChangeSet) {
    let new_encoding = body.new_storage_encoding();
    for (index_id, columns) in &body.changed_schema {
        if let Some(info) = body.schema_info.get(index_id) {
            table.set_index_schema_info(
                *index_id,
                columns.clone(),
                info.schema_version,
                info.schema_hash,
                info.short_key_column_count,
            );
        }
        if let Some(encoding) = new_encoding {
            table.set_index_storage_encoding(*index_id, encoding);
        }
    }

    if let Some(columns) = body.changed_schema.get(&table.base_index_id()) {
        table.set_new_base_schema(columns.clone());
    }

    if let Some(change) = &body.bloom_filter_change {
        table.set_bloom_filter_info(change.target().cloned());
    }
}

/// Undo `mark_schema_change` for whatever the job actually advanced.
///
/// Partitions and indices not in SCHEMA_CHANGE are skipped; CLONE and NORMAL
/// replicas are left alone.
pub(crate) fn revert_schema_change(
    inverted: &InvertedIndex,
    task_queue: Option<&TaskQueue>,
    table: &mut OlapTable,
    index_ids: &[i64],
) {
    for partition in table.partitions_mut() {
        if partition.state == PartitionState::Normal {
            continue;
        }
        let partition_id = partition.id;
        for index_id in index_ids {
            let Some(index) = partition.index_mut(*index_id) else {
                continue;
            };
            if index.state != IndexState::SchemaChange {
                continue;
            }
            for tablet in &mut index.tablets {
                let tablet_id = tablet.id;
                for replica in &mut tablet.replicas {
                    if replica.state != ReplicaState::SchemaChange {
                        continue;
                    }
                    replica.state = ReplicaState::Normal;
                    if let Some(queue) = task_queue {
                        queue.remove_task(replica.backend_id, TaskType::SchemaChange, tablet_id);
                    }
                }
            }
            inverted.delete_new_schema_hash(partition_id, *index_id);
            index.state = IndexState::Normal;
        }
        partition.state = PartitionState::Normal;
    }
    if table.state == TableState::SchemaChange {
        table.state = TableState::Normal;
    }
}

/// Forget the superseded schema hash of every changed index. The backends drop
/// the data themselves when their next report no longer matches.
pub(crate) fn delete_all_table_history_schema(
    inverted: &InvertedIndex,
    table: &OlapTable,
    index_ids: &[i64],
) {
    for partition in table.partitions() {
        for index_id in index_ids {
            if partition.index(*index_id).is_none() {
                tracing::warn!(
                    "index[{}] does not exist in partition[{}]",
                    index_id,
                    partition.id
                );
                continue;
            }
            inverted.delete_new_schema_hash(partition.id, *index_id);
            tracing::info!(
                "deleted old schema of table[{}], partition[{}], index[{}]",
                table.id,
                partition.id,
                index_id
            );
        }
    }
}
