//! End-to-end lifecycle of a schema change job against an in-process catalog:
//! dispatch, report handling, convergence, commit, clear handshake, cancel.

mod common;

use common::*;
use schemashift::alter::{BloomFilterChange, ClearStatus, FinishStatus, JobState, SchemaChangeJob};
use schemashift::catalog::{
    BloomFilterInfo, IndexState, KeysType, PartitionState, ReplicaState, StorageEncoding,
    TableState,
};
use schemashift::common::NodeState;
use schemashift::journal::JournalOp;
use schemashift::task::{AgentTask, SchemaChangePayload, TaskType};
use schemashift::Error;
use std::sync::Arc;

fn start_job(h: &mut Harness) -> (SchemaChangeJob, Vec<Arc<AgentTask>>) {
    let job = h.new_job();
    job.begin(&h.ctx).unwrap();
    job.send_tasks(&h.ctx).unwrap();
    let tasks = h.drain_tasks();
    (job, tasks)
}

fn report_all(h: &Harness, job: &SchemaChangeJob, tasks: &[Arc<AgentTask>]) {
    for task in tasks {
        job.handle_finished_replica(&h.ctx, task, &report_for(task))
            .unwrap();
    }
}

fn assert_reverted(h: &Harness) {
    h.with_table(|table| {
        assert_eq!(table.state, TableState::Normal);
        for partition in table.partitions() {
            assert_eq!(partition.state, PartitionState::Normal);
            let index = partition.index(TABLE_ID).unwrap();
            assert_eq!(index.state, IndexState::Normal);
            for tablet in &index.tablets {
                assert!(tablet
                    .replicas
                    .iter()
                    .all(|r| r.state == ReplicaState::Normal));
            }
        }
        assert_eq!(table.schema_hash_by_index(TABLE_ID), Some(OLD_SCHEMA_HASH));
        assert_eq!(table.base_schema, base_schema());
    });
    let hashes = h.catalog.inverted_index().schema_hashes(PARTITION_ID, TABLE_ID);
    assert_eq!(hashes.current, Some(OLD_SCHEMA_HASH));
    assert_eq!(hashes.staged, None);
}

#[test]
fn test_begin_marks_table_under_schema_change() {
    let h = Harness::new();
    let job = h.new_job();
    job.begin(&h.ctx).unwrap();

    assert_eq!(job.state(), JobState::Pending);
    h.with_table(|table| {
        assert_eq!(table.state, TableState::SchemaChange);
        let partition = table.partition(PARTITION_ID).unwrap();
        assert_eq!(partition.state, PartitionState::SchemaChange);
        let index = partition.index(TABLE_ID).unwrap();
        assert_eq!(index.state, IndexState::SchemaChange);
        assert!(index
            .tablets
            .iter()
            .flat_map(|t| &t.replicas)
            .all(|r| r.state == ReplicaState::SchemaChange));
    });

    let hashes = h.catalog.inverted_index().schema_hashes(PARTITION_ID, TABLE_ID);
    assert_eq!(hashes.current, Some(OLD_SCHEMA_HASH));
    assert_eq!(hashes.staged, Some(NEW_SCHEMA_HASH));

    let entries = h.edit_log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].op, JournalOp::StartSchemaChange);
}

#[test]
fn test_begin_rejects_job_without_changes() {
    let h = Harness::new();
    let job = SchemaChangeJob::new(DB_ID, TABLE_ID, "orders", h.catalog.next_transaction_id());
    assert!(matches!(job.begin(&h.ctx), Err(Error::InvalidArgument(_))));
    h.with_table(|table| assert_eq!(table.state, TableState::Normal));
    assert!(h.edit_log.is_empty());
}

#[test]
fn test_converges_after_all_replicas_report() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);
    let original_txn = job.transaction_id();

    assert_eq!(job.state(), JobState::Running);
    assert_eq!(tasks.len(), 9);
    assert_eq!(h.task_queue.task_count_of(TaskType::SchemaChange), 9);
    for task in &tasks {
        let payload = task.as_schema_change().unwrap();
        assert_eq!(payload.new_schema_hash, NEW_SCHEMA_HASH);
        assert_eq!(payload.base_schema_hash, OLD_SCHEMA_HASH);
        assert_eq!(payload.columns, new_schema());
        assert_eq!(payload.storage_encoding, StorageEncoding::Row);
        assert_eq!(payload.bloom_filter_columns, None);
    }

    report_all(&h, &job, &tasks[..8]);
    assert_eq!(job.try_finish_job(&h.ctx).unwrap(), FinishStatus::Pending);
    assert_eq!(job.state(), JobState::Running);
    assert_eq!(job.finished_replica_num(TABLE_ID), 8);

    report_all(&h, &job, &tasks[8..]);
    assert_eq!(job.try_finish_job(&h.ctx).unwrap(), FinishStatus::Committed);
    assert_eq!(job.state(), JobState::Finishing);
    assert_ne!(job.transaction_id(), original_txn);
    assert!(job.finished_time() > 0);

    h.with_table(|table| {
        assert_eq!(table.state, TableState::Normal);
        assert_eq!(table.base_schema, new_schema());
        let meta = table.index_meta(TABLE_ID).unwrap();
        assert_eq!(meta.schema, new_schema());
        assert_eq!(meta.schema_hash, NEW_SCHEMA_HASH);
        assert_eq!(meta.schema_version, 1);

        let index = table.partition(PARTITION_ID).unwrap().index(TABLE_ID).unwrap();
        assert_eq!(index.state, IndexState::Normal);
        assert_eq!(index.replica_count(), 9);
        for replica in index.tablets.iter().flat_map(|t| &t.replicas) {
            assert_eq!(replica.state, ReplicaState::Normal);
            assert_eq!(replica.version, 3);
            assert_eq!(replica.data_size, 2048);
        }
    });

    let hashes = h.catalog.inverted_index().schema_hashes(PARTITION_ID, TABLE_ID);
    assert_eq!(hashes.current, Some(NEW_SCHEMA_HASH));
    assert_eq!(hashes.staged, Some(OLD_SCHEMA_HASH));
    assert_eq!(h.task_queue.task_count_of(TaskType::SchemaChange), 0);
    assert_eq!(h.catalog.backends().report_version(10), Some(7));

    let ops: Vec<JournalOp> = h.edit_log.entries().iter().map(|e| e.op).collect();
    assert_eq!(
        ops,
        vec![JournalOp::StartSchemaChange, JournalOp::FinishingSchemaChange]
    );
    assert_eq!(job.replica_deltas(PARTITION_ID).len(), 9);

    // committed jobs ignore further polls
    assert_eq!(job.try_finish_job(&h.ctx).unwrap(), FinishStatus::NotRunning);
}

#[test]
fn test_converges_across_partitions() {
    let mut h = Harness::with_partitions(&[PARTITION_ID, PARTITION_ID + 1]);
    let (job, tasks) = start_job(&mut h);
    assert_eq!(tasks.len(), 18);

    report_all(&h, &job, &tasks);
    assert_eq!(job.try_finish_job(&h.ctx).unwrap(), FinishStatus::Committed);

    for partition_id in [PARTITION_ID, PARTITION_ID + 1] {
        let hashes = h.catalog.inverted_index().schema_hashes(partition_id, TABLE_ID);
        assert_eq!(hashes.current, Some(NEW_SCHEMA_HASH));
    }
    h.with_table(|table| {
        assert!(table
            .partitions()
            .all(|p| p.state == PartitionState::Normal));
    });
}

#[test]
fn test_one_dead_backend_still_converges() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);

    h.catalog.backends().set_state(12, NodeState::Dead);
    let alive: Vec<_> = tasks
        .iter()
        .filter(|t| t.backend_id() != 12)
        .cloned()
        .collect();
    report_all(&h, &job, &alive);

    assert_eq!(job.try_finish_job(&h.ctx).unwrap(), FinishStatus::Committed);

    h.with_table(|table| {
        let index = table.partition(PARTITION_ID).unwrap().index(TABLE_ID).unwrap();
        for tablet in &index.tablets {
            assert_eq!(tablet.replicas.len(), 2);
            assert!(tablet.replicas.iter().all(|r| r.backend_id != 12));
            assert!(tablet
                .replicas
                .iter()
                .all(|r| r.state == ReplicaState::Normal));
        }
    });

    let deltas = job.replica_deltas(PARTITION_ID);
    assert_eq!(deltas.iter().filter(|d| d.is_delete()).count(), 3);
    assert_eq!(h.task_queue.task_count_of(TaskType::SchemaChange), 0);
}

#[test]
fn test_two_dead_backends_cancel_job() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);

    let survivor: Vec<_> = tasks
        .iter()
        .filter(|t| t.backend_id() == 10)
        .cloned()
        .collect();
    report_all(&h, &job, &survivor);

    h.catalog.backends().set_state(11, NodeState::Dead);
    h.catalog.backends().set_state(12, NodeState::Decommissioned);

    let err = job.try_finish_job(&h.ctx).unwrap_err();
    let first_tablet = tablet_id(PARTITION_ID, 0);
    assert!(matches!(
        err,
        Error::QuorumViolation {
            tablet_id,
            healthy: 1,
            quorum: 2
        } if tablet_id == first_tablet
    ));

    assert_eq!(job.state(), JobState::Cancelled);
    assert!(job.cancel_msg().contains(&first_tablet.to_string()));
    assert!(job.finished_time() > 0);
    assert_reverted(&h);
    assert_eq!(h.task_queue.task_count_of(TaskType::SchemaChange), 0);
    assert_eq!(
        h.edit_log.entries().last().unwrap().op,
        JournalOp::CancelSchemaChange
    );
}

#[test]
fn test_replicas_with_failed_versions_break_quorum() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);
    report_all(&h, &job, &tasks);

    let lagging_tablet = tablet_id(PARTITION_ID, 1);
    {
        let mut tables = h.db.write().unwrap();
        let tablet = tables
            .get_mut(&TABLE_ID)
            .and_then(|t| t.partition_mut(PARTITION_ID))
            .and_then(|p| p.index_mut(TABLE_ID))
            .and_then(|i| i.tablet_mut(lagging_tablet))
            .unwrap();
        for backend_id in [11, 12] {
            tablet
                .replica_by_backend_mut(backend_id)
                .unwrap()
                .last_failed_version = 5;
        }
    }

    let err = job.try_finish_job(&h.ctx).unwrap_err();
    assert!(matches!(
        err,
        Error::QuorumViolation {
            tablet_id,
            healthy: 1,
            quorum: 2
        } if tablet_id == lagging_tablet
    ));
    assert_eq!(job.state(), JobState::Cancelled);
    assert!(job.cancel_msg().contains(&lagging_tablet.to_string()));
    assert_reverted(&h);
}

#[test]
fn test_stale_report_has_no_effect() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);

    let mut report = report_for(&tasks[0]);
    report.schema_hash = OLD_SCHEMA_HASH;
    let err = job
        .handle_finished_replica(&h.ctx, &tasks[0], &report)
        .unwrap_err();
    assert!(matches!(err, Error::StaleReport { .. }));

    assert_eq!(job.finished_replica_num(TABLE_ID), 0);
    assert_eq!(job.unfinished_replica_count(), 9);
    assert_eq!(job.state(), JobState::Running);
    h.with_table(|table| {
        let payload = tasks[0].as_schema_change().unwrap();
        let index = table.partition(PARTITION_ID).unwrap().index(TABLE_ID).unwrap();
        let replica = index
            .tablet(payload.tablet_id)
            .unwrap()
            .replica_by_id(payload.replica_id)
            .unwrap();
        assert_eq!(replica.version, 2);
    });
}

#[test]
fn test_duplicate_report_is_idempotent() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);

    let report = report_for(&tasks[0]);
    job.handle_finished_replica(&h.ctx, &tasks[0], &report)
        .unwrap();
    job.handle_finished_replica(&h.ctx, &tasks[0], &report)
        .unwrap();

    assert_eq!(job.finished_replica_num(TABLE_ID), 1);
    assert_eq!(job.unfinished_replica_count(), 8);
}

#[test]
fn test_dispatch_conflict_rolls_back() {
    let mut h = Harness::new();
    let job = h.new_job();
    job.begin(&h.ctx).unwrap();

    let last_tablet = tablet_id(PARTITION_ID, TABLETS_PER_PARTITION - 1);
    let conflicting = Arc::new(AgentTask::schema_change(
        12,
        SchemaChangePayload {
            db_id: DB_ID,
            table_id: 999,
            partition_id: PARTITION_ID,
            index_id: TABLE_ID,
            tablet_id: last_tablet,
            replica_id: replica_id(last_tablet, 12),
            columns: new_schema(),
            new_schema_hash: 4242,
            base_schema_hash: OLD_SCHEMA_HASH,
            short_key_column_count: 1,
            storage_encoding: StorageEncoding::Row,
            bloom_filter_columns: None,
            bloom_filter_fpp: 0.0,
            keys_type: KeysType::AggKeys,
        },
    ));
    assert!(h.task_queue.add_task(conflicting));

    let err = job.send_tasks(&h.ctx).unwrap_err();
    assert!(matches!(err, Error::DispatchFailure(_)));
    assert_eq!(job.state(), JobState::Pending);
    assert_eq!(h.task_queue.task_count(), 1);
    assert!(h.drain_tasks().is_empty());
    assert_eq!(job.total_replica_num(TABLE_ID), 0);

    // next poll succeeds once the conflicting task is gone
    h.task_queue
        .remove_task(12, TaskType::SchemaChange, last_tablet);
    job.send_tasks(&h.ctx).unwrap();
    assert_eq!(job.state(), JobState::Running);
    assert_eq!(h.drain_tasks().len(), 9);
}

#[test]
fn test_cloning_replicas_fail_dispatch_quorum() {
    let h = Harness::new();
    let target = tablet_id(PARTITION_ID, 1);
    {
        let mut tables = h.db.write().unwrap();
        let table = tables.get_mut(&TABLE_ID).unwrap();
        let tablet = table
            .partition_mut(PARTITION_ID)
            .unwrap()
            .index_mut(TABLE_ID)
            .unwrap()
            .tablet_mut(target)
            .unwrap();
        for backend_id in [11, 12] {
            tablet.replica_by_backend_mut(backend_id).unwrap().state = ReplicaState::Clone;
        }
    }

    let job = h.new_job();
    job.begin(&h.ctx).unwrap();
    let err = job.send_tasks(&h.ctx).unwrap_err();
    assert!(matches!(err, Error::QuorumViolation { tablet_id, .. } if tablet_id == target));
    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(h.task_queue.task_count(), 0);

    h.with_table(|table| {
        assert_eq!(table.state, TableState::Normal);
        let tablet = table
            .partition(PARTITION_ID)
            .unwrap()
            .index(TABLE_ID)
            .unwrap()
            .tablet(target)
            .unwrap();
        let clones = tablet
            .replicas
            .iter()
            .filter(|r| r.state == ReplicaState::Clone)
            .count();
        assert_eq!(clones, 2);
    });
}

#[test]
fn test_cancel_restores_state() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);
    report_all(&h, &job, &tasks[..2]);

    {
        let mut tables = h.db.write().unwrap();
        job.cancel(&h.ctx, tables.get_mut(&TABLE_ID), "user cancelled")
            .unwrap();
    }

    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(job.cancel_msg(), "user cancelled");
    assert_reverted(&h);
    assert_eq!(h.task_queue.task_count(), 0);

    let mut tables = h.db.write().unwrap();
    let again = job.cancel(&h.ctx, tables.get_mut(&TABLE_ID), "twice");
    assert!(matches!(again, Err(Error::InvalidState(_))));
}

#[test]
fn test_report_after_cancel_is_rejected() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);
    {
        let mut tables = h.db.write().unwrap();
        job.cancel(&h.ctx, tables.get_mut(&TABLE_ID), "dropped")
            .unwrap();
    }

    let err = job
        .handle_finished_replica(&h.ctx, &tasks[0], &report_for(&tasks[0]))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[test]
fn test_removed_replica_is_dropped_at_commit() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);
    let first_tablet = tablet_id(PARTITION_ID, 0);
    let removed = replica_id(first_tablet, 12);

    job.remove_replica_related_task(&h.ctx, None, first_tablet, removed, 12)
        .unwrap();
    assert_eq!(job.finished_replica_num(TABLE_ID), 1);
    assert_eq!(h.task_queue.task_count_of(TaskType::SchemaChange), 8);

    let others: Vec<_> = tasks
        .iter()
        .filter(|t| t.as_schema_change().unwrap().replica_id != removed)
        .cloned()
        .collect();
    report_all(&h, &job, &others);
    assert_eq!(job.try_finish_job(&h.ctx).unwrap(), FinishStatus::Committed);

    h.with_table(|table| {
        let index = table.partition(PARTITION_ID).unwrap().index(TABLE_ID).unwrap();
        assert_eq!(index.tablet(first_tablet).unwrap().replicas.len(), 2);
        assert_eq!(index.replica_count(), 8);
    });
}

#[test]
fn test_storage_and_bloom_filter_changes() {
    let mut h = Harness::new();
    let bloom_filter = BloomFilterInfo {
        columns: ["k".to_string()].into_iter().collect(),
        false_positive_probability: 0.01,
    };
    let job = h.new_job();
    job.set_storage_encoding(StorageEncoding::Column).unwrap();
    job.set_bloom_filter_change(BloomFilterChange::Set(bloom_filter.clone()))
        .unwrap();
    assert!(job.set_storage_encoding(StorageEncoding::Column).is_err());

    job.begin(&h.ctx).unwrap();
    job.send_tasks(&h.ctx).unwrap();
    let tasks = h.drain_tasks();
    for task in &tasks {
        let payload = task.as_schema_change().unwrap();
        assert_eq!(payload.storage_encoding, StorageEncoding::Column);
        assert_eq!(payload.bloom_filter_columns.as_ref(), Some(&bloom_filter.columns));
        assert_eq!(payload.bloom_filter_fpp, 0.01);
    }

    report_all(&h, &job, &tasks);
    assert_eq!(job.try_finish_job(&h.ctx).unwrap(), FinishStatus::Committed);
    h.with_table(|table| {
        assert_eq!(
            table.storage_encoding_by_index(TABLE_ID),
            Some(StorageEncoding::Column)
        );
        assert_eq!(table.bloom_filter, Some(bloom_filter.clone()));
    });
}

#[test]
fn test_clear_handshake_finishes_job() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);
    report_all(&h, &job, &tasks);
    assert_eq!(job.try_finish_job(&h.ctx).unwrap(), FinishStatus::Committed);

    assert_eq!(
        job.check_or_resend_clear_tasks(&h.ctx).unwrap(),
        ClearStatus::Pending
    );
    let clear_tasks = h.drain_tasks();
    assert_eq!(clear_tasks.len(), 9);
    for task in &clear_tasks {
        assert_eq!(task.as_clear_alter().unwrap().schema_hash, OLD_SCHEMA_HASH);
    }
    assert_eq!(h.task_queue.task_count_of(TaskType::ClearAlter), 9);

    // an unfinished batch is dropped and sent again
    clear_tasks[0].set_finished();
    assert_eq!(
        job.check_or_resend_clear_tasks(&h.ctx).unwrap(),
        ClearStatus::Pending
    );
    let resent = h.drain_tasks();
    assert_eq!(resent.len(), 9);
    assert!(resent.iter().all(|t| !t.is_finished()));
    assert_eq!(h.task_queue.task_count_of(TaskType::ClearAlter), 9);
    assert!(clear_tasks[1..].iter().all(|t| !t.is_finished()));

    for task in &resent {
        h.task_queue
            .finish_task(task.backend_id(), TaskType::ClearAlter, task.signature())
            .unwrap();
    }
    assert_eq!(
        job.check_or_resend_clear_tasks(&h.ctx).unwrap(),
        ClearStatus::Done
    );
    assert_eq!(h.task_queue.task_count(), 0);
    assert_eq!(
        job.check_or_resend_clear_tasks(&h.ctx).unwrap(),
        ClearStatus::Done
    );

    job.finish(&h.ctx).unwrap();
    assert_eq!(job.state(), JobState::Finished);
    let hashes = h.catalog.inverted_index().schema_hashes(PARTITION_ID, TABLE_ID);
    assert_eq!(hashes.current, Some(NEW_SCHEMA_HASH));
    assert_eq!(hashes.staged, None);
    assert_eq!(
        h.edit_log.entries().last().unwrap().op,
        JournalOp::FinishSchemaChange
    );

    job.clear().unwrap();
    assert!(job.is_retired());
    assert!(matches!(
        job.check_or_resend_clear_tasks(&h.ctx),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_cancel_while_finishing_drops_clear_tasks() {
    let mut h = Harness::new();
    let (job, tasks) = start_job(&mut h);
    report_all(&h, &job, &tasks);
    assert_eq!(job.try_finish_job(&h.ctx).unwrap(), FinishStatus::Committed);
    job.check_or_resend_clear_tasks(&h.ctx).unwrap();
    assert_eq!(h.drain_tasks().len(), 9);
    assert_eq!(h.task_queue.task_count_of(TaskType::ClearAlter), 9);

    {
        let mut tables = h.db.write().unwrap();
        job.cancel(&h.ctx, tables.get_mut(&TABLE_ID), "stop").unwrap();
    }
    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(h.task_queue.task_count(), 0);
    let hashes = h.catalog.inverted_index().schema_hashes(PARTITION_ID, TABLE_ID);
    assert_eq!(hashes.current, Some(NEW_SCHEMA_HASH));
    assert_eq!(hashes.staged, None);
    h.with_table(|table| {
        assert_eq!(table.state, TableState::Normal);
        assert_eq!(table.base_schema, new_schema());
    });
    assert_eq!(
        h.edit_log.entries().last().unwrap().op,
        JournalOp::CancelSchemaChange
    );
}

#[test]
fn test_job_info_rows() {
    let mut h = Harness::new();
    let job = h.new_job();
    job.begin(&h.ctx).unwrap();

    let rows = h.with_table(|table| job.job_info(&h.ctx, table));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].index_name, "orders");
    assert_eq!(rows[0].index_state, "SCHEMA_CHANGE");
    assert_eq!(rows[0].job_state, "PENDING");
    assert_eq!(rows[0].progress, "0%");
    assert_eq!(rows[0].finished_time, "N/A");

    job.send_tasks(&h.ctx).unwrap();
    let tasks = h.drain_tasks();
    report_all(&h, &job, &tasks[..3]);
    let rows = h.with_table(|table| job.job_info(&h.ctx, table));
    assert_eq!(rows[0].job_state, "RUNNING");
    assert_eq!(rows[0].progress, "33%");

    h.ctx.set_coordinator(false);
    let rows = h.with_table(|table| job.job_info(&h.ctx, table));
    assert_eq!(rows[0].progress, "0%");
    h.ctx.set_coordinator(true);

    {
        let mut tables = h.db.write().unwrap();
        job.cancel(&h.ctx, tables.get_mut(&TABLE_ID), "stop").unwrap();
    }
    let rows = h.with_table(|table| job.job_info(&h.ctx, table));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].index_name, "N/A");
    assert_eq!(rows[0].progress, "N/A");
    assert_eq!(rows[0].job_state, "CANCELLED");
    assert_eq!(rows[0].cancel_msg, "stop");
}
