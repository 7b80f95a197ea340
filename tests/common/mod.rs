//! Shared fixture: one database, one aggregate-keys table, three tablets per
//! partition, one replica of each tablet on each of three backends (R=3).

#![allow(dead_code)]

use schemashift::alter::{AlterContext, SchemaChangeJob};
use schemashift::catalog::{
    AggregateType, Catalog, Column, ColumnType, Database, IndexMeta, KeysType, MaterializedIndex,
    OlapTable, Partition, Replica, StorageEncoding, Tablet,
};
use schemashift::common::AlterConfig;
use schemashift::journal::{EditLog, MemoryEditLog};
use schemashift::task::{AgentTask, ChannelExecutor, TabletReport, TaskQueue};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

pub const DB_ID: i64 = 1;
pub const TABLE_ID: i64 = 100;
pub const PARTITION_ID: i64 = 200;
pub const BACKENDS: [i64; 3] = [10, 11, 12];
pub const REPLICATION_NUM: usize = 3;
pub const TABLETS_PER_PARTITION: i64 = 3;
pub const OLD_SCHEMA_HASH: i32 = 1111;
pub const NEW_SCHEMA_HASH: i32 = 2222;

pub fn tablet_id(partition_id: i64, k: i64) -> i64 {
    partition_id * 10 + k
}

pub fn replica_id(tablet_id: i64, backend_id: i64) -> i64 {
    tablet_id * 100 + backend_id
}

pub fn base_schema() -> Vec<Column> {
    vec![
        Column::key("k", ColumnType::Int),
        Column::value("v", ColumnType::BigInt).with_aggregation(AggregateType::Sum),
    ]
}

pub fn new_schema() -> Vec<Column> {
    let mut columns = base_schema();
    columns.push(
        Column::value("note", ColumnType::Varchar)
            .with_length(32)
            .with_aggregation(AggregateType::Replace)
            .with_default(""),
    );
    columns
}

pub fn sample_table(partitions: &[i64]) -> OlapTable {
    let mut table = OlapTable::new(TABLE_ID, "orders", KeysType::AggKeys, base_schema());
    table.put_index_meta(
        TABLE_ID,
        IndexMeta {
            name: "orders".into(),
            schema: base_schema(),
            schema_version: 0,
            schema_hash: OLD_SCHEMA_HASH,
            short_key_column_count: 1,
            storage_encoding: StorageEncoding::Row,
        },
    );

    for &partition_id in partitions {
        let mut partition = Partition::new(partition_id, &format!("p{}", partition_id));
        let mut index = MaterializedIndex::new(TABLE_ID);
        for k in 0..TABLETS_PER_PARTITION {
            let tid = tablet_id(partition_id, k);
            let mut tablet = Tablet::new(tid);
            for backend_id in BACKENDS {
                let mut replica = Replica::new(replica_id(tid, backend_id), backend_id, 2, 20);
                replica.update_info(2, 20, 1024, 10);
                tablet.add_replica(replica);
            }
            index.tablets.push(tablet);
        }
        partition.indices.insert(TABLE_ID, index);
        table.add_partition(partition, REPLICATION_NUM);
    }
    table
}

pub fn build_catalog(partitions: &[i64]) -> Arc<Catalog> {
    let catalog = Arc::new(Catalog::new());
    for backend_id in BACKENDS {
        catalog
            .backends()
            .add_backend(backend_id, &format!("be-{}:9050", backend_id));
    }
    let db = Database::new(DB_ID, "sales");
    db.create_table(sample_table(partitions)).unwrap();
    catalog.add_db(db).unwrap();
    for &partition_id in partitions {
        catalog
            .inverted_index()
            .register(partition_id, TABLE_ID, OLD_SCHEMA_HASH);
    }
    catalog
}

pub struct Harness {
    pub catalog: Arc<Catalog>,
    pub db: Arc<Database>,
    pub task_queue: Arc<TaskQueue>,
    pub edit_log: Arc<MemoryEditLog>,
    pub ctx: Arc<AlterContext>,
    pub tasks: UnboundedReceiver<Arc<AgentTask>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_partitions(&[PARTITION_ID])
    }

    pub fn with_partitions(partitions: &[i64]) -> Self {
        Self::build(partitions, AlterConfig::default(), None)
    }

    pub fn with_config(config: AlterConfig) -> Self {
        Self::build(&[PARTITION_ID], config, None)
    }

    /// Harness whose jobs are journaled to `edit_log` instead of the in-memory log
    pub fn with_edit_log(edit_log: Arc<dyn EditLog>) -> Self {
        Self::build(&[PARTITION_ID], AlterConfig::default(), Some(edit_log))
    }

    fn build(partitions: &[i64], config: AlterConfig, edit_log: Option<Arc<dyn EditLog>>) -> Self {
        let catalog = build_catalog(partitions);
        let db = catalog.get_db(DB_ID).unwrap();
        let task_queue = Arc::new(TaskQueue::new());
        let (executor, tasks) = ChannelExecutor::new();
        let memory_log = Arc::new(MemoryEditLog::new());
        let edit_log: Arc<dyn EditLog> = edit_log.unwrap_or_else(|| memory_log.clone() as Arc<dyn EditLog>);
        let ctx = Arc::new(AlterContext::new(
            catalog.clone(),
            task_queue.clone(),
            Arc::new(executor),
            edit_log,
            config,
        ));
        Self {
            catalog,
            db,
            task_queue,
            edit_log: memory_log,
            ctx,
            tasks,
        }
    }

    /// A job changing the base index to `new_schema()`
    pub fn new_job(&self) -> SchemaChangeJob {
        let job = SchemaChangeJob::new(
            DB_ID,
            TABLE_ID,
            "orders",
            self.catalog.next_transaction_id(),
        );
        job.put_changed_schema(TABLE_ID, new_schema()).unwrap();
        job.set_schema_info(TABLE_ID, 1, NEW_SCHEMA_HASH, 1).unwrap();
        job
    }

    pub fn drain_tasks(&mut self) -> Vec<Arc<AgentTask>> {
        let mut tasks = Vec::new();
        while let Ok(task) = self.tasks.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    pub fn with_table<T>(&self, f: impl FnOnce(&OlapTable) -> T) -> T {
        let tables = self.db.read().unwrap();
        f(tables.get(&TABLE_ID).unwrap())
    }

    pub fn table_snapshot(&self) -> OlapTable {
        self.with_table(|t| t.clone())
    }
}

/// Successful completion report for a migration task
pub fn report_for(task: &AgentTask) -> TabletReport {
    let payload = task.as_schema_change().unwrap();
    TabletReport {
        tablet_id: payload.tablet_id,
        schema_hash: payload.new_schema_hash,
        version: 3,
        version_hash: 30,
        data_size: 2048,
        row_count: 10,
        report_version: 7,
    }
}
