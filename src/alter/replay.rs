//! Follower-side reconstruction of a schema change from its log records
//!
//! Replay only touches the catalog: no tasks are dispatched and no progress is
//! tracked. Missing entities are logged and skipped.

use crate::alter::delta::DeltaOp;
use crate::alter::job::{JobState, SchemaChangeJob};
use crate::alter::schema_change::{
    apply_schema_swap, delete_all_table_history_schema, mark_schema_change, revert_schema_change,
};
use crate::catalog::{Catalog, Database, IndexState, PartitionState, ReplicaState, TableState};
use crate::common::{Error, Result};

impl SchemaChangeJob {
    /// Re-mark the table as under schema change and reset the job to PENDING,
    /// so only an elected coordinator ever dispatches its tasks.
    pub fn replay_init_job(&self, catalog: &Catalog, db: &Database) -> Result<()> {
        let mut tables = db.write()?;
        let mut core = self.lock();
        let Some(table) = tables.get_mut(&self.table_id) else {
            tracing::warn!(
                "replay init: table[{}] does not exist in db[{}]",
                self.table_id,
                db.id()
            );
            return Err(Error::NotFound(format!("table[{}]", self.table_id)));
        };

        mark_schema_change(catalog.inverted_index(), table, self.live(&core)?)?;
        core.state = JobState::Pending;
        tracing::info!("replayed init of schema change job[{}]", self.table_id);
        Ok(())
    }

    /// Apply the committed schema swap and every recorded replica delta.
    ///
    /// The old schema hash stays staged until the finish record, so a follower
    /// promoted in between can still clear the old tablets.
    pub fn replay_finishing(&self, catalog: &Catalog, db: &Database) -> Result<()> {
        let mut tables = db.write()?;
        let core = self.lock();
        let body = self.live(&core)?;
        let Some(table) = tables.get_mut(&self.table_id) else {
            tracing::warn!(
                "replay finishing: table[{}] does not exist in db[{}]",
                self.table_id,
                db.id()
            );
            return Err(Error::NotFound(format!("table[{}]", self.table_id)));
        };
        let inverted = catalog.inverted_index();

        for partition in table.partitions_mut() {
            let partition_id = partition.id;
            for index_id in body.changed_schema.keys() {
                let Some(index) = partition.index_mut(*index_id) else {
                    tracing::warn!(
                        "replay finishing: index[{}] missing in partition[{}]",
                        index_id,
                        partition_id
                    );
                    continue;
                };
                for tablet in &mut index.tablets {
                    for replica in &mut tablet.replicas {
                        replica.state = ReplicaState::Normal;
                    }
                }
                index.state = IndexState::Normal;
                inverted.update_to_new_schema_hash(partition_id, *index_id);
            }
            partition.state = PartitionState::Normal;

            let Some(deltas) = body.replica_deltas.get(&partition_id) else {
                continue;
            };
            for delta in deltas {
                let Some(tablet) = partition
                    .index_mut(delta.index_id)
                    .and_then(|index| index.tablet_mut(delta.tablet_id))
                else {
                    tracing::warn!(
                        "replay finishing: tablet {} of index[{}] missing",
                        delta.tablet_id,
                        delta.index_id
                    );
                    continue;
                };
                match &delta.op {
                    DeltaOp::Update(v) => match tablet.replica_by_backend_mut(delta.backend_id) {
                        Some(replica) => replica.update_version_info(
                            v.version,
                            v.version_hash,
                            v.data_size,
                            v.row_count,
                            v.last_failed_version,
                            v.last_failed_version_hash,
                            v.last_success_version,
                            v.last_success_version_hash,
                        ),
                        None => tracing::warn!(
                            "replay finishing: no replica of tablet {} on backend {}",
                            delta.tablet_id,
                            delta.backend_id
                        ),
                    },
                    DeltaOp::Delete => {
                        tablet.delete_replica_by_backend(delta.backend_id);
                    }
                }
            }
        }

        apply_schema_swap(table, body);
        table.state = TableState::Normal;
        catalog.observe_transaction_id(core.transaction_id);

        tracing::info!("replayed finishing of schema change job[{}]", self.table_id);
        Ok(())
    }

    /// Jobs logged before commits carried their own transaction id never wrote
    /// a finishing record; their finish record replays the commit.
    pub fn replay_finish(&self, catalog: &Catalog, db: &Database) -> Result<()> {
        if self.transaction_id() < 0 {
            self.replay_finishing(catalog, db)?;
        }

        let tables = db.read()?;
        let core = self.lock();
        let Some(table) = tables.get(&self.table_id) else {
            return Ok(());
        };
        let index_ids: Vec<i64> = self.live(&core)?.changed_schema.keys().copied().collect();
        delete_all_table_history_schema(catalog.inverted_index(), table, &index_ids);
        tracing::info!("replayed finish of schema change job[{}]", self.table_id);
        Ok(())
    }

    pub fn replay_cancel(&self, catalog: &Catalog, db: &Database) -> Result<()> {
        let mut tables = db.write()?;
        let core = self.lock();
        let Some(table) = tables.get_mut(&self.table_id) else {
            return Ok(());
        };
        let index_ids: Vec<i64> = self.live(&core)?.changed_schema.keys().copied().collect();
        let committed = table.state == TableState::Normal;
        revert_schema_change(catalog.inverted_index(), None, table, &index_ids);
        if committed {
            delete_all_table_history_schema(catalog.inverted_index(), table, &index_ids);
        }
        tracing::info!("replayed cancel of schema change job[{}]", self.table_id);
        Ok(())
    }
}
