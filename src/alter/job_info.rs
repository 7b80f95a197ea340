//! Status rows of a schema change job, as shown by `SHOW ALTER`-style listings

use crate::alter::context::AlterContext;
use crate::alter::job::{JobState, SchemaChangeJob};
use crate::catalog::{IndexState, OlapTable};
use crate::common::format_millis;
use serde::Serialize;

const NOT_APPLICABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfoRow {
    pub table_id: i64,
    pub table_name: String,
    pub transaction_id: i64,
    pub create_time: String,
    pub finished_time: String,
    pub index_name: String,
    pub index_state: String,
    pub job_state: String,
    pub cancel_msg: String,
    pub progress: String,
}

impl SchemaChangeJob {
    /// One row for a terminal job, otherwise one row per changed index.
    pub fn job_info(&self, ctx: &AlterContext, table: &OlapTable) -> Vec<JobInfoRow> {
        let state = self.state();
        let row = |index_name: String, index_state: String, progress: String| JobInfoRow {
            table_id: self.table_id,
            table_name: table.name.clone(),
            transaction_id: self.transaction_id(),
            create_time: format_millis(self.create_time),
            finished_time: format_millis(self.finished_time()),
            index_name,
            index_state,
            job_state: state.name().to_string(),
            cancel_msg: self.cancel_msg(),
            progress,
        };

        if state.is_terminal() {
            return vec![row(
                NOT_APPLICABLE.to_string(),
                NOT_APPLICABLE.to_string(),
                NOT_APPLICABLE.to_string(),
            )];
        }

        let report_progress = ctx.is_coordinator() && state == JobState::Running;

        self.changed_index_ids()
            .into_iter()
            .map(|index_id| {
                let index_state = table
                    .partitions()
                    .filter_map(|p| p.index(index_id))
                    .map(|index| index.state)
                    .find(|s| *s != IndexState::Normal)
                    .unwrap_or(IndexState::Normal);

                let progress = if report_progress {
                    let total = self.total_replica_num(index_id);
                    let finished = self.finished_replica_num(index_id);
                    if total == 0 {
                        "0%".to_string()
                    } else {
                        format!("{}%", finished * 100 / total)
                    }
                } else {
                    "0%".to_string()
                };

                row(
                    table
                        .index_name(index_id)
                        .unwrap_or(NOT_APPLICABLE)
                        .to_string(),
                    index_state.to_string(),
                    progress,
                )
            })
            .collect()
    }
}
