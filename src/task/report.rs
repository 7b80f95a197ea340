//! Backend completion report for a dispatched task

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletReport {
    pub tablet_id: i64,
    pub schema_hash: i32,
    pub version: i64,
    pub version_hash: i64,
    pub data_size: i64,
    pub row_count: i64,
    /// Report sequence of the sending backend
    pub report_version: i64,
}
