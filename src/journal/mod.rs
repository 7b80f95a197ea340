//! Append-only metadata log
//!
//! The coordinator persists every alter job transition here before treating
//! it as durable; followers replay the same records to rebuild catalog state.

pub mod file_log;
pub mod meta_version;

pub use file_log::FileEditLog;
pub use meta_version::CURRENT_META_VERSION;

use crate::common::{Error, Result};
use std::sync::Mutex;

/// Kind of alter job transition recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    StartSchemaChange,
    FinishingSchemaChange,
    FinishSchemaChange,
    CancelSchemaChange,
}

impl JournalOp {
    pub fn code(self) -> u8 {
        match self {
            JournalOp::StartSchemaChange => 1,
            JournalOp::FinishingSchemaChange => 2,
            JournalOp::FinishSchemaChange => 3,
            JournalOp::CancelSchemaChange => 4,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(JournalOp::StartSchemaChange),
            2 => Ok(JournalOp::FinishingSchemaChange),
            3 => Ok(JournalOp::FinishSchemaChange),
            4 => Ok(JournalOp::CancelSchemaChange),
            _ => Err(Error::Journal(format!("Unknown op code: {}", code))),
        }
    }
}

impl std::fmt::Display for JournalOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalOp::StartSchemaChange => write!(f, "start_schema_change"),
            JournalOp::FinishingSchemaChange => write!(f, "finishing_schema_change"),
            JournalOp::FinishSchemaChange => write!(f, "finish_schema_change"),
            JournalOp::CancelSchemaChange => write!(f, "cancel_schema_change"),
        }
    }
}

/// One persisted record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub sequence: u64,
    pub op: JournalOp,
    /// Format version the payload was encoded with
    pub meta_version: u32,
    pub payload: Vec<u8>,
}

/// Write side of the metadata log
pub trait EditLog: Send + Sync {
    /// Durably append a record; returns its sequence number.
    fn append(&self, op: JournalOp, payload: &[u8]) -> Result<u64>;
}

/// In-memory log for followers fed over the network and for tests
#[derive(Debug, Default)]
pub struct MemoryEditLog {
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryEditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EditLog for MemoryEditLog {
    fn append(&self, op: JournalOp, payload: &[u8]) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let sequence = entries.len() as u64;
        entries.push(JournalEntry {
            sequence,
            op,
            meta_version: CURRENT_META_VERSION,
            payload: payload.to_vec(),
        });
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_codes() {
        for op in [
            JournalOp::StartSchemaChange,
            JournalOp::FinishingSchemaChange,
            JournalOp::FinishSchemaChange,
            JournalOp::CancelSchemaChange,
        ] {
            assert_eq!(JournalOp::from_code(op.code()).unwrap(), op);
        }
        assert!(JournalOp::from_code(0).is_err());
    }

    #[test]
    fn test_memory_log_sequences() {
        let log = MemoryEditLog::new();
        assert!(log.is_empty());
        assert_eq!(log.append(JournalOp::StartSchemaChange, b"a").unwrap(), 0);
        assert_eq!(log.append(JournalOp::CancelSchemaChange, b"b").unwrap(), 1);

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].op, JournalOp::CancelSchemaChange);
        assert_eq!(entries[1].meta_version, CURRENT_META_VERSION);
    }
}
