//! Error types for schemashift

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Catalog Errors ===
    /// Database, table, partition, index, tablet or replica missing at lookup time.
    #[error("Not found: {0}")]
    NotFound(String),

    // === Job Protocol Errors ===
    /// Finish report produced by a superseded task instance.
    #[error("Stale report for tablet {tablet_id}: reported schema hash {reported}, task schema hash {expected}")]
    StaleReport {
        tablet_id: i64,
        reported: i32,
        expected: i32,
    },

    #[error("Tablet {tablet_id} has {healthy} healthy replicas, quorum is {quorum}")]
    QuorumViolation {
        tablet_id: i64,
        healthy: usize,
        quorum: usize,
    },

    #[error("Task dispatch failed: {0}")]
    DispatchFailure(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid job state: {0}")]
    InvalidState(String),

    #[error("Job for table {0} has been retired")]
    JobRetired(i64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Journal Errors ===
    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("Journal error: {0}")]
    Journal(String),

    // === Config Errors ===
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Can the operation be retried on a later poll without operator action?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::DispatchFailure(_) | Error::Io(_))
    }

    /// Errors after which the owning job can never make progress again.
    pub fn is_fatal_to_job(&self) -> bool {
        matches!(
            self,
            Error::QuorumViolation { .. } | Error::InvariantViolation(_) | Error::NotFound(_)
        )
    }
}
