//! Common utilities and types shared across schemashift

pub mod config;
pub mod error;
pub mod utils;

pub use config::{AlterConfig, Config, JournalConfig, JournalSyncPolicy};
pub use error::{Error, Result};
pub use utils::{crc32, format_millis, quorum, timestamp_now_millis, NodeState};
