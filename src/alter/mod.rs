//! Schema change jobs
//!
//! A job walks a table through PENDING → RUNNING → FINISHING → FINISHED (or
//! CANCELLED): tasks are dispatched per replica, completion reports are
//! folded into a transient tracker, and once every changed index converged
//! the new schema is committed in one step and written to the edit log.

pub mod codec;
pub mod context;
pub mod delta;
pub mod handler;
pub mod job;
pub mod job_info;
pub mod progress;
pub mod replay;
pub mod schema_change;

pub use context::AlterContext;
pub use delta::{DeltaOp, ReplicaDelta, VersionInfo};
pub use handler::AlterHandler;
pub use job::{BloomFilterChange, JobState, SchemaChangeJob, SchemaInfo};
pub use job_info::JobInfoRow;
pub use progress::ProgressTracker;
pub use schema_change::{ClearStatus, FinishStatus};
