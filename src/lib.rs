//! # schemashift
//!
//! Coordinator-side schema change jobs for a replicated, tablet-sharded
//! analytic store:
//! - per-replica migration task dispatch with a quorum gate
//! - completion tracking from asynchronous backend reports
//! - single-step commit of the new schema, durable through an edit log
//! - clear handshake for superseded schema data
//! - deterministic replay of every transition on followers
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!   DDL ───▶ │         AlterHandler         │ ◀─── tablet reports
//!            │  poll: send / converge /     │
//!            │        clear / finish        │
//!            └───┬──────────┬───────────┬───┘
//!                │          │           │
//!        ┌───────▼───┐ ┌────▼──────┐ ┌──▼─────────┐
//!        │  Catalog  │ │ TaskQueue │ │  EditLog   │
//!        │ db locks, │ │ + executor│ │ (replayed  │
//!        │ inv.index │ │           │ │ by peers)  │
//!        └───────────┘ └───────────┘ └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Inspect a metadata log
//! ```bash
//! schemashift-inspect dump --log ./meta/edit.log
//! ```

#![allow(clippy::result_large_err)]

pub mod alter;
pub mod catalog;
pub mod common;
pub mod journal;
pub mod task;

// Re-export commonly used types
pub use alter::{AlterContext, AlterHandler, JobState, SchemaChangeJob};
pub use common::{Config, Error, Result};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
