//! Task transport seam: task payloads, the outstanding-task registry and
//! batch submission

pub mod agent_task;
pub mod executor;
pub mod queue;
pub mod report;

pub use agent_task::{AgentTask, ClearAlterPayload, SchemaChangePayload, TaskKind, TaskType};
pub use executor::{ChannelExecutor, TaskExecutor};
pub use queue::TaskQueue;
pub use report::TabletReport;
