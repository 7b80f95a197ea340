//! Batch submission of registered tasks to the delivery layer

use crate::task::agent_task::AgentTask;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Fire-and-forget task submission. Implementations must not block.
pub trait TaskExecutor: Send + Sync {
    fn submit(&self, batch: Vec<Arc<AgentTask>>);
}

/// Hands tasks to whoever drains the paired receiver (an RPC sender in
/// production, the test harness in tests).
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
    tx: mpsc::UnboundedSender<Arc<AgentTask>>,
}

impl ChannelExecutor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<AgentTask>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TaskExecutor for ChannelExecutor {
    fn submit(&self, batch: Vec<Arc<AgentTask>>) {
        let total = batch.len();
        for task in batch {
            if self.tx.send(task).is_err() {
                tracing::warn!("task receiver closed, dropping batch of {} tasks", total);
                return;
            }
        }
        tracing::debug!("submitted batch of {} tasks", total);
    }
}
