//! Registry of outstanding backend tasks, keyed by (backend, type, signature)

use crate::task::agent_task::{AgentTask, TaskType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type TaskKey = (i64, TaskType, i64);

#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<HashMap<TaskKey, Arc<AgentTask>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(task: &AgentTask) -> TaskKey {
        (task.backend_id(), task.task_type(), task.signature())
    }

    /// Register a task. Returns false if a task with the same key is already queued.
    pub fn add_task(&self, task: Arc<AgentTask>) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let key = Self::key(&task);
        if tasks.contains_key(&key) {
            tracing::debug!(
                "task {} for tablet {} already queued on backend {}",
                key.1,
                key.2,
                key.0
            );
            return false;
        }
        tasks.insert(key, task);
        true
    }

    pub fn remove_task(
        &self,
        backend_id: i64,
        task_type: TaskType,
        signature: i64,
    ) -> Option<Arc<AgentTask>> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.remove(&(backend_id, task_type, signature))
    }

    pub fn get_task(
        &self,
        backend_id: i64,
        task_type: TaskType,
        signature: i64,
    ) -> Option<Arc<AgentTask>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(&(backend_id, task_type, signature)).cloned()
    }

    /// Mark a queued task finished, as reported by its backend. The task stays
    /// queued; its owner removes it.
    pub fn finish_task(
        &self,
        backend_id: i64,
        task_type: TaskType,
        signature: i64,
    ) -> Option<Arc<AgentTask>> {
        let task = self.get_task(backend_id, task_type, signature)?;
        task.set_finished();
        Some(task)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn task_count_of(&self, task_type: TaskType) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.keys().filter(|(_, ty, _)| *ty == task_type).count()
    }

    pub fn tasks_of(&self, task_type: TaskType) -> Vec<Arc<AgentTask>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .iter()
            .filter(|((_, ty, _), _)| *ty == task_type)
            .map(|(_, task)| task.clone())
            .collect()
    }
}
