//! Backend registry: liveness and report-version bookkeeping

use crate::common::NodeState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: i64,
    pub host: String,
    pub state: NodeState,
    /// Highest report sequence accepted from this backend
    pub report_version: i64,
}

#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<i64, Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_backend(&self, id: i64, host: &str) {
        let mut backends = self.backends.write().unwrap_or_else(|e| e.into_inner());
        backends.insert(
            id,
            Backend {
                id,
                host: host.to_string(),
                state: NodeState::Alive,
                report_version: 0,
            },
        );
    }

    pub fn set_state(&self, id: i64, state: NodeState) {
        let mut backends = self.backends.write().unwrap_or_else(|e| e.into_inner());
        if let Some(be) = backends.get_mut(&id) {
            if be.state != state {
                tracing::info!("backend {} state {} -> {}", id, be.state, state);
            }
            be.state = state;
        }
    }

    /// Unknown backends are treated as dead.
    pub fn is_alive(&self, id: i64) -> bool {
        let backends = self.backends.read().unwrap_or_else(|e| e.into_inner());
        backends.get(&id).is_some_and(|be| be.state.is_healthy())
    }

    pub fn get(&self, id: i64) -> Option<Backend> {
        let backends = self.backends.read().unwrap_or_else(|e| e.into_inner());
        backends.get(&id).cloned()
    }

    /// Advance the backend's last-seen report sequence. Older sequences are ignored.
    pub fn update_report_version(&self, id: i64, report_version: i64, db_id: i64) {
        let mut backends = self.backends.write().unwrap_or_else(|e| e.into_inner());
        match backends.get_mut(&id) {
            Some(be) if report_version > be.report_version => {
                be.report_version = report_version;
            }
            Some(_) => {}
            None => tracing::warn!(
                "report version {} from unknown backend {} (db {})",
                report_version,
                id,
                db_id
            ),
        }
    }

    pub fn report_version(&self, id: i64) -> Option<i64> {
        self.get(id).map(|be| be.report_version)
    }
}
