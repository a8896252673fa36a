//! `WorkflowState`: the Coordinator's exclusively-owned per-workflow record,
//! mutated only from within event-handler bodies.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::WorkflowStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub node_count: usize,
    #[serde(with = "time::serde::iso8601")]
    pub started_at: time::OffsetDateTime,
    #[serde(with = "time::serde::iso8601::option")]
    pub completed_at: Option<time::OffsetDateTime>,
    pub executed_nodes: Vec<String>,
    pub running_nodes: HashSet<String>,
    pub failed_nodes: HashSet<String>,
    pub skipped_nodes: HashSet<String>,
    pub node_inputs: HashMap<String, Value>,
    pub node_outputs: HashMap<String, Value>,
    pub node_errors: HashMap<String, String>,
    pub result: Option<Value>,
}

impl WorkflowState {
    pub fn new(workflow_id: impl Into<String>, node_count: usize) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Running,
            node_count,
            started_at: crate::events::now(),
            completed_at: None,
            executed_nodes: Vec::new(),
            running_nodes: HashSet::new(),
            failed_nodes: HashSet::new(),
            skipped_nodes: HashSet::new(),
            node_inputs: HashMap::new(),
            node_outputs: HashMap::new(),
            node_errors: HashMap::new(),
            result: None,
        }
    }

    pub fn mark_node_running(&mut self, node_id: &str, inputs: Option<Value>) {
        self.running_nodes.insert(node_id.to_string());
        if let Some(inputs) = inputs {
            self.node_inputs.insert(node_id.to_string(), inputs);
        }
    }

    pub fn mark_node_completed(&mut self, node_id: &str, result: Option<Value>) {
        self.running_nodes.remove(node_id);
        self.failed_nodes.remove(node_id);
        self.executed_nodes.push(node_id.to_string());
        if let Some(result) = result {
            self.node_outputs.insert(node_id.to_string(), result);
        }
    }

    pub fn mark_node_failed(&mut self, node_id: &str, error: String) {
        self.running_nodes.remove(node_id);
        self.failed_nodes.insert(node_id.to_string());
        self.node_errors.insert(node_id.to_string(), error);
    }

    pub fn mark_node_skipped(&mut self, node_id: &str) {
        self.running_nodes.remove(node_id);
        self.skipped_nodes.insert(node_id.to_string());
    }

    pub fn complete(&mut self, status: WorkflowStatus, result: Option<Value>) {
        self.status = status;
        self.result = result;
        self.completed_at = Some(crate::events::now());
    }
}

/// Per-workflow registry exclusively owned by the Coordinator; entries live
/// for the lifetime of the process.
#[derive(Default)]
pub struct WorkflowStateRegistry {
    states: parking_lot::Mutex<HashMap<String, WorkflowState>>,
}

impl WorkflowStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, workflow_id: &str, node_count: usize) {
        self.states.lock().insert(workflow_id.to_string(), WorkflowState::new(workflow_id, node_count));
    }

    pub fn with_mut<R>(&self, workflow_id: &str, f: impl FnOnce(&mut WorkflowState) -> R) -> Option<R> {
        let mut states = self.states.lock();
        states.get_mut(workflow_id).map(f)
    }

    pub fn get(&self, workflow_id: &str) -> Option<WorkflowState> {
        self.states.lock().get(workflow_id).cloned()
    }

    pub fn all(&self) -> Vec<WorkflowState> {
        self.states.lock().values().cloned().collect()
    }
}
