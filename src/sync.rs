//! Bidirectional Sync: forward (validated decision → Workflow agent),
//! reverse (workflow/node results → Conversation agent), and canvas sync
//! with version conflict detection. The canvas is the single source of
//! truth — conflicting updates are rejected, never merged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::decision::Decision;
use crate::event_bus::EventHandler;
use crate::events::{CanvasChangeType, Event, EventKind};
use crate::ports::{ConversationAgentPort, WorkflowAgentPort};

/// Per-workflow canvas state. `nodes`/`edges` are opaque records; the sync
/// service only cares about their version-gated replacement.
#[derive(Debug, Clone, Default)]
pub struct CanvasState {
    pub workflow_id: String,
    pub nodes: HashMap<String, Value>,
    pub edges: HashMap<String, Value>,
    pub version: u64,
}

/// Result of applying a `CanvasChange`.
#[derive(Debug, Clone)]
pub enum CanvasApplyResult {
    Applied { version: u64 },
    Conflict { current_version: u64 },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub decisions_forwarded: u64,
    pub execution_results_synced: u64,
    pub node_statuses_synced: u64,
    pub canvas_changes_applied: u64,
    pub canvas_conflicts: u64,
}

/// Binds a Workflow agent and a Conversation agent together without either
/// calling the other directly; all traffic passes through here (driven by
/// the Coordinator's event subscriptions).
pub struct BidirectionalSync {
    workflow_agent: Option<Arc<dyn WorkflowAgentPort>>,
    conversation_agent: Option<Arc<dyn ConversationAgentPort>>,
    canvas_states: parking_lot::Mutex<HashMap<String, CanvasState>>,
    decisions_forwarded: AtomicU64,
    execution_results_synced: AtomicU64,
    node_statuses_synced: AtomicU64,
    canvas_changes_applied: AtomicU64,
    canvas_conflicts: AtomicU64,
}

impl BidirectionalSync {
    pub fn new(
        workflow_agent: Option<Arc<dyn WorkflowAgentPort>>,
        conversation_agent: Option<Arc<dyn ConversationAgentPort>>,
    ) -> Self {
        Self {
            workflow_agent,
            conversation_agent,
            canvas_states: parking_lot::Mutex::new(HashMap::new()),
            decisions_forwarded: AtomicU64::new(0),
            execution_results_synced: AtomicU64::new(0),
            node_statuses_synced: AtomicU64::new(0),
            canvas_changes_applied: AtomicU64::new(0),
            canvas_conflicts: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            decisions_forwarded: self.decisions_forwarded.load(Ordering::Relaxed),
            execution_results_synced: self.execution_results_synced.load(Ordering::Relaxed),
            node_statuses_synced: self.node_statuses_synced.load(Ordering::Relaxed),
            canvas_changes_applied: self.canvas_changes_applied.load(Ordering::Relaxed),
            canvas_conflicts: self.canvas_conflicts.load(Ordering::Relaxed),
        }
    }

    /// Forward a validated decision to the Workflow agent (triggered by
    /// `DecisionValidated`).
    pub async fn forward_decision(&self, decision: &crate::decision::Decision) -> anyhow::Result<Option<Value>> {
        let Some(agent) = &self.workflow_agent else { return Ok(None) };
        let result = agent.handle_decision(decision).await?;
        self.decisions_forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(Some(result))
    }

    /// Push a completed workflow's outcome back to the Conversation agent
    /// (triggered by `WorkflowExecutionCompleted`).
    pub async fn sync_execution_result(&self, payload: Value) -> anyhow::Result<()> {
        let Some(agent) = &self.conversation_agent else { return Ok(()) };
        agent.receive_execution_result(payload).await?;
        self.execution_results_synced.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Push a single node's status back to the Conversation agent
    /// (triggered by `NodeExecutionEvent`).
    pub async fn sync_node_status(&self, payload: Value) -> anyhow::Result<()> {
        let Some(agent) = &self.conversation_agent else { return Ok(()) };
        agent.receive_node_status(payload).await?;
        self.node_statuses_synced.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Apply a canvas change. Additive changes (`node_added`/`edge_added`)
    /// skip the version check entirely; everything else is rejected if its
    /// carried version is behind the canvas's current version. On a
    /// successful apply, pushes the canvas dict into the registered
    /// Conversation agent's session context (§4.8).
    pub async fn apply_canvas_change(
        &self,
        workflow_id: &str,
        change_type: CanvasChangeType,
        change_data: &Value,
        version: u64,
    ) -> CanvasApplyResult {
        let snapshot = {
            let mut states = self.canvas_states.lock();
            let state = states.entry(workflow_id.to_string()).or_insert_with(|| CanvasState {
                workflow_id: workflow_id.to_string(),
                ..Default::default()
            });

            if !change_type.is_additive() && version < state.version {
                self.canvas_conflicts.fetch_add(1, Ordering::Relaxed);
                return CanvasApplyResult::Conflict { current_version: state.version };
            }

            apply_change(state, change_type, change_data);
            state.version += 1;
            self.canvas_changes_applied.fetch_add(1, Ordering::Relaxed);
            state.clone()
        };

        if let Some(agent) = &self.conversation_agent {
            let _ = agent.set_canvas_state(workflow_id, canvas_to_dict(&snapshot)).await;
        }

        CanvasApplyResult::Applied { version: snapshot.version }
    }

    pub fn canvas_state(&self, workflow_id: &str) -> Option<CanvasState> {
        self.canvas_states.lock().get(workflow_id).cloned()
    }
}

/// Subscribes `BidirectionalSync` directly to the bus (§4.8) instead of
/// having the Orchestrator call it by hand after publishing: forward on
/// `DecisionValidated`, reverse sync on `WorkflowExecutionCompleted` and
/// `NodeExecutionEvent`.
#[async_trait]
impl EventHandler for BidirectionalSync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match &event.kind {
            EventKind::DecisionValidated { original_decision_id, decision_type, payload } => {
                let decision = Decision::new(original_decision_id.clone(), decision_type.clone(), payload.clone());
                self.forward_decision(&decision).await?;
            }
            EventKind::WorkflowExecutionCompleted { workflow_id, status, result, .. } => {
                self.sync_execution_result(serde_json::json!({
                    "workflow_id": workflow_id,
                    "status": status,
                    "result": result,
                }))
                .await?;
            }
            EventKind::NodeExecutionEvent { workflow_id, node_id, node_type, status, result, error, .. } => {
                self.sync_node_status(serde_json::json!({
                    "workflow_id": workflow_id,
                    "node_id": node_id,
                    "node_type": node_type,
                    "status": status,
                    "result": result,
                    "error": error,
                }))
                .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn canvas_to_dict(state: &CanvasState) -> Value {
    serde_json::json!({
        "workflow_id": state.workflow_id,
        "nodes": state.nodes,
        "edges": state.edges,
        "version": state.version,
    })
}

fn apply_change(state: &mut CanvasState, change_type: CanvasChangeType, change_data: &Value) {
    match change_type {
        CanvasChangeType::NodeAdded | CanvasChangeType::NodeUpdated | CanvasChangeType::NodeMoved => {
            if let Some(node_id) = change_data.get("node_id").and_then(Value::as_str) {
                state.nodes.insert(node_id.to_string(), change_data.clone());
            }
        }
        CanvasChangeType::NodeDeleted => {
            if let Some(node_id) = change_data.get("node_id").and_then(Value::as_str) {
                state.nodes.remove(node_id);
            }
        }
        CanvasChangeType::EdgeAdded => {
            if let Some(edge_id) = change_data.get("edge_id").and_then(Value::as_str) {
                state.edges.insert(edge_id.to_string(), change_data.clone());
            }
        }
        CanvasChangeType::EdgeDeleted => {
            if let Some(edge_id) = change_data.get("edge_id").and_then(Value::as_str) {
                state.edges.remove(edge_id);
            }
        }
    }
}
