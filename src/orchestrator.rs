//! Orchestrator: the top-level composition root. Owns one event bus and
//! wires the Coordinator, the per-session Conversation-agent registry, and
//! bidirectional sync off of it.

use std::sync::Arc;

use serde_json::Value;

use crate::config::CoordinationConfig;
use crate::conversation_state::{ConversationAgent, SessionRegistry};
use crate::coordinator::{Coordinator, SystemStatus};
use crate::decision::Decision;
use crate::error::{CoordinatorRejected, CoreError};
use crate::event_bus::{EventBus, EventHandler};
use crate::events::{CanvasChangeType, Event, EventKind, WorkflowStatus};
use crate::knowledge::KnowledgeOrchestrator;
use crate::ports::{ConversationAgentPort, WorkflowAgentPort};
use crate::sync::{BidirectionalSync, CanvasApplyResult, SyncStats};

/// Aggregate counters across every owned subsystem.
#[derive(Debug, Clone)]
pub struct OrchestratorStatus {
    pub system: SystemStatus,
    pub sync: SyncStats,
    pub event_bus_published: u64,
    pub event_bus_dropped: u64,
}

/// Constructing an `Orchestrator` wires every subscription; callers drive it
/// by publishing events, submitting decisions, and routing canvas changes.
pub struct Orchestrator {
    event_bus: Arc<EventBus>,
    coordinator: Arc<Coordinator>,
    sessions: SessionRegistry,
    sync: Arc<BidirectionalSync>,
}

impl Orchestrator {
    pub fn new(
        config: CoordinationConfig,
        knowledge: KnowledgeOrchestrator,
        workflow_agent: Option<Arc<dyn WorkflowAgentPort>>,
        conversation_agent: Option<Arc<dyn ConversationAgentPort>>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::with_log_capacity(config.audit_log_capacity));
        let coordinator = Coordinator::new(event_bus.clone(), config, knowledge);
        if let Some(agent) = workflow_agent.clone() {
            coordinator.set_workflow_agent(agent);
        }
        let sync = Arc::new(BidirectionalSync::new(workflow_agent, conversation_agent));
        // §4.8: BidirectionalSync reacts to the bus instead of being called
        // directly — forward on `DecisionValidated`, reverse sync on
        // `WorkflowExecutionCompleted`/`NodeExecutionEvent`.
        for type_name in ["decision_validated", "workflow_execution_completed", "node_execution_event"] {
            event_bus.subscribe(type_name, sync.clone() as Arc<dyn EventHandler>);
        }
        Self { event_bus, coordinator, sessions: SessionRegistry::new(), sync }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn sync(&self) -> &Arc<BidirectionalSync> {
        &self.sync
    }

    pub async fn get_or_create_session(&self, session_id: &str) -> Arc<ConversationAgent> {
        self.sessions.get_or_create(session_id, Some(self.event_bus.clone())).await
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<ConversationAgent>> {
        self.sessions.get(session_id).await
    }

    /// Publish `decision` as `DecisionMade` onto the bus. The Coordinator's
    /// policy-chain middleware (§4.3) validates it there, publishing
    /// `DecisionValidated`/`DecisionRejected`; on validation,
    /// `BidirectionalSync`'s own subscription (§4.8) forwards it to the
    /// Workflow agent. Returns the rejection, if any, surfaced through the
    /// audit log rather than a direct call into the policy chain.
    pub async fn submit_decision(&self, decision: Decision, correlation_id: &str) -> Result<(), CoreError> {
        let event = Event::new(
            "orchestrator",
            EventKind::DecisionMade { decision_type: decision.decision_type.clone(), payload: decision.payload.clone() },
        )
        .with_correlation(correlation_id);
        let decision_id = event.id.clone();

        self.event_bus.publish(event).await;

        let rejection = self.event_bus.event_log().into_iter().find_map(|e| match e.kind {
            EventKind::DecisionRejected { original_decision_id, decision_type, reason, errors }
                if original_decision_id == decision_id =>
            {
                Some(CoordinatorRejected {
                    decision_type,
                    correlation_id: correlation_id.to_string(),
                    original_decision_id,
                    errors: if errors.is_empty() { vec![reason] } else { errors },
                })
            }
            _ => None,
        });

        match rejection {
            Some(rejected) => Err(CoreError::CoordinatorRejected(rejected)),
            None => Ok(()),
        }
    }

    /// Publish a workflow completion, driving the Coordinator's state
    /// bookkeeping and (via `BidirectionalSync`'s subscription) the
    /// Conversation agent's reverse sync.
    pub async fn complete_workflow(&self, workflow_id: &str, status: WorkflowStatus, result: Option<Value>) {
        self.event_bus
            .publish(Event::new(
                "orchestrator",
                EventKind::WorkflowExecutionCompleted {
                    workflow_id: workflow_id.to_string(),
                    status,
                    result: result.clone(),
                    final_result: result,
                    execution_log: Vec::new(),
                    execution_summary: None,
                    error: None,
                },
            ))
            .await;
    }

    pub async fn apply_canvas_change(
        &self,
        workflow_id: &str,
        change_type: CanvasChangeType,
        change_data: &Value,
        version: u64,
    ) -> CanvasApplyResult {
        self.sync.apply_canvas_change(workflow_id, change_type, change_data, version).await
    }

    pub fn status(&self) -> OrchestratorStatus {
        let bus_stats = self.event_bus.stats();
        OrchestratorStatus {
            system: self.coordinator.get_system_status(),
            sync: self.sync.stats(),
            event_bus_published: bus_stats.published,
            event_bus_dropped: bus_stats.dropped_by_middleware,
        }
    }
}
