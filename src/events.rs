//! Event envelope and the tagged union of events the coordination core
//! exchanges over the [`crate::event_bus::EventBus`].
//!
//! Every concrete event is modeled as one variant of a single tagged enum
//! rather than a hierarchy of loosely related payload shapes, so a handler
//! matching on `EventKind` gets exhaustiveness checking from the compiler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::conversation_state::ConversationAgentState;
use crate::failure::FailureStrategy;

/// Generates a 128-bit random id rendered as a hyphenated hex string.
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// UTC timestamp with microsecond precision, ISO-8601 rendered lazily via
/// `time`'s `Serialize` impl.
pub fn now() -> time::OffsetDateTime {
    time::OffsetDateTime::now_utc()
}

/// Node execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Overall workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

/// `suggested_action` carried by `WorkflowAdjustmentRequested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Retry,
    Skip,
    Abort,
    Replan,
}

impl From<FailureStrategy> for SuggestedAction {
    fn from(s: FailureStrategy) -> Self {
        match s {
            FailureStrategy::Retry => SuggestedAction::Retry,
            FailureStrategy::Skip => SuggestedAction::Skip,
            FailureStrategy::Abort => SuggestedAction::Abort,
            FailureStrategy::Replan => SuggestedAction::Replan,
        }
    }
}

/// `change_type` of a `CanvasChange` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanvasChangeType {
    NodeAdded,
    NodeUpdated,
    NodeDeleted,
    NodeMoved,
    EdgeAdded,
    EdgeDeleted,
}

impl CanvasChangeType {
    /// node_added / edge_added are additive: no version check.
    pub fn is_additive(self) -> bool {
        matches!(self, CanvasChangeType::NodeAdded | CanvasChangeType::EdgeAdded)
    }
}

/// Sub-agent kind carried in `SpawnSubAgent.subagent_type`. The source's
/// scheduler execution semantics for these variants live outside this core;
/// we only carry the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentType {
    Search,
    Mcp,
    PythonExecutor,
    DataProcessor,
    Other(String),
}

/// The tagged union of domain events. Concrete events inherit the
/// envelope (`id`, `timestamp`, `source`, `correlation_id`) by carrying it in
/// every variant's payload via [`Event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    DecisionMade {
        decision_type: String,
        payload: Value,
    },
    DecisionValidated {
        original_decision_id: String,
        decision_type: String,
        payload: Value,
    },
    DecisionRejected {
        original_decision_id: String,
        decision_type: String,
        reason: String,
        errors: Vec<String>,
    },
    WorkflowExecutionStarted {
        workflow_id: String,
        node_count: usize,
    },
    WorkflowExecutionCompleted {
        workflow_id: String,
        status: WorkflowStatus,
        result: Option<Value>,
        final_result: Option<Value>,
        execution_log: Vec<String>,
        execution_summary: Option<String>,
        error: Option<String>,
    },
    NodeExecutionEvent {
        workflow_id: String,
        node_id: String,
        node_type: String,
        status: NodeStatus,
        inputs: Option<Value>,
        result: Option<Value>,
        error: Option<String>,
        reason: Option<String>,
    },
    WorkflowReflectionCompleted {
        workflow_id: String,
        assessment: String,
        confidence: f64,
        should_retry: bool,
        recommendations: Vec<String>,
    },
    StateChanged {
        from_state: ConversationAgentState,
        to_state: ConversationAgentState,
        session_id: String,
    },
    SpawnSubAgent {
        subagent_type: SubAgentType,
        task_payload: Value,
        priority: i32,
        session_id: String,
        context_snapshot: Value,
    },
    SubAgentCompleted {
        subagent_id: String,
        subagent_type: SubAgentType,
        session_id: String,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
        execution_time: Option<f64>,
    },
    WorkflowAdjustmentRequested {
        workflow_id: String,
        failed_node_id: String,
        failure_reason: String,
        suggested_action: SuggestedAction,
        execution_context: Value,
    },
    WorkflowAborted {
        workflow_id: String,
        reason: String,
    },
    NodeFailureHandled {
        workflow_id: String,
        node_id: String,
        strategy: FailureStrategy,
        success: bool,
        retry_count: u32,
    },
    CanvasChange {
        workflow_id: String,
        change_type: CanvasChangeType,
        change_data: Value,
        client_id: String,
        version: u64,
    },
    /// Opaque payload referenced by subscription but whose fields vary
    /// across call sites in the source system.
    SimpleMessage {
        payload: Value,
    },
}

impl EventKind {
    /// Stable type name used for subscription routing and audit logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::DecisionMade { .. } => "decision_made",
            EventKind::DecisionValidated { .. } => "decision_validated",
            EventKind::DecisionRejected { .. } => "decision_rejected",
            EventKind::WorkflowExecutionStarted { .. } => "workflow_execution_started",
            EventKind::WorkflowExecutionCompleted { .. } => "workflow_execution_completed",
            EventKind::NodeExecutionEvent { .. } => "node_execution_event",
            EventKind::WorkflowReflectionCompleted { .. } => "workflow_reflection_completed",
            EventKind::StateChanged { .. } => "state_changed",
            EventKind::SpawnSubAgent { .. } => "spawn_sub_agent",
            EventKind::SubAgentCompleted { .. } => "sub_agent_completed",
            EventKind::WorkflowAdjustmentRequested { .. } => "workflow_adjustment_requested",
            EventKind::WorkflowAborted { .. } => "workflow_aborted",
            EventKind::NodeFailureHandled { .. } => "node_failure_handled",
            EventKind::CanvasChange { .. } => "canvas_change",
            EventKind::SimpleMessage { .. } => "simple_message",
        }
    }
}

/// Immutable event envelope. `id`/`timestamp` are generated at
/// construction; `correlation_id` links a chain of events for audit/dedupe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(with = "time::serde::iso8601")]
    pub timestamp: time::OffsetDateTime,
    pub source: String,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(source: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: new_event_id(),
            timestamp: now(),
            source: source.into(),
            correlation_id: None,
            kind,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

/// A single decoded error-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub node_id: Option<String>,
    pub error: String,
    pub retryable: bool,
}

/// Free-form metadata carried by a few event payloads; kept as a typed alias
/// so call sites don't litter `HashMap<String, Value>` everywhere.
pub type Metadata = HashMap<String, Value>;
