//! Conversation-agent finite state machine: IDLE/PROCESSING/
//! WAITING_FOR_SUBAGENT/COMPLETED/ERROR over a closed transition table, plus
//! the sub-agent suspend/resume lifecycle and the two-lock event publication
//! discipline that keeps `StateChanged` ordering intact without serializing
//! the whole agent behind the event bus.
//!
//! Two locks guard disjoint concerns and must never be held across each
//! other: `state_lock` protects `state`/the pending sub-agent slot, while
//! `critical_event_lock` only serializes publication of events that must
//! reach subscribers in transition order. A caller that holds `state_lock`
//! while awaiting `critical_event_lock` (or the bus directly) risks a
//! publish-side handler trying to read state back through the same lock.
//! Every async transition here releases `state_lock` before publishing.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

use async_trait::async_trait;

use crate::error::InvalidTransition;
use crate::event_bus::EventBus;
use crate::events::{Event, EventKind};

/// The conversation agent's execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationAgentState {
    Idle,
    Processing,
    WaitingForSubagent,
    Completed,
    Error,
}

/// The closed transition table: a state may only move to the states listed
/// here. Anything else is rejected by [`InvalidTransition`].
fn valid_transitions(state: ConversationAgentState) -> &'static [ConversationAgentState] {
    use ConversationAgentState::*;
    match state {
        Idle => &[Processing, Error],
        Processing => &[WaitingForSubagent, Completed, Error, Idle],
        WaitingForSubagent => &[Processing, Error],
        Completed => &[Idle],
        Error => &[Idle],
    }
}

/// Outcome of a completed sub-agent task, as delivered by
/// `EventKind::SubAgentCompleted`.
#[derive(Debug, Clone)]
pub struct SubAgentOutcome {
    pub subagent_id: String,
    pub subagent_type: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub execution_time: Option<f64>,
}

/// A decoded result record kept in `subagent_result_history`.
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentResultRecord {
    pub subagent_id: String,
    pub subagent_type: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub execution_time: Option<f64>,
}

#[derive(Debug, Clone, Default)]
struct PendingSubAgent {
    subagent_id: String,
    task_id: String,
    suspended_context: Value,
}

struct Inner {
    state: ConversationAgentState,
    pending: Option<PendingSubAgent>,
    last_subagent_result: Option<Value>,
    subagent_result_history: Vec<SubAgentResultRecord>,
}

/// Owns the state machine for one conversation session.
pub struct ConversationAgent {
    session_id: String,
    event_bus: Option<Arc<EventBus>>,
    state_lock: AsyncMutex<Inner>,
    critical_event_lock: AsyncMutex<()>,
    tracked_tasks: AsyncMutex<JoinSet<()>>,
    feedback: FeedbackInbox,
}

impl ConversationAgent {
    pub fn new(session_id: impl Into<String>, event_bus: Option<Arc<EventBus>>) -> Self {
        Self {
            session_id: session_id.into(),
            event_bus,
            state_lock: AsyncMutex::new(Inner {
                state: ConversationAgentState::Idle,
                pending: None,
                last_subagent_result: None,
                subagent_result_history: Vec::new(),
            }),
            critical_event_lock: AsyncMutex::new(()),
            tracked_tasks: AsyncMutex::new(JoinSet::new()),
            feedback: FeedbackInbox::new(),
        }
    }

    pub async fn state(&self) -> ConversationAgentState {
        self.state_lock.lock().await.state
    }

    pub async fn is_idle(&self) -> bool {
        self.state().await == ConversationAgentState::Idle
    }

    pub async fn is_processing(&self) -> bool {
        self.state().await == ConversationAgentState::Processing
    }

    pub async fn is_waiting_for_subagent(&self) -> bool {
        self.state().await == ConversationAgentState::WaitingForSubagent
    }

    /// Publish on a background task tracked in `tracked_tasks` so it cannot
    /// be dropped mid-flight, but without blocking the caller or
    /// serializing against other notification events.
    async fn publish_notification(&self, event: Event) {
        let Some(bus) = self.event_bus.clone() else { return };
        let mut tasks = self.tracked_tasks.lock().await;
        tasks.spawn(async move {
            bus.publish(event).await;
        });
        // Opportunistically drain finished tasks so the set doesn't grow
        // unbounded across a long session.
        while tasks.try_join_next().is_some() {}
    }

    /// Publish an event that must preserve ordering relative to other
    /// critical events, fully awaited before returning.
    async fn publish_critical(&self, event: Event) {
        let Some(bus) = self.event_bus.clone() else { return };
        let _guard = self.critical_event_lock.lock().await;
        bus.publish(event).await;
    }

    fn transition_locked(
        inner: &mut Inner,
        new_state: ConversationAgentState,
    ) -> Result<ConversationAgentState, InvalidTransition> {
        if !valid_transitions(inner.state).contains(&new_state) {
            return Err(InvalidTransition { from: inner.state, to: new_state });
        }
        let old_state = inner.state;
        inner.state = new_state;
        Ok(old_state)
    }

    fn state_changed_event(&self, old: ConversationAgentState, new: ConversationAgentState) -> Event {
        Event::new(
            "conversation_agent",
            EventKind::StateChanged { from_state: old, to_state: new, session_id: self.session_id.clone() },
        )
    }

    /// Synchronous transition: locks briefly to mutate state, then fires a
    /// tracked background publish. Use only off the critical path; ordering
    /// relative to other critical events is not guaranteed.
    pub async fn transition_to(
        &self,
        new_state: ConversationAgentState,
    ) -> Result<(), InvalidTransition> {
        let old_state = {
            let mut inner = self.state_lock.lock().await;
            Self::transition_locked(&mut inner, new_state)?
        };
        self.publish_notification(self.state_changed_event(old_state, new_state)).await;
        Ok(())
    }

    /// Async transition with ordering guarantee: state mutation happens
    /// under `state_lock`, then the lock is released before the
    /// `StateChanged` event is awaited through `critical_event_lock`.
    pub async fn transition_to_async(
        &self,
        new_state: ConversationAgentState,
    ) -> Result<(), InvalidTransition> {
        let old_state = {
            let mut inner = self.state_lock.lock().await;
            Self::transition_locked(&mut inner, new_state)?
        };
        self.publish_critical(self.state_changed_event(old_state, new_state)).await;
        Ok(())
    }

    /// Announces intent to delegate to a sub-agent, then suspends into
    /// `WaitingForSubagent` to wait for its result. `SpawnSubAgent` and the
    /// resulting `StateChanged` are the two critical events a single
    /// delegation produces (§5); both go through `publish_critical` so a
    /// concurrent transition on this agent cannot interleave between them.
    pub async fn spawn_subagent_and_wait(
        &self,
        subagent_type: crate::events::SubAgentType,
        subagent_id: impl Into<String>,
        task_id: impl Into<String>,
        task_payload: Value,
        priority: i32,
        context: Value,
    ) -> Result<(), InvalidTransition> {
        let subagent_id = subagent_id.into();
        let task_id = task_id.into();
        self.publish_critical(Event::new(
            "conversation_agent",
            EventKind::SpawnSubAgent {
                subagent_type,
                task_payload,
                priority,
                session_id: self.session_id.clone(),
                context_snapshot: context.clone(),
            },
        ))
        .await;
        self.wait_for_subagent_async(subagent_id, task_id, context).await
    }

    /// Suspend execution to wait on a sub-agent: records the pending slot
    /// and transitions to `WaitingForSubagent` atomically under one lock
    /// acquisition, then publishes the resulting `StateChanged` event.
    pub async fn wait_for_subagent_async(
        &self,
        subagent_id: impl Into<String>,
        task_id: impl Into<String>,
        context: Value,
    ) -> Result<(), InvalidTransition> {
        let old_state = {
            let mut inner = self.state_lock.lock().await;
            inner.pending = Some(PendingSubAgent {
                subagent_id: subagent_id.into(),
                task_id: task_id.into(),
                suspended_context: context,
            });
            Self::transition_locked(&mut inner, ConversationAgentState::WaitingForSubagent)?
        };
        self.publish_critical(self.state_changed_event(old_state, ConversationAgentState::WaitingForSubagent))
            .await;
        Ok(())
    }

    /// Resume from a sub-agent wait: merges the sub-agent result into the
    /// suspended context, clears the pending slot, and transitions back to
    /// `Processing`, all under one lock acquisition before the event is
    /// published.
    pub async fn resume_from_subagent_async(
        &self,
        result: Value,
    ) -> Result<Value, InvalidTransition> {
        let (old_state, context) = {
            let mut inner = self.state_lock.lock().await;
            let mut context = inner
                .pending
                .take()
                .map(|p| p.suspended_context)
                .unwrap_or_else(|| Value::Object(Default::default()));
            if let Value::Object(ref mut map) = context {
                map.insert("subagent_result".to_string(), result);
            }
            let old_state = Self::transition_locked(&mut inner, ConversationAgentState::Processing)?;
            (old_state, context)
        };
        self.publish_critical(self.state_changed_event(old_state, ConversationAgentState::Processing))
            .await;
        Ok(context)
    }

    /// Handle a `SubAgentCompleted` event: ignores it unless it matches the
    /// sub-agent we're waiting for and we're actually in
    /// `WaitingForSubagent`; otherwise records the result and resumes.
    pub async fn handle_subagent_completed(&self, outcome: SubAgentOutcome) -> Result<(), InvalidTransition> {
        {
            let mut inner = self.state_lock.lock().await;
            let matches_pending = inner
                .pending
                .as_ref()
                .map(|p| p.subagent_id == outcome.subagent_id)
                .unwrap_or(false);
            if !matches_pending || inner.state != ConversationAgentState::WaitingForSubagent {
                return Ok(());
            }

            let mut result = serde_json::Map::new();
            result.insert("success".to_string(), Value::Bool(outcome.success));
            result.insert("data".to_string(), outcome.data.clone().unwrap_or(Value::Null));
            result.insert(
                "error".to_string(),
                outcome.error.clone().map(Value::String).unwrap_or(Value::Null),
            );
            inner.last_subagent_result = Some(Value::Object(result));
            inner.subagent_result_history.push(SubAgentResultRecord {
                subagent_id: outcome.subagent_id.clone(),
                subagent_type: outcome.subagent_type.clone(),
                success: outcome.success,
                data: outcome.data.clone(),
                error: outcome.error.clone(),
                execution_time: outcome.execution_time,
            });
        }

        let mut result = serde_json::Map::new();
        result.insert("success".to_string(), Value::Bool(outcome.success));
        result.insert("data".to_string(), outcome.data.unwrap_or(Value::Null));
        result.insert("error".to_string(), outcome.error.map(Value::String).unwrap_or(Value::Null));
        self.resume_from_subagent_async(Value::Object(result)).await?;
        Ok(())
    }

    pub async fn last_subagent_result(&self) -> Option<Value> {
        self.state_lock.lock().await.last_subagent_result.clone()
    }

    pub async fn subagent_result_history(&self) -> Vec<SubAgentResultRecord> {
        self.state_lock.lock().await.subagent_result_history.clone()
    }

    /// Feedback queued from `WorkflowAdjustmentRequested`/`NodeFailureHandled`
    /// events, retrieved by the reasoning loop on its next turn.
    pub async fn get_pending_feedbacks(&self) -> Vec<Value> {
        self.feedback.get_pending().await
    }

    pub async fn clear_feedbacks(&self) {
        self.feedback.clear().await
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Subscribed to `WorkflowAdjustmentRequested` and `NodeFailureHandled`:
/// every matching event is appended to the feedback inbox for the reasoning
/// loop to pick up, independent of the state-machine lock.
#[async_trait]
impl crate::event_bus::EventHandler for ConversationAgent {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match &event.kind {
            EventKind::WorkflowAdjustmentRequested { .. } | EventKind::NodeFailureHandled { .. } => {
                self.feedback.push(serde_json::to_value(&event.kind)?).await;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Conversational "feedback" messages queued for the agent to pick up on its
/// next processing turn (e.g. user corrections delivered mid-workflow).
/// Kept as a simple append/drain inbox guarded by its own lock rather than
/// folded into `state_lock`, since feedback delivery never participates in
/// state transitions.
pub struct FeedbackInbox {
    items: AsyncMutex<Vec<Value>>,
}

impl FeedbackInbox {
    pub fn new() -> Self {
        Self { items: AsyncMutex::new(Vec::new()) }
    }

    pub async fn push(&self, feedback: Value) {
        self.items.lock().await.push(feedback);
    }

    pub async fn get_pending(&self) -> Vec<Value> {
        self.items.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.items.lock().await.clear();
    }
}

impl Default for FeedbackInbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyed collection of per-session agent states, owned by the orchestrator.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: AsyncMutex<HashMap<String, Arc<ConversationAgent>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or returns) the agent for `session_id`. On first creation,
    /// subscribes it to `workflow_adjustment_requested`/`node_failure_handled`
    /// so its feedback inbox fills without the caller wiring that up by hand.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        event_bus: Option<Arc<EventBus>>,
    ) -> Arc<ConversationAgent> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(session_id) {
            return existing.clone();
        }
        let agent = Arc::new(ConversationAgent::new(session_id, event_bus.clone()));
        if let Some(bus) = &event_bus {
            let handler = agent.clone() as Arc<dyn crate::event_bus::EventHandler>;
            bus.subscribe("workflow_adjustment_requested", handler.clone());
            bus.subscribe("node_failure_handled", handler);
        }
        sessions.insert(session_id.to_string(), agent.clone());
        agent
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<ConversationAgent>> {
        self.sessions.lock().await.get(session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_to_processing_is_valid() {
        let agent = ConversationAgent::new("s1", None);
        agent.transition_to_async(ConversationAgentState::Processing).await.unwrap();
        assert!(agent.is_processing().await);
    }

    #[tokio::test]
    async fn idle_to_waiting_is_rejected() {
        let agent = ConversationAgent::new("s1", None);
        let err = agent.transition_to_async(ConversationAgentState::WaitingForSubagent).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn wait_then_resume_round_trips_context() {
        let agent = ConversationAgent::new("s1", None);
        agent.transition_to_async(ConversationAgentState::Processing).await.unwrap();
        agent
            .wait_for_subagent_async("sa-1", "task-1", serde_json::json!({"goal": "x"}))
            .await
            .unwrap();
        assert!(agent.is_waiting_for_subagent().await);

        let context = agent.resume_from_subagent_async(serde_json::json!({"ok": true})).await.unwrap();
        assert!(agent.is_processing().await);
        assert_eq!(context["goal"], "x");
        assert_eq!(context["subagent_result"]["ok"], true);
    }

    #[tokio::test]
    async fn spawn_subagent_and_wait_publishes_spawn_then_state_changed() {
        let bus = Arc::new(EventBus::new());
        let agent = ConversationAgent::new("s1", Some(bus.clone()));
        agent.transition_to_async(ConversationAgentState::Processing).await.unwrap();

        agent
            .spawn_subagent_and_wait(
                crate::events::SubAgentType::Search,
                "sa-1",
                "task-1",
                serde_json::json!({"q": "weather"}),
                5,
                serde_json::json!({"goal": "y"}),
            )
            .await
            .unwrap();

        assert!(agent.is_waiting_for_subagent().await);
        let log = bus.event_log();
        assert_eq!(log.len(), 2);
        assert!(matches!(log[0].kind, EventKind::SpawnSubAgent { .. }));
        assert!(matches!(log[1].kind, EventKind::StateChanged { .. }));
    }

    #[tokio::test]
    async fn handle_subagent_completed_ignores_mismatched_id() {
        let agent = ConversationAgent::new("s1", None);
        agent.transition_to_async(ConversationAgentState::Processing).await.unwrap();
        agent.wait_for_subagent_async("sa-1", "task-1", serde_json::json!({})).await.unwrap();

        agent
            .handle_subagent_completed(SubAgentOutcome {
                subagent_id: "sa-other".into(),
                subagent_type: "search".into(),
                success: true,
                data: None,
                error: None,
                execution_time: None,
            })
            .await
            .unwrap();

        assert!(agent.is_waiting_for_subagent().await);
    }

    #[tokio::test]
    async fn handle_subagent_completed_resumes_on_match() {
        let agent = ConversationAgent::new("s1", None);
        agent.transition_to_async(ConversationAgentState::Processing).await.unwrap();
        agent.wait_for_subagent_async("sa-1", "task-1", serde_json::json!({})).await.unwrap();

        agent
            .handle_subagent_completed(SubAgentOutcome {
                subagent_id: "sa-1".into(),
                subagent_type: "search".into(),
                success: true,
                data: Some(serde_json::json!({"hits": 3})),
                error: None,
                execution_time: Some(0.2),
            })
            .await
            .unwrap();

        assert!(agent.is_processing().await);
        let history = agent.subagent_result_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].subagent_id, "sa-1");
    }

    #[tokio::test]
    async fn completed_only_returns_to_idle() {
        let agent = ConversationAgent::new("s1", None);
        agent.transition_to_async(ConversationAgentState::Processing).await.unwrap();
        agent.transition_to_async(ConversationAgentState::Completed).await.unwrap();
        assert!(agent.transition_to_async(ConversationAgentState::Processing).await.is_err());
        agent.transition_to_async(ConversationAgentState::Idle).await.unwrap();
        assert!(agent.is_idle().await);
    }

    #[tokio::test]
    async fn registry_subscribes_agent_to_feedback_events() {
        let bus = Arc::new(EventBus::new());
        let registry = SessionRegistry::new();
        let agent = registry.get_or_create("s1", Some(bus.clone())).await;

        bus.publish(Event::new(
            "test",
            EventKind::NodeFailureHandled {
                workflow_id: "w".into(),
                node_id: "n".into(),
                strategy: crate::failure::FailureStrategy::Retry,
                success: false,
                retry_count: 2,
            },
        ))
        .await;

        let pending = agent.get_pending_feedbacks().await;
        assert_eq!(pending.len(), 1);
        agent.clear_feedbacks().await;
        assert!(agent.get_pending_feedbacks().await.is_empty());
    }
}
