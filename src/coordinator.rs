//! Coordinator: composition root binding the rule engine, policy chain,
//! failure orchestrator, context compressor/snapshots, and knowledge
//! orchestrator. Subscribes to workflow/node/reflection/sub-agent events and
//! exposes synchronous query methods over the resulting state.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::compression::{self, CompressionInput, SourceType};
use crate::config::CoordinationConfig;
use crate::context_service::{ContextResponse, ContextService, WorkflowContextProvider};
use crate::context_store::ContextStore;
use crate::decision::Decision;
use crate::error::ErrorCode;
use crate::event_bus::{EventBus, EventHandler, Middleware};
use crate::events::{Event, EventKind, NodeStatus, WorkflowStatus};
use crate::failure::{FailureOrchestrator, FailureStrategy};
use crate::knowledge::KnowledgeOrchestrator;
use crate::policy::{CoordinatorPolicyChain, DecisionValidator};
use crate::ports::WorkflowAgentPort;
use crate::rules::{validate_workflow_dag, RuleEngine, ValidationResult};
use crate::snapshots::{Snapshot, SnapshotManager};
use crate::workflow_state::{WorkflowState, WorkflowStateRegistry};

/// Aggregate counters exposed via `get_system_status`.
#[derive(Debug, Default, Clone)]
pub struct SystemStatus {
    pub workflow_count: usize,
    pub running_workflows: usize,
    pub completed_workflows: usize,
    pub failed_workflows: usize,
    pub policy_total: u64,
    pub policy_rejected: u64,
    pub policy_rejection_rate_high: bool,
}

/// A merged, timestamp-ordered log line from one of the three sources the
/// Coordinator observes.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: time::OffsetDateTime,
    pub source: String,
    pub message: String,
}

/// Binds all the coordination subsystems together. The `rules`/`policy`
/// split mirrors the source: the rule engine decides validity, the policy
/// chain enforces process (dedupe, fail-closed, event emission).
pub struct Coordinator {
    event_bus: Arc<EventBus>,
    rules: parking_lot::RwLock<RuleEngine>,
    policy: CoordinatorPolicyChain,
    failures: FailureOrchestrator,
    workflow_states: WorkflowStateRegistry,
    contexts: ContextStore,
    snapshots: SnapshotManager,
    knowledge: KnowledgeOrchestrator,
    context_service: ContextService,
    compression_enabled: std::sync::atomic::AtomicBool,
    subagent_results: parking_lot::Mutex<HashMap<String, Vec<Value>>>,
    workflow_agent: parking_lot::Mutex<Option<Arc<dyn WorkflowAgentPort>>>,
    config: CoordinationConfig,
}

impl Coordinator {
    /// `CoordinatorPolicyChain` validates decisions through `self`, but `self`
    /// doesn't exist until construction finishes. `Arc::new_cyclic` hands us
    /// a `Weak` to the not-yet-built `Arc` up front; `ValidatorHandle` wraps
    /// it and upgrades on every call instead of requiring the `Arc` itself.
    pub fn new(event_bus: Arc<EventBus>, config: CoordinationConfig, knowledge: KnowledgeOrchestrator) -> Arc<Self> {
        let coordinator = Arc::new_cyclic(|weak: &Weak<Coordinator>| {
            let policy = CoordinatorPolicyChain::new(
                Some(Arc::new(ValidatorHandle(weak.clone())) as Arc<dyn DecisionValidator>),
                Some(event_bus.clone()),
                "coordinator",
                &config,
            );
            let failures = FailureOrchestrator::new(&config);
            let context_service = ContextService::new(
                None,
                None,
                Some(Arc::new(WorkflowContextHandle(weak.clone())) as Arc<dyn WorkflowContextProvider>),
            );
            Self {
                event_bus: event_bus.clone(),
                rules: parking_lot::RwLock::new(RuleEngine::new()),
                policy,
                failures,
                workflow_states: WorkflowStateRegistry::new(),
                contexts: ContextStore::new(),
                snapshots: SnapshotManager::new(),
                knowledge,
                context_service,
                compression_enabled: std::sync::atomic::AtomicBool::new(true),
                subagent_results: parking_lot::Mutex::new(HashMap::new()),
                workflow_agent: parking_lot::Mutex::new(None),
                config,
            }
        });

        for type_name in [
            "workflow_execution_started",
            "workflow_execution_completed",
            "node_execution_event",
            "workflow_reflection_completed",
            "sub_agent_completed",
            "simple_message",
        ] {
            event_bus.subscribe(type_name, coordinator.clone() as Arc<dyn EventHandler>);
        }

        // §4.3: the Coordinator sits as bus middleware over every `DecisionMade`,
        // not just ones submitted through `Orchestrator::submit_decision` — any
        // other producer publishing straight onto the bus gets the same gate.
        event_bus.add_middleware(Arc::new(PolicyMiddleware(Arc::downgrade(&coordinator))));

        coordinator
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.compression_enabled.store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn add_rule(&self, rule: crate::rules::Rule) {
        self.rules.write().add_rule(rule);
    }

    pub fn rules(&self) -> parking_lot::RwLockReadGuard<'_, RuleEngine> {
        self.rules.read()
    }

    pub fn policy(&self) -> &CoordinatorPolicyChain {
        &self.policy
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn failures(&self) -> &FailureOrchestrator {
        &self.failures
    }

    pub fn knowledge(&self) -> &KnowledgeOrchestrator {
        &self.knowledge
    }

    /// Registers the collaborator the RETRY strategy calls back into.
    /// Without one registered, a retryable failure fails immediately rather
    /// than looping against nothing.
    pub fn set_workflow_agent(&self, agent: Arc<dyn WorkflowAgentPort>) {
        *self.workflow_agent.lock() = Some(agent);
    }

    fn merge_compressed(&self, workflow_id: &str, input: CompressionInput) {
        if !self.compression_enabled.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        let merged = match self.contexts.get(workflow_id) {
            Some(existing) => {
                compression::merge(&existing, &input, self.config.max_segment_length, self.config.next_actions_cap)
            }
            None => compression::compress(&input, self.config.max_segment_length, self.config.next_actions_cap),
        };
        self.snapshots.save(merged.clone());
        self.contexts.set(workflow_id, merged);
    }

    // --- event handlers, dispatched from `EventHandler::handle` ---

    fn on_workflow_started(&self, workflow_id: &str, node_count: usize) {
        self.workflow_states.start(workflow_id, node_count);
    }

    fn on_workflow_completed(&self, workflow_id: &str, status: WorkflowStatus, result: Option<Value>) {
        self.workflow_states.with_mut(workflow_id, |s| s.complete(status, result));
    }

    async fn on_node_event(
        &self,
        workflow_id: &str,
        node_id: &str,
        node_type: &str,
        status: NodeStatus,
        inputs: Option<Value>,
        result: Option<Value>,
        error: Option<String>,
    ) {
        self.workflow_states.with_mut(workflow_id, |s| match status {
            NodeStatus::Running => s.mark_node_running(node_id, inputs.clone()),
            NodeStatus::Completed => s.mark_node_completed(node_id, result.clone()),
            NodeStatus::Failed => s.mark_node_failed(node_id, error.clone().unwrap_or_default()),
            NodeStatus::Skipped => s.mark_node_skipped(node_id),
        });

        let raw = serde_json::json!({
            "executed_nodes": [{
                "node_id": node_id,
                "node_type": node_type,
                "status": match status {
                    NodeStatus::Running => "running",
                    NodeStatus::Completed => "completed",
                    NodeStatus::Failed => "failed",
                    NodeStatus::Skipped => "skipped",
                },
                "output_summary": result.as_ref().map(|r| r.to_string()).unwrap_or_default(),
                "error": error.clone().unwrap_or_default(),
            }],
        });
        self.merge_compressed(
            workflow_id,
            CompressionInput { source_type: SourceType::Execution, workflow_id: workflow_id.to_string(), raw_data: raw },
        );

        if status == NodeStatus::Failed {
            if let Some(error_message) = &error {
                self.knowledge
                    .handle_node_failure_with_knowledge(workflow_id, node_id, "node_failure", Some(error_message.as_str()))
                    .await;
            }
        }
    }

    fn on_reflection_completed(
        &self,
        workflow_id: &str,
        assessment: &str,
        confidence: f64,
        should_retry: bool,
        recommendations: &[String],
    ) {
        let raw = serde_json::json!({
            "assessment": assessment,
            "confidence": confidence,
            "should_retry": should_retry,
            "recommendations": recommendations,
        });
        self.merge_compressed(
            workflow_id,
            CompressionInput { source_type: SourceType::Reflection, workflow_id: workflow_id.to_string(), raw_data: raw },
        );
    }

    fn on_subagent_completed(&self, session_id: &str, record: Value) {
        self.subagent_results.lock().entry(session_id.to_string()).or_default().push(record);
    }

    /// Decide what to do about a failed node and apply the strategy's
    /// side effects (§4.4): mutate `WorkflowState`, publish the
    /// strategy-specific event, and return a caller-facing result.
    pub async fn handle_node_failure(
        &self,
        workflow_id: &str,
        node_id: &str,
        error_code: ErrorCode,
        error_message: &str,
    ) -> Value {
        let strategy = self.failures.strategy_for(node_id);
        let result = self.apply_failure_decision(workflow_id, node_id, strategy, error_code, error_message).await;

        self.event_bus
            .publish(Event::new(
                "coordinator",
                EventKind::NodeFailureHandled {
                    workflow_id: workflow_id.to_string(),
                    node_id: node_id.to_string(),
                    strategy,
                    success: result.get("success").and_then(Value::as_bool).unwrap_or(false),
                    retry_count: self.failures.retry_count(node_id),
                },
            ))
            .await;

        result
    }

    /// RETRY loop: bails immediately for a non-retryable error code, then
    /// calls the registered `WorkflowAgentPort::execute_node_with_result`
    /// after each backed-off delay, stopping on first success or once
    /// `max_retries` attempts are exhausted.
    async fn retry_node(&self, workflow_id: &str, node_id: &str, error_code: ErrorCode, error_message: &str) -> Value {
        if self.failures.retry_precluded(error_code) {
            self.workflow_states.with_mut(workflow_id, |s| s.mark_node_failed(node_id, error_message.to_string()));
            return serde_json::json!({"success": false, "error_message": error_message});
        }

        let agent = self.workflow_agent.lock().clone();
        let Some(agent) = agent else {
            self.workflow_states.with_mut(workflow_id, |s| s.mark_node_failed(node_id, error_message.to_string()));
            return serde_json::json!({
                "success": false,
                "error_message": "no workflow agent registered to retry against",
            });
        };

        loop {
            let attempt = self.failures.record_retry_attempt(node_id);
            if attempt >= self.failures.max_retries() {
                self.workflow_states.with_mut(workflow_id, |s| s.mark_node_failed(node_id, error_message.to_string()));
                return serde_json::json!({"success": false, "error_message": error_message, "retry_count": attempt});
            }
            tokio::time::sleep(self.failures.backoff_delay(attempt)).await;
            match agent.execute_node_with_result(node_id).await {
                Ok(result) => {
                    self.failures.reset(node_id);
                    self.workflow_states.with_mut(workflow_id, |s| s.mark_node_completed(node_id, Some(result.clone())));
                    return serde_json::json!({"success": true, "result": result, "retry_count": attempt + 1});
                }
                Err(_) => continue,
            }
        }
    }

    async fn apply_failure_decision(
        &self,
        workflow_id: &str,
        node_id: &str,
        strategy: FailureStrategy,
        error_code: ErrorCode,
        error_message: &str,
    ) -> Value {
        match strategy {
            FailureStrategy::Retry => self.retry_node(workflow_id, node_id, error_code, error_message).await,
            FailureStrategy::Skip => {
                self.workflow_states.with_mut(workflow_id, |s| s.mark_node_skipped(node_id));
                serde_json::json!({"success": true, "skipped": true})
            }
            FailureStrategy::Abort => {
                self.workflow_states.with_mut(workflow_id, |s| s.mark_node_failed(node_id, error_message.to_string()));
                self.event_bus
                    .publish(Event::new(
                        "coordinator",
                        EventKind::WorkflowAborted { workflow_id: workflow_id.to_string(), reason: error_message.to_string() },
                    ))
                    .await;
                serde_json::json!({"success": false, "aborted": true, "abort_reason": error_message})
            }
            FailureStrategy::Replan => {
                self.workflow_states.with_mut(workflow_id, |s| s.mark_node_failed(node_id, error_message.to_string()));
                let execution_context = self
                    .workflow_states
                    .get(workflow_id)
                    .map(|s| {
                        serde_json::json!({
                            "executed_nodes": s.executed_nodes,
                            "node_outputs": s.node_outputs,
                            "failed_nodes": s.failed_nodes.iter().cloned().collect::<Vec<_>>(),
                        })
                    })
                    .unwrap_or(Value::Null);
                self.event_bus
                    .publish(Event::new(
                        "coordinator",
                        EventKind::WorkflowAdjustmentRequested {
                            workflow_id: workflow_id.to_string(),
                            failed_node_id: node_id.to_string(),
                            failure_reason: error_message.to_string(),
                            suggested_action: crate::events::SuggestedAction::Replan,
                            execution_context,
                        },
                    ))
                    .await;
                serde_json::json!({"success": false, "error_message": format!("Replan requested: {error_message}")})
            }
        }
    }

    // --- queries ---

    pub fn get_workflow_state(&self, workflow_id: &str) -> Option<WorkflowState> {
        self.workflow_states.get(workflow_id)
    }

    pub fn get_all_workflow_states(&self) -> Vec<WorkflowState> {
        self.workflow_states.all()
    }

    pub fn get_system_status(&self) -> SystemStatus {
        let states = self.workflow_states.all();
        let policy_stats = self.policy.stats();
        SystemStatus {
            workflow_count: states.len(),
            running_workflows: states.iter().filter(|s| s.status == WorkflowStatus::Running).count(),
            completed_workflows: states.iter().filter(|s| s.status == WorkflowStatus::Completed).count(),
            failed_workflows: states.iter().filter(|s| s.status == WorkflowStatus::Failed).count(),
            policy_total: policy_stats.total,
            policy_rejected: policy_stats.rejected,
            policy_rejection_rate_high: self.policy.is_rejection_rate_high(),
        }
    }

    pub fn get_compressed_context(&self, workflow_id: &str) -> Option<Arc<crate::compression::CompressedContext>> {
        self.contexts.get(workflow_id)
    }

    pub fn query_subtask_errors(&self, workflow_id: &str) -> Vec<crate::events::ErrorLogEntry> {
        self.contexts.get(workflow_id).map(|c| c.error_log.clone()).unwrap_or_default()
    }

    pub fn query_unresolved_issues(&self, workflow_id: &str) -> Vec<String> {
        self.contexts.get(workflow_id).map(|c| c.reflection_summary.issues.clone()).unwrap_or_default()
    }

    pub fn query_next_plan(&self, workflow_id: &str) -> Vec<String> {
        self.contexts.get(workflow_id).map(|c| c.next_actions.clone()).unwrap_or_default()
    }

    pub fn get_latest_snapshot(&self, workflow_id: &str) -> Option<Snapshot> {
        self.snapshots.get_latest_snapshot(workflow_id)
    }

    /// Ad-hoc "what do you know right now" query: current rules, tools, and
    /// (if present) the workflow's compressed context, without the knowledge
    /// retriever round trip.
    pub fn query_context(&self, user_input: &str, workflow_id: Option<&str>) -> ContextResponse {
        self.context_service.get_context(&self.rules.read(), user_input, workflow_id)
    }

    /// Same as [`Coordinator::query_context`] but also consults the
    /// knowledge retriever wired into the context service, if any.
    pub async fn query_context_async(&self, user_input: &str, workflow_id: Option<&str>) -> ContextResponse {
        let rules = self.rules.read();
        self.context_service.get_context_async(&rules, user_input, workflow_id).await
    }

    pub fn subagent_results(&self, session_id: &str) -> Vec<Value> {
        self.subagent_results.lock().get(session_id).cloned().unwrap_or_default()
    }

    /// Merges the audit log, subagent result records, and workflow log
    /// lines into one timestamp-ordered sequence.
    pub fn get_merged_logs(&self) -> Vec<LogLine> {
        let mut lines: Vec<LogLine> = self
            .event_bus
            .event_log()
            .into_iter()
            .map(|e| LogLine { timestamp: e.timestamp, source: e.source.clone(), message: e.type_name().to_string() })
            .collect();
        lines.sort_by_key(|l| l.timestamp);
        lines
    }
}

/// Delegates to a `Coordinator` via a `Weak` reference so the policy chain
/// can hold a validator pointing back at its own owner without a strong
/// reference cycle.
struct ValidatorHandle(Weak<Coordinator>);

impl DecisionValidator for ValidatorHandle {
    fn validate_decision(&self, decision: &Decision) -> ValidationResult {
        match self.0.upgrade() {
            Some(coordinator) => coordinator.validate_decision(decision),
            None => ValidationResult {
                is_valid: false,
                errors: vec!["coordinator no longer available".to_string()],
                correction: None,
            },
        }
    }
}

/// Hands the context service a way to read a workflow's compressed context
/// without holding a strong reference back to its own owner.
struct WorkflowContextHandle(Weak<Coordinator>);

impl WorkflowContextProvider for WorkflowContextHandle {
    fn get(&self, workflow_id: &str) -> Option<Value> {
        let coordinator = self.0.upgrade()?;
        let context = coordinator.get_compressed_context(workflow_id)?;
        serde_json::to_value(&*context).ok()
    }
}

/// Bus middleware wrapping the policy chain (§4.3): intercepts every
/// `DecisionMade` event, runs it through `enforce_action_or_raise` (which
/// itself publishes `DecisionValidated`/`DecisionRejected`), and returns
/// `None` on rejection to block the original event from reaching any
/// `decision_made` subscriber. Any other `EventKind` passes through
/// untouched.
struct PolicyMiddleware(Weak<Coordinator>);

#[async_trait]
impl Middleware for PolicyMiddleware {
    async fn process(&self, event: Event) -> anyhow::Result<Option<Event>> {
        let EventKind::DecisionMade { decision_type, payload } = &event.kind else {
            return Ok(Some(event));
        };
        let Some(coordinator) = self.0.upgrade() else {
            return Ok(Some(event));
        };

        let decision = Decision::new(event.id.clone(), decision_type.clone(), payload.clone());
        let correlation_id = event.correlation_id.clone().unwrap_or_else(|| event.id.clone());

        match coordinator.policy.enforce_action_or_raise(&decision, &correlation_id, &event.id).await {
            Ok(()) => Ok(Some(event)),
            Err(_) => Ok(None),
        }
    }
}

/// Validates a decision by running the rule engine, plus the DAG rule for
/// `create_workflow_plan` decisions.
impl DecisionValidator for Coordinator {
    fn validate_decision(&self, decision: &Decision) -> ValidationResult {
        let mut result = self.rules.read().validate(decision);
        if decision.decision_type == "create_workflow_plan" {
            let dag_result = validate_workflow_dag(decision);
            if !dag_result.is_valid {
                result.is_valid = false;
                result.errors.extend(dag_result.errors);
            }
        }
        result
    }
}

/// Narrow mutation surface the Knowledge Orchestrator uses to push
/// knowledge/error/reflection updates into a workflow's compressed context
/// without depending on `ContextStore` or `CompressedContext` directly.
impl crate::knowledge::ContextGateway for Coordinator {
    fn task_goal(&self, workflow_id: &str) -> Option<String> {
        self.contexts.get(workflow_id).map(|c| c.task_goal.clone()).filter(|s| !s.is_empty())
    }

    fn update_knowledge_refs(&self, workflow_id: &str, refs: Vec<Value>) {
        if let Some(existing) = self.contexts.get(workflow_id) {
            let mut updated = (*existing).clone();
            updated.knowledge_references = refs;
            self.contexts.set(workflow_id, updated);
        }
    }

    fn update_error_log(&self, workflow_id: &str, node_id: &str, error_type: &str, message: &str) {
        if let Some(existing) = self.contexts.get(workflow_id) {
            let mut updated = (*existing).clone();
            updated.error_log.push(crate::events::ErrorLogEntry {
                node_id: Some(node_id.to_string()),
                error: format!("{error_type}: {message}"),
                retryable: false,
            });
            self.contexts.set(workflow_id, updated);
        }
    }

    fn update_reflection(&self, workflow_id: &str, assessment: &str, confidence: f64, recommendations: Vec<String>) {
        if let Some(existing) = self.contexts.get(workflow_id) {
            let mut updated = (*existing).clone();
            updated.reflection_summary.assessment = assessment.to_string();
            updated.reflection_summary.confidence = confidence;
            updated.reflection_summary.recommendations = recommendations;
            self.contexts.set(workflow_id, updated);
        }
    }
}

#[async_trait]
impl EventHandler for Coordinator {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match &event.kind {
            EventKind::WorkflowExecutionStarted { workflow_id, node_count } => {
                self.on_workflow_started(workflow_id, *node_count);
            }
            EventKind::WorkflowExecutionCompleted { workflow_id, status, result, .. } => {
                self.on_workflow_completed(workflow_id, *status, result.clone());
            }
            EventKind::NodeExecutionEvent { workflow_id, node_id, node_type, status, inputs, result, error, .. } => {
                self.on_node_event(workflow_id, node_id, node_type, *status, inputs.clone(), result.clone(), error.clone())
                    .await;
            }
            EventKind::WorkflowReflectionCompleted { workflow_id, assessment, confidence, should_retry, recommendations } => {
                self.on_reflection_completed(workflow_id, assessment, *confidence, *should_retry, recommendations);
            }
            EventKind::SubAgentCompleted { subagent_id, subagent_type, session_id, success, result, error, execution_time } => {
                let record = serde_json::json!({
                    "subagent_id": subagent_id,
                    "subagent_type": subagent_type,
                    "success": success,
                    "result": result,
                    "error": error,
                    "execution_time": execution_time,
                });
                self.on_subagent_completed(session_id, record);
            }
            EventKind::SimpleMessage { .. } => {}
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventKind};

    fn coordinator() -> Arc<Coordinator> {
        let bus = Arc::new(EventBus::new());
        Coordinator::new(bus, CoordinationConfig::default(), KnowledgeOrchestrator::new(None, None))
    }

    #[tokio::test]
    async fn workflow_started_creates_state() {
        let coordinator = coordinator();
        coordinator
            .handle(&Event::new(
                "test",
                EventKind::WorkflowExecutionStarted { workflow_id: "wf-1".into(), node_count: 2 },
            ))
            .await
            .unwrap();
        assert!(coordinator.get_workflow_state("wf-1").is_some());
    }

    #[tokio::test]
    async fn node_events_update_state_and_context() {
        let coordinator = coordinator();
        coordinator
            .handle(&Event::new("test", EventKind::WorkflowExecutionStarted { workflow_id: "wf-1".into(), node_count: 1 }))
            .await
            .unwrap();
        coordinator
            .handle(&Event::new(
                "test",
                EventKind::NodeExecutionEvent {
                    workflow_id: "wf-1".into(),
                    node_id: "n1".into(),
                    node_type: "LLM".into(),
                    status: NodeStatus::Completed,
                    inputs: None,
                    result: Some(serde_json::json!({"ok": true})),
                    error: None,
                    reason: None,
                },
            ))
            .await
            .unwrap();

        let state = coordinator.get_workflow_state("wf-1").unwrap();
        assert_eq!(state.executed_nodes, vec!["n1"]);
        assert!(coordinator.get_compressed_context("wf-1").is_some());
    }

    #[tokio::test]
    async fn query_context_reflects_current_rules_and_workflow_context() {
        let coordinator = coordinator();
        coordinator.add_rule(crate::rules::Rule::new("allow_all", "allow", 0, |_| true));
        coordinator
            .handle(&Event::new("test", EventKind::WorkflowExecutionStarted { workflow_id: "w".into(), node_count: 1 }))
            .await
            .unwrap();
        coordinator
            .handle(&Event::new(
                "test",
                EventKind::NodeExecutionEvent {
                    workflow_id: "w".into(),
                    node_id: "n1".into(),
                    node_type: "LLM".into(),
                    status: NodeStatus::Completed,
                    inputs: None,
                    result: Some(serde_json::json!({"ok": true})),
                    error: None,
                    reason: None,
                },
            ))
            .await
            .unwrap();

        let response = coordinator.query_context("what's happening", Some("w"));
        assert_eq!(response.rules.len(), 1);
        assert!(response.workflow_context.is_some());

        let no_workflow = coordinator.query_context("what's happening", None);
        assert!(no_workflow.workflow_context.is_none());
    }

    #[tokio::test]
    async fn replan_strategy_publishes_workflow_adjustment_requested() {
        let coordinator = coordinator();
        coordinator
            .handle(&Event::new("test", EventKind::WorkflowExecutionStarted { workflow_id: "w".into(), node_count: 2 }))
            .await
            .unwrap();
        coordinator
            .handle(&Event::new(
                "test",
                EventKind::NodeExecutionEvent {
                    workflow_id: "w".into(),
                    node_id: "prepare".into(),
                    node_type: "Tool".into(),
                    status: NodeStatus::Completed,
                    inputs: None,
                    result: Some(serde_json::json!({"data": [10, 20, 30]})),
                    error: None,
                    reason: None,
                },
            ))
            .await
            .unwrap();

        coordinator.failures().set_override("api", FailureStrategy::Replan);
        let result = coordinator.handle_node_failure("w", "api", ErrorCode::DependencyFailed, "timeout").await;
        assert_eq!(result["success"], false);

        let log = coordinator.event_bus.event_log();
        let adjustment = log.iter().find(|e| matches!(e.kind, EventKind::WorkflowAdjustmentRequested { .. }));
        assert!(adjustment.is_some());
        if let EventKind::WorkflowAdjustmentRequested { execution_context, .. } = &adjustment.unwrap().kind {
            assert_eq!(execution_context["node_outputs"]["prepare"]["data"], serde_json::json!([10, 20, 30]));
        }
    }
}
