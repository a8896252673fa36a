//! End-to-end scenarios exercising the coordination core as a whole:
//! decision validation (allow/block), retry-to-success and replan recovery,
//! snapshot monotonicity, and canvas conflict detection.

use std::sync::Arc;

use flowmind_coordination::config::CoordinationConfig;
use flowmind_coordination::coordinator::Coordinator;
use flowmind_coordination::decision::Decision;
use flowmind_coordination::error::ErrorCode;
use flowmind_coordination::event_bus::{EventBus, EventHandler};
use flowmind_coordination::events::{Event, EventKind, NodeStatus};
use flowmind_coordination::failure::FailureStrategy;
use flowmind_coordination::knowledge::KnowledgeOrchestrator;
use flowmind_coordination::ports::WorkflowAgentPort;
use flowmind_coordination::rules::Rule;

fn new_coordinator() -> Arc<Coordinator> {
    let bus = Arc::new(EventBus::new());
    Coordinator::new(bus, CoordinationConfig::default(), KnowledgeOrchestrator::new(None, None))
}

/// Fails its first `fail_times` calls to `execute_node_with_result`, then
/// succeeds on every subsequent call.
struct FlakyAgent {
    fail_times: usize,
    calls: std::sync::atomic::AtomicUsize,
}

impl FlakyAgent {
    fn new(fail_times: usize) -> Self {
        Self { fail_times, calls: std::sync::atomic::AtomicUsize::new(0) }
    }
}

#[async_trait::async_trait]
impl WorkflowAgentPort for FlakyAgent {
    async fn handle_decision(&self, _decision: &Decision) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn execute_node_with_result(&self, _node_id: &str) -> anyhow::Result<serde_json::Value> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if call < self.fail_times {
            anyhow::bail!("transient failure #{call}")
        } else {
            Ok(serde_json::json!({"ok": true}))
        }
    }
}

/// Given an always-true rule, a `create_node` decision validates and
/// publishes exactly one `DecisionValidated` and zero `DecisionRejected`.
#[tokio::test]
async fn allow_path_validates_decision_once() {
    let coordinator = new_coordinator();
    coordinator.add_rule(Rule::new("allow_all", "allow", 0, |_| true));

    let decision = Decision::new("d1", "create_node", serde_json::json!({"node_type": "LLM"}));
    coordinator.policy().enforce_action_or_raise(&decision, "c1", "d1").await.unwrap();

    let log = coordinator.get_merged_logs();
    let validated = log.iter().filter(|l| l.message == "decision_validated").count();
    let rejected = log.iter().filter(|l| l.message == "decision_rejected").count();
    assert_eq!(validated, 1);
    assert_eq!(rejected, 0);
    assert_eq!(coordinator.policy().stats().total, 1);
    assert_eq!(coordinator.policy().stats().passed, 1);
}

/// Given a rule blocking `node_type == "DANGEROUS"`, the matching decision is
/// rejected with the rule's configured error message.
#[tokio::test]
async fn block_path_rejects_decision_with_reason() {
    let coordinator = new_coordinator();
    coordinator.add_rule(
        Rule::new("block_dangerous", "block", 0, |d| {
            d.payload.get("node_type").and_then(|v| v.as_str()) != Some("DANGEROUS")
        })
        .with_error_message("blocked"),
    );

    let decision = Decision::new("d1", "create_node", serde_json::json!({"node_type": "DANGEROUS"}));
    let err = coordinator.policy().enforce_action_or_raise(&decision, "c1", "d1").await.unwrap_err();
    assert_eq!(err.errors, vec!["blocked"]);

    let log = coordinator.get_merged_logs();
    assert_eq!(log.iter().filter(|l| l.message == "decision_validated").count(), 0);
    assert_eq!(log.iter().filter(|l| l.message == "decision_rejected").count(), 1);
}

/// A retryable error code retries against the registered workflow agent,
/// succeeding within `max_retries` and marking the node executed (not
/// failed), recording exactly as many collaborator calls as retries needed.
#[tokio::test]
async fn retry_to_success_marks_node_executed_not_failed() {
    let coordinator = new_coordinator();
    coordinator.set_workflow_agent(Arc::new(FlakyAgent::new(2)));
    coordinator
        .handle(&Event::new(
            "test",
            EventKind::WorkflowExecutionStarted { workflow_id: "w".into(), node_count: 1 },
        ))
        .await
        .unwrap();

    let outcome = coordinator.handle_node_failure("w", "n", ErrorCode::Timeout, "timeout #1").await;
    assert_eq!(outcome["success"], true);
    assert_eq!(outcome["retry_count"].as_u64().unwrap(), 3);

    let state = coordinator.get_workflow_state("w").unwrap();
    assert!(state.executed_nodes.contains(&"n".to_string()));
    assert!(!state.failed_nodes.contains("n"));
}

/// A node that failed once (observed via `NodeExecutionEvent(Failed)`, same
/// as §4.4's "On `NodeExecutionEvent(failed)`: ... add to `failed_nodes`")
/// and is then retried to success must leave `failed_nodes` clean — S3's
/// invariant is `n ∈ executed_nodes, n ∉ failed_nodes`, not "also still in
/// `failed_nodes`".
#[tokio::test]
async fn retry_to_success_after_an_observed_failure_clears_failed_nodes() {
    let coordinator = new_coordinator();
    coordinator.set_workflow_agent(Arc::new(FlakyAgent::new(1)));
    coordinator
        .handle(&Event::new(
            "test",
            EventKind::WorkflowExecutionStarted { workflow_id: "w".into(), node_count: 1 },
        ))
        .await
        .unwrap();
    coordinator
        .handle(&Event::new(
            "test",
            EventKind::NodeExecutionEvent {
                workflow_id: "w".into(),
                node_id: "n".into(),
                node_type: "LLM".into(),
                status: NodeStatus::Failed,
                inputs: None,
                result: None,
                error: Some("timeout #0".into()),
                reason: None,
            },
        ))
        .await
        .unwrap();
    assert!(coordinator.get_workflow_state("w").unwrap().failed_nodes.contains("n"));

    let outcome = coordinator.handle_node_failure("w", "n", ErrorCode::Timeout, "timeout #0").await;
    assert_eq!(outcome["success"], true);

    let state = coordinator.get_workflow_state("w").unwrap();
    assert!(state.executed_nodes.contains(&"n".to_string()));
    assert!(!state.failed_nodes.contains("n"));
}

/// A non-retryable error code under the RETRY strategy fails immediately
/// without ever calling the registered workflow agent.
#[tokio::test]
async fn retry_precluded_for_non_retryable_fails_without_calling_agent() {
    let coordinator = new_coordinator();
    let agent = Arc::new(FlakyAgent::new(0));
    coordinator.set_workflow_agent(agent.clone());
    coordinator
        .handle(&Event::new(
            "test",
            EventKind::WorkflowExecutionStarted { workflow_id: "w".into(), node_count: 1 },
        ))
        .await
        .unwrap();

    let outcome = coordinator.handle_node_failure("w", "n", ErrorCode::ValidationFailed, "bad input").await;
    assert_eq!(outcome["success"], false);
    assert_eq!(agent.calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    let state = coordinator.get_workflow_state("w").unwrap();
    assert!(state.failed_nodes.contains("n"));
}

/// With a per-node override forcing REPLAN, a node failure publishes exactly
/// one `WorkflowAdjustmentRequested` carrying the prior node's output intact.
#[tokio::test]
async fn replan_override_emits_adjustment_with_prior_output() {
    let coordinator = new_coordinator();
    coordinator
        .handle(&Event::new(
            "test",
            EventKind::WorkflowExecutionStarted { workflow_id: "w".into(), node_count: 2 },
        ))
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
    let outcome = coordinator.handle_node_failure("w", "api", ErrorCode::Timeout, "timeout").await;
    assert_eq!(outcome["success"], false);

    let log = coordinator.event_bus().event_log();
    let adjustments: Vec<_> =
        log.iter().filter(|e| matches!(e.kind, EventKind::WorkflowAdjustmentRequested { .. })).collect();
    assert_eq!(adjustments.len(), 1);
    if let EventKind::WorkflowAdjustmentRequested { workflow_id, failed_node_id, execution_context, .. } =
        &adjustments[0].kind
    {
        assert_eq!(workflow_id, "w");
        assert_eq!(failed_node_id, "api");
        assert_eq!(execution_context["node_outputs"]["prepare"]["data"], serde_json::json!([10, 20, 30]));
    }
}

/// Three successive reflection events for the same workflow produce three
/// monotonically versioned snapshots; the latest carries the highest
/// confidence.
#[tokio::test]
async fn reflection_events_produce_monotonic_snapshots() {
    let coordinator = new_coordinator();
    coordinator
        .handle(&Event::new(
            "test",
            EventKind::WorkflowExecutionStarted { workflow_id: "w".into(), node_count: 1 },
        ))
        .await
        .unwrap();

    for confidence in [0.7, 0.8, 0.95] {
        coordinator
            .handle(&Event::new(
                "test",
                EventKind::WorkflowReflectionCompleted {
                    workflow_id: "w".into(),
                    assessment: "progressing".into(),
                    confidence,
                    should_retry: confidence < 0.9,
                    recommendations: vec![],
                },
            ))
            .await
            .unwrap();
    }

    let latest = coordinator.get_latest_snapshot("w").unwrap();
    assert_eq!(latest.context.version, 3);
    assert_eq!(latest.context.reflection_summary.confidence, 0.95);

    let context = coordinator.get_compressed_context("w").unwrap();
    assert_eq!(context.version, 3);
}

/// Any producer publishing `DecisionMade` straight onto the bus — not just
/// one routed through `Orchestrator::submit_decision` — gets validated,
/// because the policy chain sits as middleware (§4.3), not as a call the
/// producer has to remember to make.
#[tokio::test]
async fn decision_made_published_directly_onto_bus_is_validated_by_middleware() {
    let bus = Arc::new(EventBus::new());
    let coordinator = Coordinator::new(bus.clone(), CoordinationConfig::default(), KnowledgeOrchestrator::new(None, None));
    coordinator.add_rule(
        Rule::new("block_dangerous", "block", 0, |d| {
            d.payload.get("node_type").and_then(|v| v.as_str()) != Some("DANGEROUS")
        })
        .with_error_message("blocked"),
    );

    bus.publish(Event::new(
        "some-other-producer",
        EventKind::DecisionMade { decision_type: "create_node".into(), payload: serde_json::json!({"node_type": "DANGEROUS"}) },
    ))
    .await;

    let log = coordinator.get_merged_logs();
    assert_eq!(log.iter().filter(|l| l.message == "decision_rejected").count(), 1);
    assert_eq!(log.iter().filter(|l| l.message == "decision_made").count(), 0, "rejected DecisionMade is blocked, not logged");
}

/// A canvas update carrying a stale version is rejected as a conflict and
/// leaves the canvas state at its current version.
#[tokio::test]
async fn canvas_conflict_leaves_state_unchanged() {
    use flowmind_coordination::events::CanvasChangeType;
    use flowmind_coordination::sync::{BidirectionalSync, CanvasApplyResult};

    let sync = BidirectionalSync::new(None, None);
    sync.apply_canvas_change("wf-1", CanvasChangeType::NodeAdded, &serde_json::json!({"node_id": "a"}), 0).await;
    sync.apply_canvas_change(
        "wf-1",
        CanvasChangeType::NodeUpdated,
        &serde_json::json!({"node_id": "a", "changes": {}}),
        1,
    )
    .await;

    let conflict = sync
        .apply_canvas_change(
            "wf-1",
            CanvasChangeType::NodeUpdated,
            &serde_json::json!({"node_id": "a", "changes": {}}),
            1,
        )
        .await;
    assert!(matches!(conflict, CanvasApplyResult::Conflict { current_version: 2 }));
    assert_eq!(sync.canvas_state("wf-1").unwrap().version, 2);
}
