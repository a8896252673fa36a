//! Narrow interface abstractions for the core's external collaborators.
//! Each trait carries exactly the operations the core depends on, not the
//! full surface of whatever concrete agent implements it.

use async_trait::async_trait;
use serde_json::Value;

use crate::decision::Decision;

/// Executes validated decisions against the live workflow graph.
#[async_trait]
pub trait WorkflowAgentPort: Send + Sync {
    async fn handle_decision(&self, decision: &Decision) -> anyhow::Result<Value>;
    async fn execute_node_with_result(&self, node_id: &str) -> anyhow::Result<Value>;
}

/// Receives workflow outcomes and produces new plans on request.
#[async_trait]
pub trait ConversationAgentPort: Send + Sync {
    async fn receive_execution_result(&self, payload: Value) -> anyhow::Result<()>;
    async fn receive_node_status(&self, payload: Value) -> anyhow::Result<()>;
    async fn replan_workflow(
        &self,
        original_goal: &str,
        failed_node_id: &str,
        failure_reason: &str,
        execution_context: Value,
    ) -> anyhow::Result<Value>;

    /// Writes the canvas dict into the agent's `session_context.canvas_state`
    /// field after a successful, non-conflicting `CanvasChange` apply.
    /// Deployments that don't track a canvas-backed session context can
    /// leave this as a no-op.
    async fn set_canvas_state(&self, _workflow_id: &str, _canvas: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lists tools available to a workflow node.
pub trait ToolRepositoryPort: Send + Sync {
    fn find_all(&self) -> Vec<Value>;
    fn find_published(&self) -> Vec<Value>;
    fn find_by_tags(&self, tags: &[String]) -> Vec<Value>;
}

/// Drives the Conversation agent's reasoning loop. Only `think`,
/// `decide_action`, and `should_continue` are required; planning hooks are
/// optional since not every deployment wires a planner.
#[async_trait]
pub trait LLMPort: Send + Sync {
    async fn think(&self, context: Value) -> anyhow::Result<Value>;
    async fn decide_action(&self, context: Value) -> anyhow::Result<Value>;
    async fn should_continue(&self, context: Value) -> anyhow::Result<bool>;

    async fn plan_workflow(&self, _goal: &str) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    async fn replan_workflow(
        &self,
        _goal: &str,
        _failed_node_id: &str,
        _failure_reason: &str,
        _execution_context: Value,
    ) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    async fn plan_error_recovery(&self, _context: Value) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }
}

/// Persists raw compression inputs for later traceability. Left
/// unimplemented at the core boundary: when no store is wired,
/// `CompressedContext.evidence_refs` stays empty.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn persist(&self, workflow_id: &str, raw_data: &Value) -> anyhow::Result<String>;
}
