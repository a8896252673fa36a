//! Context Compressor: folds conversation/execution/reflection inputs into a
//! nine-segment [`CompressedContext`], with incremental, non-mutating merge.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::ErrorLogEntry;

/// Which raw-input shape a [`CompressionInput`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Conversation,
    Execution,
    Reflection,
}

/// Untyped raw input tagged by source, fed to [`compress`]/[`merge`].
#[derive(Debug, Clone)]
pub struct CompressionInput {
    pub source_type: SourceType,
    pub workflow_id: String,
    pub raw_data: Value,
}

/// One executed node's contribution to `node_summary`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSummaryEntry {
    pub node_id: String,
    pub node_type: String,
    pub status: String,
    pub output_summary: String,
    pub retry_count: u32,
}

/// `reflection_summary` segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReflectionSummary {
    pub assessment: String,
    pub confidence: f64,
    pub should_retry: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ReflectionSummary {
    fn is_empty(&self) -> bool {
        self.assessment.is_empty()
            && self.confidence == 0.0
            && !self.should_retry
            && self.issues.is_empty()
            && self.recommendations.is_empty()
    }
}

/// `execution_status` segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStatus {
    pub status: String,
    pub progress: f64,
    pub nodes_completed: usize,
}

impl ExecutionStatus {
    fn is_empty(&self) -> bool {
        self.status.is_empty() && self.progress == 0.0 && self.nodes_completed == 0
    }
}

/// The nine-segment compressed context for one workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressedContext {
    pub workflow_id: String,
    pub task_goal: String,
    pub execution_status: ExecutionStatus,
    pub node_summary: Vec<NodeSummaryEntry>,
    pub decision_history: Vec<Value>,
    pub reflection_summary: ReflectionSummary,
    pub conversation_summary: String,
    pub error_log: Vec<ErrorLogEntry>,
    pub next_actions: Vec<String>,
    pub knowledge_references: Vec<Value>,
    pub version: u64,
    pub evidence_refs: Vec<String>,
}

const MAX_GOAL_LENGTH: usize = 100;
const MAX_OUTPUT_SUMMARY_LENGTH: usize = 150;

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

fn dedupe_capped(mut items: Vec<String>, cap: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
    items.truncate(cap);
    items
}

/// Builds a fresh [`CompressedContext`] from a single tagged input,
/// extracting only the segments that source type can contribute.
pub fn compress(input: &CompressionInput, max_segment_length: usize, next_actions_cap: usize) -> CompressedContext {
    let mut ctx = CompressedContext { workflow_id: input.workflow_id.clone(), version: 1, ..Default::default() };

    match input.source_type {
        SourceType::Conversation => {
            let goal = input
                .raw_data
                .get("goal")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    input
                        .raw_data
                        .get("messages")
                        .and_then(Value::as_array)
                        .and_then(|msgs| msgs.iter().find_map(|m| m.get("content").and_then(Value::as_str)))
                        .map(str::to_string)
                })
                .unwrap_or_default();
            ctx.task_goal = truncate(&goal, MAX_GOAL_LENGTH);

            let summary = input
                .raw_data
                .get("messages")
                .and_then(Value::as_array)
                .map(|msgs| {
                    msgs.iter()
                        .filter_map(|m| m.get("content").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            ctx.conversation_summary = truncate(&summary, max_segment_length);
        }
        SourceType::Execution => {
            let status = input.raw_data.get("workflow_status").and_then(Value::as_str).unwrap_or_default();
            let executed_nodes =
                input.raw_data.get("executed_nodes").and_then(Value::as_array).cloned().unwrap_or_default();
            let nodes_completed = input
                .raw_data
                .get("nodes_completed")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(executed_nodes.len());
            let progress = input.raw_data.get("progress").and_then(Value::as_f64).unwrap_or(0.0);
            ctx.execution_status =
                ExecutionStatus { status: status.to_string(), progress, nodes_completed };

            ctx.node_summary = executed_nodes
                .iter()
                .filter_map(|n| {
                    let node_id = n.get("node_id").and_then(Value::as_str)?.to_string();
                    let node_type = n.get("node_type").and_then(Value::as_str).unwrap_or_default().to_string();
                    let status = n.get("status").and_then(Value::as_str).unwrap_or_default().to_string();
                    let output_summary =
                        n.get("output_summary").and_then(Value::as_str).unwrap_or_default();
                    let retry_count = n.get("retry_count").and_then(Value::as_u64).unwrap_or(0) as u32;
                    Some(NodeSummaryEntry {
                        node_id,
                        node_type,
                        status,
                        output_summary: truncate(output_summary, MAX_OUTPUT_SUMMARY_LENGTH),
                        retry_count,
                    })
                })
                .collect();

            let mut error_log: Vec<ErrorLogEntry> = input
                .raw_data
                .get("errors")
                .and_then(Value::as_array)
                .map(|errors| {
                    errors
                        .iter()
                        .map(|e| ErrorLogEntry {
                            node_id: e.get("node_id").and_then(Value::as_str).map(str::to_string),
                            error: e.get("error").and_then(Value::as_str).unwrap_or_default().to_string(),
                            retryable: e.get("retryable").and_then(Value::as_bool).unwrap_or(false),
                        })
                        .collect()
                })
                .unwrap_or_default();
            error_log.extend(executed_nodes.iter().filter(|n| n.get("status").and_then(Value::as_str) == Some("failed")).map(
                |n| ErrorLogEntry {
                    node_id: n.get("node_id").and_then(Value::as_str).map(str::to_string),
                    error: n.get("error").and_then(Value::as_str).unwrap_or_default().to_string(),
                    retryable: false,
                },
            ));
            ctx.error_log = error_log;

            let mut next_actions: Vec<String> = input
                .raw_data
                .get("pending_nodes")
                .and_then(Value::as_array)
                .map(|nodes| nodes.iter().filter_map(|n| n.as_str().map(str::to_string)).take(3).collect())
                .unwrap_or_default();
            if let Some(recs) = input.raw_data.get("recommendations").and_then(Value::as_array) {
                next_actions.extend(recs.iter().filter_map(|r| r.as_str().map(str::to_string)));
            }
            ctx.next_actions = dedupe_capped(next_actions, next_actions_cap);
        }
        SourceType::Reflection => {
            ctx.reflection_summary = ReflectionSummary {
                assessment: input.raw_data.get("assessment").and_then(Value::as_str).unwrap_or_default().to_string(),
                confidence: input.raw_data.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
                should_retry: input.raw_data.get("should_retry").and_then(Value::as_bool).unwrap_or(false),
                issues: input
                    .raw_data
                    .get("issues")
                    .and_then(Value::as_array)
                    .map(|v| v.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
                    .unwrap_or_default(),
                recommendations: input
                    .raw_data
                    .get("recommendations")
                    .and_then(Value::as_array)
                    .map(|v| v.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
                    .unwrap_or_default(),
            };
            ctx.next_actions =
                dedupe_capped(ctx.reflection_summary.recommendations.clone(), next_actions_cap);
        }
    }

    ctx
}

/// Produces a fresh context combining `existing` with a freshly compressed
/// `new_input`; never mutates `existing`.
pub fn merge(
    existing: &CompressedContext,
    new_input: &CompressionInput,
    max_segment_length: usize,
    next_actions_cap: usize,
) -> CompressedContext {
    let new_ctx = compress(new_input, max_segment_length, next_actions_cap);

    let node_summary = {
        let mut by_id: HashMap<String, NodeSummaryEntry> =
            existing.node_summary.iter().map(|n| (n.node_id.clone(), n.clone())).collect();
        let mut order: Vec<String> = existing.node_summary.iter().map(|n| n.node_id.clone()).collect();
        for entry in &new_ctx.node_summary {
            if !by_id.contains_key(&entry.node_id) {
                order.push(entry.node_id.clone());
            }
            by_id.insert(entry.node_id.clone(), entry.clone());
        }
        order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
    };

    let mut decision_history = existing.decision_history.clone();
    decision_history.extend(new_ctx.decision_history.clone());

    let mut error_log = existing.error_log.clone();
    error_log.extend(new_ctx.error_log.clone());

    let mut evidence_refs = existing.evidence_refs.clone();
    evidence_refs.extend(new_ctx.evidence_refs.clone());

    CompressedContext {
        workflow_id: existing.workflow_id.clone(),
        task_goal: if new_ctx.task_goal.is_empty() { existing.task_goal.clone() } else { new_ctx.task_goal },
        execution_status: if new_ctx.execution_status.is_empty() {
            existing.execution_status.clone()
        } else {
            new_ctx.execution_status
        },
        node_summary,
        decision_history,
        reflection_summary: if new_ctx.reflection_summary.is_empty() {
            existing.reflection_summary.clone()
        } else {
            new_ctx.reflection_summary
        },
        conversation_summary: if new_ctx.conversation_summary.is_empty() {
            existing.conversation_summary.clone()
        } else {
            new_ctx.conversation_summary
        },
        error_log,
        next_actions: if new_ctx.next_actions.is_empty() { existing.next_actions.clone() } else { new_ctx.next_actions },
        knowledge_references: existing.knowledge_references.clone(),
        version: existing.version + 1,
        evidence_refs,
    }
}

impl CompressedContext {
    /// Pipe-separated, human-readable one-liner of the present segments.
    pub fn to_summary_text(&self) -> String {
        let mut parts = Vec::new();
        if !self.task_goal.is_empty() {
            parts.push(format!("goal: {}", self.task_goal));
        }
        if !self.execution_status.status.is_empty() {
            parts.push(format!("status: {}", self.execution_status.status));
        }
        if !self.node_summary.is_empty() {
            parts.push(format!("nodes: {}", self.node_summary.len()));
        }
        if !self.error_log.is_empty() {
            parts.push(format!("errors: {}", self.error_log.len()));
        }
        if !self.next_actions.is_empty() {
            parts.push(format!("next: {}", self.next_actions.join(", ")));
        }
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compress_conversation_extracts_goal_and_summary() {
        let input = CompressionInput {
            source_type: SourceType::Conversation,
            workflow_id: "wf-1".into(),
            raw_data: json!({"goal": "ship the feature", "messages": [{"content": "hi"}, {"content": "there"}]}),
        };
        let ctx = compress(&input, 2000, 5);
        assert_eq!(ctx.task_goal, "ship the feature");
        assert_eq!(ctx.conversation_summary, "hi there");
        assert_eq!(ctx.version, 1);
    }

    #[test]
    fn compress_execution_extracts_node_summary_and_errors() {
        let input = CompressionInput {
            source_type: SourceType::Execution,
            workflow_id: "wf-1".into(),
            raw_data: json!({
                "workflow_status": "running",
                "executed_nodes": [
                    {"node_id": "n1", "node_type": "LLM", "status": "completed", "output_summary": "ok"},
                    {"node_id": "n2", "node_type": "Tool", "status": "failed", "error": "boom"},
                ],
            }),
        };
        let ctx = compress(&input, 2000, 5);
        assert_eq!(ctx.node_summary.len(), 2);
        assert_eq!(ctx.error_log.len(), 1);
        assert_eq!(ctx.error_log[0].node_id.as_deref(), Some("n2"));
    }

    #[test]
    fn merge_increments_version_and_dedupes_node_summary() {
        let first = CompressionInput {
            source_type: SourceType::Execution,
            workflow_id: "wf-1".into(),
            raw_data: json!({"executed_nodes": [{"node_id": "n1", "status": "running", "output_summary": "start"}]}),
        };
        let ctx1 = compress(&first, 2000, 5);

        let second = CompressionInput {
            source_type: SourceType::Execution,
            workflow_id: "wf-1".into(),
            raw_data: json!({"executed_nodes": [{"node_id": "n1", "status": "completed", "output_summary": "done"}]}),
        };
        let ctx2 = merge(&ctx1, &second, 2000, 5);

        assert_eq!(ctx2.version, 2);
        assert_eq!(ctx2.node_summary.len(), 1);
        assert_eq!(ctx2.node_summary[0].status, "completed");
    }

    #[test]
    fn merge_error_log_is_append_only() {
        let first = CompressionInput {
            source_type: SourceType::Execution,
            workflow_id: "wf-1".into(),
            raw_data: json!({"errors": [{"node_id": "n1", "error": "e1"}]}),
        };
        let ctx1 = compress(&first, 2000, 5);
        let second = CompressionInput {
            source_type: SourceType::Execution,
            workflow_id: "wf-1".into(),
            raw_data: json!({"errors": [{"node_id": "n2", "error": "e2"}]}),
        };
        let ctx2 = merge(&ctx1, &second, 2000, 5);
        assert_eq!(ctx2.error_log.len(), 2);
    }

    #[test]
    fn merge_preserves_knowledge_references_from_existing() {
        let mut existing = CompressedContext { version: 1, ..Default::default() };
        existing.knowledge_references = vec![json!({"source_id": "a"})];
        let input = CompressionInput {
            source_type: SourceType::Reflection,
            workflow_id: "wf-1".into(),
            raw_data: json!({"assessment": "good"}),
        };
        let merged = merge(&existing, &input, 2000, 5);
        assert_eq!(merged.knowledge_references.len(), 1);
    }
}
