//! Query-time context assembly: the read-side sibling of the incremental
//! compressor. Where the compressor folds events into a `CompressedContext`
//! as they happen, `ContextService` answers a point-in-time question —
//! "what rules, tools, and knowledge are relevant to this input, right
//! now" — without mutating anything.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::knowledge::KnowledgeRetrieverPort;
use crate::ports::ToolRepositoryPort;
use crate::rules::RuleEngine;

/// A trimmed-down rule description suitable for exposing to a caller that
/// never needs the closures themselves.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSummary {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Assembled context returned to the Conversation agent for one query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextResponse {
    pub rules: Vec<RuleSummary>,
    pub knowledge: Vec<Value>,
    pub tools: Vec<Value>,
    pub summary: String,
    pub workflow_context: Option<Value>,
}

/// Anything that can hand back a workflow's current context for a given id.
pub trait WorkflowContextProvider: Send + Sync {
    fn get(&self, workflow_id: &str) -> Option<Value>;
}

/// Looks up rules, tools, and (optionally, asynchronously) knowledge
/// relevant to a user input, and assembles a [`ContextResponse`].
/// Collaborators beyond the rule engine are all optional.
pub struct ContextService {
    tool_repository: Option<Arc<dyn ToolRepositoryPort>>,
    knowledge_retriever: Option<Arc<dyn KnowledgeRetrieverPort>>,
    workflow_context_provider: Option<Arc<dyn WorkflowContextProvider>>,
}

impl ContextService {
    pub fn new(
        tool_repository: Option<Arc<dyn ToolRepositoryPort>>,
        knowledge_retriever: Option<Arc<dyn KnowledgeRetrieverPort>>,
        workflow_context_provider: Option<Arc<dyn WorkflowContextProvider>>,
    ) -> Self {
        Self { tool_repository, knowledge_retriever, workflow_context_provider }
    }

    fn rule_summaries(&self, rules: &RuleEngine) -> Vec<RuleSummary> {
        rules
            .rules()
            .iter()
            .map(|r| RuleSummary { id: r.id.clone(), name: r.name.clone(), description: r.description.clone() })
            .collect()
    }

    fn find_tools(&self, _user_input: &str) -> Vec<Value> {
        self.tool_repository.as_ref().map(|repo| repo.find_published()).unwrap_or_default()
    }

    fn workflow_context(&self, workflow_id: Option<&str>) -> Option<Value> {
        let provider = self.workflow_context_provider.as_ref()?;
        provider.get(workflow_id?)
    }

    fn build_summary(&self, user_input: &str, rule_count: usize, tool_count: usize, knowledge_count: usize) -> String {
        format!(
            "input=\"{}\" rules={} tools={} knowledge={}",
            if user_input.chars().count() > 60 { user_input.chars().take(60).collect::<String>() } else { user_input.to_string() },
            rule_count,
            tool_count,
            knowledge_count,
        )
    }

    /// Synchronous variant: never queries the knowledge retriever, so it
    /// never suspends.
    pub fn get_context(&self, rules: &RuleEngine, user_input: &str, workflow_id: Option<&str>) -> ContextResponse {
        let rule_summaries = self.rule_summaries(rules);
        let tools = self.find_tools(user_input);
        let workflow_context = self.workflow_context(workflow_id);
        let summary = self.build_summary(user_input, rule_summaries.len(), tools.len(), 0);

        ContextResponse { rules: rule_summaries, knowledge: Vec::new(), tools, summary, workflow_context }
    }

    /// Async variant: additionally queries the knowledge retriever by
    /// `user_input` when one is wired.
    pub async fn get_context_async(
        &self,
        rules: &RuleEngine,
        user_input: &str,
        workflow_id: Option<&str>,
    ) -> ContextResponse {
        let rule_summaries = self.rule_summaries(rules);
        let knowledge = match &self.knowledge_retriever {
            Some(retriever) => retriever
                .retrieve_by_query(user_input, workflow_id, 5)
                .await
                .iter()
                .map(|r| serde_json::json!({"source_id": r.source_id, "title": r.title, "content_preview": r.content_preview}))
                .collect(),
            None => Vec::new(),
        };
        let tools = self.find_tools(user_input);
        let workflow_context = self.workflow_context(workflow_id);
        let summary = self.build_summary(user_input, rule_summaries.len(), tools.len(), knowledge.len());

        ContextResponse { rules: rule_summaries, knowledge, tools, summary, workflow_context }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;

    #[test]
    fn sync_context_never_populates_knowledge() {
        let service = ContextService::new(None, None, None);
        let mut rules = RuleEngine::new();
        rules.add_rule(Rule::new("r1", "allow", 0, |_| true));
        let response = service.get_context(&rules, "hello", None);
        assert_eq!(response.rules.len(), 1);
        assert!(response.knowledge.is_empty());
    }
}
