//! Knowledge Retrieval Orchestrator: query/error/goal retrieval against an
//! external retriever, per-workflow caching, and auto-enrichment hooks that
//! trigger on node failure and workflow reflection.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single piece of retrieved knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeReference {
    pub source_id: String,
    pub title: String,
    pub content_preview: String,
    pub relevance_score: f64,
    pub document_id: Option<String>,
    pub chunk_id: Option<String>,
    pub source_type: String,
    #[serde(with = "time::serde::iso8601")]
    pub retrieved_at: time::OffsetDateTime,
    #[serde(default)]
    pub metadata: Value,
}

impl KnowledgeReference {
    pub fn new(source_id: impl Into<String>, title: impl Into<String>, content_preview: impl Into<String>, relevance_score: f64) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            content_preview: content_preview.into(),
            relevance_score,
            document_id: None,
            chunk_id: None,
            source_type: "unknown".to_string(),
            retrieved_at: crate::events::now(),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = source_type.into();
        self
    }

    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    /// Builds a reference from a generic RAG result map
    /// (`document_id`/`title`/`source`/`relevance_score`/`preview`).
    pub fn from_rag_source(result: &RetrievedKnowledge) -> Self {
        Self {
            source_id: result.document_id.clone().unwrap_or_default(),
            title: result.title.clone(),
            content_preview: result.content_preview.clone(),
            relevance_score: result.relevance_score,
            document_id: result.document_id.clone(),
            chunk_id: None,
            source_type: result.source_type.clone(),
            retrieved_at: crate::events::now(),
            metadata: result.metadata.clone(),
        }
    }

    /// Builds a reference summarizing an error-solution document.
    pub fn from_error_doc(error_type: &str, solution_title: &str, solution_preview: &str, confidence: f64) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("error_type".to_string(), Value::String(error_type.to_string()));
        Self {
            source_id: format!("error_{error_type}"),
            title: solution_title.to_string(),
            content_preview: solution_preview.to_string(),
            relevance_score: confidence,
            document_id: None,
            chunk_id: None,
            source_type: "error_solution".to_string(),
            retrieved_at: crate::events::now(),
            metadata: Value::Object(metadata),
        }
    }
}

/// An ordered collection of [`KnowledgeReference`] with dedupe/merge
/// semantics: when two references share a `source_id`, the higher
/// `relevance_score` wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeReferences(pub Vec<KnowledgeReference>);

impl KnowledgeReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, reference: KnowledgeReference) {
        self.0.push(reference);
    }

    pub fn merge(mut self, other: KnowledgeReferences) -> Self {
        self.0.extend(other.0);
        self
    }

    /// Keep the highest-scoring reference per `source_id`, preserving first
    /// occurrence order among surviving entries.
    pub fn deduplicate(self) -> Self {
        let mut best: HashMap<String, KnowledgeReference> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for reference in self.0 {
            match best.get(&reference.source_id) {
                Some(existing) if existing.relevance_score >= reference.relevance_score => {}
                _ => {
                    if !order.contains(&reference.source_id) {
                        order.push(reference.source_id.clone());
                    }
                    best.insert(reference.source_id.clone(), reference);
                }
            }
        }
        KnowledgeReferences(order.into_iter().filter_map(|id| best.remove(&id)).collect())
    }

    pub fn to_value_list(&self) -> Vec<Value> {
        self.0.iter().map(|r| serde_json::to_value(r).unwrap_or(Value::Null)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single retriever hit, before it is converted into a
/// [`KnowledgeReference`]. Mirrors the shape returned by an external
/// retrieval service.
#[derive(Debug, Clone)]
pub struct RetrievedKnowledge {
    pub source_id: String,
    pub title: String,
    pub content_preview: String,
    pub relevance_score: f64,
    pub document_id: Option<String>,
    pub source_type: String,
    pub metadata: Value,
}

/// An error-log entry describing a failed node, used as auto-enrichment
/// input.
#[derive(Debug, Clone)]
pub struct WorkflowErrorEntry {
    pub error_type: String,
    pub message: String,
}

/// External retrieval backend. Implementations wrap a vector store, RAG
/// pipeline, or similar; the orchestrator never depends on the concrete
/// transport.
#[async_trait]
pub trait KnowledgeRetrieverPort: Send + Sync {
    async fn retrieve_by_query(&self, query: &str, workflow_id: Option<&str>, top_k: usize) -> Vec<RetrievedKnowledge>;
    async fn retrieve_by_error(&self, error_type: &str, error_message: Option<&str>, top_k: usize) -> Vec<RetrievedKnowledge>;
    async fn retrieve_by_goal(&self, goal_text: &str, workflow_id: Option<&str>, top_k: usize) -> Vec<RetrievedKnowledge>;
}

/// Narrow mutation port into the compressed-context store, so the
/// orchestrator can inject knowledge without depending on the whole
/// compression/snapshot subsystem.
pub trait ContextGateway: Send + Sync {
    fn task_goal(&self, workflow_id: &str) -> Option<String>;
    fn update_knowledge_refs(&self, workflow_id: &str, refs: Vec<Value>);
    fn update_error_log(&self, workflow_id: &str, node_id: &str, error_type: &str, message: &str);
    fn update_reflection(&self, workflow_id: &str, assessment: &str, confidence: f64, recommendations: Vec<String>);
}

/// Result of an enrichment pass: the merged, deduplicated reference set for
/// a workflow.
#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    pub workflow_id: String,
    pub references: KnowledgeReferences,
}

/// Coordinates knowledge retrieval, per-workflow caching, and auto-enrich
/// hooks. Both collaborators are optional: without a retriever every
/// retrieval call returns an empty set; without a gateway, injection is a
/// no-op.
pub struct KnowledgeOrchestrator {
    retriever: Option<Box<dyn KnowledgeRetrieverPort>>,
    gateway: Option<Box<dyn ContextGateway>>,
    cache: parking_lot::Mutex<HashMap<String, KnowledgeReferences>>,
    auto_enrich_enabled: std::sync::atomic::AtomicBool,
}

impl KnowledgeOrchestrator {
    pub fn new(retriever: Option<Box<dyn KnowledgeRetrieverPort>>, gateway: Option<Box<dyn ContextGateway>>) -> Self {
        Self {
            retriever,
            gateway,
            cache: parking_lot::Mutex::new(HashMap::new()),
            auto_enrich_enabled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn enable_auto_knowledge_retrieval(&self) {
        self.auto_enrich_enabled.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn disable_auto_knowledge_retrieval(&self) {
        self.auto_enrich_enabled.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    pub async fn retrieve_knowledge(&self, query: &str, workflow_id: Option<&str>, top_k: usize) -> KnowledgeReferences {
        let Some(retriever) = &self.retriever else { return KnowledgeReferences::new() };
        let results = retriever.retrieve_by_query(query, workflow_id, top_k).await;
        let refs = KnowledgeReferences(results.iter().map(KnowledgeReference::from_rag_source).collect());
        if let Some(workflow_id) = workflow_id {
            self.cache.lock().insert(workflow_id.to_string(), refs.clone());
        }
        refs
    }

    pub async fn retrieve_knowledge_by_error(&self, error_type: &str, error_message: Option<&str>, top_k: usize) -> KnowledgeReferences {
        let Some(retriever) = &self.retriever else { return KnowledgeReferences::new() };
        let results = retriever.retrieve_by_error(error_type, error_message, top_k).await;
        KnowledgeReferences(
            results
                .iter()
                .map(|r| KnowledgeReference::from_rag_source(r).with_source_type("error_solution"))
                .collect(),
        )
    }

    pub async fn retrieve_knowledge_by_goal(&self, goal_text: &str, workflow_id: Option<&str>, top_k: usize) -> KnowledgeReferences {
        let Some(retriever) = &self.retriever else { return KnowledgeReferences::new() };
        let results = retriever.retrieve_by_goal(goal_text, workflow_id, top_k).await;
        KnowledgeReferences(
            results
                .iter()
                .map(|r| KnowledgeReference::from_rag_source(r).with_source_type("goal_related"))
                .collect(),
        )
    }

    pub fn get_cached_knowledge(&self, workflow_id: &str) -> Option<KnowledgeReferences> {
        self.cache.lock().get(workflow_id).cloned()
    }

    pub fn clear_cached_knowledge(&self, workflow_id: &str) {
        self.cache.lock().remove(workflow_id);
    }

    /// Retrieves knowledge relevant to `goal` and each entry in `errors`,
    /// merges and deduplicates the results, and caches them for
    /// `workflow_id`.
    pub async fn enrich_context_with_knowledge(
        &self,
        workflow_id: &str,
        goal: Option<&str>,
        errors: &[WorkflowErrorEntry],
    ) -> EnrichmentResult {
        let mut all_refs = KnowledgeReferences::new();

        if let Some(goal) = goal {
            if self.retriever.is_some() {
                all_refs = all_refs.merge(self.retrieve_knowledge_by_goal(goal, Some(workflow_id), 3).await);
            }
        }

        if self.retriever.is_some() {
            for error in errors {
                all_refs = all_refs.merge(
                    self.retrieve_knowledge_by_error(&error.error_type, Some(error.message.as_str()), 3).await,
                );
            }
        }

        let all_refs = all_refs.deduplicate();
        self.cache.lock().insert(workflow_id.to_string(), all_refs.clone());

        EnrichmentResult { workflow_id: workflow_id.to_string(), references: all_refs }
    }

    /// Enrich and push the result into the context gateway, which owns
    /// dedupe/merge against whatever is already stored there.
    pub async fn inject_knowledge_to_context(&self, workflow_id: &str, goal: Option<&str>, errors: &[WorkflowErrorEntry]) {
        let Some(gateway) = &self.gateway else { return };
        let enriched = self.enrich_context_with_knowledge(workflow_id, goal, errors).await;
        gateway.update_knowledge_refs(workflow_id, enriched.references.to_value_list());
    }

    /// Auto-trigger: a node failed. Records the error in the compressed
    /// context and retrieves + injects related error-solution knowledge.
    pub async fn handle_node_failure_with_knowledge(
        &self,
        workflow_id: &str,
        node_id: &str,
        error_type: &str,
        error_message: Option<&str>,
    ) -> EnrichmentResult {
        if let Some(gateway) = &self.gateway {
            gateway.update_error_log(workflow_id, node_id, error_type, error_message.unwrap_or(""));
        }

        let errors = [WorkflowErrorEntry { error_type: error_type.to_string(), message: error_message.unwrap_or("").to_string() }];
        let goal = self.gateway.as_ref().and_then(|g| g.task_goal(workflow_id));
        let enriched = self.enrich_context_with_knowledge(workflow_id, goal.as_deref(), &errors).await;
        self.inject_knowledge_to_context(workflow_id, goal.as_deref(), &errors).await;
        enriched
    }

    /// Auto-trigger: a reflection event arrived. Records it in the
    /// compressed context and retrieves + injects goal-related knowledge,
    /// falling back to the assessment text when no goal is known.
    pub async fn handle_reflection_with_knowledge(
        &self,
        workflow_id: &str,
        assessment: &str,
        confidence: f64,
        recommendations: Vec<String>,
    ) -> EnrichmentResult {
        if let Some(gateway) = &self.gateway {
            gateway.update_reflection(workflow_id, assessment, confidence, recommendations);
        }

        let goal = self.gateway.as_ref().and_then(|g| g.task_goal(workflow_id));
        let effective_goal = goal.clone().unwrap_or_else(|| assessment.to_string());
        let enriched = self.enrich_context_with_knowledge(workflow_id, Some(effective_goal.as_str()), &[]).await;
        self.inject_knowledge_to_context(workflow_id, Some(effective_goal.as_str()), &[]).await;
        enriched
    }
}
