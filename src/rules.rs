//! Rule Engine: a priority-sorted list of pure predicates evaluated against
//! a decision, plus derived rule builders layered on the same primitive.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::decision::Decision;

/// A declarative, immutable validation rule.
///
/// `condition` and `correction` are pure: they must not mutate the decision
/// they're given, and `correction` must be idempotent.
pub struct Rule {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Lower priority value evaluates earlier.
    pub priority: i32,
    pub condition: Box<dyn Fn(&Decision) -> bool + Send + Sync>,
    pub correction: Option<Box<dyn Fn(&Decision) -> Decision + Send + Sync>>,
    pub error_message: String,
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        condition: impl Fn(&Decision) -> bool + Send + Sync + 'static,
    ) -> Self {
        let id = id.into();
        Self {
            name: name.into(),
            description: String::new(),
            priority,
            condition: Box::new(condition),
            correction: None,
            error_message: format!("rule {id} violated"),
            id,
        }
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_correction(
        mut self,
        correction: impl Fn(&Decision) -> Decision + Send + Sync + 'static,
    ) -> Self {
        self.correction = Some(Box::new(correction));
        self
    }
}

/// Outcome of validating a decision against a rule list.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub correction: Option<Decision>,
}

/// Holds rules sorted ascending by priority (stable: insertion order breaks
/// ties), evaluates all of them against a decision.
#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Insert a rule, keeping `rules` sorted by ascending priority with a
    /// stable tie-break on insertion order.
    pub fn add_rule(&mut self, rule: Rule) {
        let pos = self
            .rules
            .iter()
            .position(|r| r.priority > rule.priority)
            .unwrap_or(self.rules.len());
        self.rules.insert(pos, rule);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluate every rule in priority order. The first rule's correction is
    /// recorded; subsequent corrections are ignored.
    pub fn validate(&self, decision: &Decision) -> ValidationResult {
        let mut errors = Vec::new();
        let mut correction = None;

        for rule in &self.rules {
            if !(rule.condition)(decision) {
                errors.push(if rule.error_message.is_empty() {
                    format!("rule {} violated", rule.id)
                } else {
                    rule.error_message.clone()
                });
                if correction.is_none() {
                    correction = rule.correction.as_ref().map(|c| c(decision));
                }
            }
        }

        ValidationResult { is_valid: errors.is_empty(), errors, correction }
    }
}

// ---------------------------------------------------------------------
// Derived rule builders
// ---------------------------------------------------------------------

/// Runtime type classification used by [`payload_field_types_rule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Array,
    Object,
}

fn value_kind(value: &Value) -> FieldKind {
    match value {
        Value::String(_) => FieldKind::String,
        Value::Number(_) => FieldKind::Number,
        Value::Bool(_) => FieldKind::Bool,
        Value::Array(_) => FieldKind::Array,
        Value::Object(_) => FieldKind::Object,
        Value::Null => FieldKind::Object,
    }
}

/// Resolve a dotted path (`"a.b.c"`) against a JSON object.
fn resolve_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Checks presence of a set of keys in `decision.payload`.
pub fn payload_required_fields_rule(
    id: impl Into<String>,
    priority: i32,
    required: impl IntoIterator<Item = &'static str>,
) -> Rule {
    let required: Vec<&'static str> = required.into_iter().collect();
    let id = id.into();
    let missing_msg = required.join(", ");
    Rule::new(id.clone(), "payload_required_fields", priority, move |decision| {
        required.iter().all(|field| resolve_path(&decision.payload, field).is_some())
    })
    .with_error_message(format!("missing required payload field(s): {missing_msg}"))
}

/// Checks the runtime type of named (possibly dotted) fields.
pub fn payload_field_types_rule(
    id: impl Into<String>,
    priority: i32,
    expected: HashMap<&'static str, FieldKind>,
) -> Rule {
    let id = id.into();
    Rule::new(id, "payload_field_types", priority, move |decision| {
        expected.iter().all(|(path, kind)| {
            resolve_path(&decision.payload, path)
                .map(|v| value_kind(v) == *kind)
                .unwrap_or(false)
        })
    })
    .with_error_message("payload field has wrong type".to_string())
}

/// Numeric range bound for [`payload_value_range_rule`].
pub fn payload_value_range_rule(
    id: impl Into<String>,
    priority: i32,
    field: &'static str,
    min: f64,
    max: f64,
) -> Rule {
    let id = id.into();
    Rule::new(id, "payload_value_range", priority, move |decision| {
        resolve_path(&decision.payload, field)
            .and_then(Value::as_f64)
            .map(|n| n >= min && n <= max)
            .unwrap_or(false)
    })
    .with_error_message(format!("{field} out of range [{min}, {max}]"))
}

/// Allowed-value enum check for [`payload_enum_rule`].
pub fn payload_enum_rule(
    id: impl Into<String>,
    priority: i32,
    field: &'static str,
    allowed: HashSet<String>,
) -> Rule {
    let id = id.into();
    Rule::new(id, "payload_enum", priority, move |decision| {
        resolve_path(&decision.payload, field)
            .and_then(Value::as_str)
            .map(|s| allowed.contains(s))
            .unwrap_or(false)
    })
    .with_error_message(format!("{field} not in allowed set"))
}

/// DAG validation for `create_workflow_plan` decisions: unique
/// node ids, every edge endpoint resolves to a declared node, no cycle
/// (Kahn's algorithm). Returns a standalone [`ValidationResult`] rather than
/// a single boolean `Rule` condition, since it must emit multiple distinct
/// errors.
pub fn validate_workflow_dag(decision: &Decision) -> ValidationResult {
    let mut errors = Vec::new();

    let nodes = decision
        .payload
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let edges = decision
        .payload
        .get("edges")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut node_ids: HashSet<String> = HashSet::new();
    for node in &nodes {
        if let Some(id) = node.get("id").and_then(Value::as_str) {
            if !node_ids.insert(id.to_string()) {
                errors.push(format!("duplicate node id: {id}"));
            }
        } else {
            errors.push("node missing id".to_string());
        }
    }

    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut indegree: HashMap<String, usize> = node_ids.iter().map(|n| (n.clone(), 0)).collect();

    for edge in &edges {
        let source = edge.get("source").and_then(Value::as_str);
        let target = edge.get("target").and_then(Value::as_str);
        match (source, target) {
            (Some(s), Some(t)) => {
                if !node_ids.contains(s) {
                    errors.push(format!("edge source does not resolve to a declared node: {s}"));
                }
                if !node_ids.contains(t) {
                    errors.push(format!("edge target does not resolve to a declared node: {t}"));
                }
                if node_ids.contains(s) && node_ids.contains(t) {
                    adjacency.entry(s.to_string()).or_default().push(t.to_string());
                    *indegree.entry(t.to_string()).or_insert(0) += 1;
                }
            }
            _ => errors.push("edge missing source/target".to_string()),
        }
    }

    if errors.is_empty() {
        // Kahn's algorithm: repeatedly remove zero-indegree nodes.
        let mut queue: Vec<String> =
            indegree.iter().filter(|(_, &d)| d == 0).map(|(n, _)| n.clone()).collect();
        queue.sort();
        let mut indegree = indegree.clone();
        let mut visited = 0usize;
        let mut i = 0;
        while i < queue.len() {
            let n = queue[i].clone();
            i += 1;
            visited += 1;
            if let Some(successors) = adjacency.get(&n) {
                for succ in successors {
                    let d = indegree.get_mut(succ).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        queue.push(succ.clone());
                    }
                }
            }
        }
        if visited != node_ids.len() {
            errors.push("workflow graph contains a cycle".to_string());
        }
    }

    ValidationResult { is_valid: errors.is_empty(), errors, correction: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decision(decision_type: &str, payload: Value) -> Decision {
        Decision { decision_type: decision_type.to_string(), payload, id: "d1".into() }
    }

    #[test]
    fn priority_order_is_ascending_with_stable_ties() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule::new("b", "b", 5, |_| false).with_error_message("b".into()));
        engine.add_rule(Rule::new("a", "a", 1, |_| false).with_error_message("a".into()));
        engine.add_rule(Rule::new("c", "c", 5, |_| false).with_error_message("c".into()));

        let result = engine.validate(&decision("x", json!({})));
        assert_eq!(result.errors, vec!["a", "b", "c"]);
    }

    #[test]
    fn allow_all_rule_passes() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule::new("allow_all", "allow", 0, |_| true));
        let result = engine.validate(&decision("create_node", json!({"node_type": "LLM"})));
        assert!(result.is_valid);
    }

    #[test]
    fn block_dangerous_rule_blocks() {
        let mut engine = RuleEngine::new();
        engine.add_rule(
            Rule::new("block_dangerous", "block", 0, |d| {
                d.payload.get("node_type").and_then(Value::as_str) != Some("DANGEROUS")
            })
            .with_error_message("blocked".to_string()),
        );
        let result = engine.validate(&decision("create_node", json!({"node_type": "DANGEROUS"})));
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["blocked"]);
    }

    #[test]
    fn required_fields_rule_reports_missing() {
        let rule = payload_required_fields_rule("req", 0, ["goal", "node_type"]);
        let mut engine = RuleEngine::new();
        engine.add_rule(rule);
        let result = engine.validate(&decision("create_node", json!({"goal": "x"})));
        assert!(!result.is_valid);
    }

    #[test]
    fn dag_validation_rejects_duplicate_node_and_cycle() {
        let decision = decision(
            "create_workflow_plan",
            json!({
                "nodes": [{"id": "a"}, {"id": "a"}, {"id": "b"}],
                "edges": [{"source": "a", "target": "b"}, {"source": "b", "target": "a"}],
            }),
        );
        let result = validate_workflow_dag(&decision);
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("duplicate node id")));
        assert!(result.errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn dag_validation_accepts_valid_dag() {
        let decision = decision(
            "create_workflow_plan",
            json!({
                "nodes": [{"id": "a"}, {"id": "b"}, {"id": "c"}],
                "edges": [{"source": "a", "target": "b"}, {"source": "b", "target": "c"}],
            }),
        );
        let result = validate_workflow_dag(&decision);
        assert!(result.is_valid);
    }

    #[test]
    fn dag_validation_rejects_unresolved_edge_endpoint() {
        let decision = decision(
            "create_workflow_plan",
            json!({
                "nodes": [{"id": "a"}],
                "edges": [{"source": "a", "target": "ghost"}],
            }),
        );
        let result = validate_workflow_dag(&decision);
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("ghost")));
    }
}
