//! Coordinator Policy Chain: gates supervised decisions through the
//! Coordinator's rule engine, deduping repeated enforcement calls and
//! failing closed when no coordinator is wired.

use std::collections::HashSet;
use std::sync::Arc;

use crate::decision::Decision;
use crate::error::CoordinatorRejected;
use crate::event_bus::EventBus;
use crate::events::{Event, EventKind};
use crate::rules::ValidationResult;

/// Anything that can validate a decision. The Coordinator implements this;
/// tests and the policy chain's caller only depend on the trait.
pub trait DecisionValidator: Send + Sync {
    fn validate_decision(&self, decision: &Decision) -> ValidationResult;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyStats {
    pub total: u64,
    pub passed: u64,
    pub rejected: u64,
}

impl PolicyStats {
    pub fn rejection_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.rejected as f64 / self.total as f64
        }
    }
}

/// Enforces coordinator sign-off for supervised decision types. Dedupes by
/// `(decision_type, correlation_id, original_decision_id)` so retried
/// enforcement calls for the same decision are no-ops.
pub struct CoordinatorPolicyChain {
    coordinator: Option<Arc<dyn DecisionValidator>>,
    event_bus: Option<Arc<EventBus>>,
    source: String,
    fail_closed: bool,
    supervised_decision_types: HashSet<String>,
    rejection_rate_threshold: f64,
    rejection_rate_sample_floor: u64,
    dedupe_keys: parking_lot::Mutex<HashSet<(String, String, String)>>,
    stats: parking_lot::Mutex<PolicyStats>,
}

impl CoordinatorPolicyChain {
    pub fn new(
        coordinator: Option<Arc<dyn DecisionValidator>>,
        event_bus: Option<Arc<EventBus>>,
        source: impl Into<String>,
        config: &crate::config::CoordinationConfig,
    ) -> Self {
        Self {
            coordinator,
            event_bus,
            source: source.into(),
            fail_closed: config.fail_closed,
            supervised_decision_types: config.supervised_decision_types.clone(),
            rejection_rate_threshold: config.rejection_rate_threshold,
            rejection_rate_sample_floor: config.rejection_rate_sample_floor,
            dedupe_keys: parking_lot::Mutex::new(HashSet::new()),
            stats: parking_lot::Mutex::new(PolicyStats::default()),
        }
    }

    pub fn is_supervised(&self, decision_type: &str) -> bool {
        self.supervised_decision_types.contains(decision_type)
    }

    pub fn stats(&self) -> PolicyStats {
        *self.stats.lock()
    }

    /// True once enough decisions have been observed and the rejection rate
    /// exceeds the configured threshold.
    pub fn is_rejection_rate_high(&self) -> bool {
        let stats = self.stats();
        stats.total >= self.rejection_rate_sample_floor && stats.rejection_rate() > self.rejection_rate_threshold
    }

    /// `DecisionValidated` is what drives `BidirectionalSync`'s forward to
    /// the Workflow agent (§4.8) — published on every path that lets the
    /// decision through, not only the supervised-and-validated one, so an
    /// unsupervised decision still gets forwarded.
    async fn publish_validated(&self, decision: &Decision, correlation_id: &str, original_decision_id: &str) {
        let Some(event_bus) = &self.event_bus else { return };
        event_bus
            .publish(
                Event::new(
                    self.source.clone(),
                    EventKind::DecisionValidated {
                        original_decision_id: original_decision_id.to_string(),
                        decision_type: decision.decision_type.clone(),
                        payload: decision.payload.clone(),
                    },
                )
                .with_correlation(correlation_id),
            )
            .await;
    }

    /// Gate a decision. Unsupervised decision types and duplicate
    /// `(decision_type, correlation_id, original_decision_id)` tuples pass
    /// through (duplicates silently, to avoid a second forward of the same
    /// decision). A missing coordinator/event bus fails closed unless
    /// `fail_closed` is false, in which case it passes through.
    pub async fn enforce_action_or_raise(
        &self,
        decision: &Decision,
        correlation_id: &str,
        original_decision_id: &str,
    ) -> Result<(), CoordinatorRejected> {
        if !self.is_supervised(&decision.decision_type) {
            self.publish_validated(decision, correlation_id, original_decision_id).await;
            return Ok(());
        }

        let key = (decision.decision_type.clone(), correlation_id.to_string(), original_decision_id.to_string());
        {
            let mut keys = self.dedupe_keys.lock();
            if !keys.insert(key) {
                return Ok(());
            }
        }

        let (Some(coordinator), Some(event_bus)) = (&self.coordinator, &self.event_bus) else {
            if !self.fail_closed {
                self.publish_validated(decision, correlation_id, original_decision_id).await;
                return Ok(());
            }
            return Err(CoordinatorRejected {
                decision_type: decision.decision_type.clone(),
                correlation_id: correlation_id.to_string(),
                original_decision_id: original_decision_id.to_string(),
                errors: vec!["coordinator or event_bus not configured".to_string()],
            });
        };

        let validation = coordinator.validate_decision(decision);
        {
            let mut stats = self.stats.lock();
            stats.total += 1;
            if validation.is_valid {
                stats.passed += 1;
            } else {
                stats.rejected += 1;
            }
        }

        if validation.is_valid {
            self.publish_validated(decision, correlation_id, original_decision_id).await;
            return Ok(());
        }

        let reason = if validation.errors.is_empty() {
            "coordinator rejected decision".to_string()
        } else {
            validation.errors.join("; ")
        };

        event_bus
            .publish(
                Event::new(
                    self.source.clone(),
                    EventKind::DecisionRejected {
                        original_decision_id: original_decision_id.to_string(),
                        decision_type: decision.decision_type.clone(),
                        reason: reason.clone(),
                        errors: validation.errors.clone(),
                    },
                )
                .with_correlation(correlation_id),
            )
            .await;

        Err(CoordinatorRejected {
            decision_type: decision.decision_type.clone(),
            correlation_id: correlation_id.to_string(),
            original_decision_id: original_decision_id.to_string(),
            errors: if validation.errors.is_empty() { vec![reason] } else { validation.errors },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use serde_json::json;

    struct AllowAll;
    impl DecisionValidator for AllowAll {
        fn validate_decision(&self, _decision: &Decision) -> ValidationResult {
            ValidationResult { is_valid: true, errors: vec![], correction: None }
        }
    }

    struct RejectAll;
    impl DecisionValidator for RejectAll {
        fn validate_decision(&self, _decision: &Decision) -> ValidationResult {
            ValidationResult { is_valid: false, errors: vec!["nope".into()], correction: None }
        }
    }

    fn decision() -> Decision {
        Decision::new("d1", "create_node", json!({"node_type": "LLM"}))
    }

    #[tokio::test]
    async fn unsupervised_decision_passes_without_coordinator() {
        let chain = CoordinatorPolicyChain::new(None, None, "test", &CoordinationConfig::default());
        let mut d = decision();
        d.decision_type = "unsupervised_thing".into();
        assert!(chain.enforce_action_or_raise(&d, "c1", "d1").await.is_ok());
    }

    #[tokio::test]
    async fn missing_collaborators_fails_closed_by_default() {
        let chain = CoordinatorPolicyChain::new(None, None, "test", &CoordinationConfig::default());
        let err = chain.enforce_action_or_raise(&decision(), "c1", "d1").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn missing_collaborators_passes_when_not_fail_closed() {
        let mut cfg = CoordinationConfig::default();
        cfg.fail_closed = false;
        let chain = CoordinatorPolicyChain::new(None, None, "test", &cfg);
        assert!(chain.enforce_action_or_raise(&decision(), "c1", "d1").await.is_ok());
    }

    #[tokio::test]
    async fn allow_path_passes_and_records_stats() {
        let bus = Arc::new(EventBus::new());
        let chain =
            CoordinatorPolicyChain::new(Some(Arc::new(AllowAll)), Some(bus), "test", &CoordinationConfig::default());
        assert!(chain.enforce_action_or_raise(&decision(), "c1", "d1").await.is_ok());
        assert_eq!(chain.stats().passed, 1);
    }

    #[tokio::test]
    async fn reject_path_raises_and_records_stats() {
        let bus = Arc::new(EventBus::new());
        let chain =
            CoordinatorPolicyChain::new(Some(Arc::new(RejectAll)), Some(bus), "test", &CoordinationConfig::default());
        let err = chain.enforce_action_or_raise(&decision(), "c1", "d1").await.unwrap_err();
        assert_eq!(err.errors, vec!["nope"]);
        assert_eq!(chain.stats().rejected, 1);
    }

    #[tokio::test]
    async fn duplicate_correlation_is_deduped() {
        let bus = Arc::new(EventBus::new());
        let chain =
            CoordinatorPolicyChain::new(Some(Arc::new(RejectAll)), Some(bus), "test", &CoordinationConfig::default());
        let _ = chain.enforce_action_or_raise(&decision(), "c1", "d1").await;
        let second = chain.enforce_action_or_raise(&decision(), "c1", "d1").await;
        assert!(second.is_ok());
        assert_eq!(chain.stats().total, 1);
    }
}
