//! Failure Orchestrator: maps a failed node's error code to a recovery
//! strategy and computes retry backoff.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Recovery strategy selected for a failed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    Retry,
    Skip,
    Abort,
    Replan,
}

/// Decides Retry/Skip/Abort/Replan for a failed node from a per-node
/// override map falling back to a configured default, and computes
/// exponentially backed-off retry delays with jitter. The error code itself
/// only matters inside the RETRY strategy's own behavior (§4.4): a
/// non-retryable error code under RETRY fails immediately rather than
/// looping.
pub struct FailureOrchestrator {
    max_retries: u32,
    base_delay: std::time::Duration,
    max_delay: std::time::Duration,
    factor: f64,
    jitter_ratio: f64,
    default_strategy: FailureStrategy,
    overrides: parking_lot::Mutex<HashMap<String, FailureStrategy>>,
    retry_counts: parking_lot::Mutex<HashMap<String, u32>>,
}

impl FailureOrchestrator {
    pub fn new(config: &crate::config::CoordinationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: std::time::Duration::from_secs_f64(config.base_delay_secs),
            max_delay: std::time::Duration::from_secs_f64(config.max_delay_secs),
            factor: config.backoff_factor,
            jitter_ratio: config.jitter_ratio,
            default_strategy: config.default_failure_strategy,
            overrides: parking_lot::Mutex::new(HashMap::new()),
            retry_counts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Force a specific strategy for a node id, taking priority over the
    /// configured default.
    pub fn set_override(&self, node_id: impl Into<String>, strategy: FailureStrategy) {
        self.overrides.lock().insert(node_id.into(), strategy);
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The strategy that applies to `node_id`: its override if one was set,
    /// else the configured default.
    pub fn strategy_for(&self, node_id: &str) -> FailureStrategy {
        self.overrides.lock().get(node_id).copied().unwrap_or(self.default_strategy)
    }

    /// Delay for the given zero-based attempt number: `base * factor^attempt`,
    /// clipped to `max_delay`, then jittered by up to `jitter_ratio` in either
    /// direction.
    pub fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let raw = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let clipped = raw.min(self.max_delay.as_secs_f64());
        let jitter_span = clipped * self.jitter_ratio;
        let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        std::time::Duration::from_secs_f64((clipped + jitter).max(0.0))
    }

    /// True when the RETRY strategy should not even attempt a retry for this
    /// error code (§4.4: "if error_code.is_retryable() == false, return
    /// failure immediately").
    pub fn retry_precluded(&self, error_code: ErrorCode) -> bool {
        !error_code.is_retryable()
    }

    pub fn retry_count(&self, node_id: &str) -> u32 {
        *self.retry_counts.lock().get(node_id).unwrap_or(&0)
    }

    pub fn record_retry_attempt(&self, node_id: &str) -> u32 {
        let mut counts = self.retry_counts.lock();
        let count = counts.entry(node_id.to_string()).or_insert(0);
        let attempt = *count;
        *count += 1;
        attempt
    }

    pub fn reset(&self, node_id: &str) {
        self.retry_counts.lock().remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;

    fn orchestrator() -> FailureOrchestrator {
        FailureOrchestrator::new(&CoordinationConfig::default())
    }

    #[test]
    fn default_strategy_is_retry() {
        let o = orchestrator();
        assert_eq!(o.strategy_for("n1"), FailureStrategy::Retry);
    }

    #[test]
    fn override_takes_priority_over_default() {
        let o = orchestrator();
        o.set_override("n1", FailureStrategy::Skip);
        assert_eq!(o.strategy_for("n1"), FailureStrategy::Skip);
        assert_eq!(o.strategy_for("n2"), FailureStrategy::Retry);
    }

    #[test]
    fn retry_precluded_for_non_retryable_codes_only() {
        let o = orchestrator();
        assert!(!o.retry_precluded(ErrorCode::Timeout));
        assert!(o.retry_precluded(ErrorCode::ValidationFailed));
        assert!(o.retry_precluded(ErrorCode::DependencyFailed));
    }

    #[test]
    fn backoff_delay_grows_and_clips() {
        let o = orchestrator();
        let d0 = o.backoff_delay(0).as_secs_f64();
        let d5 = o.backoff_delay(5).as_secs_f64();
        assert!(d5 >= d0);
        assert!(d5 <= o.max_delay.as_secs_f64() * (1.0 + o.jitter_ratio) + 1e-9);
    }

    #[test]
    fn record_retry_attempt_increments_and_reset_clears() {
        let o = orchestrator();
        assert_eq!(o.record_retry_attempt("n1"), 0);
        assert_eq!(o.record_retry_attempt("n1"), 1);
        assert_eq!(o.retry_count("n1"), 2);
        o.reset("n1");
        assert_eq!(o.retry_count("n1"), 0);
    }
}
