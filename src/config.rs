//! Runtime configuration for the coordination core, loaded from TOML with
//! `serde(default = ...)` fallbacks for every field.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FAIL_CLOSED: bool = true;
pub const DEFAULT_REJECTION_RATE_THRESHOLD: f64 = 0.5;
pub const DEFAULT_REJECTION_RATE_SAMPLE_FLOOR: u64 = 20;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_SECS: f64 = 1.0;
pub const DEFAULT_MAX_DELAY_SECS: f64 = 60.0;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;
pub const DEFAULT_MAX_SEGMENT_LENGTH: usize = 2_000;
pub const DEFAULT_NEXT_ACTIONS_CAP: usize = 5;
pub const DEFAULT_AUDIT_LOG_CAPACITY: usize = 10_000;
pub const DEFAULT_FAILURE_STRATEGY: crate::failure::FailureStrategy = crate::failure::FailureStrategy::Retry;

fn default_supervised_decision_types() -> HashSet<String> {
    ["api_request", "create_node", "file_operation", "human_interaction", "tool_call"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_fail_closed() -> bool {
    DEFAULT_FAIL_CLOSED
}

fn default_rejection_rate_threshold() -> f64 {
    DEFAULT_REJECTION_RATE_THRESHOLD
}

fn default_rejection_rate_sample_floor() -> u64 {
    DEFAULT_REJECTION_RATE_SAMPLE_FLOOR
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay_secs() -> f64 {
    DEFAULT_BASE_DELAY_SECS
}

fn default_max_delay_secs() -> f64 {
    DEFAULT_MAX_DELAY_SECS
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

fn default_jitter_ratio() -> f64 {
    DEFAULT_JITTER_RATIO
}

fn default_max_segment_length() -> usize {
    DEFAULT_MAX_SEGMENT_LENGTH
}

fn default_next_actions_cap() -> usize {
    DEFAULT_NEXT_ACTIONS_CAP
}

fn default_audit_log_capacity() -> usize {
    DEFAULT_AUDIT_LOG_CAPACITY
}

fn default_failure_strategy() -> crate::failure::FailureStrategy {
    DEFAULT_FAILURE_STRATEGY
}

/// Top-level coordination config, deserialized from a `[coordination]` TOML
/// table. Every field has a matching `DEFAULT_*` constant so callers can
/// construct partial overrides without repeating the full set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Decision types the policy chain requires coordinator sign-off for;
    /// anything outside this set passes through unsupervised.
    #[serde(default = "default_supervised_decision_types")]
    pub supervised_decision_types: HashSet<String>,

    /// When true, a missing coordinator or event bus rejects rather than
    /// silently allows a supervised decision.
    #[serde(default = "default_fail_closed")]
    pub fail_closed: bool,

    /// Rejection-rate alarm threshold (fraction of decisions rejected).
    #[serde(default = "default_rejection_rate_threshold")]
    pub rejection_rate_threshold: f64,

    /// Minimum number of decisions observed before the rejection-rate
    /// threshold is evaluated, avoiding noisy alarms on small samples.
    #[serde(default = "default_rejection_rate_sample_floor")]
    pub rejection_rate_sample_floor: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Fraction of the computed delay added/subtracted at random to avoid
    /// retry storms synchronizing across nodes.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Per-segment character cap applied by the context compressor.
    #[serde(default = "default_max_segment_length")]
    pub max_segment_length: usize,

    /// Maximum number of `next_actions` entries a compressed context keeps.
    #[serde(default = "default_next_actions_cap")]
    pub next_actions_cap: usize,

    #[serde(default = "default_audit_log_capacity")]
    pub audit_log_capacity: usize,

    /// Strategy applied to a failed node with no per-node override.
    #[serde(default = "default_failure_strategy")]
    pub default_failure_strategy: crate::failure::FailureStrategy,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            supervised_decision_types: default_supervised_decision_types(),
            fail_closed: DEFAULT_FAIL_CLOSED,
            rejection_rate_threshold: DEFAULT_REJECTION_RATE_THRESHOLD,
            rejection_rate_sample_floor: DEFAULT_REJECTION_RATE_SAMPLE_FLOOR,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_secs: DEFAULT_BASE_DELAY_SECS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            max_segment_length: DEFAULT_MAX_SEGMENT_LENGTH,
            next_actions_cap: DEFAULT_NEXT_ACTIONS_CAP,
            audit_log_capacity: DEFAULT_AUDIT_LOG_CAPACITY,
            default_failure_strategy: DEFAULT_FAILURE_STRATEGY,
        }
    }
}

impl CoordinationConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(default)]
            coordination: CoordinationConfig,
        }
        let wrapper: Wrapper = toml::from_str(input)?;
        Ok(wrapper.coordination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_constants() {
        let cfg = CoordinationConfig::default();
        assert_eq!(cfg.max_retries, DEFAULT_MAX_RETRIES);
        assert!(cfg.fail_closed);
        assert!(cfg.supervised_decision_types.contains("create_node"));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = CoordinationConfig::from_toml_str(
            r#"
            [coordination]
            max_retries = 7
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_retries, 7);
        assert_eq!(cfg.base_delay_secs, DEFAULT_BASE_DELAY_SECS);
    }

    #[test]
    fn missing_table_uses_all_defaults() {
        let cfg = CoordinationConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.audit_log_capacity, DEFAULT_AUDIT_LOG_CAPACITY);
    }
}
