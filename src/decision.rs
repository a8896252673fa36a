//! A proposed action awaiting coordinator review, and the outcome of that
//! review.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `decision_made` proposal: an action type plus its untyped payload, and
/// the ids needed to correlate the validation/rejection event that follows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub decision_type: String,
    pub payload: Value,
}

impl Decision {
    pub fn new(id: impl Into<String>, decision_type: impl Into<String>, payload: Value) -> Self {
        Self { id: id.into(), decision_type: decision_type.into(), payload }
    }
}
