//! Condition type following Kubernetes API conventions

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An observation of one aspect of an object's state.
///
/// `last_transition_time` is an RFC 3339 timestamp and only moves when
/// `status` changes, so consumers can rely on it for transition ordering.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub last_transition_time: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}
