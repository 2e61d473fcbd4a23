//! The aggregated status written back to the primary, and the rules that
//! fold per-node conditions into it.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Condition reasons the engine produces.
pub mod reason {
    pub const RECONCILED: &str = "Reconciled";
    pub const NOT_READY: &str = "NotReady";
    pub const PRECONDITION_UNMET: &str = "PreconditionUnmet";
    pub const TRANSIENT: &str = "Transient";
    pub const CONFLICT_EXCEEDED: &str = "ConflictExceeded";
    pub const INVALID_SPEC: &str = "InvalidSpec";

    /// Failures that only a change to the primary's spec can clear.
    pub fn is_terminal(reason: &str) -> bool {
        reason == INVALID_SPEC
    }

    /// Reasons reporting that applying a node failed, as opposed to a node
    /// that applied fine but is still waiting on something.
    pub fn is_failure(reason: &str) -> bool {
        matches!(reason, TRANSIENT | CONFLICT_EXCEEDED | INVALID_SPEC)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    /// Generation of the primary this condition was evaluated against.
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.to_owned(),
            message: message.into(),
            observed_generation,
            last_transition_time: None,
        }
    }

    pub fn at(mut self, timestamp: String) -> Self {
        self.last_transition_time = Some(timestamp);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.status == ConditionStatus::True
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_ready() && reason::is_terminal(&self.reason)
    }

    pub fn is_failure(&self) -> bool {
        !self.is_ready() && reason::is_failure(&self.reason)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    #[default]
    Unknown,
    Reconciling,
    Ready,
    Error,
}

/// Status subresource of a workflow-managed primary.
///
/// Fields this crate does not know about are kept in `extra` so a
/// read-modify-write cycle never drops them.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    /// Global status of the reconciliation
    #[serde(default)]
    pub status: OverallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Reconciled generation
    #[serde(default)]
    pub observed_generation: i64,
    /// One entry per active node, in evaluation order
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl WorkflowStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|condition| condition.type_ == type_)
    }
}

/// Folds one pass worth of conditions into a status.
///
/// `active` is the number of nodes that should have reported a condition
/// this pass; fewer conditions than that keeps the status at
/// [`OverallStatus::Reconciling`].
pub fn aggregate(
    mut conditions: Vec<Condition>,
    active: usize,
    previous: Option<&WorkflowStatus>,
    generation: i64,
) -> WorkflowStatus {
    if let Some(previous) = previous {
        for condition in &mut conditions {
            if let Some(before) = previous.condition(&condition.type_) {
                if before.status == condition.status && before.last_transition_time.is_some() {
                    condition.last_transition_time = before.last_transition_time.clone();
                }
            }
        }
    }

    let first_unready = conditions.iter().find(|condition| !condition.is_ready());
    let status = if conditions.iter().any(Condition::is_terminal) {
        OverallStatus::Error
    } else if first_unready.is_some() || conditions.len() < active {
        OverallStatus::Reconciling
    } else {
        OverallStatus::Ready
    };
    let message = match first_unready {
        Some(condition) => condition.message.clone(),
        None if conditions.len() < active => format!(
            "{} of {} resources reported",
            conditions.len(),
            active
        ),
        None => format!("All {} resources are ready", conditions.len()),
    };
    let observed_generation = if conditions.iter().any(Condition::is_failure) {
        previous.map_or(0, |previous| previous.observed_generation)
    } else {
        generation
    };

    WorkflowStatus {
        status,
        message: Some(message),
        observed_generation,
        conditions,
        extra: previous.map(|previous| previous.extra.clone()).unwrap_or_default(),
    }
}
