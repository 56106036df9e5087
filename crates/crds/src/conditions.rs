//! Status conditions
//!
//! Every resource carries an explicit list of typed conditions. The aggregate
//! `Ready` condition is never written by hand: it is folded from the contributing
//! conditions by [`summary`] right before a resource is persisted.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Aggregate condition computed from the other conditions of a resource.
pub const READY_CONDITION: &str = "Ready";

/// The microvm backing a `MicrovmMachine` exists and is running.
pub const MICROVM_READY_CONDITION: &str = "MicrovmReady";
/// The cluster infrastructure is still being provisioned.
pub const WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON: &str = "WaitingForClusterInfrastructure";
/// The bootstrap provider has not produced bootstrap data yet.
pub const WAITING_FOR_BOOTSTRAP_DATA_REASON: &str = "WaitingForBootstrapData";
/// The microvm service reports the microvm as pending.
pub const MICROVM_PENDING_REASON: &str = "MicrovmPending";
/// The microvm service reports the microvm as failed.
pub const MICROVM_PROVISION_FAILED_REASON: &str = "MicrovmProvisionFailed";
/// The microvm service reports a state this controller does not know.
pub const MICROVM_UNKNOWN_STATE_REASON: &str = "MicrovmUnknownState";
/// The microvm is being deleted.
pub const MICROVM_DELETING_REASON: &str = "MicrovmDeleting";
/// Deleting the microvm failed.
pub const MICROVM_DELETE_FAILED_REASON: &str = "MicrovmDeleteFailed";

/// The control plane endpoint of a `MicrovmCluster` answers its liveness probe.
pub const LOAD_BALANCER_AVAILABLE_CONDITION: &str = "LoadBalancerAvailable";
/// The control plane endpoint did not answer (timeout or server error).
pub const LOAD_BALANCER_NOT_AVAILABLE_REASON: &str = "LoadBalancerNotAvailable";
/// Probing the control plane endpoint failed for another reason.
pub const LOAD_BALANCER_FAILED_REASON: &str = "LoadBalancerAvailabilityFailed";

/// The endpoint of an `ExternalLoadBalancer` answers its liveness probe.
pub const EXTERNAL_LOAD_BALANCER_ENDPOINT_AVAILABLE_CONDITION: &str =
    "ExternalLoadBalancerEndpointAvailable";
/// The external load balancer endpoint did not answer.
pub const EXTERNAL_LOAD_BALANCER_ENDPOINT_NOT_AVAILABLE_REASON: &str =
    "ExternalLoadBalancerEndpointNotAvailable";
/// Probing the external load balancer endpoint failed for another reason.
pub const EXTERNAL_LOAD_BALANCER_ENDPOINT_FAILED_REASON: &str =
    "ExternalLoadBalancerEndpointFailed";

/// Status of a condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not enough information to decide
    #[default]
    Unknown,
}

/// Severity of a condition that does not hold
///
/// Ordered from least to most severe so that `max()` picks the worst one.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionSeverity {
    /// Informational, usually a normal waiting state
    Info,
    /// Something is degraded but may recover on its own
    Warning,
    /// Operator attention required
    Error,
}

/// A named, reason-coded status entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `MicrovmReady`
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    pub status: ConditionStatus,

    /// Severity, only set when status is `False`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// A `True` condition of the given type
    pub fn true_condition(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::True,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    /// A `False` condition of the given type
    pub fn false_condition(
        type_: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity),
            reason: Some(reason.to_string()),
            message: (!message.is_empty()).then_some(message),
            last_transition_time: None,
        }
    }

    /// An `Unknown` condition of the given type
    pub fn unknown_condition(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::Unknown,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    /// True when both conditions carry the same observable state, ignoring the timestamp
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Returns the condition of the given type, if present
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Returns true when the condition of the given type is present and `True`
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Returns true when the condition of the given type is present and `False`
pub fn is_false(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::False)
}

/// Inserts or replaces a condition.
///
/// The transition time is kept when the status did not change, so re-asserting the
/// same condition does not produce a status diff. The list is kept sorted with
/// `Ready` first and the rest by type.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            } else {
                condition.last_transition_time = Some(Utc::now());
            }
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(Utc::now());
            conditions.push(condition);
        }
    }

    conditions.sort_by(|a, b| {
        let a_ready = a.type_ == READY_CONDITION;
        let b_ready = b.type_ == READY_CONDITION;
        b_ready.cmp(&a_ready).then_with(|| a.type_.cmp(&b.type_))
    });
}

/// Marks a condition `True`
pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set_condition(conditions, Condition::true_condition(type_));
}

/// Marks a condition `False` with a reason and severity
pub fn mark_false(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    set_condition(
        conditions,
        Condition::false_condition(type_, reason, severity, message),
    );
}

/// Folds the contributing conditions into one aggregate `Ready` condition.
///
/// - none of the contributing types present: `Unknown`
/// - every present contributing condition `True`: `True`
/// - otherwise `False`, carrying reason, severity and message of the most severe
///   `False` condition (earlier entries in `contributing` win ties)
///
/// Contributing conditions that are `Unknown` make the summary `Unknown` unless a
/// `False` one is present.
pub fn summary(conditions: &[Condition], contributing: &[&str]) -> Condition {
    let present: Vec<&Condition> = contributing
        .iter()
        .filter_map(|type_| get_condition(conditions, type_))
        .collect();

    if present.is_empty() {
        return Condition::unknown_condition(READY_CONDITION);
    }

    let mut worst: Option<&Condition> = None;
    for condition in present.iter().filter(|c| c.status == ConditionStatus::False) {
        let replace = match worst {
            None => true,
            Some(current) => condition.severity > current.severity,
        };
        if replace {
            worst = Some(condition);
        }
    }

    if let Some(worst) = worst {
        return Condition {
            type_: READY_CONDITION.to_string(),
            status: ConditionStatus::False,
            severity: worst.severity,
            reason: worst.reason.clone(),
            message: worst.message.clone(),
            last_transition_time: None,
        };
    }

    if present.iter().all(|c| c.status == ConditionStatus::True) {
        Condition::true_condition(READY_CONDITION)
    } else {
        Condition::unknown_condition(READY_CONDITION)
    }
}

/// Recomputes the aggregate `Ready` condition in place
pub fn set_summary(conditions: &mut Vec<Condition>, contributing: &[&str]) {
    let ready = summary(conditions, contributing);
    set_condition(conditions, ready);
}
