//! Status construction.
//!
//! Every status write carries the full status: lifecycle state, the
//! `Ready` condition and the observed generation.

use chrono::Utc;
use crds::{LifecycleState, PowerState, VirtualMachineCondition, VirtualMachineStatus, READY_CONDITION};

/// Why the `Ready` condition has its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyReason {
    Converged,
    Initialized,
    Transitioning,
    Pending,
    OperationFailed,
}

impl ReadyReason {
    fn as_str(self) -> &'static str {
        match self {
            ReadyReason::Converged => "Converged",
            ReadyReason::Initialized => "Initialized",
            ReadyReason::Transitioning => "Transitioning",
            ReadyReason::Pending => "Pending",
            ReadyReason::OperationFailed => "OperationFailed",
        }
    }
}

/// Build the status to write for `state`.
///
/// `failure` surfaces a runtime failure to the user while the resource is
/// not ready; a failure that still left the VM in the desired state reports
/// `Converged`. The transition time of `Ready` is kept when its truth value
/// does not change.
pub fn build_status(
    previous: Option<&VirtualMachineStatus>,
    state: LifecycleState,
    desired: PowerState,
    failure: Option<String>,
    generation: Option<i64>,
) -> VirtualMachineStatus {
    let ready = state == desired.as_lifecycle();
    let failure = failure.filter(|_| !ready);
    let reason = if ready {
        ReadyReason::Converged
    } else if failure.is_some() {
        ReadyReason::OperationFailed
    } else if previous.is_none() {
        ReadyReason::Initialized
    } else if state.is_transitional() {
        ReadyReason::Transitioning
    } else {
        ReadyReason::Pending
    };
    let status_value = if ready { "True" } else { "False" };
    let message = failure.or_else(|| {
        (!ready).then(|| format!("VM is {} and should be {}", state, desired))
    });

    let last_transition_time = previous
        .and_then(|s| s.conditions.iter().find(|c| c.type_ == READY_CONDITION))
        .filter(|c| c.status == status_value)
        .map_or_else(Utc::now, |c| c.last_transition_time);

    VirtualMachineStatus {
        state,
        conditions: vec![VirtualMachineCondition {
            type_: READY_CONDITION.to_string(),
            status: status_value.to_string(),
            reason: reason.as_str().to_string(),
            message,
            last_transition_time,
        }],
        observed_generation: generation,
    }
}

/// Whether `stored` already says what `fresh` says. Condition transition
/// times are not compared.
pub fn same_status(stored: &VirtualMachineStatus, fresh: &VirtualMachineStatus) -> bool {
    stored.state == fresh.state
        && stored.observed_generation == fresh.observed_generation
        && stored.conditions.len() == fresh.conditions.len()
        && stored.conditions.iter().zip(&fresh.conditions).all(|(a, b)| {
            a.type_ == b.type_ && a.status == b.status && a.reason == b.reason && a.message == b.message
        })
}

/// The `Ready` condition of a status, if any.
pub fn ready_condition(status: &VirtualMachineStatus) -> Option<&VirtualMachineCondition> {
    status.conditions.iter().find(|c| c.type_ == READY_CONDITION)
}
