//! Transition planning.
//!
//! Pure decision logic: given the desired steady state and the observed
//! lifecycle state, decide what a single reconciliation pass does.

use crds::{LifecycleState, PowerState};
use vm_runtime_client::PowerOperation;

/// One step from a steady state towards another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Steady state the VM is in now
    pub from: PowerState,
    /// Runtime operation to invoke
    pub operation: PowerOperation,
    /// Status written before the operation runs
    pub intermediate: LifecycleState,
    /// Status written once the operation succeeded
    pub target: PowerState,
}

/// What a reconciliation pass should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// No status yet: ask the runtime and record what it reports
    Initialize,
    /// Status already matches the desired state
    Converged,
    /// An operation towards `pending` may be in flight: query, never re-issue
    Observe {
        intermediate: LifecycleState,
        pending: PowerState,
    },
    /// Start the next transition
    Transition(Transition),
}

/// Decide the next step for a resource.
#[must_use]
pub fn plan(desired: PowerState, observed: Option<LifecycleState>) -> Plan {
    let Some(observed) = observed else {
        return Plan::Initialize;
    };

    if let Some(pending) = observed.pending_target() {
        return Plan::Observe {
            intermediate: observed,
            pending,
        };
    }

    match observed.steady() {
        Some(current) if current == desired => Plan::Converged,
        Some(current) => Plan::Transition(next_transition(desired, current)),
        // Every non-transitional lifecycle value is steady
        None => Plan::Initialize,
    }
}

/// The single hop taken from `from` towards `desired` (`from != desired`).
///
/// STOPPED -> HIBERNATED has no direct runtime primitive: the VM is started
/// first and hibernated on the following pass. A stopped VM is started with
/// `power_on`; `resume` is only used to leave HIBERNATED.
#[must_use]
pub fn next_transition(desired: PowerState, from: PowerState) -> Transition {
    let (operation, target) = match (desired, from) {
        (PowerState::Started, PowerState::Hibernated) => (PowerOperation::Resume, PowerState::Started),
        (PowerState::Started, _) => (PowerOperation::PowerOn, PowerState::Started),
        (PowerState::Stopped, _) => (PowerOperation::PowerOff, PowerState::Stopped),
        (PowerState::Hibernated, PowerState::Stopped) => (PowerOperation::PowerOn, PowerState::Started),
        (PowerState::Hibernated, _) => (PowerOperation::Hibernate, PowerState::Hibernated),
    };

    Transition {
        from,
        operation,
        intermediate: intermediate_for(target),
        target,
    }
}

/// Transitional status shown while moving into `target`.
#[must_use]
pub fn intermediate_for(target: PowerState) -> LifecycleState {
    match target {
        PowerState::Started => LifecycleState::Starting,
        PowerState::Stopped => LifecycleState::Stopping,
        PowerState::Hibernated => LifecycleState::Hibernating,
    }
}

/// Steady state a runtime operation ends in.
#[must_use]
pub fn target_of(operation: PowerOperation) -> PowerState {
    match operation {
        PowerOperation::PowerOn | PowerOperation::Resume => PowerState::Started,
        PowerOperation::PowerOff => PowerState::Stopped,
        PowerOperation::Hibernate => PowerState::Hibernated,
    }
}
