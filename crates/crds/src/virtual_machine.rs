//! VirtualMachine CRD
//!
//! Declares the desired power state of a virtual machine (`spec.state`) and
//! the lifecycle state observed by the controller (`status.state`).

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer held while the runtime may still own a VM for this resource.
pub const VIRTUAL_MACHINE_FINALIZER: &str = "vm.codesandbox.io";

/// Name of the condition summarizing convergence.
pub const READY_CONDITION: &str = "Ready";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "codesandbox.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    namespaced,
    shortname = "vm",
    status = "VirtualMachineStatus",
    printcolumn = r#"{"name":"Image","type":"string","description":"Root filesystem image","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"State","type":"string","description":"Observed lifecycle state","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Root filesystem image of the VM
    pub image: String,

    /// Desired steady power state
    pub state: PowerState,
}

/// Steady power states. These are the only values a user may request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    /// VM is powered off
    Stopped,

    /// VM is running
    Started,

    /// VM memory is persisted and the VM is suspended
    Hibernated,
}

/// Observed lifecycle state, including in-flight transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Stopped,
    Stopping,
    Started,
    Starting,
    Hibernating,
    Hibernated,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Current lifecycle state
    pub state: LifecycleState,

    /// Conditions surfaced to users (convergence, last failure)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<VirtualMachineCondition>,

    /// Generation of the spec this status was computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineCondition {
    /// Condition type, e.g. `Ready`
    #[serde(rename = "type")]
    pub type_: String,

    /// One of `True`, `False`, `Unknown`
    pub status: String,

    /// Machine-readable reason
    pub reason: String,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When `status` last changed
    pub last_transition_time: chrono::DateTime<chrono::Utc>,
}

impl PowerState {
    /// The lifecycle value reported once this state is reached.
    #[must_use]
    pub fn as_lifecycle(self) -> LifecycleState {
        match self {
            PowerState::Stopped => LifecycleState::Stopped,
            PowerState::Started => LifecycleState::Started,
            PowerState::Hibernated => LifecycleState::Hibernated,
        }
    }
}

impl From<PowerState> for LifecycleState {
    fn from(state: PowerState) -> Self {
        state.as_lifecycle()
    }
}

impl LifecycleState {
    /// True for STARTING, STOPPING and HIBERNATING.
    #[must_use]
    pub fn is_transitional(self) -> bool {
        self.steady().is_none()
    }

    /// The steady state this value represents, if it is one.
    #[must_use]
    pub fn steady(self) -> Option<PowerState> {
        match self {
            LifecycleState::Stopped => Some(PowerState::Stopped),
            LifecycleState::Started => Some(PowerState::Started),
            LifecycleState::Hibernated => Some(PowerState::Hibernated),
            LifecycleState::Stopping | LifecycleState::Starting | LifecycleState::Hibernating => None,
        }
    }

    /// The steady state a transitional value is heading towards.
    #[must_use]
    pub fn pending_target(self) -> Option<PowerState> {
        match self {
            LifecycleState::Starting => Some(PowerState::Started),
            LifecycleState::Stopping => Some(PowerState::Stopped),
            LifecycleState::Hibernating => Some(PowerState::Hibernated),
            LifecycleState::Stopped | LifecycleState::Started | LifecycleState::Hibernated => None,
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_lifecycle().fmt(f)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Started => "STARTED",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Hibernating => "HIBERNATING",
            LifecycleState::Hibernated => "HIBERNATED",
        };
        f.write_str(s)
    }
}

impl VirtualMachine {
    /// Desired steady state from the spec.
    #[must_use]
    pub fn desired_state(&self) -> PowerState {
        self.spec.state
    }

    /// Observed lifecycle state, `None` before the first reconciliation.
    #[must_use]
    pub fn observed_state(&self) -> Option<LifecycleState> {
        self.status.as_ref().map(|s| s.state)
    }

    /// Whether the resource has a deletion timestamp.
    #[must_use]
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the controller finalizer is present.
    #[must_use]
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == VIRTUAL_MACHINE_FINALIZER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_state_serializes_screaming_case() {
        let json = serde_json::to_string(&LifecycleState::Hibernating).unwrap();
        assert_eq!(json, "\"HIBERNATING\"");

        let state: PowerState = serde_json::from_str("\"STARTED\"").unwrap();
        assert_eq!(state, PowerState::Started);
    }

    #[test]
    fn test_transitional_states_have_targets() {
        assert!(LifecycleState::Starting.is_transitional());
        assert!(LifecycleState::Stopping.is_transitional());
        assert!(LifecycleState::Hibernating.is_transitional());
        assert!(!LifecycleState::Started.is_transitional());

        assert_eq!(LifecycleState::Starting.pending_target(), Some(PowerState::Started));
        assert_eq!(LifecycleState::Stopping.pending_target(), Some(PowerState::Stopped));
        assert_eq!(LifecycleState::Hibernating.pending_target(), Some(PowerState::Hibernated));
        assert_eq!(LifecycleState::Stopped.pending_target(), None);
    }

    #[test]
    fn test_spec_rejects_transitional_desired_state() {
        let result: Result<VirtualMachineSpec, _> =
            serde_json::from_value(serde_json::json!({ "image": "ubuntu:24.04", "state": "STARTING" }));
        assert!(result.is_err(), "transitional values are not valid desired states");
    }

    #[test]
    fn test_status_without_conditions_omits_them() {
        let status = VirtualMachineStatus {
            state: LifecycleState::Stopped,
            conditions: Vec::new(),
            observed_generation: None,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value, serde_json::json!({ "state": "STOPPED" }));
    }

    #[test]
    fn test_crd_metadata() {
        let crd = VirtualMachine::crd();
        assert_eq!(crd.spec.group, "codesandbox.io");
        assert_eq!(crd.spec.names.kind, "VirtualMachine");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.short_names, Some(vec!["vm".to_string()]));

        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
        let columns = version.additional_printer_columns.as_ref().unwrap();
        assert!(columns.iter().any(|c| c.json_path == ".spec.image"));
    }
}
