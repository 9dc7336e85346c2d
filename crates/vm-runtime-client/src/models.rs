//! Runtime data models

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a VM as known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmIdentity {
    pub namespace: String,
    pub name: String,
    /// Root filesystem image the VM boots from
    pub image: String,
}

impl VmIdentity {
    /// Create a new identity
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            image: image.into(),
        }
    }

    /// Stable runtime id (`namespace/name`)
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A long-running power operation on a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerOperation {
    PowerOn,
    PowerOff,
    Hibernate,
    Resume,
}

impl PowerOperation {
    /// Path segment / metric label for the operation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PowerOperation::PowerOn => "power-on",
            PowerOperation::PowerOff => "power-off",
            PowerOperation::Hibernate => "hibernate",
            PowerOperation::Resume => "resume",
        }
    }
}

impl fmt::Display for PowerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State reported by `query_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeState {
    Stopped,
    Started,
    Hibernated,
    /// An operation is still running on the VM
    InProgress(PowerOperation),
    /// The runtime reported something outside the known states
    Unknown(String),
}

impl RuntimeState {
    /// Parse the agent's wire value. Unrecognized values map to `Unknown`.
    #[must_use]
    pub fn from_wire(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "stopped" => RuntimeState::Stopped,
            "started" | "running" => RuntimeState::Started,
            "hibernated" | "suspended" => RuntimeState::Hibernated,
            "starting" => RuntimeState::InProgress(PowerOperation::PowerOn),
            "resuming" => RuntimeState::InProgress(PowerOperation::Resume),
            "stopping" => RuntimeState::InProgress(PowerOperation::PowerOff),
            "hibernating" => RuntimeState::InProgress(PowerOperation::Hibernate),
            _ => RuntimeState::Unknown(value.to_string()),
        }
    }
}

/// Body sent with every power operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerRequest {
    pub image: String,
}

/// Body returned by the state endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
