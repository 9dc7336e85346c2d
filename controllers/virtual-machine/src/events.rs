//! Kubernetes Events published on VirtualMachine resources.
//!
//! Failures are also recorded in the `Ready` condition; events keep a
//! history that `kubectl describe` shows next to the resource.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Name the controller reports events under.
pub const REPORTER: &str = "virtual-machine-controller";

/// Event reasons.
pub mod reasons {
    pub const OPERATION_FAILED: &str = "OperationFailed";
    pub const UNKNOWN_STATE: &str = "UnknownState";
    pub const RELEASED: &str = "Released";
}

/// Event actions.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const FINALIZE: &str = "Finalize";
}

/// Sink for resource events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event about `reference`. Failures are logged, never
    /// returned: a lost event must not fail a pass.
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the Kubernetes events API.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        Self {
            recorder: Recorder::new(client, Reporter::from(REPORTER)),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!(
                "Failed to publish {} event for {}: {}",
                reason,
                reference.name.as_deref().unwrap_or("<unnamed>"),
                e
            );
        }
    }
}
