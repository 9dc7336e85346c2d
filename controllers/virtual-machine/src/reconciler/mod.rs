//! Reconciliation logic for VirtualMachine resources.
//!
//! One call to [`Reconciler::reconcile`] performs at most one lifecycle
//! transition. The intermediate status is always written before the runtime
//! is asked to act, and a transitional status is always resolved by querying
//! the runtime instead of re-issuing the operation.

pub mod conditions;
pub mod transition;


use crate::error::ControllerError;
use crate::events::{actions, reasons, EventPublisher};
use crate::metrics::Metrics;
use crate::store::{StoreError, VirtualMachineStore, VmKey};
use conditions::{build_status, same_status};
use crds::{LifecycleState, PowerState, VirtualMachine, VirtualMachineStatus};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use transition::{plan, target_of, Plan, Transition};
use vm_runtime_client::{PowerOperation, RuntimeDriver, RuntimeError, RuntimeState, VmIdentity};

/// Result of a successful reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Status matches the desired state
    Converged,
    /// Progress was made, run the next pass right away
    Requeue,
    /// An operation is still running in the runtime, check back later
    Poll,
    /// The resource is gone (or released by its finalizer)
    Gone,
}

impl ReconcileOutcome {
    /// Short label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileOutcome::Converged => "converged",
            ReconcileOutcome::Requeue => "requeue",
            ReconcileOutcome::Poll => "poll",
            ReconcileOutcome::Gone => "gone",
        }
    }
}

/// State carried through one pass: the object as read and the version
/// token every write must present.
struct Pass<'a> {
    key: &'a VmKey,
    reference: ObjectReference,
    desired: PowerState,
    generation: Option<i64>,
    identity: VmIdentity,
    resource_version: String,
    status: Option<VirtualMachineStatus>,
}

/// Reconciles VirtualMachine resources against the runtime.
pub struct Reconciler {
    store: Box<dyn VirtualMachineStore>,
    driver: Box<dyn RuntimeDriver>,
    events: Box<dyn EventPublisher>,
    driver_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        store: impl VirtualMachineStore + 'static,
        driver: impl RuntimeDriver + 'static,
        events: impl EventPublisher + 'static,
        driver_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store: Box::new(store),
            driver: Box::new(driver),
            events: Box::new(events),
            driver_timeout,
            metrics,
        }
    }

    /// Run one reconciliation pass for `key`.
    pub async fn reconcile(&self, key: &VmKey) -> Result<ReconcileOutcome, ControllerError> {
        let Some(vm) = self.store.get(key).await? else {
            debug!("VirtualMachine {} no longer exists", key);
            return Ok(ReconcileOutcome::Gone);
        };
        let resource_version = vm
            .resource_version()
            .ok_or_else(|| ControllerError::InvalidResource(format!("{} has no resourceVersion", key)))?;
        let identity = VmIdentity::new(&key.namespace, &key.name, &vm.spec.image);

        if vm.is_being_deleted() {
            return self.finalize(key, &vm, &identity, &resource_version).await;
        }

        let resource_version = if vm.has_finalizer() {
            resource_version
        } else {
            debug!("Adding finalizer to {}", key);
            self.store.add_finalizer(key, &resource_version).await?
        };

        let mut pass = Pass {
            key,
            reference: vm.object_ref(&()),
            desired: vm.desired_state(),
            generation: vm.metadata.generation,
            identity,
            resource_version,
            status: vm.status.clone(),
        };

        match plan(pass.desired, vm.observed_state()) {
            Plan::Initialize => self.initialize(&mut pass).await,
            Plan::Converged => self.converged(&mut pass).await,
            Plan::Observe { intermediate, pending } => self.observe(&mut pass, intermediate, pending).await,
            Plan::Transition(transition) => self.transition(&mut pass, transition).await,
        }
    }

    /// No status yet: record what the runtime reports.
    async fn initialize(&self, pass: &mut Pass<'_>) -> Result<ReconcileOutcome, ControllerError> {
        let observed = match self.query(&pass.identity).await? {
            Ok(state) => state,
            // The runtime has never seen this VM, so it is not running
            Err(RuntimeError::NotFound(_)) => RuntimeState::Stopped,
            Err(e) => return Err(e.into()),
        };

        let state = match observed {
            RuntimeState::Stopped => LifecycleState::Stopped,
            RuntimeState::Started => LifecycleState::Started,
            RuntimeState::Hibernated => LifecycleState::Hibernated,
            RuntimeState::InProgress(operation) => transition::intermediate_for(target_of(operation)),
            RuntimeState::Unknown(raw) => return Err(self.unknown_state(&pass.reference, raw).await),
        };

        info!("Initializing status of {} to {}", pass.key, state);
        self.write_status(pass, state, None).await?;
        Ok(ReconcileOutcome::Requeue)
    }

    /// Already in the desired state. The status is rewritten only when it
    /// is stale (an old failure, or a newer generation), never the runtime.
    async fn converged(&self, pass: &mut Pass<'_>) -> Result<ReconcileOutcome, ControllerError> {
        let Some(stored) = pass.status.as_ref() else {
            return Ok(ReconcileOutcome::Converged);
        };
        let fresh = build_status(Some(stored), stored.state, pass.desired, None, pass.generation);
        if same_status(stored, &fresh) {
            debug!("{} is {}, nothing to do", pass.key, pass.desired);
        } else {
            debug!("{} is {}, refreshing status", pass.key, pass.desired);
            self.write_status(pass, fresh.state, None).await?;
        }
        Ok(ReconcileOutcome::Converged)
    }

    /// A transition may be in flight: ask the runtime how it ended.
    async fn observe(
        &self,
        pass: &mut Pass<'_>,
        intermediate: LifecycleState,
        pending: PowerState,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let observed = match self.query(&pass.identity).await? {
            Ok(state) => state,
            Err(RuntimeError::NotFound(_)) => RuntimeState::Stopped,
            // Outcome still unknown, status stays transitional
            Err(e) => return Err(e.into()),
        };

        let reached = match observed {
            RuntimeState::InProgress(operation) => {
                debug!("{} is still running {} ({})", pass.key, operation, intermediate);
                return Ok(ReconcileOutcome::Poll);
            }
            RuntimeState::Unknown(raw) => return Err(self.unknown_state(&pass.reference, raw).await),
            RuntimeState::Stopped => PowerState::Stopped,
            RuntimeState::Started => PowerState::Started,
            RuntimeState::Hibernated => PowerState::Hibernated,
        };

        if reached == pending {
            info!("{} completed {}, now {}", pass.key, intermediate, reached);
            self.write_status(pass, reached.as_lifecycle(), None).await?;
            return Ok(self.outcome_after(pass, reached));
        }

        // The operation did not take effect (or was never issued before a
        // crash). Fall back to what the runtime reports and retry later.
        let message = format!("{} did not complete, runtime reports {}", intermediate, reached);
        warn!("{}: {}", pass.key, message);
        self.write_status(pass, reached.as_lifecycle(), Some(message.clone())).await?;
        self.warn(&pass.reference, reasons::OPERATION_FAILED, actions::RECONCILE, message.clone())
            .await;
        if reached == pass.desired {
            // The spec moved while the operation failed: nothing left to do
            return Ok(ReconcileOutcome::Converged);
        }
        Err(ControllerError::OperationFailed {
            operation: intermediate.to_string(),
            message,
        })
    }

    /// Steady but not desired: write intent, act, record the result.
    async fn transition(&self, pass: &mut Pass<'_>, transition: Transition) -> Result<ReconcileOutcome, ControllerError> {
        let Transition {
            from,
            operation,
            intermediate,
            target,
        } = transition;
        info!(
            "Transitioning {} from {} towards {} via {}",
            pass.key, from, pass.desired, operation
        );

        // A conflict here aborts the pass before the runtime is touched
        self.write_status(pass, intermediate, None).await?;

        match self.call(operation.as_str(), self.driver.execute(operation, &pass.identity)).await? {
            Ok(()) => {}
            Err(e) if e.is_indeterminate() => {
                warn!("{} on {} has unknown outcome, status stays {}: {}", operation, pass.key, intermediate, e);
                return Err(e.into());
            }
            Err(e) => {
                let message = format!("{} failed: {}", operation, e);
                warn!("{}: {}", pass.key, message);
                self.write_status(pass, from.as_lifecycle(), Some(message.clone())).await?;
                self.warn(&pass.reference, reasons::OPERATION_FAILED, operation.as_str(), message)
                    .await;
                return Err(ControllerError::OperationFailed {
                    operation: operation.to_string(),
                    message: e.to_string(),
                });
            }
        }

        info!("{} on {} succeeded", operation, pass.key);
        self.write_status(pass, target.as_lifecycle(), None).await?;
        Ok(self.outcome_after(pass, target))
    }

    /// Power the VM off and release the finalizer.
    async fn finalize(
        &self,
        key: &VmKey,
        vm: &VirtualMachine,
        identity: &VmIdentity,
        resource_version: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        if !vm.has_finalizer() {
            return Ok(ReconcileOutcome::Gone);
        }
        let reference = vm.object_ref(&());

        let observed = match self.query(identity).await? {
            Ok(state) => Some(state),
            Err(RuntimeError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        match observed {
            None | Some(RuntimeState::Stopped) => {}
            Some(RuntimeState::InProgress(operation)) => {
                debug!("{} is being deleted but still running {}", key, operation);
                return Ok(ReconcileOutcome::Poll);
            }
            Some(RuntimeState::Unknown(raw)) => return Err(self.unknown_state(&reference, raw).await),
            Some(_) => {
                info!("Powering off {} before deletion", key);
                let operation = PowerOperation::PowerOff;
                if let Err(e) = self.call(operation.as_str(), self.driver.execute(operation, identity)).await? {
                    if !e.is_indeterminate() {
                        let note = format!("{} failed: {}", operation, e);
                        self.warn(&reference, reasons::OPERATION_FAILED, actions::FINALIZE, note)
                            .await;
                    }
                    return Err(e.into());
                }
            }
        }

        match self.store.remove_finalizer(key, resource_version).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!("Released {}", key);
        self.events
            .publish(
                &reference,
                EventType::Normal,
                reasons::RELEASED,
                actions::FINALIZE,
                Some(format!("Powered off and released {}", key)),
            )
            .await;
        Ok(ReconcileOutcome::Gone)
    }

    /// List every resource so the caller can queue them after a restart.
    ///
    /// Nothing from a previous process is trusted: each resource is
    /// re-derived from the store and the runtime by a normal pass.
    pub async fn startup_reconciliation(&self) -> Result<Vec<VmKey>, ControllerError> {
        let resources = self.store.list().await?;
        let mut keys = Vec::with_capacity(resources.len());
        let mut transitional = 0usize;

        for vm in &resources {
            let Some(key) = VmKey::from_resource(vm) else {
                warn!("Skipping VirtualMachine without a name");
                continue;
            };
            if let Some(state) = vm.observed_state().filter(|s| s.is_transitional()) {
                debug!("{} was left {}, will revalidate against the runtime", key, state);
                transitional += 1;
            }
            keys.push(key);
        }

        info!(
            "Startup reconciliation found {} VirtualMachine(s), {} mid-transition",
            keys.len(),
            transitional
        );
        Ok(keys)
    }

    fn outcome_after(&self, pass: &Pass<'_>, reached: PowerState) -> ReconcileOutcome {
        if reached == pass.desired {
            ReconcileOutcome::Converged
        } else {
            ReconcileOutcome::Requeue
        }
    }

    async fn warn(&self, reference: &ObjectReference, reason: &str, action: &str, note: String) {
        self.events
            .publish(reference, EventType::Warning, reason, action, Some(note))
            .await;
    }

    async fn unknown_state(&self, reference: &ObjectReference, raw: String) -> ControllerError {
        self.warn(
            reference,
            reasons::UNKNOWN_STATE,
            actions::RECONCILE,
            format!("runtime reports unknown state {:?}", raw),
        )
        .await;
        ControllerError::UnknownState(raw)
    }

    async fn write_status(
        &self,
        pass: &mut Pass<'_>,
        state: LifecycleState,
        failure: Option<String>,
    ) -> Result<(), ControllerError> {
        let status = build_status(pass.status.as_ref(), state, pass.desired, failure, pass.generation);
        pass.resource_version = self
            .store
            .write_status(pass.key, &pass.resource_version, &status)
            .await?;
        pass.status = Some(status);
        Ok(())
    }

    async fn query(&self, identity: &VmIdentity) -> Result<Result<RuntimeState, RuntimeError>, ControllerError> {
        self.call("query-state", self.driver.query_state(identity)).await
    }

    /// Run a driver call under the controller deadline.
    ///
    /// The outer error is the deadline; the inner result is what the
    /// runtime answered.
    async fn call<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<Result<T, RuntimeError>, ControllerError> {
        match tokio::time::timeout(self.driver_timeout, call).await {
            Ok(result) => {
                let label = match &result {
                    Ok(_) => "ok",
                    Err(e) if e.is_indeterminate() => "indeterminate",
                    Err(_) => "failed",
                };
                self.metrics.driver_call(operation, label);
                Ok(result)
            }
            Err(_) => {
                self.metrics.driver_call(operation, "timeout");
                warn!("{} did not answer within {:?}", operation, self.driver_timeout);
                Err(ControllerError::DriverTimeout {
                    operation: operation.to_string(),
                    seconds: self.driver_timeout.as_secs(),
                })
            }
        }
    }
}
