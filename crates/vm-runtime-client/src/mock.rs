//! Mock RuntimeDriver for unit testing
//!
//! Keeps VM states in memory, records every call and lets tests inject
//! failures, timeouts and operations that complete after the caller gave up.

use crate::driver_trait::RuntimeDriver;
use crate::error::RuntimeError;
use crate::models::{PowerOperation, RuntimeState, VmIdentity};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A call observed by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Query(String),
    Operation(PowerOperation, String),
}

/// What the mock should do on the next invocation of an operation
#[derive(Debug)]
enum Injection {
    /// Return this error without touching the VM
    Fail(RuntimeError),
    /// Apply the operation but report a timeout to the caller
    CompleteThenTimeout,
    /// Leave the VM in progress and report a timeout to the caller
    Stall,
}

/// Mock RuntimeDriver for testing
#[derive(Clone, Default)]
pub struct MockRuntimeDriver {
    states: Arc<Mutex<HashMap<String, RuntimeState>>>,
    calls: Arc<Mutex<Vec<DriverCall>>>,
    injections: Arc<Mutex<HashMap<PowerOperation, VecDeque<Injection>>>>,
    query_failures: Arc<Mutex<VecDeque<RuntimeError>>>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl MockRuntimeDriver {
    /// Create a new mock with no VMs
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state of a VM (for test setup)
    pub fn set_state(&self, vm_id: &str, state: RuntimeState) {
        self.states.lock().unwrap().insert(vm_id.to_string(), state);
    }

    /// Current state of a VM, `None` if the runtime has never seen it
    pub fn state(&self, vm_id: &str) -> Option<RuntimeState> {
        self.states.lock().unwrap().get(vm_id).cloned()
    }

    /// Remove a VM from the runtime
    pub fn remove(&self, vm_id: &str) {
        self.states.lock().unwrap().remove(vm_id);
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Power operations made so far, in order
    pub fn operations(&self) -> Vec<PowerOperation> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                DriverCall::Operation(op, _) => Some(*op),
                DriverCall::Query(_) => None,
            })
            .collect()
    }

    /// Number of times `operation` was invoked
    pub fn count(&self, operation: PowerOperation) -> usize {
        self.operations().into_iter().filter(|op| *op == operation).count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Make the next `operation` call fail with `error`
    pub fn fail_next(&self, operation: PowerOperation, error: RuntimeError) {
        self.push_injection(operation, Injection::Fail(error));
    }

    /// Make the next `operation` call time out after the VM reached the target
    pub fn complete_then_timeout(&self, operation: PowerOperation) {
        self.push_injection(operation, Injection::CompleteThenTimeout);
    }

    /// Make the next `operation` call time out with the VM still in progress
    pub fn stall(&self, operation: PowerOperation) {
        self.push_injection(operation, Injection::Stall);
    }

    /// Make the next `query_state` call fail with `error`
    pub fn fail_next_query(&self, error: RuntimeError) {
        self.query_failures.lock().unwrap().push_back(error);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    fn push_injection(&self, operation: PowerOperation, injection: Injection) {
        self.injections
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(injection);
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn apply(&self, operation: PowerOperation, vm: &VmIdentity) -> Result<(), RuntimeError> {
        let id = vm.id();
        self.calls
            .lock()
            .unwrap()
            .push(DriverCall::Operation(operation, id.clone()));
        self.simulate_latency().await;

        let injection = self
            .injections
            .lock()
            .unwrap()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);

        match injection {
            Some(Injection::Fail(error)) => return Err(error),
            Some(Injection::Stall) => {
                self.set_state(&id, RuntimeState::InProgress(operation));
                return Err(RuntimeError::Timeout(format!("{} {} still running", operation, id)));
            }
            Some(Injection::CompleteThenTimeout) => {
                let next = self.transition(operation, &id)?;
                self.set_state(&id, next);
                return Err(RuntimeError::Timeout(format!("{} {} timed out", operation, id)));
            }
            None => {}
        }

        let next = self.transition(operation, &id)?;
        self.set_state(&id, next);
        Ok(())
    }

    fn transition(&self, operation: PowerOperation, id: &str) -> Result<RuntimeState, RuntimeError> {
        let current = self.state(id).unwrap_or(RuntimeState::Stopped);
        match (operation, &current) {
            (PowerOperation::PowerOn, RuntimeState::Stopped | RuntimeState::Started) => Ok(RuntimeState::Started),
            (PowerOperation::PowerOff, _) => Ok(RuntimeState::Stopped),
            (PowerOperation::Hibernate, RuntimeState::Started | RuntimeState::Hibernated) => {
                Ok(RuntimeState::Hibernated)
            }
            (PowerOperation::Resume, RuntimeState::Hibernated | RuntimeState::Started) => Ok(RuntimeState::Started),
            _ => Err(RuntimeError::OperationFailed(format!(
                "cannot {} {} from {:?}",
                operation, id, current
            ))),
        }
    }
}

#[async_trait::async_trait]
impl RuntimeDriver for MockRuntimeDriver {
    async fn power_on(&self, vm: &VmIdentity) -> Result<(), RuntimeError> {
        self.apply(PowerOperation::PowerOn, vm).await
    }

    async fn power_off(&self, vm: &VmIdentity) -> Result<(), RuntimeError> {
        self.apply(PowerOperation::PowerOff, vm).await
    }

    async fn hibernate(&self, vm: &VmIdentity) -> Result<(), RuntimeError> {
        self.apply(PowerOperation::Hibernate, vm).await
    }

    async fn resume(&self, vm: &VmIdentity) -> Result<(), RuntimeError> {
        self.apply(PowerOperation::Resume, vm).await
    }

    async fn query_state(&self, vm: &VmIdentity) -> Result<RuntimeState, RuntimeError> {
        let id = vm.id();
        self.calls.lock().unwrap().push(DriverCall::Query(id.clone()));
        self.simulate_latency().await;

        if let Some(error) = self.query_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.state(&id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no VM {}", id)))
    }
}
