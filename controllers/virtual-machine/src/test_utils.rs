//! Test utilities for unit testing the reconciler and workers
//!
//! Provides an in-memory [`VirtualMachineStore`] with Kubernetes-style
//! optimistic concurrency, an [`EventPublisher`] that records what it is
//! given, and helpers for building test resources.

use crate::events::EventPublisher;
use crate::reconciler::conditions::build_status;
use crate::store::{StoreError, VirtualMachineStore, VmKey};
use async_trait::async_trait;
use crds::{
    LifecycleState, PowerState, VirtualMachine, VirtualMachineSpec, VirtualMachineStatus,
    VIRTUAL_MACHINE_FINALIZER,
};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Helper to create a test VirtualMachine.
///
/// The resource has no finalizer and no resourceVersion; [`MockStore::insert`]
/// assigns one. An `observed` state comes with the status the controller
/// would have written for it.
pub fn create_test_vm(
    name: &str,
    namespace: &str,
    desired: PowerState,
    observed: Option<LifecycleState>,
) -> VirtualMachine {
    VirtualMachine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: VirtualMachineSpec {
            image: "ubuntu:24.04".to_string(),
            state: desired,
        },
        status: observed.map(|state| build_status(None, state, desired, None, Some(1))),
    }
}

/// Same as [`create_test_vm`] with the controller finalizer already set.
pub fn create_finalized_vm(
    name: &str,
    namespace: &str,
    desired: PowerState,
    observed: Option<LifecycleState>,
) -> VirtualMachine {
    let mut vm = create_test_vm(name, namespace, desired, observed);
    vm.metadata.finalizers = Some(vec![VIRTUAL_MACHINE_FINALIZER.to_string()]);
    vm
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<VmKey, VirtualMachine>,
    next_version: u64,
    /// Every accepted status write, in order
    writes: Vec<(VmKey, LifecycleState)>,
    /// Writes left to reject with a conflict
    injected_conflicts: usize,
    conflicts: usize,
    list_unavailable: bool,
}

impl StoreState {
    fn bump(&mut self, key: &VmKey) -> String {
        self.next_version += 1;
        let version = self.next_version.to_string();
        if let Some(vm) = self.objects.get_mut(key) {
            vm.metadata.resource_version = Some(version.clone());
        }
        version
    }

    /// Check that `key` exists at `resource_version`.
    fn precondition(&mut self, key: &VmKey, resource_version: &str) -> Result<(), StoreError> {
        let current = self
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?
            .metadata
            .resource_version
            .clone();

        if self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            self.conflicts += 1;
            return Err(StoreError::Conflict(key.to_string()));
        }
        if current.as_deref() != Some(resource_version) {
            self.conflicts += 1;
            return Err(StoreError::Conflict(key.to_string()));
        }
        Ok(())
    }
}

/// In-memory store for tests.
///
/// Every mutation bumps a numeric resourceVersion, writes carrying a stale
/// version are rejected with [`StoreError::Conflict`], and `get` yields to
/// the scheduler so concurrent passes interleave.
#[derive(Clone, Default)]
pub struct MockStore {
    state: Arc<Mutex<StoreState>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `vm` (replacing any previous version) and return its key.
    pub fn insert(&self, vm: VirtualMachine) -> VmKey {
        let key = VmKey::from_resource(&vm).unwrap();
        let mut state = self.state.lock().unwrap();
        state.objects.insert(key.clone(), vm);
        state.bump(&key);
        key
    }

    /// Current stored version of the object.
    pub fn object(&self, key: &VmKey) -> Option<VirtualMachine> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    /// Current `status.state` of the object.
    pub fn observed(&self, key: &VmKey) -> Option<LifecycleState> {
        self.object(key).and_then(|vm| vm.observed_state())
    }

    /// Change `spec.state` as a user would.
    pub fn set_desired(&self, key: &VmKey, desired: PowerState) {
        let mut state = self.state.lock().unwrap();
        if let Some(vm) = state.objects.get_mut(key) {
            vm.spec.state = desired;
            vm.metadata.generation = vm.metadata.generation.map(|g| g + 1);
        }
        state.bump(key);
    }

    /// Request deletion: the object stays until its finalizers are gone.
    pub fn mark_deleted(&self, key: &VmKey) {
        let mut state = self.state.lock().unwrap();
        let mut release = false;
        if let Some(vm) = state.objects.get_mut(key) {
            vm.metadata.deletion_timestamp =
                Some(serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).unwrap());
            release = vm.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        }
        if release {
            state.objects.remove(key);
        } else {
            state.bump(key);
        }
    }

    /// Reject the next `count` writes with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.state.lock().unwrap().injected_conflicts += count;
    }

    /// Make `list` fail as it does when the CRD is not installed.
    pub fn set_list_unavailable(&self) {
        self.state.lock().unwrap().list_unavailable = true;
    }

    /// Number of writes rejected with a conflict so far.
    pub fn conflicts(&self) -> usize {
        self.state.lock().unwrap().conflicts
    }

    /// Accepted status writes for `key`, in order.
    pub fn status_writes(&self, key: &VmKey) -> Vec<LifecycleState> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl VirtualMachineStore for MockStore {
    async fn get(&self, key: &VmKey) -> Result<Option<VirtualMachine>, StoreError> {
        let snapshot = self.object(key);
        tokio::task::yield_now().await;
        Ok(snapshot)
    }

    async fn list(&self) -> Result<Vec<VirtualMachine>, StoreError> {
        let state = self.state.lock().unwrap();
        if state.list_unavailable {
            return Err(StoreError::NotFound("virtualmachines.codesandbox.io".to_string()));
        }
        let mut objects: Vec<VirtualMachine> = state.objects.values().cloned().collect();
        objects.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(objects)
    }

    async fn write_status(
        &self,
        key: &VmKey,
        resource_version: &str,
        status: &VirtualMachineStatus,
    ) -> Result<String, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.precondition(key, resource_version)?;
        if let Some(vm) = state.objects.get_mut(key) {
            vm.status = Some(status.clone());
        }
        state.writes.push((key.clone(), status.state));
        Ok(state.bump(key))
    }

    async fn add_finalizer(&self, key: &VmKey, resource_version: &str) -> Result<String, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.precondition(key, resource_version)?;
        if let Some(vm) = state.objects.get_mut(key) {
            let finalizers = vm.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == VIRTUAL_MACHINE_FINALIZER) {
                finalizers.push(VIRTUAL_MACHINE_FINALIZER.to_string());
            }
        }
        Ok(state.bump(key))
    }

    async fn remove_finalizer(&self, key: &VmKey, resource_version: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.precondition(key, resource_version)?;
        let mut release = false;
        if let Some(vm) = state.objects.get_mut(key) {
            if let Some(finalizers) = vm.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != VIRTUAL_MACHINE_FINALIZER);
            }
            release = vm.metadata.deletion_timestamp.is_some()
                && vm.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        }
        if release {
            state.objects.remove(key);
        } else {
            state.bump(key);
        }
        Ok(())
    }
}

/// An event handed to [`RecordingPublisher`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub name: Option<String>,
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// Keeps every published event in memory.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Reasons of the published events, in order.
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            name: reference.name.clone(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}
