//! Resource store access.
//!
//! The reconciler reads and writes VirtualMachine objects through the
//! [`VirtualMachineStore`] trait so it can run against the Kubernetes API
//! in production and an in-memory store in tests.

use async_trait::async_trait;
use crds::{VirtualMachine, VirtualMachineStatus, VIRTUAL_MACHINE_FINALIZER};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Identity of a VirtualMachine in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmKey {
    pub namespace: String,
    pub name: String,
}

impl VmKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a stored object. Objects without a name cannot be keyed.
    pub fn from_resource(vm: &VirtualMachine) -> Option<Self> {
        let name = vm.metadata.name.clone()?;
        let namespace = vm.namespace().unwrap_or_else(|| "default".to_string());
        Some(Self { namespace, name })
    }
}

impl fmt::Display for VmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Errors returned by a [`VirtualMachineStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The version token was stale
    #[error("conflicting write to {0}")]
    Conflict(String),

    /// The object no longer exists
    #[error("{0} not found")]
    NotFound(String),

    /// The object lacks metadata the store needs
    #[error("{0} has no {1}")]
    MissingMetadata(String, &'static str),

    /// Any other Kubernetes API failure
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),
}

impl StoreError {
    fn from_kube(key: &VmKey, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref response) if response.code == 409 => StoreError::Conflict(key.to_string()),
            kube::Error::Api(ref response) if response.code == 404 => StoreError::NotFound(key.to_string()),
            other => StoreError::Kube(other),
        }
    }
}

/// Access to VirtualMachine objects with optimistic concurrency.
#[async_trait]
pub trait VirtualMachineStore: Send + Sync {
    /// Latest version of the object, `None` if it does not exist.
    async fn get(&self, key: &VmKey) -> Result<Option<VirtualMachine>, StoreError>;

    /// Every VirtualMachine visible to the controller.
    async fn list(&self) -> Result<Vec<VirtualMachine>, StoreError>;

    /// Replace the status if the object is still at `resource_version`.
    ///
    /// Returns the new version token, or [`StoreError::Conflict`] when the
    /// object changed since it was read.
    async fn write_status(
        &self,
        key: &VmKey,
        resource_version: &str,
        status: &VirtualMachineStatus,
    ) -> Result<String, StoreError>;

    /// Add the controller finalizer at `resource_version`.
    async fn add_finalizer(&self, key: &VmKey, resource_version: &str) -> Result<String, StoreError>;

    /// Remove the controller finalizer at `resource_version`.
    async fn remove_finalizer(&self, key: &VmKey, resource_version: &str) -> Result<(), StoreError>;
}

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
    /// Namespace restriction for `list` (all namespaces when `None`)
    namespace: Option<String>,
}

impl KubeStore {
    pub fn new(client: kube::Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api(&self, namespace: &str) -> Api<VirtualMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn list_api(&self) -> Api<VirtualMachine> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn patch_finalizers(
        &self,
        key: &VmKey,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<VirtualMachine, StoreError> {
        // Carrying resourceVersion in a merge patch makes it a precondition
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            }
        });
        self.api(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(key, e))
    }
}

#[async_trait]
impl VirtualMachineStore for KubeStore {
    async fn get(&self, key: &VmKey) -> Result<Option<VirtualMachine>, StoreError> {
        self.api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(key, e))
    }

    async fn list(&self) -> Result<Vec<VirtualMachine>, StoreError> {
        let list = self
            .list_api()
            .list(&ListParams::default())
            .await
            .map_err(StoreError::Kube)?;
        Ok(list.items)
    }

    async fn write_status(
        &self,
        key: &VmKey,
        resource_version: &str,
        status: &VirtualMachineStatus,
    ) -> Result<String, StoreError> {
        debug!("Writing status {} for {} at version {}", status.state, key, resource_version);

        // conditions are replaced wholesale by the merge patch, which is
        // what we want: the reconciler always writes the full status.
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        let updated = self
            .api(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(key, e))?;

        updated
            .resource_version()
            .ok_or_else(|| StoreError::MissingMetadata(key.to_string(), "resourceVersion"))
    }

    async fn add_finalizer(&self, key: &VmKey, resource_version: &str) -> Result<String, StoreError> {
        let current = self
            .get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let mut finalizers = current.finalizers().to_vec();
        if !finalizers.iter().any(|f| f == VIRTUAL_MACHINE_FINALIZER) {
            finalizers.push(VIRTUAL_MACHINE_FINALIZER.to_string());
        }

        let updated = self.patch_finalizers(key, resource_version, finalizers).await?;
        updated
            .resource_version()
            .ok_or_else(|| StoreError::MissingMetadata(key.to_string(), "resourceVersion"))
    }

    async fn remove_finalizer(&self, key: &VmKey, resource_version: &str) -> Result<(), StoreError> {
        let Some(current) = self.get(key).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = current
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != VIRTUAL_MACHINE_FINALIZER)
            .cloned()
            .collect();

        match self.patch_finalizers(key, resource_version, finalizers).await {
            // The object may disappear as soon as the last finalizer goes
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
