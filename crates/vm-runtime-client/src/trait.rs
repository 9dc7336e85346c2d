//! RuntimeDriver trait
//!
//! Abstracts the VM runtime so the controller can be tested against an
//! in-memory implementation.

use crate::error::RuntimeError;
use crate::models::{PowerOperation, RuntimeState, VmIdentity};

/// Power operations against a concrete VM.
///
/// Every call may be long-running and may fail or time out, leaving the VM
/// in an indeterminate state. Callers re-check with `query_state` before
/// retrying an operation.
#[async_trait::async_trait]
pub trait RuntimeDriver: Send + Sync {
    async fn power_on(&self, vm: &VmIdentity) -> Result<(), RuntimeError>;
    async fn power_off(&self, vm: &VmIdentity) -> Result<(), RuntimeError>;
    async fn hibernate(&self, vm: &VmIdentity) -> Result<(), RuntimeError>;
    async fn resume(&self, vm: &VmIdentity) -> Result<(), RuntimeError>;
    async fn query_state(&self, vm: &VmIdentity) -> Result<RuntimeState, RuntimeError>;

    /// Dispatch a power operation
    async fn execute(&self, operation: PowerOperation, vm: &VmIdentity) -> Result<(), RuntimeError> {
        match operation {
            PowerOperation::PowerOn => self.power_on(vm).await,
            PowerOperation::PowerOff => self.power_off(vm).await,
            PowerOperation::Hibernate => self.hibernate(vm).await,
            PowerOperation::Resume => self.resume(vm).await,
        }
    }
}
