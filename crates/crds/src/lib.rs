//! VirtualMachine CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the VM lifecycle controller.

pub mod virtual_machine;

pub use virtual_machine::*;
