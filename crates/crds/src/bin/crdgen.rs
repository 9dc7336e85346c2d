//! Prints the VirtualMachine CRD as YAML.
//!
//! Installation: `cargo run --bin crdgen | kubectl apply -f -`

use anyhow::Context;
use crds::VirtualMachine;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&VirtualMachine::crd())
        .context("failed to serialize VirtualMachine CRD")?;
    print!("{yaml}");
    Ok(())
}
