//! VirtualMachine Controller
//!
//! Drives the power state of `VirtualMachine` resources (`codesandbox.io/v1alpha1`)
//! towards `spec.state` by calling the VM runtime, one lifecycle transition
//! per reconciliation pass:
//! - STOPPED/HIBERNATED -> STARTED via power-on/resume
//! - STARTED/HIBERNATED -> STOPPED via power-off
//! - STARTED -> HIBERNATED via hibernate
//!
//! Progress is recorded in `status.state` before and after every runtime call.

mod backoff;
mod config;
mod controller;
mod error;
mod events;
mod metrics;
mod reconciler;
mod server;
mod store;
#[cfg(test)]
mod test_utils;
mod watcher;
mod work_queue;
mod worker;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting VirtualMachine Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Runtime URL: {}", config.runtime_url);
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Workers: {}", config.workers);
    info!("  Driver timeout: {:?}", config.driver_timeout);
    info!("  Backoff: {:?} to {:?}", config.backoff_base, config.backoff_max);
    info!("  HTTP address: {}", config.http_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
