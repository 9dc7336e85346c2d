//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the store, the
//! runtime driver, the work queue, the watcher, the workers and the
//! health/metrics server together.

use crate::backoff::ExponentialBackoff;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::KubeEventPublisher;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::server::{self, ServerState};
use crate::store::{KubeStore, VmKey};
use crate::watcher::Watcher;
use crate::work_queue::WorkQueue;
use crate::worker::Worker;
use crds::VirtualMachine;
use kube::{Api, Client};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vm_runtime_client::HttpRuntimeDriver;

/// Main controller for VirtualMachine power management.
pub struct Controller {
    config: ControllerConfig,
    api: Api<VirtualMachine>,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue<VmKey>>,
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing VirtualMachine Controller");

        let kube_client = Client::try_default().await?;

        let driver = HttpRuntimeDriver::new(config.runtime_url.clone(), config.runtime_token.clone())?;
        info!("Validating runtime connectivity...");
        match driver.validate_connectivity().await {
            Ok(()) => info!("Runtime reachable at {}", config.runtime_url),
            // Passes fail and back off until the runtime comes up
            Err(e) => warn!("Runtime at {} is not reachable yet: {}", config.runtime_url, e),
        }

        let metrics = Arc::new(Metrics::new()?);
        let store = KubeStore::new(kube_client.clone(), config.namespace.clone());
        let events = KubeEventPublisher::new(kube_client.clone());
        let reconciler = Arc::new(Reconciler::new(
            store,
            driver,
            events,
            config.driver_timeout,
            metrics.clone(),
        ));

        let api: Api<VirtualMachine> = match &config.namespace {
            Some(ns) => Api::namespaced(kube_client, ns),
            None => Api::all(kube_client),
        };
        let queue = Arc::new(WorkQueue::new(ExponentialBackoff::new(
            config.backoff_base,
            2,
            config.backoff_max,
        )));

        Ok(Self {
            config,
            api,
            reconciler,
            queue,
            metrics,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runs the controller until SIGINT/SIGTERM or a fatal watch failure.
    pub async fn run(self) -> Result<(), ControllerError> {
        // Nothing survives a restart: every resource gets a fresh pass
        info!("Performing startup reconciliation...");
        enqueue_existing(&self.reconciler, &self.queue).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = {
            let state = ServerState {
                ready: self.ready.clone(),
                metrics: self.metrics.clone(),
            };
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(server::serve(self.config.http_addr, state, async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            }))
        };

        let mut watcher_task = {
            let watcher = Watcher::new(self.api.clone(), self.queue.clone(), self.ready.clone());
            tokio::spawn(async move { watcher.watch().await })
        };

        info!("Starting {} reconciliation worker(s)", self.config.workers);
        let workers: Vec<JoinHandle<()>> = (0..self.config.workers)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    self.queue.clone(),
                    self.reconciler.clone(),
                    self.metrics.clone(),
                    self.config.resync_interval,
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let result = tokio::select! {
            () = shutdown_signal() => {
                info!("Shutdown signal received");
                Ok(())
            }
            joined = &mut watcher_task => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ControllerError::Watch(format!("watcher task failed: {}", e))),
            },
        };

        // Workers finish their current pass and exit
        self.queue.shutdown();
        watcher_task.abort();
        let _ = shutdown_tx.send(true);

        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
            }
        }
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Health server failed: {}", e),
            Err(e) => error!("Health server task failed: {}", e),
        }

        info!("VirtualMachine Controller stopped");
        result
    }
}

/// Queue every existing VirtualMachine.
///
/// Failing to list is fatal: without the CRD the watcher would retry forever.
async fn enqueue_existing(reconciler: &Reconciler, queue: &WorkQueue<VmKey>) -> Result<usize, ControllerError> {
    let keys = reconciler.startup_reconciliation().await.inspect_err(|e| {
        error!("VirtualMachine resources are not queryable: {}. Is the CRD installed?", e);
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
    })?;
    let count = keys.len();
    for key in keys {
        queue.enqueue(key);
    }
    Ok(count)
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
