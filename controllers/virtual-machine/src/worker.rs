//! Reconciliation workers.
//!
//! Each worker pulls keys from the shared [`WorkQueue`], runs one pass and
//! turns the outcome into the key's next schedule. The queue guarantees no
//! two workers hold the same key.

use crate::error::{ControllerError, RetryPolicy};
use crate::metrics::Metrics;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::store::VmKey;
use crate::work_queue::WorkQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub struct Worker {
    id: usize,
    queue: Arc<WorkQueue<VmKey>>,
    reconciler: Arc<Reconciler>,
    metrics: Arc<Metrics>,
    /// Delay before a converged resource is checked again
    resync_interval: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<WorkQueue<VmKey>>,
        reconciler: Arc<Reconciler>,
        metrics: Arc<Metrics>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            reconciler,
            metrics,
            resync_interval,
        }
    }

    /// Process keys until the queue shuts down.
    pub async fn run(self) {
        debug!("Worker {} started", self.id);
        while let Some(key) = self.queue.dequeue().await {
            self.metrics.set_queue_depth(self.queue.len());
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!("Worker {} stopped", self.id);
    }

    async fn process(&self, key: &VmKey) {
        let span = info_span!("reconcile", vm = %key, pass_id = %Uuid::new_v4());
        let started = Instant::now();
        let result = self.reconciler.reconcile(key).instrument(span.clone()).await;
        let elapsed = started.elapsed();

        span.in_scope(|| match result {
            Ok(outcome) => {
                self.metrics.pass_completed(outcome.as_str(), elapsed);
                self.schedule_after(key, outcome);
            }
            Err(e) => {
                self.metrics.pass_failed(e.kind(), elapsed);
                self.schedule_retry(key, &e);
            }
        });
    }

    fn schedule_after(&self, key: &VmKey, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Converged => {
                self.queue.forget(key);
                self.queue.requeue_after(key.clone(), self.resync_interval);
            }
            ReconcileOutcome::Requeue => {
                self.queue.forget(key);
                self.queue.enqueue(key.clone());
            }
            ReconcileOutcome::Poll => {
                let delay = self.queue.requeue_with_backoff(key.clone());
                debug!("{} still in progress, checking again in {:?}", key, delay);
            }
            ReconcileOutcome::Gone => {
                self.queue.forget(key);
                info!("{} finished", key);
            }
        }
    }

    fn schedule_retry(&self, key: &VmKey, err: &ControllerError) {
        match err.retry_policy() {
            RetryPolicy::Immediate => {
                debug!("{} changed during the pass, retrying: {}", key, err);
                self.queue.enqueue(key.clone());
            }
            RetryPolicy::Backoff => {
                let delay = self.queue.requeue_with_backoff(key.clone());
                warn!("Reconciliation of {} failed, retrying in {:?}: {}", key, delay, err);
            }
            RetryPolicy::MaxBackoff => {
                let delay = self.queue.requeue_with_max_backoff(key.clone());
                error!("Reconciliation of {} failed, retrying in {:?}: {}", key, delay, err);
            }
        }
    }
}
