//! Kubernetes resource watcher.
//!
//! Turns VirtualMachine watch events into work queue entries. The watcher
//! never reconciles itself: workers always re-read the latest version, so
//! the event payload only identifies the resource.

use crate::error::ControllerError;
use crate::store::VmKey;
use crate::work_queue::WorkQueue;
use crds::VirtualMachine;
use futures::StreamExt;
use kube::Api;
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Watches VirtualMachine resources for changes.
pub struct Watcher {
    api: Api<VirtualMachine>,
    queue: Arc<WorkQueue<VmKey>>,
    ready: Arc<AtomicBool>,
}

impl Watcher {
    pub fn new(api: Api<VirtualMachine>, queue: Arc<WorkQueue<VmKey>>, ready: Arc<AtomicBool>) -> Self {
        Self { api, queue, ready }
    }

    /// Watch until the stream ends or the queue shuts down.
    ///
    /// Stream errors are retried with kube-runtime's default backoff.
    pub async fn watch(&self) -> Result<(), ControllerError> {
        info!("Starting VirtualMachine watcher");

        let mut stream = Box::pin(watcher(self.api.clone(), watcher::Config::default()).default_backoff());

        while let Some(result) = stream.next().await {
            if self.queue.is_shutting_down() {
                break;
            }
            match result {
                Ok(event) => handle_event(event, &self.queue, &self.ready),
                Err(e) => warn!("VirtualMachine watch error (retrying): {}", e),
            }
        }

        if self.queue.is_shutting_down() {
            info!("VirtualMachine watcher stopped");
            Ok(())
        } else {
            Err(ControllerError::Watch("VirtualMachine watch stream ended".to_string()))
        }
    }
}

/// Queue the resource an event refers to.
fn handle_event(event: watcher::Event<VirtualMachine>, queue: &WorkQueue<VmKey>, ready: &AtomicBool) {
    match event {
        watcher::Event::Apply(vm) | watcher::Event::InitApply(vm) => {
            if let Some(key) = VmKey::from_resource(&vm) {
                debug!("VirtualMachine changed: {}", key);
                queue.enqueue(key);
            }
        }
        watcher::Event::Delete(vm) => {
            if let Some(key) = VmKey::from_resource(&vm) {
                debug!("VirtualMachine deleted: {}", key);
                queue.enqueue(key);
            }
        }
        watcher::Event::Init => {
            debug!("VirtualMachine watch (re)started");
        }
        watcher::Event::InitDone => {
            if !ready.swap(true, Ordering::SeqCst) {
                info!("VirtualMachine watcher initialization complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::test_utils::create_test_vm;
    use crds::PowerState;

    fn queue() -> WorkQueue<VmKey> {
        WorkQueue::new(ExponentialBackoff::default())
    }

    #[tokio::test]
    async fn test_apply_and_delete_enqueue_the_resource() {
        let queue = queue();
        let ready = AtomicBool::new(false);
        let vm = create_test_vm("vm-1", "team-a", PowerState::Started, None);

        handle_event(watcher::Event::Apply(vm.clone()), &queue, &ready);
        handle_event(watcher::Event::InitApply(vm.clone()), &queue, &ready);
        assert_eq!(queue.len(), 1);

        let key = queue.dequeue().await.unwrap();
        assert_eq!(key, VmKey::new("team-a", "vm-1"));
        queue.done(&key);

        handle_event(watcher::Event::Delete(vm), &queue, &ready);
        assert_eq!(queue.len(), 1);
        assert!(!ready.load(Ordering::SeqCst));
    }

    #[test]
    fn test_init_done_marks_ready() {
        let queue = queue();
        let ready = AtomicBool::new(false);

        handle_event(watcher::Event::Init, &queue, &ready);
        assert!(!ready.load(Ordering::SeqCst));

        handle_event(watcher::Event::InitDone, &queue, &ready);
        assert!(ready.load(Ordering::SeqCst));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unnamed_resource_is_ignored() {
        let queue = queue();
        let ready = AtomicBool::new(false);
        let mut vm = create_test_vm("vm-1", "default", PowerState::Stopped, None);
        vm.metadata.name = None;

        handle_event(watcher::Event::Apply(vm), &queue, &ready);
        assert!(queue.is_empty());
    }
}
