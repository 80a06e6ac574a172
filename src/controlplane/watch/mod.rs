//! Content Watch
//!
//! After a successful sync each instance gets watchers on Deployments,
//! DaemonSets and Pods carrying its instance labels. Events are projected
//! onto the resource status by [`StatusProjector`].

pub mod projection;
pub mod watched;

pub use projection::{project_state, read_workloads, StatusProjector};
pub use watched::WatchedObject;

use crate::crd::{LABEL_INSTANCE, LABEL_INSTANCE_NAMESPACE};
use crate::manifest::bundle::InstanceRef;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Launcher
// =============================================================================

/// Starts the watchers of one instance; they stop when `token` is cancelled
pub trait WatchLauncher: Send + Sync {
    fn launch(&self, instance: InstanceRef, token: CancellationToken);
}

/// Watches the cluster through a kube client
pub struct KubeWatchLauncher {
    client: Client,
    projector: Arc<StatusProjector>,
}

impl KubeWatchLauncher {
    pub fn new(client: Client, projector: Arc<StatusProjector>) -> Self {
        Self { client, projector }
    }

    fn spawn<S>(&self, instance: InstanceRef, token: CancellationToken, stream: S)
    where
        S: Stream<Item = Result<WatchedObject, watcher::Error>> + Send + 'static,
    {
        let projector = self.projector.clone();
        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(object)) => {
                            if let Err(e) = projector.handle(&instance, object).await {
                                warn!(instance = %instance.key(), error = %e, "Status projection failed");
                            }
                        }
                        Some(Err(e)) => debug!(instance = %instance.key(), error = %e, "Watch error"),
                        None => {
                            // Stop the sibling watchers too; the next sync re-arms
                            warn!(instance = %instance.key(), "Watch stream ended");
                            token.cancel();
                            break;
                        }
                    }
                }
            }
            debug!(instance = %instance.key(), "Watcher stopped");
        });
    }
}

impl WatchLauncher for KubeWatchLauncher {
    fn launch(&self, instance: InstanceRef, token: CancellationToken) {
        let selector = format!(
            "{}={},{}={}",
            LABEL_INSTANCE, instance.name, LABEL_INSTANCE_NAMESPACE, instance.namespace
        );
        let config = || watcher::Config::default().labels(&selector);

        let deployments = watcher(Api::<Deployment>::all(self.client.clone()), config())
            .default_backoff()
            .applied_objects()
            .map(|r| r.map(WatchedObject::ControllerWorkload));
        let daemon_sets = watcher(Api::<DaemonSet>::all(self.client.clone()), config())
            .default_backoff()
            .applied_objects()
            .map(|r| r.map(WatchedObject::NodeWorkload));
        let pods = watcher(Api::<Pod>::all(self.client.clone()), config())
            .default_backoff()
            .applied_objects()
            .map(|r| r.map(WatchedObject::Pod));

        self.spawn(instance.clone(), token.clone(), deployments);
        self.spawn(instance.clone(), token.clone(), daemon_sets);
        self.spawn(instance, token, pods);
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Live content watches keyed by `namespace/name`
#[derive(Default)]
pub struct WatchRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start fresh watchers for an instance, stopping any previous ones.
    ///
    /// Returns whether a previous watch was replaced.
    pub fn arm(&self, instance: &InstanceRef, launcher: &dyn WatchLauncher) -> bool {
        let key = instance.key();
        let token = CancellationToken::new();
        let previous = self.tokens.lock().insert(key.clone(), token.clone());
        if let Some(previous) = &previous {
            previous.cancel();
        }
        launcher.launch(instance.clone(), token);
        debug!(instance = %key, replaced = previous.is_some(), "Content watch armed");
        previous.is_some()
    }

    /// Stop and forget an instance's watch; returns whether one existed
    pub fn disarm(&self, key: &str) -> bool {
        let token = self.tokens.lock().remove(key);
        match token {
            Some(token) => {
                token.cancel();
                info!(instance = %key, "Content watch stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: &str) -> bool {
        self.tokens.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every watch, on shutdown
    pub fn shutdown(&self) {
        for (_, token) in self.tokens.lock().drain() {
            token.cancel();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingLauncher;
    use super::*;

    fn instance(name: &str) -> InstanceRef {
        InstanceRef {
            name: name.into(),
            namespace: "storage".into(),
            owner: None,
        }
    }

    #[test]
    fn test_arm_replaces_previous_watch() {
        let registry = WatchRegistry::new();
        let launcher = RecordingLauncher::default();

        assert!(!registry.arm(&instance("mayastor"), &launcher));
        assert!(registry.arm(&instance("mayastor"), &launcher));
        assert!(!registry.arm(&instance("rustfs"), &launcher));
        assert_eq!(launcher.count(), 3);
        assert_eq!(registry.len(), 2);

        let launched = launcher.launched.lock();
        assert!(launched[0].1.is_cancelled());
        assert!(!launched[1].1.is_cancelled());
        assert!(!launched[2].1.is_cancelled());
    }

    #[test]
    fn test_arm_relaunches_ended_watch() {
        let registry = WatchRegistry::new();
        let launcher = RecordingLauncher::default();
        registry.arm(&instance("mayastor"), &launcher);

        // A stream that ends cancels its own token
        launcher.launched.lock()[0].1.cancel();
        registry.arm(&instance("mayastor"), &launcher);
        assert_eq!(launcher.count(), 2);
        assert!(!launcher.launched.lock()[1].1.is_cancelled());
        assert!(registry.is_armed("storage/mayastor"));
    }

    #[test]
    fn test_disarm_cancels() {
        let registry = WatchRegistry::new();
        let launcher = RecordingLauncher::default();
        registry.arm(&instance("mayastor"), &launcher);

        assert!(registry.disarm("storage/mayastor"));
        assert!(!registry.disarm("storage/mayastor"));
        assert!(launcher.launched.lock()[0].1.is_cancelled());
        assert!(!registry.is_armed("storage/mayastor"));

        // Re-arming after teardown launches fresh watchers
        assert!(!registry.arm(&instance("mayastor"), &launcher));
        assert_eq!(launcher.count(), 2);
    }

    #[test]
    fn test_shutdown_cancels_all() {
        let registry = WatchRegistry::new();
        let launcher = RecordingLauncher::default();
        registry.arm(&instance("a"), &launcher);
        registry.arm(&instance("b"), &launcher);
        registry.shutdown();
        assert!(registry.is_empty());
        assert!(launcher.launched.lock().iter().all(|(_, t)| t.is_cancelled()));
    }
}
