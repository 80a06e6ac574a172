//! Shared state of the controllers

use super::metrics::Metrics;
use super::watch::{WatchLauncher, WatchRegistry};
use crate::config::OperatorConfig;
use crate::crd::{ConnectivityClient, ContainerStorageModule};
use crate::domain::ports::{ClusterApiRef, EventSinkRef, KubeVersion, ResourceStore};
use crate::error::Result;
use crate::manifest::resolver::ManifestResolver;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;

pub const MIN_BACKOFF: Duration = Duration::from_millis(5);
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Backoff key of an object: `kind/namespace/name`
pub fn backoff_key<K: Resource<DynamicType = ()>>(object: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        object.namespace().unwrap_or_default(),
        object.name_any()
    )
}

/// Everything a reconcile pass or status handler needs
pub struct Context {
    pub cluster: ClusterApiRef,
    pub modules: Arc<dyn ResourceStore<ContainerStorageModule>>,
    pub clients: Arc<dyn ResourceStore<ConnectivityClient>>,
    pub events: EventSinkRef,
    pub resolver: ManifestResolver,
    pub config: OperatorConfig,
    pub watches: WatchRegistry,
    pub launcher: Arc<dyn WatchLauncher>,
    /// Serializes status writes of reconciles and content watches
    pub status_lock: Arc<tokio::sync::Mutex<()>>,
    pub metrics: Arc<Metrics>,
    backoff: DashMap<String, ExponentialBackoff>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: ClusterApiRef,
        modules: Arc<dyn ResourceStore<ContainerStorageModule>>,
        clients: Arc<dyn ResourceStore<ConnectivityClient>>,
        events: EventSinkRef,
        resolver: ManifestResolver,
        config: OperatorConfig,
        launcher: Arc<dyn WatchLauncher>,
        status_lock: Arc<tokio::sync::Mutex<()>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cluster,
            modules,
            clients,
            events,
            resolver,
            config,
            watches: WatchRegistry::new(),
            launcher,
            status_lock,
            metrics,
            backoff: DashMap::new(),
        }
    }

    /// Cluster version used to pick the image values file
    pub async fn kube_version(&self) -> Result<KubeVersion> {
        match self.config.kube_version {
            Some(version) => Ok(version),
            None => self.cluster.server_version().await,
        }
    }

    /// Next retry delay of a failing key
    pub fn next_backoff(&self, key: &str) -> Duration {
        let mut entry = self.backoff.entry(key.to_string()).or_insert_with(|| {
            ExponentialBackoffBuilder::new()
                .with_initial_interval(MIN_BACKOFF)
                .with_max_interval(MAX_BACKOFF)
                .with_randomization_factor(0.0)
                .with_max_elapsed_time(None)
                .build()
        });
        entry.next_backoff().unwrap_or(MAX_BACKOFF)
    }

    /// Forget the failures of a key after a successful pass
    pub fn reset_backoff(&self, key: &str) {
        self.backoff.remove(key);
    }
}
