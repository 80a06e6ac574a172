//! Controller runtime
//!
//! Wires the kube adapters into a [`Context`] and drives both reconcilers
//! with kube-runtime controllers. Owned workloads re-trigger their owner.

use super::client_reconciler;
use super::context::{backoff_key, Context};
use super::metrics::Metrics;
use super::reconciler;
use super::watch::projection::StatusProjector;
use super::watch::KubeWatchLauncher;
use crate::adapters::{KubeCluster, KubeEvents, KubeStore};
use crate::config::OperatorConfig;
use crate::crd::{ConnectivityClient, ContainerStorageModule};
use crate::domain::ports::{ClusterApiRef, EventSinkRef, ResourceStore};
use crate::error::{Error, ErrorAction};
use crate::manifest::resolver::ManifestResolver;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Build the shared context over a live cluster
pub fn build_context(
    client: Client,
    config: OperatorConfig,
    resolver: ManifestResolver,
    metrics: Arc<Metrics>,
) -> Arc<Context> {
    let cluster: ClusterApiRef = Arc::new(KubeCluster::new(client.clone()));
    let modules: Arc<dyn ResourceStore<ContainerStorageModule>> =
        Arc::new(KubeStore::<ContainerStorageModule>::new(client.clone()));
    let clients: Arc<dyn ResourceStore<ConnectivityClient>> =
        Arc::new(KubeStore::<ConnectivityClient>::new(client.clone()));
    let events: EventSinkRef = Arc::new(KubeEvents::new(
        client.clone(),
        std::env::var("POD_NAME").ok(),
    ));

    let status_lock = Arc::new(Mutex::new(()));
    let projector = Arc::new(StatusProjector::new(
        cluster.clone(),
        modules.clone(),
        events.clone(),
        status_lock.clone(),
        metrics.clone(),
    ));
    let launcher = Arc::new(KubeWatchLauncher::new(client, projector));

    Arc::new(Context::new(
        cluster,
        modules,
        clients,
        events,
        resolver,
        config,
        launcher,
        status_lock,
        metrics,
    ))
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Requeue decision for a failed pass
pub fn error_policy<K>(object: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let key = backoff_key(object.as_ref());
    match error.action() {
        ErrorAction::NoRequeue => Action::await_change(),
        ErrorAction::RequeueWithBackoff => {
            let delay = ctx.next_backoff(&key);
            debug!(%key, ?delay, "Backing off");
            Action::requeue(delay)
        }
    }
}

/// Run both controllers until a shutdown signal arrives
pub async fn run(client: Client, ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let ns = namespace.as_deref();
    let config = controller::Config::default().concurrency(ctx.config.max_concurrent_reconciles);

    info!(
        namespace = ns.unwrap_or("*"),
        concurrency = ctx.config.max_concurrent_reconciles,
        "Starting controllers"
    );

    let modules = Controller::new(
        scoped_api::<ContainerStorageModule>(&client, ns),
        watcher::Config::default(),
    )
    .owns(scoped_api::<Deployment>(&client, ns), watcher::Config::default())
    .owns(scoped_api::<DaemonSet>(&client, ns), watcher::Config::default())
    .with_config(config.clone())
    .shutdown_on_signal()
    .run(reconciler::reconcile, error_policy::<ContainerStorageModule>, ctx.clone())
    .for_each(|result| async move {
        match result {
            Ok((object, action)) => debug!(%object, ?action, "Reconciled storage module"),
            Err(e) => error!(error = %e, "Storage module reconcile failed"),
        }
    });

    let clients = Controller::new(
        scoped_api::<ConnectivityClient>(&client, ns),
        watcher::Config::default(),
    )
    .owns(scoped_api::<StatefulSet>(&client, ns), watcher::Config::default())
    .with_config(config)
    .shutdown_on_signal()
    .run(client_reconciler::reconcile, error_policy::<ConnectivityClient>, ctx.clone())
    .for_each(|result| async move {
        match result {
            Ok((object, action)) => debug!(%object, ?action, "Reconciled connectivity client"),
            Err(e) => error!(error = %e, "Connectivity client reconcile failed"),
        }
    });

    tokio::join!(modules, clients);

    ctx.watches.shutdown();
    info!("Controllers stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::context::testing::test_context;
    use crate::controlplane::drivers::testing::csm;
    use crate::crd::{ClientSpec, ClientType, ConnectivityClientSpec, DriverType};

    #[test]
    fn test_validation_errors_wait_for_change() {
        let t = test_context();
        let object = Arc::new(csm("mayastor", DriverType::Mayastor));
        let action = error_policy(object, &Error::InvalidConfig("bad".into()), t.ctx.clone());
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn test_transient_errors_back_off_per_key() {
        let t = test_context();
        let mayastor = Arc::new(csm("mayastor", DriverType::Mayastor));
        let rustfs = Arc::new(csm("rustfs", DriverType::RustFS));
        let err = Error::Internal("apply failed".into());

        let first = error_policy(mayastor.clone(), &err, t.ctx.clone());
        assert_ne!(first, Action::await_change());
        let second = error_policy(mayastor, &err, t.ctx.clone());
        assert_ne!(second, first);
        // A fresh key starts from the minimum again
        assert_eq!(error_policy(rustfs, &err, t.ctx.clone()), first);
    }

    #[test]
    fn test_backoff_is_kept_per_kind() {
        let t = test_context();
        let module = Arc::new(csm("edge", DriverType::Mayastor));
        let mut client = ConnectivityClient::new(
            "edge",
            ConnectivityClientSpec {
                client: ClientSpec {
                    client_type: ClientType::ConnectivityAgent,
                    config_version: "v1.1.0".into(),
                    force_removal: false,
                    common: Default::default(),
                    side_cars: vec![],
                },
            },
        );
        client.metadata.namespace = Some("storage".into());
        let client = Arc::new(client);
        assert_ne!(backoff_key(module.as_ref()), backoff_key(client.as_ref()));

        let err = Error::Internal("apply failed".into());
        let first = error_policy(module.clone(), &err, t.ctx.clone());
        error_policy(module.clone(), &err, t.ctx.clone());

        // The client's failures neither share nor reset the module's delay
        assert_eq!(error_policy(client.clone(), &err, t.ctx.clone()), first);
        t.ctx.reset_backoff(&backoff_key(client.as_ref()));
        assert_ne!(error_policy(module, &err, t.ctx.clone()), first);
    }
}
