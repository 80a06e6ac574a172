//! ConnectivityClient Reconciler
//!
//! Same pass shape as the storage module reconciler without modules: the
//! client bundle is its RBAC plus one StatefulSet. Status is refreshed from
//! the StatefulSet on every pass; changes to it re-trigger the controller
//! through its owner reference.

use super::context::{backoff_key, Context};
use super::sync::{ExtensionFailures, Synchronizer};
use super::upgrade::{UpgradeTarget, UpgradeValidator};
use super::watch::projection::project_state;
use super::watch::watched::stateful_set_counts;
use crate::crd::{
    ConnectivityClient, ConnectivityClientStatus, StatusState, ANNOTATION_CONFIG_VERSION,
    ANNOTATION_OPERATOR_VERSION, CLIENT_FINALIZER,
};
use crate::domain::objects::{ManagedObject, ObjectKey, ObjectKind};
use crate::domain::ports::{EventReason, ResourceEvent};
use crate::error::{Error, Result};
use crate::manifest::bundle::{apply_container_override_to, apply_sidecar_overrides, InstanceRef};
use crate::manifest::patch::stateful_set_pod_spec;
use crate::manifest::template::RenderContext;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const KIND: &str = "ConnectivityClient";

/// Container the common overrides land on
pub const AGENT_CONTAINER: &str = "agent";

/// Controller entry point
pub async fn reconcile(client: Arc<ConnectivityClient>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let namespace = client.namespace().unwrap_or_default();
    let name = client.name_any();

    let result = ClientReconciler::new(ctx.clone())
        .reconcile(&namespace, &name)
        .await;

    ctx.metrics
        .reconciled(KIND, started.elapsed(), result.as_ref().err());
    if result.is_ok() {
        ctx.reset_backoff(&backoff_key(client.as_ref()));
    }
    result
}

/// StatefulSet of a client instance
pub fn agent_key(instance: &InstanceRef) -> ObjectKey {
    ObjectKey::namespaced(
        ObjectKind::StatefulSet,
        &instance.namespace,
        format!("{}-agent", instance.name),
    )
}

pub struct ClientReconciler {
    ctx: Arc<Context>,
}

impl ClientReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let client = match self.ctx.clients.get(namespace, name).await {
            Ok(Some(client)) => client,
            Ok(None) => return Ok(Action::await_change()),
            Err(e) => {
                warn!(error = %e, "Failed to fetch resource");
                return Ok(Action::await_change());
            }
        };

        if client.meta().deletion_timestamp.is_some() {
            return self.remove(&client).await;
        }

        if let Err(e) = self.precheck(&client) {
            return if e.is_validation() {
                Ok(self.reject(&client, &e).await)
            } else {
                Err(e)
            };
        }

        match self.install(&client).await {
            Ok(action) => Ok(action),
            Err(e) => {
                warn!(error = %e, "Sync failed");
                let message = e.to_string();
                self.update_status(&client, |status| status.message = Some(message.clone()))
                    .await;
                self.publish(&client, ResourceEvent::warning(EventReason::Updated, message))
                    .await;
                Err(e)
            }
        }
    }

    fn precheck(&self, client: &ConnectivityClient) -> Result<()> {
        let spec = &client.spec.client;
        let validator = UpgradeValidator::new(&self.ctx.resolver);
        if !validator.client_supported(spec.client_type, &spec.config_version) {
            return Err(Error::InvalidConfig(format!(
                "{} {} is not a supported client version",
                spec.client_type, spec.config_version
            )));
        }
        validator.check(
            UpgradeTarget::Client(spec.client_type),
            client.applied_config_version(),
            &spec.config_version,
        )
    }

    async fn install(&self, client: &ConnectivityClient) -> Result<Action> {
        let instance = InstanceRef::from_resource(client);
        let installing = !client.has_finalizer();

        if installing {
            let mut finalizers = client.finalizers().to_vec();
            finalizers.push(CLIENT_FINALIZER.to_string());
            self.ctx
                .clients
                .set_finalizers(&instance.namespace, &instance.name, finalizers)
                .await?;
        }

        let upgrading = client
            .applied_config_version()
            .is_some_and(|v| v != client.spec.client.config_version);
        self.annotate_versions(client).await?;

        let target = match client.state() {
            StatusState::NoState => StatusState::Creating,
            _ if installing => StatusState::Creating,
            StatusState::Failed | StatusState::InvalidConfig => StatusState::Updating,
            _ if upgrading => StatusState::Updating,
            current => current,
        };
        self.update_status(client, |status| {
            status.state = status.state.advance(target);
            status.message = None;
        })
        .await;

        let objects = self.compose(client).await?;
        let report = Synchronizer::new(self.ctx.cluster.as_ref(), &instance)
            .apply_all(objects)
            .await?;
        info!(
            instance = %instance.key(),
            created = report.created,
            updated = report.updated,
            "Synced client"
        );

        match self.ctx.cluster.get_object(&agent_key(&instance)).await {
            Ok(Some(ManagedObject::StatefulSet(agent))) => {
                let counts = stateful_set_counts(&agent);
                self.update_status(client, |status| {
                    status.client_status = counts;
                    status.state = project_state(status.state, counts.is_healthy());
                })
                .await;
            }
            Ok(_) => warn!("Agent StatefulSet missing after sync"),
            Err(e) => warn!(error = %e, "Failed to read agent StatefulSet"),
        }

        self.publish(
            client,
            ResourceEvent::normal(EventReason::Completed, format!("Synced {} objects", report.changed())),
        )
        .await;
        Ok(Action::await_change())
    }

    /// Client RBAC and StatefulSet with the resource's overrides
    async fn compose(&self, client: &ConnectivityClient) -> Result<Vec<ManagedObject>> {
        let spec = &client.spec.client;
        let mut render = RenderContext::new(client.name_any(), client.namespace().unwrap_or_default())
            .with_config_version(spec.config_version.clone());
        render.images = self.ctx.resolver.images(self.ctx.kube_version().await?)?;

        let mut workload = self.ctx.resolver.resolve_client(spec.client_type, &render)?;
        let pod = stateful_set_pod_spec(&mut workload.workload);
        apply_container_override_to(pod, AGENT_CONTAINER, &spec.common);
        apply_sidecar_overrides(pod, &spec.side_cars);

        let mut objects = workload.rbac.ordered();
        objects.push(ManagedObject::StatefulSet(workload.workload));
        Ok(objects)
    }

    async fn reject(&self, client: &ConnectivityClient, error: &Error) -> Action {
        warn!(name = %client.name_any(), error = %error, "Invalid configuration");
        let message = error.to_string();
        self.update_status(client, |status| {
            status.state = StatusState::InvalidConfig;
            status.message = Some(message.clone());
        })
        .await;
        self.publish(client, ResourceEvent::warning(EventReason::Updated, message))
            .await;
        Action::await_change()
    }

    #[instrument(skip_all, fields(name = %client.name_any()))]
    async fn remove(&self, client: &ConnectivityClient) -> Result<Action> {
        if !client.has_finalizer() {
            return Ok(Action::await_change());
        }
        let instance = InstanceRef::from_resource(client);

        if client.spec.client.force_removal {
            // Render the version the cluster actually holds
            let mut applied = client.clone();
            if let Some(version) = client.applied_config_version() {
                applied.spec.client.config_version = version.to_string();
            }
            let objects = self.compose(&applied).await?;
            let removed = Synchronizer::new(self.ctx.cluster.as_ref(), &instance)
                .remove_all(objects, ExtensionFailures::Fail)
                .await?;
            info!(removed, "Removed client objects");
        }

        self.publish(client, ResourceEvent::normal(EventReason::Deleted, "Released client objects"))
            .await;
        let finalizers = client
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != CLIENT_FINALIZER)
            .cloned()
            .collect();
        self.ctx
            .clients
            .set_finalizers(&instance.namespace, &instance.name, finalizers)
            .await?;
        Ok(Action::await_change())
    }

    async fn annotate_versions(&self, client: &ConnectivityClient) -> Result<()> {
        let mut annotations = BTreeMap::new();
        let version = &client.spec.client.config_version;
        if client.applied_config_version() != Some(version.as_str()) {
            annotations.insert(ANNOTATION_CONFIG_VERSION.to_string(), version.clone());
        }
        let operator = &self.ctx.config.operator_version;
        if client.annotations().get(ANNOTATION_OPERATOR_VERSION) != Some(operator) {
            annotations.insert(ANNOTATION_OPERATOR_VERSION.to_string(), operator.clone());
        }
        if annotations.is_empty() {
            return Ok(());
        }
        self.ctx
            .clients
            .merge_annotations(
                &client.namespace().unwrap_or_default(),
                &client.name_any(),
                annotations,
            )
            .await
    }

    async fn update_status(
        &self,
        client: &ConnectivityClient,
        update: impl FnOnce(&mut ConnectivityClientStatus) + Send,
    ) {
        let namespace = client.namespace().unwrap_or_default();
        let name = client.name_any();

        let _guard = self.ctx.status_lock.lock().await;
        let current = match self.ctx.clients.get(&namespace, &name).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to refetch resource for status");
                return;
            }
        };

        let previous = current.status.unwrap_or_default();
        let mut status = previous.clone();
        update(&mut status);
        status.last_updated = previous.last_updated;
        if status == previous {
            return;
        }
        status.last_updated = Some(Utc::now());

        match self.ctx.clients.set_status(&namespace, &name, &status).await {
            Ok(()) => debug!(state = %status.state, "Status updated"),
            Err(e) => warn!(error = %e, "Failed to update status"),
        }
    }

    async fn publish(&self, client: &ConnectivityClient, event: ResourceEvent) {
        self.ctx.events.publish(&client.object_ref(&()), event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::context::testing::{test_context, TestContext};
    use crate::crd::{ClientSpec, ClientType, ConnectivityClientSpec, ContainerOverride, EnvVarSpec};
    use crate::manifest::patch::{container_mut, env_value};
    use serde_json::json;

    fn setup(version: &str, force_removal: bool) -> TestContext {
        let t = test_context();
        let mut client = ConnectivityClient::new(
            "edge",
            ConnectivityClientSpec {
                client: ClientSpec {
                    client_type: ClientType::ConnectivityAgent,
                    config_version: version.into(),
                    force_removal,
                    common: ContainerOverride {
                        envs: vec![EnvVarSpec { name: "AGENT_LOG_LEVEL".into(), value: "debug".into() }],
                        ..Default::default()
                    },
                    side_cars: vec![],
                },
            },
        );
        client.metadata.namespace = Some("storage".into());
        client.metadata.uid = Some("uid-edge".into());
        t.clients.insert(client);
        t
    }

    async fn pass(t: &TestContext) -> Result<Action> {
        ClientReconciler::new(t.ctx.clone()).reconcile("storage", "edge").await
    }

    fn current(t: &TestContext) -> ConnectivityClient {
        t.clients.current("storage", "edge").unwrap()
    }

    fn instance(t: &TestContext) -> InstanceRef {
        InstanceRef::from_resource(&current(t))
    }

    #[tokio::test]
    async fn test_install_client() {
        let t = setup("v1.1.0", false);
        pass(&t).await.unwrap();

        assert_eq!(t.cluster.len(), 4);
        assert_eq!(t.cluster.count_of(&ObjectKind::StatefulSet), 1);
        assert_eq!(t.cluster.count_of(&ObjectKind::RoleBinding), 1);

        let resource = current(&t);
        assert!(resource.has_finalizer());
        assert_eq!(resource.applied_config_version(), Some("v1.1.0"));
        assert_eq!(resource.state(), StatusState::Creating);

        let mut stored: k8s_openapi::api::apps::v1::StatefulSet =
            serde_json::from_value(t.cluster.get_json(&agent_key(&instance(&t))).unwrap()).unwrap();
        let agent = container_mut(stateful_set_pod_spec(&mut stored), AGENT_CONTAINER).unwrap();
        assert_eq!(env_value(agent, "AGENT_LOG_LEVEL"), Some("debug"));

        t.cluster.reset_counters();
        pass(&t).await.unwrap();
        assert_eq!(t.cluster.writes(), 0);
    }

    #[tokio::test]
    async fn test_ready_agent_reaches_running() {
        let t = setup("v1.1.0", false);
        pass(&t).await.unwrap();

        t.cluster.set_status(
            &agent_key(&instance(&t)),
            json!({ "replicas": 1, "availableReplicas": 1, "readyReplicas": 1 }),
        );
        pass(&t).await.unwrap();
        let status = current(&t).status.unwrap();
        assert_eq!(status.state, StatusState::Running);
        assert_eq!(status.client_status.available, 1);
    }

    #[tokio::test]
    async fn test_unknown_version_is_invalid() {
        let t = setup("v3.0.0", false);
        assert_eq!(pass(&t).await.unwrap(), Action::await_change());
        let resource = current(&t);
        assert_eq!(resource.state(), StatusState::InvalidConfig);
        assert!(!resource.has_finalizer());
        assert_eq!(t.cluster.len(), 0);
    }

    #[tokio::test]
    async fn test_upgrade_guard() {
        let t = setup("v1.1.0", false);
        let mut resource = current(&t);
        resource
            .annotations_mut()
            .insert(ANNOTATION_CONFIG_VERSION.into(), "v0.8.0".into());
        t.clients.insert(resource);

        pass(&t).await.unwrap();
        assert_eq!(current(&t).state(), StatusState::InvalidConfig);

        let mut resource = current(&t);
        resource
            .annotations_mut()
            .insert(ANNOTATION_CONFIG_VERSION.into(), "v1.0.0".into());
        t.clients.insert(resource);
        pass(&t).await.unwrap();
        let resource = current(&t);
        assert_eq!(resource.state(), StatusState::Creating);
        assert_eq!(resource.applied_config_version(), Some("v1.1.0"));
    }

    #[tokio::test]
    async fn test_forced_removal() {
        let t = setup("v1.1.0", true);
        pass(&t).await.unwrap();
        assert_eq!(t.cluster.len(), 4);

        t.clients.mark_deleted("storage", "edge");
        pass(&t).await.unwrap();
        assert_eq!(t.cluster.len(), 0);
        assert!(t.clients.current("storage", "edge").is_none());
        assert_eq!(t.events.last().unwrap().reason, EventReason::Deleted);
    }

    #[tokio::test]
    async fn test_removal_without_force_keeps_objects() {
        let t = setup("v1.1.0", false);
        pass(&t).await.unwrap();

        t.clients.mark_deleted("storage", "edge");
        pass(&t).await.unwrap();
        assert_eq!(t.cluster.len(), 4);
        assert!(t.clients.current("storage", "edge").is_none());
    }
}
