//! Status projection
//!
//! Mirrors live workload health onto the resource status. Runs for content
//! watch events and after every successful sync.

use super::watched::{daemon_set_counts, deployment_counts, WatchedObject};
use crate::controlplane::metrics::Metrics;
use crate::crd::{ContainerStorageModule, ContainerStorageModuleStatus, StatusState, WorkloadStatus};
use crate::domain::objects::{ManagedObject, ObjectKey, ObjectKind};
use crate::domain::ports::{ClusterApi, ClusterApiRef, EventReason, EventSinkRef, ResourceEvent, ResourceStore};
use crate::error::Result;
use crate::manifest::bundle::InstanceRef;
use chrono::Utc;
use kube::Resource;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Controller Deployment of an instance
pub fn controller_key(instance: &InstanceRef) -> ObjectKey {
    ObjectKey::namespaced(
        ObjectKind::Deployment,
        &instance.namespace,
        format!("{}-controller", instance.name),
    )
}

/// Node DaemonSet of an instance
pub fn node_key(instance: &InstanceRef) -> ObjectKey {
    ObjectKey::namespaced(
        ObjectKind::DaemonSet,
        &instance.namespace,
        format!("{}-node", instance.name),
    )
}

/// State after a health observation.
///
/// Healthy workloads move the resource to `Running` where the state machine
/// allows it. Unhealthy ones only demote a `Running` resource.
pub fn project_state(current: StatusState, healthy: bool) -> StatusState {
    match (current, healthy) {
        (current, true) => current.advance(StatusState::Running),
        (StatusState::Running, false) => StatusState::Failed,
        (current, false) => current,
    }
}

/// Read both driver workloads; missing ones count as empty
pub async fn read_workloads(
    cluster: &dyn ClusterApi,
    instance: &InstanceRef,
) -> Result<(WorkloadStatus, WorkloadStatus)> {
    let controller = match cluster.get_object(&controller_key(instance)).await? {
        Some(ManagedObject::Deployment(d)) => deployment_counts(&d),
        _ => WorkloadStatus::default(),
    };
    let node = match cluster.get_object(&node_key(instance)).await? {
        Some(ManagedObject::DaemonSet(d)) => daemon_set_counts(&d),
        _ => WorkloadStatus::default(),
    };
    Ok((controller, node))
}

/// Handles content watch events of ContainerStorageModule instances
pub struct StatusProjector {
    cluster: ClusterApiRef,
    store: Arc<dyn ResourceStore<ContainerStorageModule>>,
    events: EventSinkRef,
    lock: Arc<Mutex<()>>,
    metrics: Arc<Metrics>,
}

impl StatusProjector {
    pub fn new(
        cluster: ClusterApiRef,
        store: Arc<dyn ResourceStore<ContainerStorageModule>>,
        events: EventSinkRef,
        lock: Arc<Mutex<()>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cluster,
            store,
            events,
            lock,
            metrics,
        }
    }

    /// Project one watched object onto its instance's status.
    ///
    /// Returns the state written, or `None` when the event was ignored.
    #[instrument(skip_all, fields(instance = %instance.key(), kind = object.kind()))]
    pub async fn handle(&self, instance: &InstanceRef, object: WatchedObject) -> Result<Option<StatusState>> {
        if !object.labels().map(|l| instance.matches(l)).unwrap_or(false) {
            return Ok(None);
        }

        let _guard = self.lock.lock().await;
        let Some(csm) = self.store.get(&instance.namespace, &instance.name).await? else {
            return Ok(None);
        };
        if csm.meta().deletion_timestamp.is_some() {
            return Ok(None);
        }

        let previous = csm.status.clone().unwrap_or_default();
        let controller_name = controller_key(instance).name;
        let node_name = node_key(instance).name;
        let (controller, node) = match &object {
            WatchedObject::ControllerWorkload(_) if object.name() == Some(controller_name.as_str()) => {
                (object.counts().unwrap_or_default(), previous.node_status)
            }
            WatchedObject::NodeWorkload(_) if object.name() == Some(node_name.as_str()) => {
                (previous.controller_status, object.counts().unwrap_or_default())
            }
            // Pods and module workloads share the labels; re-read the driver workloads
            _ => read_workloads(self.cluster.as_ref(), instance).await?,
        };

        let healthy = controller.is_healthy() && node.is_healthy();
        let state = project_state(previous.state, healthy);
        let status = ContainerStorageModuleStatus {
            state,
            controller_status: controller,
            node_status: node,
            message: previous.message.clone().filter(|_| state == previous.state),
            last_updated: Some(Utc::now()),
        };
        if same_status(&previous, &status) {
            return Ok(Some(state));
        }

        self.store
            .set_status(&instance.namespace, &instance.name, &status)
            .await?;
        self.metrics.projection(state);

        let note = format!(
            "controller {}/{} available, node {}/{} available",
            controller.available, controller.desired, node.available, node.desired
        );
        let event = if healthy {
            ResourceEvent::normal(EventReason::Updated, note)
        } else {
            ResourceEvent::warning(EventReason::Updated, note)
        };
        self.events.publish(&csm.object_ref(&()), event).await;

        debug!(%state, "Projected workload status");
        Ok(Some(state))
    }
}

/// Equal apart from the timestamp
pub fn same_status(a: &ContainerStorageModuleStatus, b: &ContainerStorageModuleStatus) -> bool {
    a.state == b.state
        && a.controller_status == b.controller_status
        && a.node_status == b.node_status
        && a.message == b.message
}
