//! Kubernetes adapters
//!
//! Every managed kind goes through `DynamicObject`, which keeps one code path
//! for built-in kinds and CRD-backed extension kinds. Extension kinds are
//! resolved through discovery once and cached.

use crate::crd::OPERATOR_NAME;
use crate::domain::objects::{is_subset, ApplyOutcome, ManagedObject, ObjectKey, ObjectKind};
use crate::domain::ports::{
    ClusterApi, EventKind, EventSink, KubeVersion, ManagedResource, ResourceEvent, ResourceStore,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{pinned_kind, Scope};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tracing::{debug, instrument, warn};

// =============================================================================
// Cluster
// =============================================================================

/// [`ClusterApi`] over a kube client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    /// Discovered extension kinds: (resource, cluster scoped)
    extensions: std::sync::Arc<DashMap<ObjectKind, (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            extensions: Default::default(),
        }
    }

    fn builtin(kind: &ObjectKind) -> Option<ApiResource> {
        let resource = match kind {
            ObjectKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            ObjectKind::ClusterRole => ApiResource::erase::<ClusterRole>(&()),
            ObjectKind::ClusterRoleBinding => ApiResource::erase::<ClusterRoleBinding>(&()),
            ObjectKind::Role => ApiResource::erase::<Role>(&()),
            ObjectKind::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
            ObjectKind::CsiDriver => ApiResource::erase::<CSIDriver>(&()),
            ObjectKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ObjectKind::Service => ApiResource::erase::<Service>(&()),
            ObjectKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ObjectKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
            ObjectKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
            ObjectKind::Extension { .. } => return None,
        };
        Some(resource)
    }

    async fn resource(&self, kind: &ObjectKind) -> Result<(ApiResource, bool)> {
        if let Some(builtin) = Self::builtin(kind) {
            return Ok((builtin, kind.is_cluster_scoped()));
        }
        if let Some(cached) = self.extensions.get(kind) {
            return Ok(cached.clone());
        }

        let ObjectKind::Extension { api_version, kind: name } = kind else {
            return Err(Error::Internal(format!("no resource for {}", kind)));
        };
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version.as_str()));
        let gvk = GroupVersionKind::gvk(group, version, name);
        let (resource, caps) = pinned_kind(&self.client, &gvk).await?;
        let entry = (resource, caps.scope == Scope::Cluster);
        self.extensions.insert(kind.clone(), entry.clone());
        debug!(%kind, "Discovered extension kind");
        Ok(entry)
    }

    async fn api(&self, key: &ObjectKey) -> Result<Api<DynamicObject>> {
        let (resource, cluster_scoped) = self.resource(&key.kind).await?;
        Ok(match (&key.namespace, cluster_scoped) {
            (Some(ns), false) => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        })
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_object(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        let api = self.api(key).await?;
        match api.get_opt(&key.name).await? {
            Some(live) => Ok(Some(ManagedObject::from_value(serde_json::to_value(live)?, "cluster")?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, object), fields(object = %object.key()))]
    async fn apply_object(&self, object: &ManagedObject) -> Result<ApplyOutcome> {
        let key = object.key();
        let api = self.api(&key).await?;
        let desired = object.to_json()?;
        let failed = |e: kube::Error| Error::ApplyFailed {
            kind: key.kind.to_string(),
            name: key.name.clone(),
            reason: e.to_string(),
        };

        match api.get_opt(&key.name).await? {
            None => {
                let body: DynamicObject = serde_json::from_value(desired)?;
                let params = PostParams {
                    field_manager: Some(OPERATOR_NAME.to_string()),
                    ..Default::default()
                };
                api.create(&params, &body).await.map_err(failed)?;
                Ok(ApplyOutcome::Created)
            }
            Some(live) if is_subset(&desired, &serde_json::to_value(&live)?) => Ok(ApplyOutcome::Unchanged),
            Some(_) => {
                let params = PatchParams {
                    field_manager: Some(OPERATOR_NAME.to_string()),
                    ..Default::default()
                };
                api.patch(&key.name, &params, &Patch::Merge(&desired))
                    .await
                    .map_err(failed)?;
                Ok(ApplyOutcome::Updated)
            }
        }
    }

    async fn delete_object(&self, key: &ObjectKey) -> Result<bool> {
        let api = self.api(key).await?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(Error::DeleteFailed {
                kind: key.kind.to_string(),
                name: key.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };

        let mut data: BTreeMap<String, String> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
            .collect();
        data.extend(secret.string_data.unwrap_or_default());
        Ok(Some(data))
    }

    async fn server_version(&self) -> Result<KubeVersion> {
        let info = self.client.apiserver_version().await?;
        KubeVersion::from_parts(&info.major, &info.minor)
    }
}

// =============================================================================
// Resource Store
// =============================================================================

/// [`ResourceStore`] over a kube client
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K: ManagedResource> KubeStore<K> {
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn merge(&self, namespace: &str, name: &str, patch: serde_json::Value) -> Result<()> {
        let params = PatchParams {
            field_manager: Some(OPERATOR_NAME.to_string()),
            ..Default::default()
        };
        self.api(namespace).patch(name, &params, &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

#[async_trait]
impl<K: ManagedResource> ResourceStore<K> for KubeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        self.merge(namespace, name, json!({ "metadata": { "finalizers": finalizers } }))
            .await
    }

    async fn merge_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        self.merge(namespace, name, json!({ "metadata": { "annotations": annotations } }))
            .await
    }

    async fn set_status(&self, namespace: &str, name: &str, status: &K::Status) -> Result<()> {
        let patch = json!({ "status": status });
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Events
// =============================================================================

/// [`EventSink`] publishing Kubernetes events
pub struct KubeEvents {
    client: Client,
    reporter: Reporter,
}

impl KubeEvents {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: OPERATOR_NAME.to_string(),
                instance,
            },
        }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, target: &ObjectReference, event: ResourceEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), target.clone());
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        let result = recorder
            .publish(Event {
                type_,
                reason: event.reason.to_string(),
                note: Some(event.note),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await;
        if let Err(e) = result {
            warn!(target = ?target.name, error = %e, "Failed to publish event");
        }
    }
}
