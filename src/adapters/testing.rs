//! In-memory fakes of the domain ports

use crate::domain::objects::{is_subset, ApplyOutcome, ManagedObject, ObjectKey, ObjectKind};
use crate::domain::ports::{
    ClusterApi, EventSink, KubeVersion, ManagedResource, ResourceEvent, ResourceStore,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

// =============================================================================
// Cluster
// =============================================================================

/// Object store keyed by `ObjectKey` display form
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<String, (ObjectKey, Value)>>,
    secrets: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
    fail_apply: Mutex<BTreeSet<String>>,
    fail_delete: Mutex<BTreeSet<String>>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    version: Mutex<Option<KubeVersion>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and updates so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.writes.store(0, Ordering::SeqCst);
        self.deletes.store(0, Ordering::SeqCst);
    }

    pub fn put_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        self.secrets.lock().insert(
            (namespace.to_string(), name.to_string()),
            data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        );
    }

    pub fn set_version(&self, version: KubeVersion) {
        *self.version.lock() = Some(version);
    }

    /// Make applies of objects with this name fail
    pub fn fail_apply_of(&self, name: &str) {
        self.fail_apply.lock().insert(name.to_string());
    }

    /// Make deletes of objects with this name fail
    pub fn fail_delete_of(&self, name: &str) {
        self.fail_delete.lock().insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_apply.lock().clear();
        self.fail_delete.lock().clear();
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.lock().contains_key(&key.to_string())
    }

    pub fn get_json(&self, key: &ObjectKey) -> Option<Value> {
        self.objects.lock().get(&key.to_string()).map(|(_, v)| v.clone())
    }

    /// Stored keys of one kind
    pub fn keys_of(&self, kind: &ObjectKind) -> Vec<ObjectKey> {
        self.objects
            .lock()
            .values()
            .filter(|(k, _)| &k.kind == kind)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn count_of(&self, kind: &ObjectKind) -> usize {
        self.keys_of(kind).len()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Every stored object by key
    pub fn dump(&self) -> BTreeMap<String, Value> {
        self.objects
            .lock()
            .iter()
            .map(|(key, (_, value))| (key.clone(), value.clone()))
            .collect()
    }

    /// Overwrite the `status` of a stored object, as a controller would
    pub fn set_status(&self, key: &ObjectKey, status: Value) {
        if let Some((_, value)) = self.objects.lock().get_mut(&key.to_string()) {
            value["status"] = status;
        }
    }
}

/// JSON merge patch as the API server applies it: objects merge key by key,
/// `null` removes a key, anything else replaces the live value.
pub fn merge_patch(live: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *live = patch.clone();
        return;
    };
    if !live.is_object() {
        *live = json!({});
    }
    if let Value::Object(live) = live {
        for (key, value) in fields {
            if value.is_null() {
                live.remove(key);
            } else {
                merge_patch(live.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_object(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        match self.get_json(key) {
            Some(value) => Ok(Some(ManagedObject::from_value(value, "fake")?)),
            None => Ok(None),
        }
    }

    async fn apply_object(&self, object: &ManagedObject) -> Result<ApplyOutcome> {
        let key = object.key();
        if self.fail_apply.lock().contains(&key.name) {
            return Err(Error::ApplyFailed {
                kind: key.kind.to_string(),
                name: key.name.clone(),
                reason: "injected failure".into(),
            });
        }

        let desired = object.to_json()?;
        let mut objects = self.objects.lock();
        let outcome = match objects.get_mut(&key.to_string()) {
            Some((_, live)) if is_subset(&desired, live) => ApplyOutcome::Unchanged,
            Some((_, live)) => {
                merge_patch(live, &desired);
                ApplyOutcome::Updated
            }
            None => {
                objects.insert(key.to_string(), (key.clone(), desired));
                ApplyOutcome::Created
            }
        };
        if outcome != ApplyOutcome::Unchanged {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    async fn delete_object(&self, key: &ObjectKey) -> Result<bool> {
        if self.fail_delete.lock().contains(&key.name) {
            return Err(Error::DeleteFailed {
                kind: key.kind.to_string(),
                name: key.name.clone(),
                reason: "injected failure".into(),
            });
        }
        let existed = self.objects.lock().remove(&key.to_string()).is_some();
        if existed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(existed)
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .secrets
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn server_version(&self) -> Result<KubeVersion> {
        Ok(self.version.lock().unwrap_or(KubeVersion::new(1, 29)))
    }
}

// =============================================================================
// Resource Store
// =============================================================================

/// Custom resources kept as JSON, with API server finalizer semantics
pub struct FakeStore<K> {
    resources: Mutex<BTreeMap<(String, String), K>>,
    statuses: Mutex<Vec<Value>>,
}

impl<K: ManagedResource> Default for FakeStore<K> {
    fn default() -> Self {
        Self {
            resources: Mutex::new(BTreeMap::new()),
            statuses: Mutex::new(Vec::new()),
        }
    }
}

impl<K: ManagedResource> FakeStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource: K) {
        let meta = resource.meta();
        let key = (
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        );
        self.resources.lock().insert(key, resource);
    }

    pub fn current(&self, namespace: &str, name: &str) -> Option<K> {
        self.resources
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every status written, oldest first
    pub fn status_history(&self) -> Vec<Value> {
        self.statuses.lock().clone()
    }

    /// `state` of every status written, oldest first
    pub fn state_history(&self) -> Vec<String> {
        self.status_history()
            .iter()
            .filter_map(|s| s.get("state").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Mark the resource as being deleted
    pub fn mark_deleted(&self, namespace: &str, name: &str) {
        if let Some(resource) = self
            .resources
            .lock()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            resource.meta_mut().deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
            );
        }
    }

    fn update(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K) -> Result<()>) -> Result<()> {
        let mut resources = self.resources.lock();
        let key = (namespace.to_string(), name.to_string());
        let resource = resources
            .get_mut(&key)
            .ok_or_else(|| Error::Internal(format!("{} {}/{} not found", K::kind(&()), namespace, name)))?;
        f(resource)?;

        // The API server drops a deleted object once its finalizers are gone
        let meta = resource.meta();
        if meta.deletion_timestamp.is_some() && meta.finalizers.as_ref().map_or(true, Vec::is_empty) {
            resources.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl<K: ManagedResource> ResourceStore<K> for FakeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.current(namespace, name))
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        self.update(namespace, name, |r| {
            r.meta_mut().finalizers = Some(finalizers);
            Ok(())
        })
    }

    async fn merge_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        self.update(namespace, name, |r| {
            r.meta_mut()
                .annotations
                .get_or_insert_with(Default::default)
                .extend(annotations);
            Ok(())
        })
    }

    async fn set_status(&self, namespace: &str, name: &str, status: &K::Status) -> Result<()> {
        let status = serde_json::to_value(status)?;
        self.update(namespace, name, |r| {
            let mut value = serde_json::to_value(&*r)?;
            value["status"] = status.clone();
            *r = serde_json::from_value(value)?;
            Ok(())
        })?;
        self.statuses.lock().push(status);
        Ok(())
    }
}

// =============================================================================
// Events
// =============================================================================

/// Records published events
#[derive(Default)]
pub struct FakeEvents {
    events: Mutex<Vec<(String, ResourceEvent)>>,
}

impl FakeEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<(String, ResourceEvent)> {
        self.events.lock().clone()
    }

    pub fn last(&self) -> Option<ResourceEvent> {
        self.events.lock().last().map(|(_, e)| e.clone())
    }
}

#[async_trait]
impl EventSink for FakeEvents {
    async fn publish(&self, target: &ObjectReference, event: ResourceEvent) {
        self.events
            .lock()
            .push((target.name.clone().unwrap_or_default(), event));
    }
}

/// Deployment status as reported by the API server
pub fn deployment_status(replicas: i32, available: i32) -> Value {
    json!({ "replicas": replicas, "availableReplicas": available, "readyReplicas": available })
}

/// DaemonSet status as reported by the API server
pub fn daemon_set_status(desired: i32, available: i32) -> Value {
    json!({
        "desiredNumberScheduled": desired,
        "numberAvailable": available,
        "numberReady": available,
        "currentNumberScheduled": desired,
        "numberMisscheduled": 0,
        "numberUnavailable": desired - available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_patch_replaces_arrays() {
        let mut live = json!({
            "spec": {
                "replicas": 2,
                "containers": [{ "name": "driver" }, { "name": "podmon" }],
                "selector": { "app": "csi" },
            },
            "status": { "availableReplicas": 2 },
        });
        merge_patch(
            &mut live,
            &json!({
                "spec": { "containers": [{ "name": "driver" }], "selector": { "tier": "node" } },
            }),
        );
        assert_eq!(
            live,
            json!({
                "spec": {
                    "replicas": 2,
                    "containers": [{ "name": "driver" }],
                    "selector": { "app": "csi", "tier": "node" },
                },
                "status": { "availableReplicas": 2 },
            })
        );

        merge_patch(&mut live, &json!({ "spec": { "selector": { "app": null } } }));
        assert_eq!(live["spec"]["selector"], json!({ "tier": "node" }));
    }
}
