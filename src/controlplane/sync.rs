//! Resource Synchronization
//!
//! Applies a bundle object by object in apply order, stopping at the first
//! failure, and removes object sets in the reverse order.

use crate::domain::objects::{ApplyOutcome, ManagedObject};
use crate::domain::ports::ClusterApi;
use crate::error::Result;
use crate::manifest::bundle::InstanceRef;
use tracing::{debug, instrument, warn};

/// Counts of one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl SyncReport {
    /// Objects written to the cluster
    pub fn changed(&self) -> usize {
        self.created + self.updated
    }

    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// How removal treats CRD-backed objects that fail to delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionFailures {
    Fail,
    Warn,
}

pub struct Synchronizer<'a> {
    cluster: &'a dyn ClusterApi,
    instance: &'a InstanceRef,
}

impl<'a> Synchronizer<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, instance: &'a InstanceRef) -> Self {
        Self { cluster, instance }
    }

    /// Stamp and apply objects in order; the first failure aborts
    #[instrument(skip_all, fields(instance = %self.instance.key(), objects = objects.len()))]
    pub async fn apply_all(&self, objects: Vec<ManagedObject>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for mut object in objects {
            self.instance.stamp(&mut object);
            let outcome = self.cluster.apply_object(&object).await?;
            if outcome != ApplyOutcome::Unchanged {
                debug!(object = %object.key(), ?outcome, "Applied");
            }
            report.record(outcome);
        }
        Ok(report)
    }

    /// Delete objects in reverse apply order.
    ///
    /// Returns the number of objects that existed.
    #[instrument(skip_all, fields(instance = %self.instance.key(), objects = objects.len()))]
    pub async fn remove_all(
        &self,
        objects: Vec<ManagedObject>,
        extensions: ExtensionFailures,
    ) -> Result<usize> {
        let mut removed = 0;
        for mut object in objects.into_iter().rev() {
            // Namespaces are defaulted the same way they were on apply
            self.instance.stamp(&mut object);
            let key = object.key();
            match self.cluster.delete_object(&key).await {
                Ok(true) => {
                    debug!(object = %key, "Deleted");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) if key.kind.is_extension() && extensions == ExtensionFailures::Warn => {
                    warn!(object = %key, error = %e, "Leaving extension object behind");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::FakeCluster;
    use crate::crd::{LABEL_INSTANCE, LABEL_INSTANCE_NAMESPACE};
    use crate::domain::objects::ObjectKind;
    use crate::manifest::template::parse_objects;

    const OBJECTS: &str = r#"
apiVersion: v1
kind: ServiceAccount
metadata:
  name: topology
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: topology-config
data:
  level: debug
---
apiVersion: cert-manager.io/v1
kind: Issuer
metadata:
  name: selfsigned
spec:
  selfSigned: {}
"#;

    fn instance() -> InstanceRef {
        InstanceRef {
            name: "csm".into(),
            namespace: "storage".into(),
            owner: None,
        }
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_and_stamped() {
        let cluster = FakeCluster::new();
        let instance = instance();
        let sync = Synchronizer::new(&cluster, &instance);
        let objects = parse_objects(OBJECTS, "test.yaml").unwrap();

        let first = sync.apply_all(objects.clone()).await.unwrap();
        assert_eq!(first.created, 3);
        let second = sync.apply_all(objects).await.unwrap();
        assert_eq!(second.changed(), 0);
        assert_eq!(second.unchanged, 3);
        assert_eq!(cluster.writes(), 3);

        let key = cluster.keys_of(&ObjectKind::ConfigMap).pop().unwrap();
        assert_eq!(key.namespace.as_deref(), Some("storage"));
        let stored = cluster.get_json(&key).unwrap();
        assert_eq!(stored["metadata"]["labels"][LABEL_INSTANCE], "csm");
        assert_eq!(stored["metadata"]["labels"][LABEL_INSTANCE_NAMESPACE], "storage");
    }

    #[tokio::test]
    async fn test_first_failure_aborts() {
        let cluster = FakeCluster::new();
        let instance = instance();
        let sync = Synchronizer::new(&cluster, &instance);
        cluster.fail_apply_of("topology-config");

        let objects = parse_objects(OBJECTS, "test.yaml").unwrap();
        assert!(sync.apply_all(objects).await.is_err());
        // Only the service account made it
        assert_eq!(cluster.len(), 1);
    }

    #[tokio::test]
    async fn test_extension_delete_failures() {
        let cluster = FakeCluster::new();
        let instance = instance();
        let sync = Synchronizer::new(&cluster, &instance);
        let objects = parse_objects(OBJECTS, "test.yaml").unwrap();
        sync.apply_all(objects.clone()).await.unwrap();
        cluster.fail_delete_of("selfsigned");

        assert!(sync
            .remove_all(objects.clone(), ExtensionFailures::Fail)
            .await
            .is_err());
        let removed = sync.remove_all(objects, ExtensionFailures::Warn).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cluster.len(), 1);
    }
}
