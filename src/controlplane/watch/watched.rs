//! Objects observed by the content watch

use crate::crd::WorkloadStatus;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

/// Closed set of kinds a content watch reacts to
#[derive(Debug, Clone)]
pub enum WatchedObject {
    ControllerWorkload(Deployment),
    NodeWorkload(DaemonSet),
    Pod(Pod),
}

impl WatchedObject {
    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            WatchedObject::ControllerWorkload(d) => d.metadata.labels.as_ref(),
            WatchedObject::NodeWorkload(d) => d.metadata.labels.as_ref(),
            WatchedObject::Pod(p) => p.metadata.labels.as_ref(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            WatchedObject::ControllerWorkload(d) => d.metadata.name.as_deref(),
            WatchedObject::NodeWorkload(d) => d.metadata.name.as_deref(),
            WatchedObject::Pod(p) => p.metadata.name.as_deref(),
        }
    }

    /// Replica counters; pods carry none of their own
    pub fn counts(&self) -> Option<WorkloadStatus> {
        match self {
            WatchedObject::ControllerWorkload(d) => Some(deployment_counts(d)),
            WatchedObject::NodeWorkload(d) => Some(daemon_set_counts(d)),
            WatchedObject::Pod(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatchedObject::ControllerWorkload(_) => "Deployment",
            WatchedObject::NodeWorkload(_) => "DaemonSet",
            WatchedObject::Pod(_) => "Pod",
        }
    }
}

/// Desired replicas come from the spec until the controller reports them
pub fn deployment_counts(deployment: &Deployment) -> WorkloadStatus {
    let status = deployment.status.as_ref();
    let desired = status
        .and_then(|s| s.replicas)
        .or_else(|| deployment.spec.as_ref().and_then(|s| s.replicas))
        .unwrap_or(0);
    let available = status.and_then(|s| s.available_replicas).unwrap_or(0);
    WorkloadStatus::new(desired, available)
}

pub fn daemon_set_counts(daemon_set: &DaemonSet) -> WorkloadStatus {
    let status = daemon_set.status.as_ref();
    let desired = status.map(|s| s.desired_number_scheduled).unwrap_or(0);
    let available = status.and_then(|s| s.number_available).unwrap_or(0);
    WorkloadStatus::new(desired, available)
}

pub fn stateful_set_counts(stateful_set: &StatefulSet) -> WorkloadStatus {
    let status = stateful_set.status.as_ref();
    let desired = stateful_set
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .or_else(|| status.map(|s| s.replicas))
        .unwrap_or(0);
    let available = status.and_then(|s| s.available_replicas).unwrap_or(0);
    WorkloadStatus::new(desired, available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{daemon_set_status, deployment_status};
    use serde_json::json;

    #[test]
    fn test_deployment_counts() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": { "name": "mayastor-controller" },
            "spec": {
                "replicas": 2,
                "selector": {},
                "template": {}
            }
        }))
        .unwrap();
        assert_eq!(deployment_counts(&deployment), WorkloadStatus::new(2, 0));

        let mut deployment = deployment;
        deployment.status = Some(serde_json::from_value(deployment_status(2, 2)).unwrap());
        let watched = WatchedObject::ControllerWorkload(deployment);
        assert!(watched.counts().unwrap().is_healthy());
    }

    #[test]
    fn test_daemon_set_counts() {
        let daemon_set = DaemonSet {
            status: Some(serde_json::from_value(daemon_set_status(3, 1)).unwrap()),
            ..Default::default()
        };
        let counts = daemon_set_counts(&daemon_set);
        assert_eq!(counts.failed, 2);
        assert!(!counts.is_healthy());
    }

    #[test]
    fn test_pod_has_labels_but_no_counts() {
        let mut pod = Pod::default();
        pod.metadata.labels = Some([("app".to_string(), "mayastor-node".to_string())].into());
        let watched = WatchedObject::Pod(pod);
        assert!(watched.counts().is_none());
        assert_eq!(watched.labels().unwrap()["app"], "mayastor-node");
    }
}
