//! Domain Ports - Core trait definitions for the storage module operator
//!
//! These traits define the boundaries between the reconcile logic and the
//! cluster, the on-disk configuration tree and the event recorder. Adapters
//! implement these traits to provide concrete functionality.

use crate::domain::objects::{ApplyOutcome, ManagedObject, ObjectKey};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

// =============================================================================
// Platform
// =============================================================================

/// Cluster distributions the operator adjusts manifests for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Kubernetes,
    OpenShift,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Kubernetes => write!(f, "kubernetes"),
            Platform::OpenShift => write!(f, "openshift"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(Platform::Kubernetes),
            "openshift" | "ocp" => Ok(Platform::OpenShift),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

/// Kubernetes server version (major.minor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KubeVersion {
    pub major: u32,
    pub minor: u32,
}

impl KubeVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse the `major`/`minor` pair reported by `/version`.
    ///
    /// Managed distributions append suffixes such as `29+`; only the leading
    /// digits are kept.
    pub fn from_parts(major: &str, minor: &str) -> Result<Self> {
        let digits = |s: &str| -> Result<u32> {
            let d: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
            d.parse()
                .map_err(|_| Error::VersionParse(format!("kubernetes version {}.{}", major, minor)))
        };
        Ok(Self::new(digits(major)?, digits(minor)?))
    }
}

impl std::fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl std::str::FromStr for KubeVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('v');
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| Error::VersionParse(s.to_string()))?;
        Self::from_parts(major, minor)
    }
}

// =============================================================================
// Cluster API Port
// =============================================================================

/// Port for reading and writing the objects the operator manages
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a live object; `None` when it does not exist
    async fn get_object(&self, key: &ObjectKey) -> Result<Option<ManagedObject>>;

    /// Create the object, or replace it when the live copy has drifted
    async fn apply_object(&self, object: &ManagedObject) -> Result<ApplyOutcome>;

    /// Delete an object; returns whether it existed
    async fn delete_object(&self, key: &ObjectKey) -> Result<bool>;

    /// Decoded data of a Secret; `None` when the secret is absent
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    /// API server version
    async fn server_version(&self) -> Result<KubeVersion>;
}

// =============================================================================
// Resource Store Port
// =============================================================================

/// A custom resource reconciled by the operator
pub trait ManagedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    type Status: Clone + Debug + Serialize + Send + Sync + 'static;

    /// Finalizer owned by the operator
    const FINALIZER: &'static str;
}

/// Port for the custom resources themselves
#[async_trait]
pub trait ResourceStore<K: ManagedResource>: Send + Sync {
    /// Fetch the resource; `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Replace the finalizer list
    async fn set_finalizers(&self, namespace: &str, name: &str, finalizers: Vec<String>)
        -> Result<()>;

    /// Merge annotations into the resource metadata
    async fn merge_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Replace the status subresource
    async fn set_status(&self, namespace: &str, name: &str, status: &K::Status) -> Result<()>;
}

// =============================================================================
// Event Sink Port
// =============================================================================

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Event reasons emitted on managed resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    Updated,
    Deleted,
    Completed,
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventReason::Updated => write!(f, "Updated"),
            EventReason::Deleted => write!(f, "Deleted"),
            EventReason::Completed => write!(f, "Completed"),
        }
    }
}

/// An event to record against a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEvent {
    pub kind: EventKind,
    pub reason: EventReason,
    pub note: String,
}

impl ResourceEvent {
    pub fn normal(reason: EventReason, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason,
            note: note.into(),
        }
    }

    pub fn warning(reason: EventReason, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason,
            note: note.into(),
        }
    }
}

/// Port for Kubernetes events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record an event; failures are logged by the adapter, never returned
    async fn publish(&self, target: &ObjectReference, event: ResourceEvent);
}

// =============================================================================
// Config Tree Port
// =============================================================================

/// Read-only view of the manifest/version tree
pub trait ConfigTree: Send + Sync {
    /// Read a file relative to the tree root; `ConfigNotFound` when absent
    fn read(&self, relative: &str) -> Result<String>;

    /// Whether a file exists relative to the tree root
    fn exists(&self, relative: &str) -> bool;

    /// Relative paths matching a glob pattern
    fn list(&self, pattern: &str) -> Result<Vec<String>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterApiRef = Arc<dyn ClusterApi>;
pub type EventSinkRef = Arc<dyn EventSink>;
pub type ConfigTreeRef = Arc<dyn ConfigTree>;
