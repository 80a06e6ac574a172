//! Managed Objects
//!
//! The closed set of cluster object kinds the operator renders, applies and
//! deletes, plus the keys used to address them.

use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde_json::Value;

// =============================================================================
// Object Kind
// =============================================================================

/// Kind of a managed object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
    CsiDriver,
    ConfigMap,
    Service,
    Deployment,
    DaemonSet,
    StatefulSet,
    /// CRD-backed object (e.g. a cert-manager Issuer)
    Extension { api_version: String, kind: String },
}

impl ObjectKind {
    /// Position in the apply order; lower ranks are applied first
    pub fn sync_rank(&self) -> u8 {
        match self {
            ObjectKind::ServiceAccount => 0,
            ObjectKind::ClusterRole | ObjectKind::Role => 1,
            ObjectKind::ClusterRoleBinding | ObjectKind::RoleBinding => 2,
            ObjectKind::CsiDriver => 3,
            ObjectKind::ConfigMap => 4,
            ObjectKind::Service => 5,
            ObjectKind::Deployment | ObjectKind::StatefulSet => 6,
            ObjectKind::DaemonSet => 7,
            ObjectKind::Extension { .. } => 8,
        }
    }

    /// Whether objects of this kind live outside namespaces
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            ObjectKind::ClusterRole | ObjectKind::ClusterRoleBinding | ObjectKind::CsiDriver
        )
    }

    /// Whether this kind is served by a CustomResourceDefinition
    pub fn is_extension(&self) -> bool {
        matches!(self, ObjectKind::Extension { .. })
    }

    /// Resolve a kind from apiVersion/kind as written in a template
    pub fn from_type_meta(api_version: &str, kind: &str) -> Option<ObjectKind> {
        let builtin = match (api_version, kind) {
            ("v1", "ServiceAccount") => Some(ObjectKind::ServiceAccount),
            ("v1", "ConfigMap") => Some(ObjectKind::ConfigMap),
            ("v1", "Service") => Some(ObjectKind::Service),
            ("rbac.authorization.k8s.io/v1", "ClusterRole") => Some(ObjectKind::ClusterRole),
            ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding") => {
                Some(ObjectKind::ClusterRoleBinding)
            }
            ("rbac.authorization.k8s.io/v1", "Role") => Some(ObjectKind::Role),
            ("rbac.authorization.k8s.io/v1", "RoleBinding") => Some(ObjectKind::RoleBinding),
            ("storage.k8s.io/v1", "CSIDriver") => Some(ObjectKind::CsiDriver),
            ("apps/v1", "Deployment") => Some(ObjectKind::Deployment),
            ("apps/v1", "DaemonSet") => Some(ObjectKind::DaemonSet),
            ("apps/v1", "StatefulSet") => Some(ObjectKind::StatefulSet),
            _ => None,
        };
        if builtin.is_some() {
            return builtin;
        }
        if is_builtin_group(api_version) {
            return None;
        }
        Some(ObjectKind::Extension {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        })
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::ServiceAccount => write!(f, "ServiceAccount"),
            ObjectKind::ClusterRole => write!(f, "ClusterRole"),
            ObjectKind::ClusterRoleBinding => write!(f, "ClusterRoleBinding"),
            ObjectKind::Role => write!(f, "Role"),
            ObjectKind::RoleBinding => write!(f, "RoleBinding"),
            ObjectKind::CsiDriver => write!(f, "CSIDriver"),
            ObjectKind::ConfigMap => write!(f, "ConfigMap"),
            ObjectKind::Service => write!(f, "Service"),
            ObjectKind::Deployment => write!(f, "Deployment"),
            ObjectKind::DaemonSet => write!(f, "DaemonSet"),
            ObjectKind::StatefulSet => write!(f, "StatefulSet"),
            ObjectKind::Extension { kind, .. } => write!(f, "{}", kind),
        }
    }
}

fn is_builtin_group(api_version: &str) -> bool {
    !api_version.contains('/')
        || api_version.starts_with("apps/")
        || api_version.split('/').next().map(|g| g.ends_with("k8s.io")).unwrap_or(false)
}

// =============================================================================
// Object Key
// =============================================================================

/// Address of a managed object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

// =============================================================================
// Managed Object
// =============================================================================

/// Result of an idempotent apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// A rendered cluster object
#[derive(Debug, Clone)]
pub enum ManagedObject {
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    Role(Role),
    RoleBinding(RoleBinding),
    CsiDriver(CSIDriver),
    ConfigMap(ConfigMap),
    Service(Service),
    Deployment(Deployment),
    DaemonSet(DaemonSet),
    StatefulSet(StatefulSet),
    Extension(DynamicObject),
}

macro_rules! with_object {
    ($obj:expr, $inner:ident => $body:expr) => {
        match $obj {
            ManagedObject::ServiceAccount($inner) => $body,
            ManagedObject::ClusterRole($inner) => $body,
            ManagedObject::ClusterRoleBinding($inner) => $body,
            ManagedObject::Role($inner) => $body,
            ManagedObject::RoleBinding($inner) => $body,
            ManagedObject::CsiDriver($inner) => $body,
            ManagedObject::ConfigMap($inner) => $body,
            ManagedObject::Service($inner) => $body,
            ManagedObject::Deployment($inner) => $body,
            ManagedObject::DaemonSet($inner) => $body,
            ManagedObject::StatefulSet($inner) => $body,
            ManagedObject::Extension($inner) => $body,
        }
    };
}

impl ManagedObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ManagedObject::ServiceAccount(_) => ObjectKind::ServiceAccount,
            ManagedObject::ClusterRole(_) => ObjectKind::ClusterRole,
            ManagedObject::ClusterRoleBinding(_) => ObjectKind::ClusterRoleBinding,
            ManagedObject::Role(_) => ObjectKind::Role,
            ManagedObject::RoleBinding(_) => ObjectKind::RoleBinding,
            ManagedObject::CsiDriver(_) => ObjectKind::CsiDriver,
            ManagedObject::ConfigMap(_) => ObjectKind::ConfigMap,
            ManagedObject::Service(_) => ObjectKind::Service,
            ManagedObject::Deployment(_) => ObjectKind::Deployment,
            ManagedObject::DaemonSet(_) => ObjectKind::DaemonSet,
            ManagedObject::StatefulSet(_) => ObjectKind::StatefulSet,
            ManagedObject::Extension(obj) => {
                let (api_version, kind) = obj
                    .types
                    .as_ref()
                    .map(|t| (t.api_version.clone(), t.kind.clone()))
                    .unwrap_or_default();
                ObjectKind::Extension { api_version, kind }
            }
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        with_object!(self, o => &o.metadata)
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        with_object!(self, o => &mut o.metadata)
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> ObjectKey {
        let kind = self.kind();
        let namespace = if kind.is_cluster_scoped() {
            None
        } else {
            self.meta().namespace.clone()
        };
        ObjectKey {
            kind,
            namespace,
            name: self.name().to_string(),
        }
    }

    /// Serialized form, including apiVersion and kind
    pub fn to_json(&self) -> Result<Value> {
        let value = with_object!(self, o => serde_json::to_value(o)?);
        Ok(value)
    }

    /// Build an object from a parsed template document
    pub fn from_value(value: Value, template: &str) -> Result<ManagedObject> {
        let api_version = value
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let object_kind = ObjectKind::from_type_meta(&api_version, &kind).ok_or_else(|| {
            Error::UnsupportedKind {
                template: template.to_string(),
                kind: format!("{}/{}", api_version, kind),
            }
        })?;

        let object = match object_kind {
            ObjectKind::ServiceAccount => ManagedObject::ServiceAccount(serde_json::from_value(value)?),
            ObjectKind::ClusterRole => ManagedObject::ClusterRole(serde_json::from_value(value)?),
            ObjectKind::ClusterRoleBinding => {
                ManagedObject::ClusterRoleBinding(serde_json::from_value(value)?)
            }
            ObjectKind::Role => ManagedObject::Role(serde_json::from_value(value)?),
            ObjectKind::RoleBinding => ManagedObject::RoleBinding(serde_json::from_value(value)?),
            ObjectKind::CsiDriver => ManagedObject::CsiDriver(serde_json::from_value(value)?),
            ObjectKind::ConfigMap => ManagedObject::ConfigMap(serde_json::from_value(value)?),
            ObjectKind::Service => ManagedObject::Service(serde_json::from_value(value)?),
            ObjectKind::Deployment => ManagedObject::Deployment(serde_json::from_value(value)?),
            ObjectKind::DaemonSet => ManagedObject::DaemonSet(serde_json::from_value(value)?),
            ObjectKind::StatefulSet => ManagedObject::StatefulSet(serde_json::from_value(value)?),
            ObjectKind::Extension { .. } => ManagedObject::Extension(serde_json::from_value(value)?),
        };

        if object.name().is_empty() {
            return Err(Error::TemplateRender {
                template: template.to_string(),
                reason: format!("{} without metadata.name", kind),
            });
        }
        Ok(object)
    }
}

// =============================================================================
// Drift Detection
// =============================================================================

/// True when every field set in `desired` has the same value in `live`.
///
/// Fields the API server defaults or manages (status, uid, extra keys) are
/// ignored because they only appear on the live side.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(k, v)| {
            if v.is_null() {
                return true;
            }
            have.get(k).map(|h| is_subset(v, h)).unwrap_or(false)
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        (want, have) => want == have,
    }
}
