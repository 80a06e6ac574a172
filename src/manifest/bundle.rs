//! Rendered object bundle
//!
//! A bundle is built fresh by each reconcile pass: the driver's base objects
//! (registration, config map, controller and node workloads with their RBAC)
//! plus standalone objects contributed by modules.

use crate::crd::{
    ContainerOverride, DriverSpec, EnvVarSpec, SidecarSpec, TolerationSpec, LABEL_INSTANCE,
    LABEL_INSTANCE_NAMESPACE,
};
use crate::domain::objects::ManagedObject;
use crate::error::{Error, Result};
use crate::manifest::patch::{
    container_mut, daemon_set_pod_spec, deployment_pod_spec, stateful_set_pod_spec,
    template_labels_mut, upsert_env, DRIVER_CONTAINER,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PodSpec, ServiceAccount, Toleration};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

// =============================================================================
// RBAC
// =============================================================================

/// Identity and permissions of one workload
#[derive(Debug, Clone, Default)]
pub struct Rbac {
    pub service_accounts: Vec<ServiceAccount>,
    pub cluster_roles: Vec<ClusterRole>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
    pub roles: Vec<Role>,
    pub role_bindings: Vec<RoleBinding>,
}

impl Rbac {
    /// Keep RBAC objects, hand back everything else
    pub fn absorb(&mut self, object: ManagedObject) -> Option<ManagedObject> {
        match object {
            ManagedObject::ServiceAccount(o) => self.service_accounts.push(o),
            ManagedObject::ClusterRole(o) => self.cluster_roles.push(o),
            ManagedObject::ClusterRoleBinding(o) => self.cluster_role_bindings.push(o),
            ManagedObject::Role(o) => self.roles.push(o),
            ManagedObject::RoleBinding(o) => self.role_bindings.push(o),
            other => return Some(other),
        }
        None
    }

    /// Primary cluster role, the target of module rule merges
    pub fn primary_cluster_role(&mut self) -> Option<&mut ClusterRole> {
        self.cluster_roles.first_mut()
    }

    pub fn len(&self) -> usize {
        self.service_accounts.len()
            + self.cluster_roles.len()
            + self.cluster_role_bindings.len()
            + self.roles.len()
            + self.role_bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects in apply order
    pub fn ordered(&self) -> Vec<ManagedObject> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.service_accounts.iter().cloned().map(ManagedObject::ServiceAccount));
        out.extend(self.cluster_roles.iter().cloned().map(ManagedObject::ClusterRole));
        out.extend(self.roles.iter().cloned().map(ManagedObject::Role));
        out.extend(
            self.cluster_role_bindings
                .iter()
                .cloned()
                .map(ManagedObject::ClusterRoleBinding),
        );
        out.extend(self.role_bindings.iter().cloned().map(ManagedObject::RoleBinding));
        out
    }
}

/// A workload together with its RBAC
#[derive(Debug, Clone)]
pub struct Workload<W> {
    pub rbac: Rbac,
    pub workload: W,
}

impl<W> Workload<W> {
    /// Split a rendered template into RBAC and exactly one workload
    pub fn from_objects(
        objects: Vec<ManagedObject>,
        template: &str,
        pick: impl Fn(ManagedObject) -> std::result::Result<W, ManagedObject>,
    ) -> Result<Self> {
        let mut rbac = Rbac::default();
        let mut workload = None;

        for object in objects {
            let Some(rest) = rbac.absorb(object) else {
                continue;
            };
            match pick(rest) {
                Ok(w) if workload.is_none() => workload = Some(w),
                Ok(_) => {
                    return Err(Error::TemplateRender {
                        template: template.to_string(),
                        reason: "more than one workload".to_string(),
                    })
                }
                Err(other) => {
                    return Err(Error::UnsupportedKind {
                        template: template.to_string(),
                        kind: other.kind().to_string(),
                    })
                }
            }
        }

        let workload = workload.ok_or_else(|| Error::TemplateRender {
            template: template.to_string(),
            reason: "no workload object".to_string(),
        })?;
        Ok(Self { rbac, workload })
    }
}

pub fn pick_deployment(object: ManagedObject) -> std::result::Result<Deployment, ManagedObject> {
    match object {
        ManagedObject::Deployment(d) => Ok(d),
        other => Err(other),
    }
}

pub fn pick_daemon_set(object: ManagedObject) -> std::result::Result<DaemonSet, ManagedObject> {
    match object {
        ManagedObject::DaemonSet(d) => Ok(d),
        other => Err(other),
    }
}

pub fn pick_stateful_set(object: ManagedObject) -> std::result::Result<StatefulSet, ManagedObject> {
    match object {
        ManagedObject::StatefulSet(s) => Ok(s),
        other => Err(other),
    }
}

// =============================================================================
// Driver Bundle
// =============================================================================

/// Base objects of a driver install
#[derive(Debug, Clone)]
pub struct DriverBundle {
    pub csi_driver: CSIDriver,
    pub config_map: ConfigMap,
    pub controller: Workload<Deployment>,
    pub node: Workload<DaemonSet>,
}

impl DriverBundle {
    pub fn controller_pod_spec(&mut self) -> &mut PodSpec {
        deployment_pod_spec(&mut self.controller.workload)
    }

    pub fn node_pod_spec(&mut self) -> &mut PodSpec {
        daemon_set_pod_spec(&mut self.node.workload)
    }

    /// Apply the resource's replica, image, env, scheduling and sidecar overrides
    pub fn apply_overrides(&mut self, spec: &DriverSpec) {
        self.controller
            .workload
            .spec
            .get_or_insert_with(Default::default)
            .replicas = Some(spec.replicas);

        let controller = self.controller_pod_spec();
        apply_container_override(controller, &spec.common);
        apply_container_override(controller, &spec.controller);
        apply_sidecar_overrides(controller, &spec.side_cars);

        let node = self.node_pod_spec();
        apply_container_override(node, &spec.common);
        apply_container_override(node, &spec.node);
        apply_sidecar_overrides(node, &spec.side_cars);
    }

    /// Objects in apply order
    pub fn ordered(&self) -> Vec<ManagedObject> {
        let mut out = Vec::new();
        let rbacs = [&self.controller.rbac, &self.node.rbac];

        for rbac in rbacs {
            out.extend(rbac.service_accounts.iter().cloned().map(ManagedObject::ServiceAccount));
        }
        for rbac in rbacs {
            out.extend(rbac.cluster_roles.iter().cloned().map(ManagedObject::ClusterRole));
            out.extend(rbac.roles.iter().cloned().map(ManagedObject::Role));
        }
        for rbac in rbacs {
            out.extend(
                rbac.cluster_role_bindings
                    .iter()
                    .cloned()
                    .map(ManagedObject::ClusterRoleBinding),
            );
            out.extend(rbac.role_bindings.iter().cloned().map(ManagedObject::RoleBinding));
        }
        out.push(ManagedObject::CsiDriver(self.csi_driver.clone()));
        out.push(ManagedObject::ConfigMap(self.config_map.clone()));
        out.push(ManagedObject::Deployment(self.controller.workload.clone()));
        out.push(ManagedObject::DaemonSet(self.node.workload.clone()));
        out
    }
}

/// Apply container-level overrides to the driver container of a pod spec
pub fn apply_container_override(spec: &mut PodSpec, overrides: &ContainerOverride) {
    apply_container_override_to(spec, DRIVER_CONTAINER, overrides);
}

/// Apply container-level overrides to the named container of a pod spec
pub fn apply_container_override_to(spec: &mut PodSpec, container: &str, overrides: &ContainerOverride) {
    if let Some(driver) = container_mut(spec, container) {
        if let Some(image) = &overrides.image {
            driver.image = Some(image.clone());
        }
        if let Some(policy) = &overrides.image_pull_policy {
            driver.image_pull_policy = Some(policy.clone());
        }
        apply_envs(driver, &overrides.envs);
    }

    if !overrides.node_selector.is_empty() {
        spec.node_selector
            .get_or_insert_with(Default::default)
            .extend(overrides.node_selector.clone());
    }

    if !overrides.tolerations.is_empty() {
        let tolerations = spec.tolerations.get_or_insert_with(Vec::new);
        for t in overrides.tolerations.iter().map(to_toleration) {
            if !tolerations.contains(&t) {
                tolerations.push(t);
            }
        }
    }
}

pub fn apply_sidecar_overrides(spec: &mut PodSpec, sidecars: &[SidecarSpec]) {
    for sidecar in sidecars {
        if let Some(container) = container_mut(spec, &sidecar.name) {
            if let Some(image) = &sidecar.image {
                container.image = Some(image.clone());
            }
            apply_envs(container, &sidecar.envs);
        }
    }
}

pub fn apply_envs(container: &mut k8s_openapi::api::core::v1::Container, envs: &[EnvVarSpec]) {
    for env in envs {
        upsert_env(container, &env.name, &env.value);
    }
}

fn to_toleration(spec: &TolerationSpec) -> Toleration {
    Toleration {
        key: spec.key.clone(),
        operator: spec.operator.clone(),
        value: spec.value.clone(),
        effect: spec.effect.clone(),
        toleration_seconds: None,
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// Everything a reconcile pass applies
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    /// Base driver objects; absent for driverless installs
    pub driver: Option<DriverBundle>,
    /// Standalone objects contributed by modules, in module order
    pub extras: Vec<ManagedObject>,
}

impl Bundle {
    pub fn new(driver: Option<DriverBundle>) -> Self {
        Self {
            driver,
            extras: Vec::new(),
        }
    }

    /// Append one module's standalone objects, ordered by kind
    pub fn push_extras(&mut self, mut objects: Vec<ManagedObject>) {
        objects.sort_by_key(|o| o.kind().sync_rank());
        self.extras.extend(objects);
    }

    /// Every object in apply order
    pub fn ordered(&self) -> Vec<ManagedObject> {
        let mut out = self.driver.as_ref().map(DriverBundle::ordered).unwrap_or_default();
        out.extend(self.extras.iter().cloned());
        out
    }

    pub fn len(&self) -> usize {
        self.ordered().len()
    }

    pub fn is_empty(&self) -> bool {
        self.driver.is_none() && self.extras.is_empty()
    }
}

// =============================================================================
// Instance Ownership
// =============================================================================

/// The custom resource that owns a bundle
#[derive(Debug, Clone)]
pub struct InstanceRef {
    pub name: String,
    pub namespace: String,
    pub owner: Option<OwnerReference>,
}

impl InstanceRef {
    pub fn from_resource<K: Resource<DynamicType = ()>>(resource: &K) -> Self {
        Self {
            name: resource.name_any(),
            namespace: resource.namespace().unwrap_or_default(),
            owner: resource.controller_owner_ref(&()),
        }
    }

    /// Registry key of the instance
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether a label map carries this instance's label pair
    pub fn matches(&self, labels: &std::collections::BTreeMap<String, String>) -> bool {
        labels.get(LABEL_INSTANCE) == Some(&self.name)
            && labels.get(LABEL_INSTANCE_NAMESPACE) == Some(&self.namespace)
    }

    /// Label the object, default its namespace and set owner references
    pub fn stamp(&self, object: &mut ManagedObject) {
        let cluster_scoped = object.kind().is_cluster_scoped();

        let meta = object.meta_mut();
        let labels = meta.labels.get_or_insert_with(Default::default);
        labels.insert(LABEL_INSTANCE.to_string(), self.name.clone());
        labels.insert(LABEL_INSTANCE_NAMESPACE.to_string(), self.namespace.clone());

        if cluster_scoped {
            meta.namespace = None;
        } else {
            let namespace = meta.namespace.get_or_insert_with(|| self.namespace.clone());
            if *namespace == self.namespace {
                if let Some(owner) = &self.owner {
                    let refs = meta.owner_references.get_or_insert_with(Vec::new);
                    if !refs.iter().any(|r| r.uid == owner.uid) {
                        refs.push(owner.clone());
                    }
                }
            }
        }

        let template = match object {
            ManagedObject::Deployment(d) => {
                deployment_pod_spec(d);
                d.spec.as_mut().map(|s| &mut s.template)
            }
            ManagedObject::DaemonSet(d) => {
                daemon_set_pod_spec(d);
                d.spec.as_mut().map(|s| &mut s.template)
            }
            ManagedObject::StatefulSet(s) => {
                stateful_set_pod_spec(s);
                s.spec.as_mut().map(|s| &mut s.template)
            }
            _ => None,
        };
        if let Some(template) = template {
            let labels = template_labels_mut(template);
            labels.insert(LABEL_INSTANCE.to_string(), self.name.clone());
            labels.insert(LABEL_INSTANCE_NAMESPACE.to_string(), self.namespace.clone());
        }
    }
}
