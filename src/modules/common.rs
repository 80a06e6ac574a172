//! Fragments and helpers shared by module transforms

use crate::crd::{ComponentSpec, ModuleSpec};
use crate::domain::objects::ManagedObject;
use crate::manifest::bundle::{apply_envs, Rbac};
use crate::manifest::patch::{
    container_mut, merge_rules, upsert_container, upsert_env_var, upsert_volume,
    upsert_volume_mount, DRIVER_CONTAINER,
};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, Volume, VolumeMount};
use k8s_openapi::api::rbac::v1::PolicyRule;
use serde::Deserialize;

// =============================================================================
// Fragments
// =============================================================================

/// `controller-sidecar.yaml` / `node-sidecar.yaml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarFragment {
    /// Containers added next to the driver
    #[serde(default)]
    pub containers: Vec<Container>,
    /// Pod volumes the containers need
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Env entries set on the driver container
    #[serde(default)]
    pub driver_env: Vec<EnvVar>,
    /// Mounts added to the driver container
    #[serde(default)]
    pub driver_volume_mounts: Vec<VolumeMount>,
}

/// `rbac.yaml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RbacFragment {
    #[serde(default)]
    pub controller: Vec<PolicyRule>,
    #[serde(default)]
    pub node: Vec<PolicyRule>,
}

// =============================================================================
// Injection
// =============================================================================

/// Add a sidecar fragment to a pod spec.
///
/// A component named after a sidecar container overrides its image and envs.
pub fn inject_sidecar(spec: &mut PodSpec, fragment: &SidecarFragment, module: &ModuleSpec) {
    for container in &fragment.containers {
        let mut container = container.clone();
        if let Some(component) = module.component(&container.name) {
            apply_component(&mut container, component);
        }
        upsert_container(spec, container);
    }

    for volume in &fragment.volumes {
        upsert_volume(spec, volume.clone());
    }

    if let Some(driver) = container_mut(spec, DRIVER_CONTAINER) {
        for var in &fragment.driver_env {
            upsert_env_var(driver, var.clone());
        }
        for mount in &fragment.driver_volume_mounts {
            upsert_volume_mount(driver, mount.clone());
        }
    }
}

/// Merge extra rules into the workload's primary cluster role
pub fn merge_cluster_role(rbac: &mut Rbac, rules: &[PolicyRule]) -> bool {
    if rules.is_empty() {
        return true;
    }
    match rbac.primary_cluster_role() {
        Some(role) => {
            merge_rules(role.rules.get_or_insert_with(Vec::new), rules);
            true
        }
        None => false,
    }
}

/// Image and env overrides of a component
pub fn apply_component(container: &mut Container, component: &ComponentSpec) {
    if let Some(image) = &component.image {
        container.image = Some(image.clone());
    }
    apply_envs(container, &component.envs);
}

/// Apply a component's overrides to the first container of its workloads
pub fn apply_component_to_objects(objects: &mut [ManagedObject], component: &ComponentSpec) {
    use crate::manifest::patch::{daemon_set_pod_spec, deployment_pod_spec, stateful_set_pod_spec};

    for object in objects.iter_mut() {
        let spec = match object {
            ManagedObject::Deployment(d) => deployment_pod_spec(d),
            ManagedObject::DaemonSet(d) => daemon_set_pod_spec(d),
            ManagedObject::StatefulSet(s) => stateful_set_pod_spec(s),
            _ => continue,
        };
        if let Some(container) = spec.containers.first_mut() {
            apply_component(container, component);
        }
    }
}

/// Whether a component is enabled; absent components count as enabled
pub fn component_enabled(module: &ModuleSpec, name: &str) -> bool {
    module.component(name).map(ComponentSpec::is_enabled).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EnvVarSpec, ModuleType};
    use crate::manifest::patch::env_value;

    fn module(components: Vec<ComponentSpec>) -> ModuleSpec {
        ModuleSpec {
            name: ModuleType::Authorization,
            enabled: true,
            config_version: "v2.0.0".into(),
            force_remove_module: false,
            components,
        }
    }

    fn fragment() -> SidecarFragment {
        serde_yaml::from_str(
            r#"
containers:
  - name: karavi-authorization-proxy
    image: sidecar:v1
    env:
      - name: PROXY_HOST
        value: ""
volumes:
  - name: karavi-authorization-config
    secret:
      secretName: karavi-authorization-config
driverEnv:
  - name: X_CSI_AUTH_ENABLED
    value: "true"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_inject_sidecar_is_idempotent() {
        let mut spec = PodSpec {
            containers: vec![Container { name: DRIVER_CONTAINER.into(), ..Default::default() }],
            ..Default::default()
        };
        let module = module(vec![ComponentSpec {
            name: "karavi-authorization-proxy".into(),
            envs: vec![EnvVarSpec { name: "PROXY_HOST".into(), value: "authz.example.com".into() }],
            ..Default::default()
        }]);

        inject_sidecar(&mut spec, &fragment(), &module);
        inject_sidecar(&mut spec, &fragment(), &module);

        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 1);
        let driver = container_mut(&mut spec, DRIVER_CONTAINER).unwrap();
        assert_eq!(driver.env.as_ref().unwrap().len(), 1);
        let sidecar = container_mut(&mut spec, "karavi-authorization-proxy").unwrap();
        assert_eq!(env_value(sidecar, "PROXY_HOST"), Some("authz.example.com"));
    }

    #[test]
    fn test_component_enabled_defaults() {
        let m = module(vec![ComponentSpec {
            name: "metrics".into(),
            enabled: Some(false),
            ..Default::default()
        }]);
        assert!(!component_enabled(&m, "metrics"));
        assert!(component_enabled(&m, "topology"));
    }

    #[test]
    fn test_merge_cluster_role_without_role() {
        let mut rbac = Rbac::default();
        let rule = PolicyRule { verbs: vec!["get".into()], ..Default::default() };
        assert!(!merge_cluster_role(&mut rbac, &[rule]));
        assert!(merge_cluster_role(&mut rbac, &[]));
    }
}
