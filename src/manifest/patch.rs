//! Idempotent edits on pod specs and RBAC rules
//!
//! Every helper here can be applied any number of times with the same result:
//! containers, volumes and env entries are upserted by name, rules are merged.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, Volume, VolumeMount};
use k8s_openapi::api::rbac::v1::PolicyRule;
use std::collections::BTreeMap;

/// Name of the driver container in controller and node templates
pub const DRIVER_CONTAINER: &str = "driver";

// =============================================================================
// Pod Spec Access
// =============================================================================

pub fn deployment_pod_spec(deployment: &mut Deployment) -> &mut PodSpec {
    deployment
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default)
}

pub fn daemon_set_pod_spec(daemon_set: &mut DaemonSet) -> &mut PodSpec {
    daemon_set
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default)
}

pub fn stateful_set_pod_spec(stateful_set: &mut StatefulSet) -> &mut PodSpec {
    stateful_set
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default)
}

/// Pod template labels of a workload object
pub fn template_labels_mut(
    template: &mut k8s_openapi::api::core::v1::PodTemplateSpec,
) -> &mut BTreeMap<String, String> {
    template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(Default::default)
}

// =============================================================================
// Containers
// =============================================================================

pub fn container_mut<'a>(spec: &'a mut PodSpec, name: &str) -> Option<&'a mut Container> {
    spec.containers.iter_mut().find(|c| c.name == name)
}

pub fn has_container(spec: &PodSpec, name: &str) -> bool {
    spec.containers.iter().any(|c| c.name == name)
}

/// Insert a container, replacing any container with the same name
pub fn upsert_container(spec: &mut PodSpec, container: Container) {
    match spec.containers.iter_mut().find(|c| c.name == container.name) {
        Some(existing) => *existing = container,
        None => spec.containers.push(container),
    }
}

pub fn remove_container(spec: &mut PodSpec, name: &str) -> bool {
    let before = spec.containers.len();
    spec.containers.retain(|c| c.name != name);
    before != spec.containers.len()
}

pub fn remove_init_container(spec: &mut PodSpec, name: &str) -> bool {
    let Some(init) = spec.init_containers.as_mut() else {
        return false;
    };
    let before = init.len();
    init.retain(|c| c.name != name);
    let removed = before != init.len();
    if init.is_empty() {
        spec.init_containers = None;
    }
    removed
}

// =============================================================================
// Environment
// =============================================================================

pub fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.as_deref())
}

/// Set a plain env value, replacing an existing entry
pub fn upsert_env(container: &mut Container, name: &str, value: &str) {
    upsert_env_var(
        container,
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        },
    );
}

pub fn upsert_env_var(container: &mut Container, var: EnvVar) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == var.name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}

// =============================================================================
// Volumes
// =============================================================================

pub fn upsert_volume(spec: &mut PodSpec, volume: Volume) {
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}

/// Remove a volume and every mount of it, including init containers
pub fn remove_volume(spec: &mut PodSpec, name: &str) -> bool {
    let mut removed = false;
    if let Some(volumes) = spec.volumes.as_mut() {
        let before = volumes.len();
        volumes.retain(|v| v.name != name);
        removed = before != volumes.len();
    }

    let init = spec.init_containers.iter_mut().flatten();
    for container in spec.containers.iter_mut().chain(init) {
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.retain(|m| m.name != name);
            if mounts.is_empty() {
                container.volume_mounts = None;
            }
        }
    }
    removed
}

pub fn upsert_volume_mount(container: &mut Container, mount: VolumeMount) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    match mounts.iter_mut().find(|m| m.name == mount.name) {
        Some(existing) => *existing = mount,
        None => mounts.push(mount),
    }
}

pub fn has_volume(spec: &PodSpec, name: &str) -> bool {
    spec.volumes
        .as_ref()
        .map(|vs| vs.iter().any(|v| v.name == name))
        .unwrap_or(false)
}

// =============================================================================
// RBAC
// =============================================================================

fn same_target(a: &PolicyRule, b: &PolicyRule) -> bool {
    a.api_groups == b.api_groups
        && a.resources == b.resources
        && a.resource_names == b.resource_names
        && a.non_resource_urls == b.non_resource_urls
}

/// Merge rules: verbs are unioned into a rule with the same target,
/// otherwise the rule is appended
pub fn merge_rules(rules: &mut Vec<PolicyRule>, extra: &[PolicyRule]) {
    for rule in extra {
        match rules.iter_mut().find(|r| same_target(r, rule)) {
            Some(existing) => {
                for verb in &rule.verbs {
                    if !existing.verbs.contains(verb) {
                        existing.verbs.push(verb.clone());
                    }
                }
            }
            None => rules.push(rule.clone()),
        }
    }
}
