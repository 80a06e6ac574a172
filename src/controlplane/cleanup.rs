//! Differential Cleanup
//!
//! The synchronizer only creates and updates. Standalone objects of modules
//! and components switched off since the last successful sync are deleted
//! here, rendered with the configuration they were created from.

use super::snapshot::{enabled_modules, AppliedSnapshot};
use super::sync::{ExtensionFailures, Synchronizer};
use crate::crd::{ContainerStorageModuleSpec, ModuleSpec};
use crate::domain::ports::ClusterApi;
use crate::error::Result;
use crate::manifest::bundle::InstanceRef;
use crate::manifest::resolver::ManifestResolver;
use crate::manifest::template::RenderContext;
use crate::modules::{transform, ModulePipeline};
use tracing::{info, instrument, warn};

/// Standalone components of one module that are no longer wanted
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    /// Module entry as it was last applied
    pub module: ModuleSpec,
    pub components: Vec<&'static str>,
    /// The whole module was switched off
    pub whole_module: bool,
}

/// Compare the last applied spec with the current one
pub fn plan(previous: &AppliedSnapshot, current: &ContainerStorageModuleSpec) -> Vec<Removal> {
    let now = enabled_modules(current);
    let mut removals = Vec::new();

    for before in previous.spec.modules.iter().filter(|m| m.enabled) {
        let was = transform(before.name).components(before);
        let (components, whole_module) = match now.get(&before.name) {
            Some(after) => {
                let is = transform(after.name).components(after);
                (was.into_iter().filter(|c| !is.contains(c)).collect::<Vec<_>>(), false)
            }
            None => (was, true),
        };
        if !components.is_empty() {
            removals.push(Removal {
                module: before.clone(),
                components,
                whole_module,
            });
        }
    }
    removals
}

pub struct DifferentialCleanup<'a> {
    resolver: &'a ManifestResolver,
    cluster: &'a dyn ClusterApi,
    instance: &'a InstanceRef,
}

impl<'a> DifferentialCleanup<'a> {
    pub fn new(
        resolver: &'a ManifestResolver,
        cluster: &'a dyn ClusterApi,
        instance: &'a InstanceRef,
    ) -> Self {
        Self {
            resolver,
            cluster,
            instance,
        }
    }

    /// Delete what `plan` finds; returns the number of deleted objects.
    ///
    /// `base` carries the current render values; the driver version is taken
    /// from the snapshot.
    #[instrument(skip_all, fields(instance = %self.instance.key()))]
    pub async fn run(
        &self,
        previous: &AppliedSnapshot,
        current: &ContainerStorageModuleSpec,
        base: &RenderContext,
    ) -> Result<usize> {
        let removals = plan(previous, current);
        if removals.is_empty() {
            return Ok(0);
        }

        let driver = &previous.spec.driver;
        let mut render = base.with_config_version(driver.config_version.clone());
        render.driver = driver
            .csi_driver_type
            .map(|d| d.as_str().to_string())
            .unwrap_or_default();
        let pipeline = ModulePipeline::new(
            self.resolver,
            &render,
            driver.csi_driver_type.map(|d| (d, driver.config_version.as_str())),
        );
        let sync = Synchronizer::new(self.cluster, self.instance);

        let mut deleted = 0;
        for removal in removals {
            let objects = match pipeline.standalone(&removal.module, &removal.components) {
                Ok(objects) => objects,
                Err(e) => {
                    // Nothing to go on once the old templates are gone
                    warn!(
                        module = %removal.module.name,
                        error = %e,
                        "Can't render previous configuration, skipping cleanup"
                    );
                    continue;
                }
            };
            deleted += sync.remove_all(objects, ExtensionFailures::Warn).await?;
            info!(
                module = %removal.module.name,
                components = ?removal.components,
                whole_module = removal.whole_module,
                "Removed disabled components"
            );
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ComponentSpec, DriverType, ModuleType};
    use crate::controlplane::drivers::testing::csm;

    fn module(name: ModuleType, components: Vec<ComponentSpec>) -> ModuleSpec {
        ModuleSpec {
            name,
            enabled: true,
            config_version: String::new(),
            force_remove_module: false,
            components,
        }
    }

    fn disabled(name: &str) -> ComponentSpec {
        ComponentSpec {
            name: name.into(),
            enabled: Some(false),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_whole_module() {
        let mut resource = csm("mayastor", DriverType::Mayastor);
        resource.spec.modules = vec![
            module(ModuleType::Observability, vec![]),
            module(ModuleType::Authorization, vec![]),
        ];
        let previous = AppliedSnapshot::capture(&resource.spec);

        resource.spec.modules[0].enabled = false;
        resource.spec.modules.remove(1);
        let removals = plan(&previous, &resource.spec);

        // authorization has no standalone objects
        assert_eq!(removals.len(), 1);
        assert!(removals[0].whole_module);
        assert_eq!(removals[0].components, vec!["topology", "otel-collector", "metrics"]);
    }

    #[test]
    fn test_plan_single_component() {
        let mut resource = csm("mayastor", DriverType::Mayastor);
        resource.spec.modules = vec![module(ModuleType::Observability, vec![])];
        let previous = AppliedSnapshot::capture(&resource.spec);

        resource.spec.modules[0].components.push(disabled("metrics"));
        let removals = plan(&previous, &resource.spec);
        assert_eq!(removals.len(), 1);
        assert!(!removals[0].whole_module);
        assert_eq!(removals[0].components, vec!["metrics"]);

        // Nothing changes when nothing was switched off
        let unchanged = AppliedSnapshot::capture(&resource.spec);
        assert!(plan(&unchanged, &resource.spec).is_empty());
    }

    #[test]
    fn test_plan_reverse_proxy_mode_switch() {
        use crate::crd::EnvVarSpec;

        let mut resource = csm("rustfs", DriverType::RustFS);
        let standalone = ComponentSpec {
            name: "reverse-proxy".into(),
            envs: vec![EnvVarSpec { name: "DeployAsSidecar".into(), value: "false".into() }],
            ..Default::default()
        };
        resource.spec.modules = vec![module(ModuleType::ReverseProxy, vec![standalone])];
        let previous = AppliedSnapshot::capture(&resource.spec);

        resource.spec.modules[0].components.clear();
        let removals = plan(&previous, &resource.spec);
        assert_eq!(removals[0].components, vec!["reverse-proxy"]);
    }
}
