//! Manifest Resolver
//!
//! Turns `{driver type, config version}` into a typed [`DriverBundle`] by
//! reading and rendering the templates of the configuration tree.

use crate::crd::{ClientType, DriverType, ModuleSpec, ModuleType};
use crate::domain::objects::ManagedObject;
use crate::domain::ports::{ConfigTree, ConfigTreeRef, KubeVersion};
use crate::error::{Error, Result};
use crate::manifest::bundle::{pick_daemon_set, pick_deployment, pick_stateful_set, DriverBundle, Workload};
use crate::manifest::template::{parse_fragment, parse_objects, render, RenderContext};
use k8s_openapi::api::apps::v1::StatefulSet;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

// =============================================================================
// Layout
// =============================================================================

pub const CONTROLLER_TEMPLATE: &str = "controller.yaml";
pub const NODE_TEMPLATE: &str = "node.yaml";
pub const CSIDRIVER_TEMPLATE: &str = "csidriver.yaml";
pub const CONFIG_PARAMS_TEMPLATE: &str = "driver-config-params.yaml";
pub const UPGRADE_PATH_FILE: &str = "upgrade-path.yaml";
pub const MODULES_FILE: &str = "modules.yaml";

pub fn driver_dir(driver: DriverType, version: &str) -> String {
    format!("driverconfig/{}/{}", driver.as_str(), version)
}

pub fn module_dir(module: ModuleType, version: &str) -> String {
    format!("moduleconfig/{}/{}", module.as_str(), version)
}

pub fn client_dir(client: ClientType, version: &str) -> String {
    format!("clientconfig/{}/{}", client.as_str(), version)
}

// =============================================================================
// Data Files
// =============================================================================

/// `common/k8s-<major>.<minor>-values.yaml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuesFile {
    #[serde(default)]
    pub images: BTreeMap<String, String>,
}

/// One entry of a driver version's `modules.yaml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleVersions {
    /// Version used when the module entry leaves `configVersion` empty
    pub default: String,
    /// Versions supported with this driver version
    #[serde(default)]
    pub versions: Vec<String>,
}

impl ModuleVersions {
    pub fn supports(&self, version: &str) -> bool {
        self.default == version || self.versions.iter().any(|v| v == version)
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Reads and renders templates from the configuration tree
#[derive(Clone)]
pub struct ManifestResolver {
    tree: ConfigTreeRef,
}

impl ManifestResolver {
    pub fn new(tree: ConfigTreeRef) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &dyn ConfigTree {
        self.tree.as_ref()
    }

    /// Image map for a cluster version.
    ///
    /// Falls back to the newest values file not newer than the cluster.
    #[instrument(skip(self))]
    pub fn images(&self, kube: KubeVersion) -> Result<BTreeMap<String, String>> {
        let exact = format!("common/k8s-{}-values.yaml", kube);
        let path = if self.tree.exists(&exact) {
            exact
        } else {
            let mut candidates: Vec<(KubeVersion, String)> = self
                .tree
                .list("common/k8s-*-values.yaml")?
                .into_iter()
                .filter_map(|p| values_file_version(&p).map(|v| (v, p)))
                .filter(|(v, _)| *v <= kube)
                .collect();
            candidates.sort();
            let (version, path) = candidates.pop().ok_or_else(|| Error::ConfigNotFound { path: exact })?;
            debug!(cluster = %kube, using = %version, "No exact values file, falling back");
            path
        };

        let values: ValuesFile = parse_fragment(&self.tree.read(&path)?)?;
        Ok(values.images)
    }

    /// A driver version is supported when its template directory exists
    pub fn supports_driver(&self, driver: DriverType, version: &str) -> bool {
        !version.is_empty()
            && self
                .tree
                .exists(&format!("{}/{}", driver_dir(driver, version), CONTROLLER_TEMPLATE))
    }

    /// Module compatibility table of a driver version
    pub fn module_versions(
        &self,
        driver: DriverType,
        version: &str,
    ) -> Result<BTreeMap<String, ModuleVersions>> {
        let path = format!("{}/{}", driver_dir(driver, version), MODULES_FILE);
        if !self.tree.exists(&path) {
            return Ok(BTreeMap::new());
        }
        parse_fragment(&self.tree.read(&path)?)
    }

    /// Effective configuration version of a module.
    ///
    /// An explicit version must be listed for the driver; an empty one takes
    /// the driver's default. Driverless modules must name a version that
    /// exists in the tree.
    pub fn module_version(
        &self,
        driver: Option<(DriverType, &str)>,
        module: &ModuleSpec,
    ) -> Result<String> {
        let unsupported = |version: &str, driver: &str| Error::UnsupportedModule {
            module: module.name.to_string(),
            version: version.to_string(),
            driver: driver.to_string(),
        };

        let Some((driver, driver_version)) = driver else {
            let version = module.config_version.as_str();
            let marker = format!("{}/{}", module_dir(module.name, version), UPGRADE_PATH_FILE);
            if version.is_empty() || !self.tree.exists(&marker) {
                return Err(unsupported(version, "none"));
            }
            return Ok(version.to_string());
        };

        let table = self.module_versions(driver, driver_version)?;
        let entry = table
            .get(module.name.as_str())
            .ok_or_else(|| unsupported(&module.config_version, driver.as_str()))?;

        if module.config_version.is_empty() {
            return Ok(entry.default.clone());
        }
        if entry.supports(&module.config_version) {
            Ok(module.config_version.clone())
        } else {
            Err(unsupported(&module.config_version, driver.as_str()))
        }
    }

    /// Render a template into typed objects
    pub fn render_objects(&self, relative: &str, ctx: &RenderContext) -> Result<Vec<ManagedObject>> {
        let text = self.tree.read(relative)?;
        let rendered = render(&text, ctx, relative)?;
        parse_objects(&rendered, relative)
    }

    /// Render a template into a fragment type
    pub fn render_fragment<T: DeserializeOwned>(&self, relative: &str, ctx: &RenderContext) -> Result<T> {
        let text = self.tree.read(relative)?;
        let rendered = render(&text, ctx, relative)?;
        parse_fragment(&rendered)
    }

    /// Build the base bundle of a driver at `ctx.config_version`
    #[instrument(skip(self, ctx), fields(version = %ctx.config_version))]
    pub fn resolve_driver(&self, driver: DriverType, ctx: &RenderContext) -> Result<DriverBundle> {
        let dir = driver_dir(driver, &ctx.config_version);
        let path = |file: &str| format!("{}/{}", dir, file);

        let controller = Workload::from_objects(
            self.render_objects(&path(CONTROLLER_TEMPLATE), ctx)?,
            CONTROLLER_TEMPLATE,
            pick_deployment,
        )?;
        let node = Workload::from_objects(
            self.render_objects(&path(NODE_TEMPLATE), ctx)?,
            NODE_TEMPLATE,
            pick_daemon_set,
        )?;

        let csi_driver = match single(self.render_objects(&path(CSIDRIVER_TEMPLATE), ctx)?, CSIDRIVER_TEMPLATE)? {
            ManagedObject::CsiDriver(d) => d,
            other => return Err(unexpected(CSIDRIVER_TEMPLATE, &other)),
        };
        let config_map =
            match single(self.render_objects(&path(CONFIG_PARAMS_TEMPLATE), ctx)?, CONFIG_PARAMS_TEMPLATE)? {
                ManagedObject::ConfigMap(c) => c,
                other => return Err(unexpected(CONFIG_PARAMS_TEMPLATE, &other)),
            };

        debug!(
            driver = %driver,
            controller_rbac = controller.rbac.len(),
            node_rbac = node.rbac.len(),
            "Resolved driver bundle"
        );

        Ok(DriverBundle {
            csi_driver,
            config_map,
            controller,
            node,
        })
    }

    /// Build the workload of a connectivity client at `ctx.config_version`
    pub fn resolve_client(&self, client: ClientType, ctx: &RenderContext) -> Result<Workload<StatefulSet>> {
        let dir = client_dir(client, &ctx.config_version);
        let mut objects = self.render_objects(&format!("{}/rbac.yaml", dir), ctx)?;
        objects.extend(self.render_objects(&format!("{}/statefulset.yaml", dir), ctx)?);
        Workload::from_objects(objects, "statefulset.yaml", pick_stateful_set)
    }
}

fn single(mut objects: Vec<ManagedObject>, template: &str) -> Result<ManagedObject> {
    if objects.len() != 1 {
        return Err(Error::TemplateRender {
            template: template.to_string(),
            reason: format!("expected one object, found {}", objects.len()),
        });
    }
    objects.pop().ok_or_else(|| Error::Internal("empty template".into()))
}

fn unexpected(template: &str, object: &ManagedObject) -> Error {
    Error::UnsupportedKind {
        template: template.to_string(),
        kind: object.kind().to_string(),
    }
}

fn values_file_version(path: &str) -> Option<KubeVersion> {
    let name = path.rsplit('/').next()?;
    let version = name.strip_prefix("k8s-")?.strip_suffix("-values.yaml")?;
    version.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::testing::shipped_resolver;
    use crate::manifest::DirConfigTree;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_values_file_version() {
        assert_eq!(
            values_file_version("common/k8s-1.28-values.yaml"),
            Some(KubeVersion::new(1, 28))
        );
        assert_eq!(values_file_version("common/images.yaml"), None);
    }

    #[test]
    fn test_images_fall_back_to_older_values() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("common")).unwrap();
        std::fs::write(dir.path().join("common/k8s-1.26-values.yaml"), "images:\n  driver: a\n").unwrap();
        std::fs::write(dir.path().join("common/k8s-1.28-values.yaml"), "images:\n  driver: b\n").unwrap();
        std::fs::write(dir.path().join("common/k8s-1.30-values.yaml"), "images:\n  driver: c\n").unwrap();

        let resolver = ManifestResolver::new(Arc::new(DirConfigTree::new(dir.path())));
        assert_eq!(resolver.images(KubeVersion::new(1, 28)).unwrap()["driver"], "b");
        assert_eq!(resolver.images(KubeVersion::new(1, 29)).unwrap()["driver"], "b");
        assert_eq!(resolver.images(KubeVersion::new(1, 31)).unwrap()["driver"], "c");

        let err = resolver.images(KubeVersion::new(1, 25)).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }

    #[test]
    fn test_resolve_shipped_drivers() {
        let resolver = shipped_resolver();
        for driver in DriverType::ALL {
            let mut ctx = RenderContext::new(driver.as_str(), "storage").with_config_version("v2.10.0");
            ctx.images = resolver.images(KubeVersion::new(1, 29)).unwrap();

            let bundle = resolver.resolve_driver(driver, &ctx).unwrap();
            assert_eq!(bundle.controller.rbac.len(), 3, "{}", driver);
            assert_eq!(bundle.node.rbac.len(), 3, "{}", driver);
            assert_eq!(bundle.ordered().len(), 10, "{}", driver);
        }
    }

    #[test]
    fn test_missing_version_is_config_not_found() {
        let resolver = shipped_resolver();
        let ctx = RenderContext::new("mayastor", "storage").with_config_version("v0.0.1");
        let err = resolver.resolve_driver(DriverType::Mayastor, &ctx).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
        assert!(!resolver.supports_driver(DriverType::Mayastor, "v0.0.1"));
        assert!(resolver.supports_driver(DriverType::Mayastor, "v2.10.0"));
    }

    #[test]
    fn test_module_version_resolution() {
        let resolver = shipped_resolver();
        let driver = Some((DriverType::Mayastor, "v2.10.0"));

        let mut module = ModuleSpec {
            name: ModuleType::Resiliency,
            enabled: true,
            config_version: String::new(),
            force_remove_module: false,
            components: vec![],
        };
        assert_eq!(resolver.module_version(driver, &module).unwrap(), "v1.9.0");

        module.config_version = "v0.1.0".into();
        assert!(matches!(
            resolver.module_version(driver, &module).unwrap_err(),
            Error::UnsupportedModule { .. }
        ));

        let proxy = ModuleSpec {
            name: ModuleType::AuthorizationProxyServer,
            enabled: true,
            config_version: "v2.0.0".into(),
            force_remove_module: false,
            components: vec![],
        };
        assert_eq!(resolver.module_version(None, &proxy).unwrap(), "v2.0.0");
    }
}
