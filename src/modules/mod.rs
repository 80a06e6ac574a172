//! Module Injection Pipeline
//!
//! Optional modules layered onto a driver bundle:
//! - authorization: proxy sidecar on controller and node
//! - authorization-proxy-server: standalone proxy server
//! - replication: replicator sidecar plus the replication manager
//! - resiliency: podmon sidecar on controller and node
//! - observability: topology, metrics, OTEL collector and certificates
//! - application-mobility: controller manager and backup agent
//! - reverse-proxy: sidecar or standalone proxy in front of the driver
//!
//! Every transform is idempotent. A failing transform aborts the pipeline
//! and the partially mutated bundle is dropped.

pub mod authorization;
pub mod common;
pub mod mobility;
pub mod observability;
pub mod proxy_server;
pub mod replication;
pub mod resiliency;
pub mod reverse_proxy;

pub use authorization::Authorization;
pub use mobility::ApplicationMobility;
pub use observability::Observability;
pub use proxy_server::AuthorizationProxyServer;
pub use replication::Replication;
pub use resiliency::Resiliency;
pub use reverse_proxy::ReverseProxy;

use crate::crd::{DriverType, ModuleSpec, ModuleType};
use crate::domain::objects::ManagedObject;
use crate::error::{Error, Result};
use crate::manifest::bundle::{Bundle, DriverBundle};
use crate::manifest::resolver::{module_dir, ManifestResolver};
use crate::manifest::template::RenderContext;
use common::{apply_component_to_objects, RbacFragment, SidecarFragment};
use tracing::{debug, instrument};

// =============================================================================
// Module Environment
// =============================================================================

/// Everything a transform needs to render one module
pub struct ModuleEnv<'a> {
    pub resolver: &'a ManifestResolver,
    /// Render context with `CONFIG_VERSION` set to the module version
    pub render: RenderContext,
    pub spec: &'a ModuleSpec,
}

impl<'a> ModuleEnv<'a> {
    pub fn path(&self, file: &str) -> String {
        format!("{}/{}", module_dir(self.spec.name, &self.render.config_version), file)
    }

    /// Sidecar fragment, if this module version ships one
    pub fn sidecar(&self, file: &str) -> Result<Option<SidecarFragment>> {
        let path = self.path(file);
        if !self.resolver.tree().exists(&path) {
            return Ok(None);
        }
        self.resolver.render_fragment(&path, &self.render).map(Some)
    }

    /// RBAC fragment; empty when the module ships none
    pub fn rbac(&self) -> Result<RbacFragment> {
        let path = self.path("rbac.yaml");
        if !self.resolver.tree().exists(&path) {
            return Ok(RbacFragment::default());
        }
        self.resolver.render_fragment(&path, &self.render)
    }

    /// Standalone objects of one component with its overrides applied
    pub fn component_objects(&self, component: &str) -> Result<Vec<ManagedObject>> {
        let mut objects = self
            .resolver
            .render_objects(&self.path(&format!("{}.yaml", component)), &self.render)?;
        if let Some(overrides) = self.spec.component(component) {
            apply_component_to_objects(&mut objects, overrides);
        }
        Ok(objects)
    }
}

// =============================================================================
// Module Transform
// =============================================================================

/// A module's contribution to a bundle
pub trait ModuleTransform: Send + Sync {
    fn module(&self) -> ModuleType;

    /// Mutate the driver's workloads and RBAC
    fn inject(&self, _driver: &mut DriverBundle, _env: &ModuleEnv<'_>) -> Result<()> {
        Ok(())
    }

    /// Enabled components that render standalone objects
    fn components(&self, _spec: &ModuleSpec) -> Vec<&'static str> {
        Vec::new()
    }
}

/// Transform implementing a module
pub fn transform(module: ModuleType) -> &'static dyn ModuleTransform {
    match module {
        ModuleType::Authorization => &Authorization,
        ModuleType::AuthorizationProxyServer => &AuthorizationProxyServer,
        ModuleType::Replication => &Replication,
        ModuleType::Resiliency => &Resiliency,
        ModuleType::Observability => &Observability,
        ModuleType::ApplicationMobility => &ApplicationMobility,
        ModuleType::ReverseProxy => &ReverseProxy,
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Applies enabled modules to a bundle
pub struct ModulePipeline<'a> {
    resolver: &'a ManifestResolver,
    base: &'a RenderContext,
    driver: Option<(DriverType, &'a str)>,
}

impl<'a> ModulePipeline<'a> {
    pub fn new(
        resolver: &'a ManifestResolver,
        base: &'a RenderContext,
        driver: Option<(DriverType, &'a str)>,
    ) -> Self {
        Self { resolver, base, driver }
    }

    /// Resolve the module version and build its environment
    pub fn env<'s>(&'s self, spec: &'s ModuleSpec) -> Result<ModuleEnv<'s>> {
        let version = self.resolver.module_version(self.driver, spec)?;
        Ok(ModuleEnv {
            resolver: self.resolver,
            render: self.base.with_config_version(version),
            spec,
        })
    }

    /// Run every module in order over the bundle
    #[instrument(skip_all)]
    pub fn apply(&self, mut bundle: Bundle, modules: &[ModuleSpec]) -> Result<Bundle> {
        for spec in modules.iter().filter(|m| m.enabled) {
            self.apply_one(&mut bundle, spec)
                .map_err(|e| Error::in_module(spec.name, e))?;
        }
        Ok(bundle)
    }

    fn apply_one(&self, bundle: &mut Bundle, spec: &ModuleSpec) -> Result<()> {
        let module = transform(spec.name);
        let env = self.env(spec)?;

        if spec.name.requires_driver() {
            let driver = bundle
                .driver
                .as_mut()
                .ok_or_else(|| Error::InvalidConfig(format!("{} requires a driver", spec.name)))?;
            module.inject(driver, &env)?;
        }

        let mut extras = Vec::new();
        for component in module.components(spec) {
            extras.extend(env.component_objects(component)?);
        }
        debug!(
            module = %spec.name,
            version = %env.render.config_version,
            standalone = extras.len(),
            "Applied module"
        );
        bundle.push_extras(extras);
        Ok(())
    }

    /// Standalone objects of the named components, for cleanup
    pub fn standalone(&self, spec: &ModuleSpec, components: &[&str]) -> Result<Vec<ManagedObject>> {
        let env = self.env(spec)?;
        let mut objects = Vec::new();
        for component in components {
            objects.extend(env.component_objects(component)?);
        }
        Ok(objects)
    }
}
