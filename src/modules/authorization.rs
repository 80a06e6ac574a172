//! Authorization module
//!
//! Injects the authorization proxy sidecar into the controller and node
//! workloads and points the driver at it.

use super::common::inject_sidecar;
use super::{ModuleEnv, ModuleTransform};
use crate::crd::{ModuleSpec, ModuleType};
use crate::error::{Error, Result};
use crate::manifest::bundle::DriverBundle;

/// Sidecar container name, also the component carrying its overrides
pub const SIDECAR: &str = "karavi-authorization-proxy";

/// Secret holding the proxy configuration
pub const CONFIG_SECRET: &str = "karavi-authorization-config";

/// Secret holding the access and refresh tokens
pub const TOKEN_SECRET: &str = "proxy-authz-tokens";

/// Secret holding the proxy server root certificate
pub const ROOT_CERT_SECRET: &str = "proxy-server-root-certificate";

pub struct Authorization;

impl Authorization {
    /// Proxy host configured on the sidecar component
    pub fn proxy_host(spec: &ModuleSpec) -> Option<&str> {
        spec.component(SIDECAR)
            .and_then(|c| c.env("PROXY_HOST"))
            .filter(|h| !h.is_empty())
    }

    /// Whether the sidecar skips proxy certificate validation (default true)
    pub fn skip_certificate_validation(spec: &ModuleSpec) -> bool {
        spec.component(SIDECAR)
            .and_then(|c| c.env("SKIP_CERTIFICATE_VALIDATION"))
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true)
    }
}

impl ModuleTransform for Authorization {
    fn module(&self) -> ModuleType {
        ModuleType::Authorization
    }

    fn inject(&self, driver: &mut DriverBundle, env: &ModuleEnv<'_>) -> Result<()> {
        let controller = env
            .sidecar("controller-sidecar.yaml")?
            .ok_or_else(|| Error::ConfigNotFound {
                path: env.path("controller-sidecar.yaml"),
            })?;
        inject_sidecar(driver.controller_pod_spec(), &controller, env.spec);

        let node = env.sidecar("node-sidecar.yaml")?.ok_or_else(|| Error::ConfigNotFound {
            path: env.path("node-sidecar.yaml"),
        })?;
        inject_sidecar(driver.node_pod_spec(), &node, env.spec);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ComponentSpec, DriverType, EnvVarSpec};
    use crate::domain::ports::KubeVersion;
    use crate::manifest::patch::{container_mut, env_value, has_container, DRIVER_CONTAINER};
    use crate::manifest::testing::shipped_resolver;
    use crate::manifest::{Bundle, RenderContext};
    use crate::modules::ModulePipeline;

    fn spec(version: &str) -> ModuleSpec {
        ModuleSpec {
            name: ModuleType::Authorization,
            enabled: true,
            config_version: version.into(),
            force_remove_module: false,
            components: vec![ComponentSpec {
                name: SIDECAR.into(),
                envs: vec![EnvVarSpec { name: "PROXY_HOST".into(), value: "authz.example.com".into() }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_sidecar_on_both_workloads() {
        let resolver = shipped_resolver();
        let mut ctx = RenderContext::new("mayastor", "storage").with_config_version("v2.10.0");
        ctx.images = resolver.images(KubeVersion::new(1, 29)).unwrap();
        let driver = resolver.resolve_driver(DriverType::Mayastor, &ctx).unwrap();
        let pipeline = ModulePipeline::new(&resolver, &ctx, Some((DriverType::Mayastor, "v2.10.0")));

        let bundle = pipeline.apply(Bundle::new(Some(driver)), &[spec("")]).unwrap();
        let mut driver = bundle.driver.unwrap();

        let controller = driver.controller_pod_spec();
        assert!(has_container(controller, SIDECAR));
        let sidecar = container_mut(controller, SIDECAR).unwrap();
        assert_eq!(env_value(sidecar, "PROXY_HOST"), Some("authz.example.com"));
        let main = container_mut(controller, DRIVER_CONTAINER).unwrap();
        assert_eq!(env_value(main, "X_CSI_AUTH_ENABLED"), Some("true"));

        assert!(has_container(driver.node_pod_spec(), SIDECAR));
    }

    #[test]
    fn test_spec_helpers() {
        let s = spec("v2.0.0");
        assert_eq!(Authorization::proxy_host(&s), Some("authz.example.com"));
        assert!(Authorization::skip_certificate_validation(&s));

        let mut empty = s.clone();
        empty.components.clear();
        assert_eq!(Authorization::proxy_host(&empty), None);
    }
}
