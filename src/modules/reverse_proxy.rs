//! Reverse proxy module
//!
//! The proxy runs either as a sidecar of the controller or as its own
//! deployment behind a service. Both modes share one config map.

use super::common::inject_sidecar;
use super::{ModuleEnv, ModuleTransform};
use crate::crd::{ModuleSpec, ModuleType};
use crate::error::{Error, Result};
use crate::manifest::bundle::DriverBundle;

/// Component carrying the proxy's mode, port and image overrides
pub const COMPONENT: &str = "reverse-proxy";
pub const CONFIG: &str = "reverse-proxy-config";

pub const DEFAULT_PORT: u16 = 2222;

pub struct ReverseProxy;

impl ReverseProxy {
    /// Sidecar mode unless the component sets `DeployAsSidecar` to false
    pub fn deploy_as_sidecar(spec: &ModuleSpec) -> bool {
        spec.component(COMPONENT)
            .and_then(|c| c.env("DeployAsSidecar"))
            .map(|v| !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true)
    }

    /// Service port of a standalone proxy
    pub fn port(spec: &ModuleSpec) -> u16 {
        spec.component(COMPONENT)
            .and_then(|c| c.env("Port"))
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// In-cluster endpoint of a standalone proxy
    pub fn service_endpoint(spec: &ModuleSpec, release: &str, namespace: &str) -> String {
        format!(
            "{}-reverseproxy.{}.svc.cluster.local:{}",
            release,
            namespace,
            Self::port(spec)
        )
    }
}

impl ModuleTransform for ReverseProxy {
    fn module(&self) -> ModuleType {
        ModuleType::ReverseProxy
    }

    fn inject(&self, driver: &mut DriverBundle, env: &ModuleEnv<'_>) -> Result<()> {
        if !Self::deploy_as_sidecar(env.spec) {
            return Ok(());
        }
        let mut fragment = env
            .sidecar("controller-sidecar.yaml")?
            .ok_or_else(|| Error::ConfigNotFound {
                path: env.path("controller-sidecar.yaml"),
            })?;
        // The sidecar listens on the same port a standalone proxy would serve
        for container in fragment.containers.iter_mut().filter(|c| c.name == COMPONENT) {
            crate::manifest::patch::upsert_env(
                container,
                "X_CSI_REVPROXY_PORT",
                &Self::port(env.spec).to_string(),
            );
        }
        inject_sidecar(driver.controller_pod_spec(), &fragment, env.spec);
        Ok(())
    }

    fn components(&self, spec: &ModuleSpec) -> Vec<&'static str> {
        if Self::deploy_as_sidecar(spec) {
            vec![CONFIG]
        } else {
            vec![CONFIG, COMPONENT]
        }
    }
}
