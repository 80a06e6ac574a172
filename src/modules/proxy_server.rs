//! Authorization proxy server module
//!
//! Standalone install of the authorization proxy server and its tenant
//! service. Runs without a driver.

use super::common::component_enabled;
use super::ModuleTransform;
use crate::crd::{ModuleSpec, ModuleType};

pub const COMPONENTS: [&str; 2] = ["proxy-server", "tenant-service"];

pub struct AuthorizationProxyServer;

impl ModuleTransform for AuthorizationProxyServer {
    fn module(&self) -> ModuleType {
        ModuleType::AuthorizationProxyServer
    }

    fn components(&self, spec: &ModuleSpec) -> Vec<&'static str> {
        COMPONENTS
            .into_iter()
            .filter(|c| component_enabled(spec, c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ComponentSpec;

    #[test]
    fn test_tenant_service_can_be_disabled() {
        let spec = ModuleSpec {
            name: ModuleType::AuthorizationProxyServer,
            enabled: true,
            config_version: "v2.0.0".into(),
            force_remove_module: false,
            components: vec![ComponentSpec {
                name: "tenant-service".into(),
                enabled: Some(false),
                ..Default::default()
            }],
        };
        assert_eq!(AuthorizationProxyServer.components(&spec), vec!["proxy-server"]);
    }
}
