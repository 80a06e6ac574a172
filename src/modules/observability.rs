//! Observability module
//!
//! Standalone topology, metrics and OTEL collector deployments. Certificates
//! for the collector are only issued when `cert-manager` is requested
//! explicitly, since it needs the cert-manager API in the cluster.

use super::common::component_enabled;
use super::ModuleTransform;
use crate::crd::{ComponentSpec, ModuleSpec, ModuleType};

pub const TOPOLOGY: &str = "topology";
pub const OTEL_COLLECTOR: &str = "otel-collector";
pub const METRICS: &str = "metrics";
pub const CERT_MANAGER: &str = "cert-manager";

pub struct Observability;

impl ModuleTransform for Observability {
    fn module(&self) -> ModuleType {
        ModuleType::Observability
    }

    fn components(&self, spec: &ModuleSpec) -> Vec<&'static str> {
        let mut components: Vec<&'static str> = [TOPOLOGY, OTEL_COLLECTOR, METRICS]
            .into_iter()
            .filter(|c| component_enabled(spec, c))
            .collect();
        if spec.component(CERT_MANAGER).is_some_and(ComponentSpec::is_enabled) {
            components.push(CERT_MANAGER);
        }
        components
    }
}
