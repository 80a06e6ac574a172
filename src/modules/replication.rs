//! Replication module
//!
//! Adds the replicator sidecar and replication-group permissions to the
//! controller, then deploys the replication controller manager.

use super::common::{component_enabled, inject_sidecar, merge_cluster_role};
use super::{ModuleEnv, ModuleTransform};
use crate::crd::{ModuleSpec, ModuleType};
use crate::error::{Error, Result};
use crate::manifest::bundle::DriverBundle;

pub const SIDECAR: &str = "csi-replicator";
pub const MANAGER: &str = "replication-controller-manager";

pub struct Replication;

impl ModuleTransform for Replication {
    fn module(&self) -> ModuleType {
        ModuleType::Replication
    }

    fn inject(&self, driver: &mut DriverBundle, env: &ModuleEnv<'_>) -> Result<()> {
        let sidecar = env
            .sidecar("controller-sidecar.yaml")?
            .ok_or_else(|| Error::ConfigNotFound {
                path: env.path("controller-sidecar.yaml"),
            })?;
        inject_sidecar(driver.controller_pod_spec(), &sidecar, env.spec);

        // The sidecar is useless without access to replication groups
        let rbac = env.rbac()?;
        if !merge_cluster_role(&mut driver.controller.rbac, &rbac.controller) {
            return Err(Error::module(self.module(), "controller has no cluster role"));
        }
        Ok(())
    }

    fn components(&self, spec: &ModuleSpec) -> Vec<&'static str> {
        if component_enabled(spec, MANAGER) {
            vec![MANAGER]
        } else {
            Vec::new()
        }
    }
}
