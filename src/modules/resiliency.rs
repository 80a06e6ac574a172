//! Resiliency module
//!
//! Adds the podmon sidecar to both driver workloads along with the
//! permissions it needs to fence and reschedule pods.

use super::common::{inject_sidecar, merge_cluster_role};
use super::{ModuleEnv, ModuleTransform};
use crate::crd::ModuleType;
use crate::error::{Error, Result};
use crate::manifest::bundle::DriverBundle;

pub const SIDECAR: &str = "podmon";

pub struct Resiliency;

impl ModuleTransform for Resiliency {
    fn module(&self) -> ModuleType {
        ModuleType::Resiliency
    }

    fn inject(&self, driver: &mut DriverBundle, env: &ModuleEnv<'_>) -> Result<()> {
        let rbac = env.rbac()?;

        if let Some(fragment) = env.sidecar("controller-sidecar.yaml")? {
            inject_sidecar(driver.controller_pod_spec(), &fragment, env.spec);
        }
        if !merge_cluster_role(&mut driver.controller.rbac, &rbac.controller) {
            return Err(Error::module(self.module(), "controller has no cluster role"));
        }

        if let Some(fragment) = env.sidecar("node-sidecar.yaml")? {
            inject_sidecar(driver.node_pod_spec(), &fragment, env.spec);
        }
        if !merge_cluster_role(&mut driver.node.rbac, &rbac.node) {
            return Err(Error::module(self.module(), "node has no cluster role"));
        }
        Ok(())
    }
}
