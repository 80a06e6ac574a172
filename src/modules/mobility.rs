//! Application mobility module: controller manager plus a per-node backup agent

use super::common::component_enabled;
use super::ModuleTransform;
use crate::crd::{ModuleSpec, ModuleType};

pub const CONTROLLER_MANAGER: &str = "controller-manager";
pub const BACKUP_AGENT: &str = "backup-agent";

pub struct ApplicationMobility;

impl ModuleTransform for ApplicationMobility {
    fn module(&self) -> ModuleType {
        ModuleType::ApplicationMobility
    }

    fn components(&self, spec: &ModuleSpec) -> Vec<&'static str> {
        [CONTROLLER_MANAGER, BACKUP_AGENT]
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
    fn test_backup_agent_can_be_disabled() {
        let spec = ModuleSpec {
            name: ModuleType::ApplicationMobility,
            enabled: true,
            config_version: String::new(),
            force_remove_module: false,
            components: vec![ComponentSpec {
                name: BACKUP_AGENT.into(),
                enabled: Some(false),
                ..Default::default()
            }],
        };
        assert_eq!(ApplicationMobility.components(&spec), vec![CONTROLLER_MANAGER]);
    }
}
