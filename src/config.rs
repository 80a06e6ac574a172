//! Operator configuration

use crate::domain::ports::{KubeVersion, Platform};
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Default location of the manifest tree inside the operator image
pub const DEFAULT_CONFIG_DIR: &str = "/etc/storage-operator/operatorconfig";

/// Runtime settings of the operator
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Root of the driver/module/client manifest tree
    pub config_dir: PathBuf,
    /// Distribution the manifests are adjusted for
    pub platform: Platform,
    /// Restrict the controllers to one namespace
    pub watch_namespace: Option<String>,
    /// Reconciles running at once per resource kind
    pub max_concurrent_reconciles: u16,
    /// Overrides the version reported by the API server
    pub kube_version: Option<KubeVersion>,
    /// Written to the operator-version annotation
    pub operator_version: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            platform: Platform::Kubernetes,
            watch_namespace: None,
            max_concurrent_reconciles: 1,
            kube_version: None,
            operator_version: crate::VERSION.to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::Configuration(
                "max concurrent reconciles must be at least 1".into(),
            ));
        }
        if !self.config_dir.is_dir() {
            return Err(Error::Configuration(format!(
                "config directory {} does not exist",
                self.config_dir.display()
            )));
        }
        Ok(())
    }
}
