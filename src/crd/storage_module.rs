//! ContainerStorageModule CRD
//!
//! Declares which CSI driver to install, at which configuration version, and
//! which optional modules to layer on top of it.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use super::{ANNOTATION_CONFIG_VERSION, CSM_FINALIZER};
use crate::domain::ports::ManagedResource;

// =============================================================================
// ContainerStorageModule CRD
// =============================================================================

/// ContainerStorageModule describes a CSI driver installation and the
/// optional cross-cutting modules injected into it.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "ContainerStorageModule",
    plural = "containerstoragemodules",
    shortname = "csm",
    status = "ContainerStorageModuleStatus",
    printcolumn = r#"{"name": "Driver", "type": "string", "jsonPath": ".spec.driver.csiDriverType"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.driver.configVersion"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStorageModuleSpec {
    /// Driver installation settings
    #[serde(default)]
    pub driver: DriverSpec,

    /// Optional modules, applied in list order
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

// =============================================================================
// Driver
// =============================================================================

/// CSI driver flavours the operator knows how to install
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    /// Block storage (NVMe-oF)
    Mayastor,
    /// File storage
    #[serde(rename = "seaweedfs")]
    SeaweedFS,
    /// Object storage (S3 gateway backed)
    #[serde(rename = "rustfs")]
    RustFS,
}

impl DriverType {
    pub const ALL: [DriverType; 3] = [DriverType::Mayastor, DriverType::SeaweedFS, DriverType::RustFS];

    /// Directory and resource-name prefix for this driver
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverType::Mayastor => "mayastor",
            DriverType::SeaweedFS => "seaweedfs",
            DriverType::RustFS => "rustfs",
        }
    }

    /// CSI plugin name registered with the kubelet
    pub fn plugin_name(&self) -> String {
        format!("csi-{}.storage.billyronks.io", self.as_str())
    }
}

impl std::fmt::Display for DriverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DriverType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mayastor" => Ok(DriverType::Mayastor),
            "seaweedfs" => Ok(DriverType::SeaweedFS),
            "rustfs" => Ok(DriverType::RustFS),
            other => Err(format!("unknown driver type '{}'", other)),
        }
    }
}

/// Driver installation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverSpec {
    /// Driver type; absent or empty means no driver is installed
    #[serde(default, deserialize_with = "empty_as_none")]
    #[schemars(with = "Option<String>")]
    pub csi_driver_type: Option<DriverType>,

    /// Configuration version (e.g. v2.10.0)
    #[serde(default)]
    pub config_version: String,

    /// Controller replica count
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Delete every driver object when the resource is deleted
    #[serde(default)]
    pub force_removal: bool,

    /// Settings shared by controller and node containers
    #[serde(default)]
    pub common: ContainerOverride,

    /// Controller-only settings
    #[serde(default)]
    pub controller: ContainerOverride,

    /// Node-only settings
    #[serde(default)]
    pub node: ContainerOverride,

    /// Sidecar image and env overrides, matched by container name
    #[serde(default)]
    pub side_cars: Vec<SidecarSpec>,
}

impl Default for DriverSpec {
    fn default() -> Self {
        Self {
            csi_driver_type: None,
            config_version: String::new(),
            replicas: default_replicas(),
            force_removal: false,
            common: ContainerOverride::default(),
            controller: ContainerOverride::default(),
            node: ContainerOverride::default(),
            side_cars: Vec::new(),
        }
    }
}

/// Overrides applied to the driver container of a workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverride {
    /// Driver image
    #[serde(default)]
    pub image: Option<String>,

    /// Image pull policy
    #[serde(default)]
    pub image_pull_policy: Option<String>,

    /// Environment variables
    #[serde(default)]
    pub envs: Vec<EnvVarSpec>,

    /// Node selector for the pod template
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations for the pod template
    #[serde(default)]
    pub tolerations: Vec<TolerationSpec>,
}

/// Simple name/value environment variable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Pod toleration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TolerationSpec {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub effect: Option<String>,
}

/// Sidecar override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSpec {
    /// Container name in the template (e.g. provisioner)
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub envs: Vec<EnvVarSpec>,
}

// =============================================================================
// Modules
// =============================================================================

/// Optional modules that can be layered onto a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleType {
    Authorization,
    AuthorizationProxyServer,
    Replication,
    Resiliency,
    Observability,
    ApplicationMobility,
    ReverseProxy,
}

impl ModuleType {
    /// Directory name under moduleconfig/
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleType::Authorization => "authorization",
            ModuleType::AuthorizationProxyServer => "authorization-proxy-server",
            ModuleType::Replication => "replication",
            ModuleType::Resiliency => "resiliency",
            ModuleType::Observability => "observability",
            ModuleType::ApplicationMobility => "application-mobility",
            ModuleType::ReverseProxy => "reverse-proxy",
        }
    }

    /// Whether this module may not cross a major version in one update
    pub fn is_major_versioned(&self) -> bool {
        matches!(self, ModuleType::Authorization)
    }

    /// Whether this module needs a driver to inject into
    pub fn requires_driver(&self) -> bool {
        !matches!(self, ModuleType::AuthorizationProxyServer)
    }
}

impl std::fmt::Display for ModuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ModuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization" => Ok(ModuleType::Authorization),
            "authorization-proxy-server" => Ok(ModuleType::AuthorizationProxyServer),
            "replication" => Ok(ModuleType::Replication),
            "resiliency" => Ok(ModuleType::Resiliency),
            "observability" => Ok(ModuleType::Observability),
            "application-mobility" => Ok(ModuleType::ApplicationMobility),
            "reverse-proxy" => Ok(ModuleType::ReverseProxy),
            other => Err(format!("unknown module '{}'", other)),
        }
    }
}

/// One module entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// Module name
    pub name: ModuleType,

    /// Whether the module is installed
    #[serde(default)]
    pub enabled: bool,

    /// Module configuration version; empty selects the driver's default
    #[serde(default)]
    pub config_version: String,

    /// Delete the module's standalone objects when the resource is deleted
    #[serde(default)]
    pub force_remove_module: bool,

    /// Module components
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
}

impl ModuleSpec {
    /// Look up a component by name
    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Component of a module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub name: String,

    /// Unset means enabled
    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub envs: Vec<EnvVarSpec>,
}

impl ComponentSpec {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Value of an env entry on this component
    pub fn env(&self, name: &str) -> Option<&str> {
        self.envs
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle state of a managed resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StatusState {
    #[default]
    NoState,
    Creating,
    Updating,
    Running,
    Failed,
    InvalidConfig,
    Succeeded,
}

impl StatusState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: StatusState) -> bool {
        use StatusState::*;

        if *self == next || next == InvalidConfig {
            return true;
        }
        match self {
            NoState => matches!(next, Creating),
            Creating => matches!(next, Running | Failed | Succeeded),
            Updating => matches!(next, Running | Failed | Succeeded),
            Running => matches!(next, Updating | Failed | Succeeded),
            Succeeded => matches!(next, Updating | Running | Failed),
            Failed => matches!(next, Creating | Updating | Running),
            InvalidConfig => matches!(next, Creating | Updating),
        }
    }

    /// Move to `next` when permitted, otherwise stay put
    pub fn advance(self, next: StatusState) -> StatusState {
        if self.can_transition_to(next) {
            next
        } else {
            self
        }
    }
}

impl std::fmt::Display for StatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusState::NoState => "NoState",
            StatusState::Creating => "Creating",
            StatusState::Updating => "Updating",
            StatusState::Running => "Running",
            StatusState::Failed => "Failed",
            StatusState::InvalidConfig => "InvalidConfig",
            StatusState::Succeeded => "Succeeded",
        };
        write!(f, "{}", s)
    }
}

/// Replica counters of one workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub desired: i32,
    #[serde(default)]
    pub available: i32,
    #[serde(default)]
    pub failed: i32,
}

impl WorkloadStatus {
    pub fn new(desired: i32, available: i32) -> Self {
        Self {
            desired,
            available,
            failed: (desired - available).max(0),
        }
    }

    /// All desired replicas are available
    pub fn is_healthy(&self) -> bool {
        self.desired > 0 && self.available >= self.desired
    }
}

/// Status of a ContainerStorageModule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStorageModuleStatus {
    #[serde(default)]
    pub state: StatusState,

    /// Controller Deployment counters
    #[serde(default)]
    pub controller_status: WorkloadStatus,

    /// Node DaemonSet counters
    #[serde(default)]
    pub node_status: WorkloadStatus,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_updated: Option<DateTime<Utc>>,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_replicas() -> i32 {
    2
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<DriverType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl ContainerStorageModule {
    /// Installed driver, if any
    pub fn driver_type(&self) -> Option<DriverType> {
        self.spec.driver.csi_driver_type
    }

    /// Modules with `enabled: true`, in spec order
    pub fn enabled_modules(&self) -> impl Iterator<Item = &ModuleSpec> {
        self.spec.modules.iter().filter(|m| m.enabled)
    }

    /// Find a module entry
    pub fn module(&self, module: ModuleType) -> Option<&ModuleSpec> {
        self.spec.modules.iter().find(|m| m.name == module)
    }

    /// Whether a module is present and enabled
    pub fn is_module_enabled(&self, module: ModuleType) -> bool {
        self.module(module).map(|m| m.enabled).unwrap_or(false)
    }

    /// Install consisting only of the authorization proxy server
    pub fn is_proxy_server_install(&self) -> bool {
        self.driver_type().is_none() && self.is_module_enabled(ModuleType::AuthorizationProxyServer)
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CSM_FINALIZER)
    }

    /// Configuration version recorded by the last annotate step
    pub fn applied_config_version(&self) -> Option<&str> {
        self.annotations()
            .get(ANNOTATION_CONFIG_VERSION)
            .map(String::as_str)
    }

    /// Current lifecycle state
    pub fn state(&self) -> StatusState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Value of a driver env, node entries overriding common ones
    pub fn driver_env(&self, name: &str) -> Option<&str> {
        let driver = &self.spec.driver;
        driver
            .node
            .envs
            .iter()
            .chain(driver.controller.envs.iter())
            .chain(driver.common.envs.iter())
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

impl ManagedResource for ContainerStorageModule {
    type Status = ContainerStorageModuleStatus;
    const FINALIZER: &'static str = CSM_FINALIZER;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_type_parsing() {
        assert_eq!("mayastor".parse::<DriverType>(), Ok(DriverType::Mayastor));
        assert_eq!("SeaweedFS".parse::<DriverType>(), Ok(DriverType::SeaweedFS));
        assert!("ceph".parse::<DriverType>().is_err());
        assert_eq!(DriverType::RustFS.plugin_name(), "csi-rustfs.storage.billyronks.io");
    }

    #[test]
    fn test_empty_driver_type_is_none() {
        let spec: DriverSpec =
            serde_json::from_value(serde_json::json!({"csiDriverType": "", "configVersion": "v1.0.0"}))
                .unwrap();
        assert_eq!(spec.csi_driver_type, None);
        assert_eq!(spec.replicas, 2);

        let spec: DriverSpec =
            serde_json::from_value(serde_json::json!({"csiDriverType": "rustfs"})).unwrap();
        assert_eq!(spec.csi_driver_type, Some(DriverType::RustFS));
    }

    #[test]
    fn test_module_names_round_trip_through_serde() {
        let module: ModuleSpec = serde_json::from_value(serde_json::json!({
            "name": "authorization-proxy-server",
            "enabled": true
        }))
        .unwrap();
        assert_eq!(module.name, ModuleType::AuthorizationProxyServer);
        assert_eq!(module.name.to_string(), "authorization-proxy-server");
        assert!(!module.name.requires_driver());
        assert!(ModuleType::Authorization.is_major_versioned());
    }

    #[test]
    fn test_component_defaults_to_enabled() {
        let component = ComponentSpec {
            name: "topology".into(),
            ..Default::default()
        };
        assert!(component.is_enabled());

        let component = ComponentSpec {
            name: "topology".into(),
            enabled: Some(false),
            ..Default::default()
        };
        assert!(!component.is_enabled());
    }

    #[test]
    fn test_state_transitions() {
        use StatusState::*;

        assert!(NoState.can_transition_to(Creating));
        assert!(Creating.can_transition_to(Running));
        assert!(Failed.can_transition_to(Creating));
        assert!(Running.can_transition_to(InvalidConfig));
        assert!(!Running.can_transition_to(Creating));
        assert!(!NoState.can_transition_to(Running));

        assert_eq!(Running.advance(Creating), Running);
        assert_eq!(Failed.advance(Creating), Creating);
    }

    #[test]
    fn test_workload_status_health() {
        let status = WorkloadStatus::new(3, 1);
        assert_eq!(status.failed, 2);
        assert!(!status.is_healthy());

        assert!(WorkloadStatus::new(2, 2).is_healthy());
        assert!(!WorkloadStatus::new(0, 0).is_healthy());
    }

    #[test]
    fn test_driver_env_lookup_prefers_node() {
        let mut csm = ContainerStorageModule::new("csm", ContainerStorageModuleSpec {
            driver: DriverSpec::default(),
            modules: vec![],
        });
        csm.spec.driver.common.envs.push(EnvVarSpec {
            name: "X_CSI_SFTP_REPO_ENABLED".into(),
            value: "false".into(),
        });
        csm.spec.driver.node.envs.push(EnvVarSpec {
            name: "X_CSI_SFTP_REPO_ENABLED".into(),
            value: "true".into(),
        });
        assert_eq!(csm.driver_env("X_CSI_SFTP_REPO_ENABLED"), Some("true"));
        assert_eq!(csm.driver_env("MISSING"), None);
    }
}
