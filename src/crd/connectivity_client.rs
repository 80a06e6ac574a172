//! ConnectivityClient CRD
//!
//! A lighter-weight install of the connectivity agent that phones home to
//! the storage control plane. Reconciled like a ContainerStorageModule but
//! without the module pipeline.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::storage_module::{ContainerOverride, SidecarSpec, StatusState, WorkloadStatus};
use super::{ANNOTATION_CONFIG_VERSION, CLIENT_FINALIZER};
use crate::domain::ports::ManagedResource;

// =============================================================================
// ConnectivityClient CRD
// =============================================================================

/// ConnectivityClient installs the connectivity agent StatefulSet.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "ConnectivityClient",
    plural = "connectivityclients",
    shortname = "ccl",
    status = "ConnectivityClientStatus",
    printcolumn = r#"{"name": "Client", "type": "string", "jsonPath": ".spec.client.clientType"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.client.configVersion"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityClientSpec {
    pub client: ClientSpec,
}

/// Client flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    ConnectivityAgent,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::ConnectivityAgent => "connectivity-agent",
        }
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connectivity-agent" => Ok(ClientType::ConnectivityAgent),
            other => Err(format!("unknown client type '{}'", other)),
        }
    }
}

/// Client installation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpec {
    pub client_type: ClientType,

    pub config_version: String,

    /// Delete every client object when the resource is deleted
    #[serde(default)]
    pub force_removal: bool,

    #[serde(default)]
    pub common: ContainerOverride,

    #[serde(default)]
    pub side_cars: Vec<SidecarSpec>,
}

/// Status of a ConnectivityClient
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityClientStatus {
    #[serde(default)]
    pub state: StatusState,

    #[serde(default)]
    pub client_status: WorkloadStatus,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ConnectivityClient {
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CLIENT_FINALIZER)
    }

    pub fn applied_config_version(&self) -> Option<&str> {
        self.annotations()
            .get(ANNOTATION_CONFIG_VERSION)
            .map(String::as_str)
    }

    pub fn state(&self) -> StatusState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

impl ManagedResource for ConnectivityClient {
    type Status = ConnectivityClientStatus;
    const FINALIZER: &'static str = CLIENT_FINALIZER;
}
