//! Previously applied configuration
//!
//! After every successful sync the resource spec is stored in an annotation.
//! The next pass diffs against it to find modules and components that were
//! switched off.

use crate::crd::{
    ContainerStorageModule, ContainerStorageModuleSpec, ModuleSpec, ModuleType,
    ANNOTATION_PREVIOUS_CONFIG,
};
use crate::error::Result;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Current snapshot layout
pub const SCHEMA_VERSION: u32 = 1;

/// Spec of the last successful sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedSnapshot {
    pub schema_version: u32,
    pub spec: ContainerStorageModuleSpec,
}

impl AppliedSnapshot {
    pub fn capture(spec: &ContainerStorageModuleSpec) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            spec: spec.clone(),
        }
    }

    /// Snapshot stored on a resource.
    ///
    /// An unreadable annotation is treated as absent; the next successful
    /// sync overwrites it.
    pub fn from_resource(csm: &ContainerStorageModule) -> Option<Self> {
        let raw = csm.annotations().get(ANNOTATION_PREVIOUS_CONFIG)?;
        match serde_json::from_str::<AppliedSnapshot>(raw) {
            Ok(snapshot) if snapshot.schema_version == SCHEMA_VERSION => Some(snapshot),
            Ok(snapshot) => {
                warn!(
                    name = %csm.name_any(),
                    schema = snapshot.schema_version,
                    "Ignoring snapshot with unknown schema"
                );
                None
            }
            Err(e) => {
                warn!(name = %csm.name_any(), error = %e, "Ignoring unreadable snapshot");
                None
            }
        }
    }

    pub fn to_annotation(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Enabled modules keyed by type
    pub fn enabled_modules(&self) -> BTreeMap<ModuleType, &ModuleSpec> {
        enabled_modules(&self.spec)
    }
}

pub fn enabled_modules(spec: &ContainerStorageModuleSpec) -> BTreeMap<ModuleType, &ModuleSpec> {
    spec.modules
        .iter()
        .filter(|m| m.enabled)
        .map(|m| (m.name, m))
        .collect()
}
