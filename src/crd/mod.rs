//! Custom Resource Definitions for the Storage Module Operator
//!
//! This module contains all CRD types:
//! - ContainerStorageModule: CSI driver plus optional modules
//! - ConnectivityClient: standalone connectivity agent install
//!
//! It also holds the reserved annotation, label and finalizer names shared by
//! the reconcilers and the status watchers.

pub mod connectivity_client;
pub mod storage_module;

pub use connectivity_client::*;
pub use storage_module::*;

/// API group of both resources
pub const API_GROUP: &str = "storage.billyronks.io";

/// Finalizer placed on ContainerStorageModule resources
pub const CSM_FINALIZER: &str = "storage.billyronks.io/csm-finalizer";

/// Finalizer placed on ConnectivityClient resources
pub const CLIENT_FINALIZER: &str = "storage.billyronks.io/connectivity-client-finalizer";

/// Configuration version applied by the last annotate step
pub const ANNOTATION_CONFIG_VERSION: &str = "storage.billyronks.io/config-version";

/// JSON snapshot of the last successfully applied spec
pub const ANNOTATION_PREVIOUS_CONFIG: &str =
    "storage.billyronks.io/previously-applied-configuration";

/// Operator build that last annotated the resource
pub const ANNOTATION_OPERATOR_VERSION: &str = "storage.billyronks.io/operator-version";

/// Label carrying the owning resource name on every managed object
pub const LABEL_INSTANCE: &str = "storage.billyronks.io/instance";

/// Label carrying the owning resource namespace on every managed object
pub const LABEL_INSTANCE_NAMESPACE: &str = "storage.billyronks.io/instance-namespace";

/// Field manager / reporter name
pub const OPERATOR_NAME: &str = "storage-module-operator";
