//! Storage Module Operator
//!
//! A Kubernetes operator installing CSI drivers (Mayastor, SeaweedFS, RustFS)
//! together with optional modules from a versioned manifest tree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                   ContainerStorageModule / ConnectivityClient                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Prechecks &   │  │    Manifest     │  │      Module Injection       │  │
//! │  │ Upgrade Guards  │  │    Resolver     │  │        Pipeline             │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │                                             │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │ Differential Cleanup  │                                │
//! │                    │   & Synchronizer      │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                    ┌───────────┴───────────┐                                │
//! │                    │  Content Watches →    │                                │
//! │                    │  Status Projection    │                                │
//! │                    └───────────────────────┘                                │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: reconcilers, validation, sync, cleanup and watches
//! - [`manifest`]: configuration tree, templates and rendered bundles
//! - [`modules`]: optional module transforms
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: managed object model and ports
//! - [`adapters`]: kube-rs implementations of the ports
//! - [`error`]: Error types and handling

pub mod adapters;
pub mod config;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod manifest;
pub mod modules;

// Re-export commonly used types
pub use config::OperatorConfig;

pub use controlplane::{
    ClientReconciler, Context, Metrics, StorageModuleReconciler, WatchRegistry,
};

pub use crd::{
    ConnectivityClient, ConnectivityClientSpec, ConnectivityClientStatus,
    ContainerStorageModule, ContainerStorageModuleSpec, ContainerStorageModuleStatus,
    DriverType, ModuleType, StatusState,
};

pub use domain::ports::{ClusterApi, ConfigTree, EventSink, KubeVersion, Platform, ResourceStore};

pub use error::{Error, ErrorAction, Result};

pub use manifest::{DirConfigTree, ManifestResolver};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
