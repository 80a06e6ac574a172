//! Control Plane
//!
//! Reconciliation of ContainerStorageModule and ConnectivityClient resources:
//! - [`reconciler`] / [`client_reconciler`]: the per-resource state machines
//! - [`precheck`] and [`upgrade`]: spec validation before anything is applied
//! - [`drivers`]: per-driver checks and bundle edits
//! - [`sync`] and [`cleanup`]: applying bundles and removing disabled modules
//! - [`snapshot`]: the last applied spec
//! - [`watch`]: content watches projecting workload health onto status
//! - [`runtime`]: kube-runtime controllers and context wiring

pub mod cleanup;
pub mod client_reconciler;
pub mod context;
pub mod drivers;
pub mod metrics;
pub mod precheck;
pub mod reconciler;
pub mod runtime;
pub mod snapshot;
pub mod sync;
pub mod upgrade;
pub mod watch;

pub use context::Context;
pub use drivers::{DriverFactory, DriverProfile};
pub use metrics::Metrics;
pub use reconciler::StorageModuleReconciler;
pub use client_reconciler::ClientReconciler;
pub use snapshot::AppliedSnapshot;
pub use sync::{SyncReport, Synchronizer};
pub use upgrade::{UpgradeTarget, UpgradeValidator};
pub use watch::WatchRegistry;
