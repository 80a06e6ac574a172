//! Manifest handling
//!
//! - [`config_tree`]: filesystem view of the configuration tree
//! - [`template`]: `${TOKEN}` rendering and multi-document parsing
//! - [`resolver`]: driver and client bundle resolution
//! - [`bundle`]: the rendered object bundle and instance ownership
//! - [`patch`]: idempotent pod spec and RBAC edits

pub mod bundle;
pub mod config_tree;
pub mod patch;
pub mod resolver;
pub mod template;

pub use bundle::{Bundle, DriverBundle, InstanceRef, Rbac, Workload};
pub use config_tree::DirConfigTree;
pub use resolver::{ManifestResolver, ModuleVersions};
pub use template::RenderContext;
