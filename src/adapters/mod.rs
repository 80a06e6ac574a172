//! Adapters implementing the domain ports
//!
//! - [`kube`]: the live cluster through kube-rs
//! - `testing`: in-memory fakes backing the unit tests

pub mod kube;

#[cfg(test)]
pub(crate) mod testing;

pub use self::kube::{KubeCluster, KubeEvents, KubeStore};
