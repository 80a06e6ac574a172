//! Domain layer - Managed object model and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles, and the closed set of
//! object kinds the operator renders and applies.

pub mod objects;
pub mod ports;

pub use objects::*;
pub use ports::*;
