//! Driver Profiles
//!
//! Per-driver checks and bundle edits that the shared templates can't express:
//! - Mayastor: zone configuration secret, OpenShift kernel module loading
//! - SeaweedFS: optional SFTP key distribution
//! - RustFS: standalone reverse proxy endpoint

pub mod mayastor;
pub mod rustfs;
pub mod seaweedfs;

pub use mayastor::MayastorProfile;
pub use rustfs::RustFSProfile;
pub use seaweedfs::SeaweedFSProfile;

use crate::crd::{ContainerStorageModule, DriverType};
use crate::domain::ports::{ClusterApi, Platform};
use crate::error::Result;
use crate::manifest::bundle::DriverBundle;
use async_trait::async_trait;

/// Driver-specific behaviour around the shared templates
#[async_trait]
pub trait DriverProfile: Send + Sync {
    fn driver(&self) -> DriverType;

    /// Validate side configuration the driver needs before install
    async fn precheck(&self, _csm: &ContainerStorageModule, _cluster: &dyn ClusterApi) -> Result<()> {
        Ok(())
    }

    /// Edit the resolved bundle before modules are injected
    fn preprocess(
        &self,
        bundle: &mut DriverBundle,
        csm: &ContainerStorageModule,
        platform: Platform,
    ) -> Result<()>;
}

/// Lookup of driver profiles
pub struct DriverFactory;

impl DriverFactory {
    /// Profile of a driver type
    pub fn profile(driver: DriverType) -> &'static dyn DriverProfile {
        match driver {
            DriverType::Mayastor => &MayastorProfile,
            DriverType::SeaweedFS => &SeaweedFSProfile,
            DriverType::RustFS => &RustFSProfile,
        }
    }
}
