//! SeaweedFS File Storage Profile
//!
//! SFTP key distribution is opt-in through `X_CSI_SFTP_REPO_ENABLED`.

use super::DriverProfile;
use crate::crd::{ContainerStorageModule, DriverType};
use crate::domain::ports::Platform;
use crate::error::Result;
use crate::manifest::bundle::DriverBundle;
use crate::manifest::patch::{remove_init_container, remove_volume};
use async_trait::async_trait;

pub const SFTP_ENV: &str = "X_CSI_SFTP_REPO_ENABLED";
pub const SFTP_KEYS: &str = "sftp-keys";
pub const SFTP_KEYS_DIR: &str = "sftp-keys-dir";
pub const SFTP_KEYS_INIT: &str = "sftp-keys-init";

pub struct SeaweedFSProfile;

impl SeaweedFSProfile {
    pub fn sftp_enabled(csm: &ContainerStorageModule) -> bool {
        csm.driver_env(SFTP_ENV)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl DriverProfile for SeaweedFSProfile {
    fn driver(&self) -> DriverType {
        DriverType::SeaweedFS
    }

    fn preprocess(
        &self,
        bundle: &mut DriverBundle,
        csm: &ContainerStorageModule,
        _platform: Platform,
    ) -> Result<()> {
        if Self::sftp_enabled(csm) {
            return Ok(());
        }

        let controller = bundle.controller_pod_spec();
        remove_volume(controller, SFTP_KEYS);

        let node = bundle.node_pod_spec();
        remove_init_container(node, SFTP_KEYS_INIT);
        remove_volume(node, SFTP_KEYS);
        remove_volume(node, SFTP_KEYS_DIR);
        Ok(())
    }
}
