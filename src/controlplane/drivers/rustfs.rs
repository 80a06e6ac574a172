//! RustFS Object Storage Profile
//!
//! A standalone reverse proxy fronts the S3 gateway; the driver has to be
//! told where the proxy service lives.

use super::DriverProfile;
use crate::crd::{ContainerStorageModule, DriverType, ModuleType};
use crate::domain::ports::Platform;
use crate::error::Result;
use crate::manifest::bundle::DriverBundle;
use crate::manifest::patch::{container_mut, upsert_env, DRIVER_CONTAINER};
use crate::modules::ReverseProxy;
use async_trait::async_trait;
use kube::ResourceExt;

pub const REVPROXY_ENDPOINT_ENV: &str = "X_CSI_REVPROXY_SERVICE_ENDPOINT";

pub struct RustFSProfile;

#[async_trait]
impl DriverProfile for RustFSProfile {
    fn driver(&self) -> DriverType {
        DriverType::RustFS
    }

    fn preprocess(
        &self,
        bundle: &mut DriverBundle,
        csm: &ContainerStorageModule,
        _platform: Platform,
    ) -> Result<()> {
        let Some(proxy) = csm.module(ModuleType::ReverseProxy).filter(|m| m.enabled) else {
            return Ok(());
        };
        if ReverseProxy::deploy_as_sidecar(proxy) {
            return Ok(());
        }

        let endpoint = ReverseProxy::service_endpoint(
            proxy,
            &csm.name_any(),
            &csm.namespace().unwrap_or_default(),
        );
        if let Some(driver) = container_mut(bundle.controller_pod_spec(), DRIVER_CONTAINER) {
            upsert_env(driver, REVPROXY_ENDPOINT_ENV, &endpoint);
        }
        Ok(())
    }
}
