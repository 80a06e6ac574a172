//! Prechecks
//!
//! Everything that has to hold before a resource is synced. A failure here
//! means the spec needs an edit, so it surfaces as an invalid configuration
//! instead of a retry.

use super::drivers::DriverFactory;
use super::snapshot::AppliedSnapshot;
use super::upgrade::{UpgradeTarget, UpgradeValidator};
use crate::crd::{ContainerStorageModule, ModuleSpec, ModuleType};
use crate::domain::ports::ClusterApi;
use crate::error::{Error, Result};
use crate::manifest::resolver::ManifestResolver;
use crate::modules::authorization::{self, Authorization};
use kube::ResourceExt;
use std::collections::BTreeSet;
use tracing::{debug, instrument, warn};

pub struct Prechecks<'a> {
    resolver: &'a ManifestResolver,
    cluster: &'a dyn ClusterApi,
}

impl<'a> Prechecks<'a> {
    pub fn new(resolver: &'a ManifestResolver, cluster: &'a dyn ClusterApi) -> Self {
        Self { resolver, cluster }
    }

    #[instrument(skip_all, fields(name = %csm.name_any()))]
    pub async fn run(&self, csm: &ContainerStorageModule) -> Result<()> {
        let driver = &csm.spec.driver;
        if let Some(driver_type) = driver.csi_driver_type {
            if !self.resolver.supports_driver(driver_type, &driver.config_version) {
                return Err(Error::UnsupportedDriver {
                    driver: driver_type.to_string(),
                    version: driver.config_version.clone(),
                });
            }
        }

        check_structure(csm)?;

        let current = driver
            .csi_driver_type
            .map(|d| (d, driver.config_version.as_str()));
        let mut versions = Vec::new();
        for module in csm.enabled_modules() {
            versions.push((module, self.resolver.module_version(current, module)?));
        }

        self.check_upgrades(csm, &versions)?;

        if let Some(driver_type) = driver.csi_driver_type {
            DriverFactory::profile(driver_type)
                .precheck(csm, self.cluster)
                .await?;
        }

        if let Some(module) = csm.module(ModuleType::Authorization).filter(|m| m.enabled) {
            self.check_authorization(csm, module).await?;
        }

        debug!(modules = versions.len(), "Prechecks passed");
        Ok(())
    }

    fn check_upgrades(
        &self,
        csm: &ContainerStorageModule,
        versions: &[(&ModuleSpec, String)],
    ) -> Result<()> {
        let validator = UpgradeValidator::new(self.resolver);
        let driver = &csm.spec.driver;

        if let Some(driver_type) = driver.csi_driver_type {
            validator.check(
                UpgradeTarget::Driver(driver_type),
                csm.applied_config_version(),
                &driver.config_version,
            )?;
        }

        let Some(previous) = AppliedSnapshot::from_resource(csm) else {
            return Ok(());
        };
        let before = previous.enabled_modules();
        let previous_driver = previous
            .spec
            .driver
            .csi_driver_type
            .map(|d| (d, previous.spec.driver.config_version.as_str()));

        for (module, version) in versions {
            let Some(old) = before.get(&module.name) else {
                continue;
            };
            let old = match self.resolver.module_version(previous_driver, old) {
                Ok(old) => old,
                Err(e) => {
                    warn!(module = %module.name, error = %e, "Previous module version unknown");
                    continue;
                }
            };
            validator.check(UpgradeTarget::Module(module.name), Some(&old), version)?;
        }
        Ok(())
    }

    async fn check_authorization(&self, csm: &ContainerStorageModule, module: &ModuleSpec) -> Result<()> {
        if Authorization::proxy_host(module).is_none() {
            return Err(Error::InvalidConfig(format!(
                "{} requires PROXY_HOST on the {} component",
                ModuleType::Authorization,
                authorization::SIDECAR
            )));
        }

        let namespace = csm.namespace().unwrap_or_default();
        let mut required = vec![authorization::CONFIG_SECRET, authorization::TOKEN_SECRET];
        if !Authorization::skip_certificate_validation(module) {
            required.push(authorization::ROOT_CERT_SECRET);
        }
        for secret in required {
            if self.cluster.get_secret_data(&namespace, secret).await?.is_none() {
                return Err(Error::InvalidConfig(format!(
                    "{} requires secret {}/{}",
                    ModuleType::Authorization,
                    namespace,
                    secret
                )));
            }
        }
        Ok(())
    }
}

/// Module combinations that can never be installed
pub fn check_structure(csm: &ContainerStorageModule) -> Result<()> {
    let mut seen = BTreeSet::new();
    for module in &csm.spec.modules {
        if !seen.insert(module.name) {
            return Err(Error::InvalidConfig(format!("module {} listed twice", module.name)));
        }
    }

    let has_driver = csm.driver_type().is_some();
    for module in csm.enabled_modules() {
        match (module.name.requires_driver(), has_driver) {
            (true, false) => {
                return Err(Error::InvalidConfig(format!(
                    "module {} requires a driver",
                    module.name
                )))
            }
            (false, true) => {
                return Err(Error::InvalidConfig(format!(
                    "module {} is installed without a driver",
                    module.name
                )))
            }
            _ => {}
        }
    }
    Ok(())
}
