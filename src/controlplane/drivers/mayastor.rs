//! Mayastor Block Storage Profile
//!
//! The controller reads its availability zones from the `<name>-config`
//! secret. The node plugin loads NVMe-oF kernel modules from an init
//! container, which OpenShift nodes already provide.

use super::DriverProfile;
use crate::crd::{ContainerStorageModule, DriverType};
use crate::domain::ports::{ClusterApi, Platform};
use crate::error::{Error, Result};
use crate::manifest::bundle::DriverBundle;
use async_trait::async_trait;
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Secret key holding the zone list
pub const ZONES_KEY: &str = "zones";

pub const KERNEL_MODULES: &str = "kernel-modules";

/// One availability zone
#[derive(Debug, Clone, Deserialize)]
pub struct Zone {
    pub name: String,
    /// Node labels selecting the zone's nodes
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Parse and validate the zone list
pub fn parse_zones(text: &str) -> Result<Vec<Zone>> {
    let zones: Vec<Zone> = serde_yaml::from_str(text)
        .map_err(|e| Error::InvalidConfig(format!("malformed zone configuration: {}", e)))?;
    if zones.is_empty() {
        return Err(Error::InvalidConfig("zone configuration lists no zones".into()));
    }

    let mut seen = BTreeSet::new();
    for zone in &zones {
        if zone.name.is_empty() {
            return Err(Error::InvalidConfig("zone without a name".into()));
        }
        if zone.labels.is_empty() {
            return Err(Error::InvalidConfig(format!("zone {} selects no nodes", zone.name)));
        }
        if !seen.insert(zone.name.as_str()) {
            return Err(Error::InvalidConfig(format!("duplicate zone {}", zone.name)));
        }
    }
    Ok(zones)
}

pub struct MayastorProfile;

#[async_trait]
impl DriverProfile for MayastorProfile {
    fn driver(&self) -> DriverType {
        DriverType::Mayastor
    }

    async fn precheck(&self, csm: &ContainerStorageModule, cluster: &dyn ClusterApi) -> Result<()> {
        let namespace = csm.namespace().unwrap_or_default();
        let secret = format!("{}-config", csm.name_any());

        let data = cluster
            .get_secret_data(&namespace, &secret)
            .await?
            .ok_or_else(|| Error::InvalidConfig(format!("secret {}/{} not found", namespace, secret)))?;
        let text = data.get(ZONES_KEY).ok_or_else(|| {
            Error::InvalidConfig(format!("secret {}/{} has no {} key", namespace, secret, ZONES_KEY))
        })?;

        let zones = parse_zones(text)?;
        debug!(secret = %secret, zones = zones.len(), "Zone configuration valid");
        Ok(())
    }

    fn preprocess(
        &self,
        bundle: &mut DriverBundle,
        _csm: &ContainerStorageModule,
        platform: Platform,
    ) -> Result<()> {
        if platform == Platform::OpenShift {
            let node = bundle.node_pod_spec();
            crate::manifest::patch::remove_init_container(node, KERNEL_MODULES);
            crate::manifest::patch::remove_volume(node, KERNEL_MODULES);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::FakeCluster;
    use crate::controlplane::drivers::testing::csm;
    use crate::domain::ports::KubeVersion;
    use crate::manifest::patch::has_volume;
    use crate::manifest::testing::shipped_resolver;
    use crate::manifest::RenderContext;

    const ZONES: &str = r#"
- name: zone-a
  labels:
    topology.kubernetes.io/zone: a
- name: zone-b
  labels:
    topology.kubernetes.io/zone: b
"#;

    #[test]
    fn test_parse_zones() {
        assert_eq!(parse_zones(ZONES).unwrap().len(), 2);
        assert!(parse_zones("[]").is_err());
        assert!(parse_zones("- name: a\n  labels: {x: y}\n- name: a\n  labels: {x: z}\n").is_err());
        assert!(parse_zones("- name: a\n").is_err());
    }

    #[tokio::test]
    async fn test_precheck_requires_zone_secret() {
        let cluster = FakeCluster::new();
        let resource = csm("mayastor", DriverType::Mayastor);

        let err = MayastorProfile.precheck(&resource, &cluster).await.unwrap_err();
        assert!(err.is_validation());

        cluster.put_secret("storage", "mayastor-config", &[("other", "x")]);
        assert!(MayastorProfile.precheck(&resource, &cluster).await.is_err());

        cluster.put_secret("storage", "mayastor-config", &[(ZONES_KEY, ZONES)]);
        MayastorProfile.precheck(&resource, &cluster).await.unwrap();
    }

    #[test]
    fn test_openshift_drops_kernel_modules() {
        let resolver = shipped_resolver();
        let mut ctx = RenderContext::new("mayastor", "storage").with_config_version("v2.10.0");
        ctx.images = resolver.images(KubeVersion::new(1, 29)).unwrap();
        let resource = csm("mayastor", DriverType::Mayastor);

        let mut bundle = resolver.resolve_driver(DriverType::Mayastor, &ctx).unwrap();
        MayastorProfile.preprocess(&mut bundle, &resource, Platform::Kubernetes).unwrap();
        assert!(has_volume(bundle.node_pod_spec(), KERNEL_MODULES));

        MayastorProfile.preprocess(&mut bundle, &resource, Platform::OpenShift).unwrap();
        let node = bundle.node_pod_spec();
        assert!(!has_volume(node, KERNEL_MODULES));
        assert!(node.init_containers.is_none());
    }
}
