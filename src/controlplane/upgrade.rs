//! Upgrade Path Validation
//!
//! Every driver, module and client version directory carries an
//! `upgrade-path.yaml` naming the oldest version it can be reached from.

use crate::crd::{ClientType, DriverType, ModuleType};
use crate::error::{Error, Result};
use crate::manifest::resolver::{client_dir, driver_dir, module_dir, ManifestResolver, UPGRADE_PATH_FILE};
use crate::manifest::template::parse_fragment;
use serde::Deserialize;
use std::cmp::Ordering;
use std::str::FromStr;
use tracing::{debug, info};

// =============================================================================
// Version
// =============================================================================

/// A `vX.Y.Z` configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::VersionParse(s.to_string());
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let mut parts = digits.splitn(3, '.');
        let mut next = || -> Result<u64> {
            let part = parts.next().ok_or_else(bad)?;
            // Pre-release and build suffixes don't take part in ordering
            let numeric: String = part.chars().take_while(char::is_ascii_digit).collect();
            numeric.parse().map_err(|_| bad())
        };
        Ok(Version {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// =============================================================================
// Upgrade Validator
// =============================================================================

/// What is being upgraded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeTarget {
    Driver(DriverType),
    Module(ModuleType),
    Client(ClientType),
}

impl UpgradeTarget {
    fn dir(&self, version: &str) -> String {
        match self {
            UpgradeTarget::Driver(d) => driver_dir(*d, version),
            UpgradeTarget::Module(m) => module_dir(*m, version),
            UpgradeTarget::Client(c) => client_dir(*c, version),
        }
    }

    fn is_major_versioned(&self) -> bool {
        matches!(self, UpgradeTarget::Module(m) if m.is_major_versioned())
    }
}

impl std::fmt::Display for UpgradeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeTarget::Driver(d) => write!(f, "{}", d),
            UpgradeTarget::Module(m) => write!(f, "{}", m),
            UpgradeTarget::Client(c) => write!(f, "{}", c),
        }
    }
}

/// `upgrade-path.yaml`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePath {
    pub min_upgrade_path: String,
}

/// Checks configuration version transitions against the upgrade tables
pub struct UpgradeValidator<'a> {
    resolver: &'a ManifestResolver,
}

impl<'a> UpgradeValidator<'a> {
    pub fn new(resolver: &'a ManifestResolver) -> Self {
        Self { resolver }
    }

    /// Whether `old -> new` is a permitted transition.
    ///
    /// Errors only when the upgrade table can't be read or parsed.
    pub fn is_valid(&self, target: UpgradeTarget, old: Option<&str>, new: &str) -> Result<bool> {
        let old = match old {
            Some(old) if !old.is_empty() => old,
            _ => return Ok(true),
        };
        if old == new {
            return Ok(true);
        }

        if target.is_major_versioned() && crosses_major(old, new) {
            info!(%target, from = %old, to = %new, "Major version change rejected");
            return Ok(false);
        }

        let path = format!("{}/{}", target.dir(new), UPGRADE_PATH_FILE);
        let table: UpgradePath = parse_fragment(&self.resolver.tree().read(&path)?)?;
        let min: Version = table.min_upgrade_path.parse()?;
        let from: Version = old.parse()?;

        debug!(%target, from = %from, to = %new, min = %min, "Checked upgrade path");
        Ok(from >= min)
    }

    /// Like [`is_valid`](Self::is_valid) but an invalid transition is an error
    pub fn check(&self, target: UpgradeTarget, old: Option<&str>, new: &str) -> Result<()> {
        if self.is_valid(target, old, new)? {
            Ok(())
        } else {
            Err(Error::UpgradeNotPermitted {
                component: target.to_string(),
                from: old.unwrap_or_default().to_string(),
                to: new.to_string(),
            })
        }
    }

    /// A client version is supported when its upgrade table exists
    pub fn client_supported(&self, client: ClientType, version: &str) -> bool {
        !version.is_empty()
            && self
                .resolver
                .tree()
                .exists(&format!("{}/{}", client_dir(client, version), UPGRADE_PATH_FILE))
    }
}

fn major_prefix(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Whether two versions differ in their `vN.` prefix
fn crosses_major(old: &str, new: &str) -> bool {
    major_prefix(old) != major_prefix(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::testing::shipped_resolver;
    use crate::manifest::DirConfigTree;
    use std::sync::Arc;

    #[test]
    fn test_version_parse_and_order() {
        let a: Version = "v2.10.0".parse().unwrap();
        let b: Version = "v2.9.3".parse().unwrap();
        assert!(a > b);
        assert_eq!("1.8.0-rc1".parse::<Version>().unwrap(), Version { major: 1, minor: 8, patch: 0 });
        assert!("v2".parse::<Version>().is_err());
        assert!("latest".parse::<Version>().is_err());
        assert_eq!(a.to_string(), "v2.10.0");
    }

    #[test]
    fn test_first_install_and_same_version() {
        let resolver = shipped_resolver();
        let validator = UpgradeValidator::new(&resolver);
        let driver = UpgradeTarget::Driver(DriverType::Mayastor);
        assert!(validator.is_valid(driver, None, "v2.10.0").unwrap());
        assert!(validator.is_valid(driver, Some(""), "v2.10.0").unwrap());
        // No table needed when nothing changes
        assert!(validator.is_valid(driver, Some("v9.9.9"), "v9.9.9").unwrap());
    }

    #[test]
    fn test_driver_min_upgrade_path() {
        let resolver = shipped_resolver();
        let validator = UpgradeValidator::new(&resolver);
        let driver = UpgradeTarget::Driver(DriverType::Mayastor);

        assert!(validator.is_valid(driver, Some("v2.9.0"), "v2.10.0").unwrap());
        assert!(validator.is_valid(driver, Some("v2.8.0"), "v2.10.0").unwrap());
        assert!(!validator.is_valid(driver, Some("v2.7.0"), "v2.10.0").unwrap());

        let err = validator.check(driver, Some("v2.7.0"), "v2.10.0").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_major_boundary_rejected_before_table() {
        // Empty tree: any table lookup would fail with ConfigNotFound
        let dir = tempfile::tempdir().unwrap();
        let resolver = ManifestResolver::new(Arc::new(DirConfigTree::new(dir.path())));
        let validator = UpgradeValidator::new(&resolver);
        let auth = UpgradeTarget::Module(ModuleType::Authorization);

        for (old, new) in [("v1.10.0", "v2.0.0"), ("v2.0.0", "v1.10.0"), ("v1.0.0", "v2.9.9")] {
            assert!(!validator.is_valid(auth, Some(old), new).unwrap());
        }

        // Non major-versioned modules go to the table
        let replication = UpgradeTarget::Module(ModuleType::Replication);
        assert!(validator.is_valid(replication, Some("v1.6.0"), "v2.0.0").is_err());
    }

    #[test]
    fn test_client_support_gate() {
        let resolver = shipped_resolver();
        let validator = UpgradeValidator::new(&resolver);
        assert!(validator.client_supported(ClientType::ConnectivityAgent, "v1.1.0"));
        assert!(!validator.client_supported(ClientType::ConnectivityAgent, "v3.0.0"));
        assert!(!validator.client_supported(ClientType::ConnectivityAgent, ""));
        assert!(validator
            .is_valid(UpgradeTarget::Client(ClientType::ConnectivityAgent), Some("v1.0.0"), "v1.1.0")
            .unwrap());
    }
}
