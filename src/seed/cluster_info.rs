//! Seed cluster info: facts about the cluster a seed image was built from.

use serde::{Deserialize, Serialize};

use super::Versioned;
use crate::error::IbuError;

/// Current seed format version. Existing seed images carry older values,
/// so changing a field here requires a bump.
pub const SEED_FORMAT_VERSION: u64 = 1;

/// Baked into the seed image at capture time. Read-only afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SeedClusterInfo {
    pub seed_format_version: u64,
    /// OCP version of the seed cluster, compared with the desired version during an upgrade.
    #[serde(default)]
    pub seed_cluster_ocp_version: String,
    #[serde(default)]
    pub base_domain: String,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub node_ip: String,
    #[serde(default)]
    pub release_registry: String,
    #[serde(default)]
    pub mirror_registry_configured: bool,
    #[serde(default)]
    pub sno_hostname: String,
    /// Recert image that already ran successfully against this seed.
    #[serde(default)]
    pub recert_image_pull_spec: String,
}

impl Versioned for SeedClusterInfo {
    const DOCUMENT: &'static str = "seed cluster info";
    const VERSION_FIELD: &'static str = "seed_format_version";
    const SUPPORTED: &'static [u64] = &[SEED_FORMAT_VERSION];

    fn decode_version(version: u64, value: serde_yaml::Value) -> Result<Self, IbuError> {
        match version {
            1 => Ok(serde_yaml::from_value(value)?),
            other => Err(IbuError::SchemaIncompatible {
                document: Self::DOCUMENT,
                found: other.to_string(),
                supported: SEED_FORMAT_VERSION.to_string(),
            }),
        }
    }
}

impl SeedClusterInfo {
    /// Fully qualified cluster domain, `<cluster_name>.<base_domain>`.
    pub fn cluster_domain(&self) -> String {
        format!("{}.{}", self.cluster_name, self.base_domain)
    }
}

/// Which flow is consuming the seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedFlow {
    /// In-place upgrade of a running cluster.
    Upgrade,
    /// Fresh install; there is no current version to protect.
    Install,
}

/// Compare the seed's baked OCP version with the desired target version.
pub fn check_seed_version(
    info: &SeedClusterInfo,
    desired: &str,
    flow: SeedFlow,
) -> Result<(), IbuError> {
    if flow == SeedFlow::Install || info.seed_cluster_ocp_version == desired {
        return Ok(());
    }
    Err(IbuError::VersionMismatch {
        seed: info.seed_cluster_ocp_version.clone(),
        desired: desired.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::decode;

    fn seed_info() -> SeedClusterInfo {
        SeedClusterInfo {
            seed_format_version: SEED_FORMAT_VERSION,
            seed_cluster_ocp_version: "4.16.2".to_string(),
            base_domain: "example.com".to_string(),
            cluster_name: "seed".to_string(),
            sno_hostname: "seed-node".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_cluster_domain() {
        assert_eq!(seed_info().cluster_domain(), "seed.example.com");
    }

    #[test]
    fn test_decode_omits_defaults() {
        let info: SeedClusterInfo =
            decode(r#"{"seed_format_version": 1, "seed_cluster_ocp_version": "4.16.2"}"#).unwrap();
        assert_eq!(info.seed_cluster_ocp_version, "4.16.2");
        assert!(!info.mirror_registry_configured);
        assert!(info.recert_image_pull_spec.is_empty());
    }

    #[test]
    fn test_version_mismatch_fails_upgrade() {
        let info = seed_info();
        let err = check_seed_version(&info, "4.16.3", SeedFlow::Upgrade).unwrap_err();
        assert!(matches!(err, IbuError::VersionMismatch { .. }));
        assert!(check_seed_version(&info, "4.16.2", SeedFlow::Upgrade).is_ok());
    }

    #[test]
    fn test_version_ignored_on_install() {
        let info = seed_info();
        assert!(check_seed_version(&info, "4.17.0", SeedFlow::Install).is_ok());
    }
}
