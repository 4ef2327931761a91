//! `ImageBasedUpgrade` spec types.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::ImageBasedUpgradeStatus;
use super::types::Stage;

/// Default init-monitor watchdog timeout.
pub const DEFAULT_INIT_MONITOR_TIMEOUT_SECONDS: u64 = 1800;

/// `ImageBasedUpgrade` spec defines the desired stage of an image-based upgrade.
///
/// Cluster-scoped singleton: one per cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "lca.openshift.io",
    version = "v1alpha1",
    kind = "ImageBasedUpgrade",
    shortname = "ibu",
    status = "ImageBasedUpgradeStatus",
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"DESIRED STAGE","type":"string","jsonPath":".spec.stage"}"#,
    printcolumn = r#"{"name":"STATE","type":"string","jsonPath":".status.conditions[-1:].reason"}"#,
    printcolumn = r#"{"name":"DETAILS","type":"string","jsonPath":".status.conditions[-1:].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageBasedUpgradeSpec {
    /// Desired stage: Idle, Prep, Upgrade or Rollback.
    #[serde(default)]
    pub stage: Stage,

    /// Seed image and the OCP version it was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_image_ref: Option<SeedImageRef>,

    /// Config map listing additional images to precache during Prep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_images: Option<ConfigMapRef>,

    /// Config maps with backup/restore content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub oadp_content: Vec<ConfigMapRef>,

    /// Config maps with extra manifests applied after the upgrade.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_manifests: Vec<ConfigMapRef>,

    /// Per-phase auto-rollback suppression and watchdog timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rollback_on_failure: Option<AutoRollbackOnFailure>,
}

/// Seed image reference.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedImageRef {
    /// OCP version the seed image was built from.
    #[serde(default)]
    pub version: String,

    /// Seed image pull-spec.
    #[serde(default)]
    pub image: String,

    /// Secret with credentials for pulling the seed image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret_ref: Option<PullSecretRef>,
}

/// Auto-rollback configuration.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoRollbackOnFailure {
    /// Disable auto-rollback when post-reboot configuration fails.
    #[serde(default)]
    pub disabled_for_post_reboot_config: bool,

    /// Disable auto-rollback when the upgrade completion handler fails.
    #[serde(default)]
    pub disabled_for_upgrade_completion: bool,

    /// Disable the init-monitor watchdog entirely.
    #[serde(default)]
    pub disabled_init_monitor: bool,

    /// Init-monitor watchdog timeout in seconds. Values <= 0 use the default.
    #[serde(default)]
    pub init_monitor_timeout_seconds: i64,
}

impl AutoRollbackOnFailure {
    /// Effective init-monitor timeout in seconds.
    pub const fn effective_timeout_seconds(&self) -> u64 {
        if self.init_monitor_timeout_seconds <= 0 {
            DEFAULT_INIT_MONITOR_TIMEOUT_SECONDS
        } else {
            #[allow(clippy::cast_sign_loss)]
            {
                self.init_monitor_timeout_seconds as u64
            }
        }
    }
}

/// Reference to a config map.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapRef {
    pub name: String,
    pub namespace: String,
}

/// Reference to a secret holding image pull credentials.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PullSecretRef {
    pub name: String,
}

impl ImageBasedUpgradeSpec {
    /// Auto-rollback settings with defaults applied.
    pub fn auto_rollback(&self) -> AutoRollbackOnFailure {
        self.auto_rollback_on_failure.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_deserialize_minimal() {
        let spec: ImageBasedUpgradeSpec = serde_json::from_str(r#"{"stage":"Prep"}"#).unwrap();
        assert_eq!(spec.stage, Stage::Prep);
        assert!(spec.seed_image_ref.is_none());
        assert!(spec.oadp_content.is_empty());
    }

    #[test]
    fn test_spec_deserialize_full() {
        let json = r#"{
            "stage": "Upgrade",
            "seedImageRef": {"version": "4.16.2", "image": "quay.io/seed:4.16.2", "pullSecretRef": {"name": "seed-pull"}},
            "oadpContent": [{"name": "oadp", "namespace": "openshift-adp"}],
            "extraManifests": [{"name": "extra", "namespace": "default"}],
            "autoRollbackOnFailure": {"disabledForUpgradeCompletion": true, "initMonitorTimeoutSeconds": 600}
        }"#;
        let spec: ImageBasedUpgradeSpec = serde_json::from_str(json).unwrap();
        let seed = spec.seed_image_ref.as_ref().unwrap();
        assert_eq!(seed.version, "4.16.2");
        assert_eq!(seed.pull_secret_ref.as_ref().unwrap().name, "seed-pull");
        let arb = spec.auto_rollback();
        assert!(arb.disabled_for_upgrade_completion);
        assert!(!arb.disabled_init_monitor);
        assert_eq!(arb.effective_timeout_seconds(), 600);
    }

    #[test]
    fn test_non_positive_timeout_uses_default() {
        let zero = AutoRollbackOnFailure::default();
        assert_eq!(
            zero.effective_timeout_seconds(),
            DEFAULT_INIT_MONITOR_TIMEOUT_SECONDS
        );
        let negative = AutoRollbackOnFailure {
            init_monitor_timeout_seconds: -5,
            ..Default::default()
        };
        assert_eq!(
            negative.effective_timeout_seconds(),
            DEFAULT_INIT_MONITOR_TIMEOUT_SECONDS
        );
        assert!(!negative.disabled_init_monitor);
    }
}
