//! Stage handler: host-side work executed on behalf of the state machine.

pub mod ostree;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crd::{SeedImageRef, Stage};
use crate::error::IbuError;
use crate::seed::{SeedClusterInfo, write_json};

/// Outcome of an idempotent step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepProgress {
    Done,
    /// Work was started but finishes out of band (reboot, node readiness).
    Pending,
}

/// Rollback steps. Each completed step is recorded as a `Rollback<Step>Done` condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackStep {
    CleanupPrepArtifacts,
    RestoreBootDeployment,
    RebootIntoPrevious,
    CleanupUpgradeArtifacts,
}

impl RollbackStep {
    /// Steps needed to roll back from `origin`, in order.
    pub const fn for_origin(origin: Stage) -> &'static [Self] {
        match origin {
            Stage::Prep => &[Self::CleanupPrepArtifacts],
            Stage::Upgrade => &[
                Self::RestoreBootDeployment,
                Self::RebootIntoPrevious,
                Self::CleanupUpgradeArtifacts,
            ],
            Stage::Idle | Stage::Rollback => &[],
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CleanupPrepArtifacts => "CleanupPrepArtifacts",
            Self::RestoreBootDeployment => "RestoreBootDeployment",
            Self::RebootIntoPrevious => "RebootIntoPrevious",
            Self::CleanupUpgradeArtifacts => "CleanupUpgradeArtifacts",
        }
    }

    /// Condition type recorded once the step is done.
    pub fn marker(self) -> String {
        format!("Rollback{}Done", self.as_str())
    }
}

impl std::fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host operations behind each stage.
///
/// Every method must be safe to call again after a crash or requeue.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// `var` directory the gatherer writes the bundle into for this seed.
    fn target_root(&self, seed: &SeedImageRef) -> PathBuf;

    /// Stage the seed image as a new, non-default deployment.
    async fn prep(&self, seed: &SeedImageRef) -> Result<(), IbuError>;

    /// Seed cluster info baked into the staged seed.
    async fn seed_cluster_info(&self, seed: &SeedImageRef) -> Result<SeedClusterInfo, IbuError>;

    /// Make the seed deployment the default and reboot into it.
    async fn pivot(&self, seed: &SeedImageRef) -> Result<StepProgress, IbuError>;

    /// Outcome of the post-reboot configuration (`ibu restore`).
    async fn post_reboot_config(&self) -> Result<StepProgress, IbuError>;

    /// Whether the upgraded node came back healthy.
    async fn complete_upgrade(&self) -> Result<StepProgress, IbuError>;

    async fn rollback_step(
        &self,
        step: RollbackStep,
        seed: &SeedImageRef,
    ) -> Result<StepProgress, IbuError>;

    /// Drop the pre-upgrade deployment once the upgrade is accepted.
    async fn finalize_upgrade(&self, seed: &SeedImageRef) -> Result<(), IbuError>;
}

/// Result of `ibu restore`, read back by the post-reboot configuration guard.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

impl RestoreReport {
    pub fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
            finished_at: Utc::now(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), IbuError> {
        info!("Writing restore report to {}", path.display());
        write_json(path, self)
    }

    /// `None` when restore has not finished yet.
    pub fn load(path: &Path) -> Result<Option<Self>, IbuError> {
        match std::fs::read(path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IbuError::io(path, e)),
        }
    }
}
