//! Ostree-backed stage handler.
//!
//! The seed image is pulled and mounted with podman, its `var` archive is
//! extracted into a new stateroot, and its ostree commit is deployed next to
//! the running one. Pivot and rollback only flip the default deployment and
//! reboot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{RestoreReport, RollbackStep, StageHandler, StepProgress};
use crate::clusterconfig::ClusterAccessor;
use crate::config::HostLayout;
use crate::crd::SeedImageRef;
use crate::error::IbuError;
use crate::ops::CommandRunner;
use crate::seed::{SeedClusterInfo, load};

const SYSROOT_REPO: &str = "/sysroot/ostree/repo";
const SEED_VAR_ARCHIVE: &str = "var.tgz";
const SEED_OSTREE_REPO: &str = "ostree";
const SEED_OSTREE_REF: &str = "seed";

/// One entry of `ostree admin status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub index: usize,
    pub stateroot: String,
    pub checksum: String,
    pub booted: bool,
}

/// Parse deployments from `ostree admin status`, in index order.
///
/// Deployment lines look like `* rhcos 4b1f...e2.0` (booted) or
/// `  rhcos_4.16.2 9a0c...d1.0 (staged)`; indented detail lines are skipped.
pub fn parse_deployments(status: &str) -> Vec<Deployment> {
    status
        .lines()
        .filter_map(|line| {
            let (booted, rest) = if let Some(rest) = line.strip_prefix("* ") {
                (true, rest)
            } else {
                let rest = line.strip_prefix("  ")?;
                if rest.starts_with(' ') {
                    return None;
                }
                (false, rest)
            };
            let mut fields = rest.split_whitespace();
            let stateroot = fields.next()?;
            let checksum = fields.next()?;
            if stateroot.ends_with(':') {
                return None;
            }
            Some((booted, stateroot.to_string(), checksum.to_string()))
        })
        .enumerate()
        .map(|(index, (booted, stateroot, checksum))| Deployment {
            index,
            stateroot,
            checksum,
            booted,
        })
        .collect()
}

/// Stateroot a seed version is deployed into.
pub fn stateroot_name(seed: &SeedImageRef) -> String {
    format!("rhcos_{}", seed.version)
}

/// Absolute path as seen from inside the host namespace.
fn on_host(relative: &Path) -> PathBuf {
    Path::new("/").join(relative.strip_prefix("/").unwrap_or(relative))
}

pub struct OstreeStageHandler {
    layout: HostLayout,
    runner: Arc<dyn CommandRunner>,
    accessor: Arc<dyn ClusterAccessor>,
    authfile: Option<PathBuf>,
}

impl OstreeStageHandler {
    pub fn new(
        layout: HostLayout,
        runner: Arc<dyn CommandRunner>,
        accessor: Arc<dyn ClusterAccessor>,
        authfile: Option<PathBuf>,
    ) -> Self {
        Self {
            layout,
            runner,
            accessor,
            authfile,
        }
    }

    async fn deployments(&self) -> Result<Vec<Deployment>, IbuError> {
        let out = self.runner.run("ostree", &["admin", "status"]).await?;
        Ok(parse_deployments(&out))
    }

    fn stateroot_dir(&self, stateroot: &str) -> PathBuf {
        self.layout.ostree_deploy_dir.join(stateroot)
    }

    /// Restore report location inside the seed stateroot, before it is booted.
    fn staged_restore_report(&self, stateroot: &str) -> PathBuf {
        let relative = self
            .layout
            .restore_report_file
            .strip_prefix("var")
            .unwrap_or(&self.layout.restore_report_file);
        self.layout.stateroot_var(stateroot).join(relative)
    }

    async fn pull_seed(&self, image: &str) -> Result<(), IbuError> {
        info!("Pulling seed image {}", image);
        let authfile = self.authfile.as_ref().map(|p| p.display().to_string());
        let mut args = vec!["pull"];
        if let Some(authfile) = authfile.as_deref() {
            args.extend(["--authfile", authfile]);
        }
        args.push(image);
        self.runner.run("podman", &args).await.map(|_| ())
    }

    /// Undeploy every deployment of `stateroot` and remove its directory.
    async fn remove_stateroot(&self, stateroot: &str) -> Result<(), IbuError> {
        let deployments = self.deployments().await?;
        if deployments
            .iter()
            .any(|d| d.stateroot == stateroot && d.booted)
        {
            return Err(IbuError::Validation(format!(
                "refusing to remove booted stateroot {stateroot}"
            )));
        }

        // Undeploy from the highest index so lower indices stay valid.
        for d in deployments.iter().rev().filter(|d| d.stateroot == stateroot) {
            info!("Undeploying {} deployment {}", d.stateroot, d.index);
            let index = d.index.to_string();
            self.runner.run("ostree", &["admin", "undeploy", &index]).await?;
        }

        let dir = self.layout.host_path(self.stateroot_dir(stateroot));
        if dir.exists() {
            info!("Removing stateroot directory {}", dir.display());
            std::fs::remove_dir_all(&dir).map_err(|e| IbuError::io(&dir, e))?;
        }
        Ok(())
    }

    async fn reboot(&self) -> Result<StepProgress, IbuError> {
        info!("Rebooting node");
        self.runner.run("systemctl", &["reboot"]).await?;
        Ok(StepProgress::Pending)
    }
}

#[async_trait]
impl StageHandler for OstreeStageHandler {
    fn target_root(&self, seed: &SeedImageRef) -> PathBuf {
        self.layout.stateroot_var(&stateroot_name(seed))
    }

    async fn prep(&self, seed: &SeedImageRef) -> Result<(), IbuError> {
        let stateroot = stateroot_name(seed);
        if self
            .deployments()
            .await?
            .iter()
            .any(|d| d.stateroot == stateroot)
        {
            info!("Stateroot {} is already deployed, skipping prep", stateroot);
            return Ok(());
        }

        self.pull_seed(&seed.image).await?;
        let mount = self
            .runner
            .run("podman", &["image", "mount", &seed.image])
            .await?;
        let mount = PathBuf::from(mount);

        info!("Creating stateroot {}", stateroot);
        self.runner
            .run("ostree", &["admin", "os-init", &stateroot])
            .await?;

        let var = on_host(&self.stateroot_dir(&stateroot).join("var"));
        let archive = mount.join(SEED_VAR_ARCHIVE);
        info!("Extracting {} into {}", archive.display(), var.display());
        self.runner
            .run(
                "tar",
                &[
                    "xzf",
                    &archive.display().to_string(),
                    "-C",
                    &var.display().to_string(),
                    "--selinux",
                ],
            )
            .await?;

        let seed_repo = mount.join(SEED_OSTREE_REPO).display().to_string();
        self.runner
            .run(
                "ostree",
                &["pull-local", &format!("--repo={SYSROOT_REPO}"), &seed_repo, SEED_OSTREE_REF],
            )
            .await?;
        let commit = self
            .runner
            .run("ostree", &["rev-parse", &format!("--repo={seed_repo}"), SEED_OSTREE_REF])
            .await?;

        info!("Deploying seed commit {} into {}", commit, stateroot);
        self.runner
            .run(
                "ostree",
                &["admin", "deploy", "--os", &stateroot, "--not-as-default", "--no-prune", &commit],
            )
            .await?;

        self.runner
            .run("podman", &["image", "unmount", &seed.image])
            .await?;
        Ok(())
    }

    async fn seed_cluster_info(&self, seed: &SeedImageRef) -> Result<SeedClusterInfo, IbuError> {
        let path = self
            .target_root(seed)
            .join(&self.layout.seed_cluster_info_file);
        load(&path)
    }

    async fn pivot(&self, seed: &SeedImageRef) -> Result<StepProgress, IbuError> {
        let stateroot = stateroot_name(seed);
        let deployments = self.deployments().await?;
        if deployments
            .iter()
            .any(|d| d.booted && d.stateroot == stateroot)
        {
            info!("Booted into {}, pivot done", stateroot);
            return Ok(StepProgress::Done);
        }

        let target = deployments
            .iter()
            .find(|d| d.stateroot == stateroot)
            .ok_or_else(|| IbuError::NotFound(format!("deployment for stateroot {stateroot}")))?;

        let report = self.staged_restore_report(&stateroot);
        if report.exists() {
            std::fs::remove_file(&report).map_err(|e| IbuError::io(&report, e))?;
        }

        info!(
            "Setting {} deployment {} ({}) as default",
            stateroot, target.index, target.checksum
        );
        let index = target.index.to_string();
        self.runner
            .run("ostree", &["admin", "set-default", &index])
            .await?;
        self.reboot().await
    }

    async fn post_reboot_config(&self) -> Result<StepProgress, IbuError> {
        match RestoreReport::load(&self.layout.restore_report())? {
            None => Ok(StepProgress::Pending),
            Some(report) if report.success => Ok(StepProgress::Done),
            Some(report) => Err(IbuError::tool("restore", report.message)),
        }
    }

    async fn complete_upgrade(&self) -> Result<StepProgress, IbuError> {
        if self.accessor.node_ready().await? {
            Ok(StepProgress::Done)
        } else {
            Ok(StepProgress::Pending)
        }
    }

    async fn rollback_step(
        &self,
        step: RollbackStep,
        seed: &SeedImageRef,
    ) -> Result<StepProgress, IbuError> {
        let stateroot = stateroot_name(seed);
        info!("Running rollback step {} for {}", step, stateroot);

        match step {
            RollbackStep::CleanupPrepArtifacts | RollbackStep::CleanupUpgradeArtifacts => {
                self.remove_stateroot(&stateroot).await?;
                if let Err(e) = self.runner.run("podman", &["rmi", &seed.image]).await {
                    warn!("Failed to remove seed image {}: {}", seed.image, e);
                }
                Ok(StepProgress::Done)
            }
            RollbackStep::RestoreBootDeployment => {
                let deployments = self.deployments().await?;
                let previous = deployments
                    .iter()
                    .find(|d| d.stateroot != stateroot)
                    .ok_or_else(|| {
                        IbuError::NotFound("deployment to roll back to".to_string())
                    })?;
                if previous.index == 0 {
                    info!("{} is already the default deployment", previous.stateroot);
                    return Ok(StepProgress::Done);
                }
                let index = previous.index.to_string();
                self.runner
                    .run("ostree", &["admin", "set-default", &index])
                    .await?;
                Ok(StepProgress::Done)
            }
            RollbackStep::RebootIntoPrevious => {
                let booted_seed = self
                    .deployments()
                    .await?
                    .iter()
                    .any(|d| d.booted && d.stateroot == stateroot);
                if booted_seed {
                    self.reboot().await
                } else {
                    Ok(StepProgress::Done)
                }
            }
        }
    }

    async fn finalize_upgrade(&self, seed: &SeedImageRef) -> Result<(), IbuError> {
        let stateroot = stateroot_name(seed);
        let deployments = self.deployments().await?;
        let mut old: Vec<&str> = deployments
            .iter()
            .filter(|d| d.stateroot != stateroot && !d.booted)
            .map(|d| d.stateroot.as_str())
            .collect();
        old.dedup();
        for previous in old {
            info!("Removing pre-upgrade stateroot {}", previous);
            self.remove_stateroot(previous).await?;
        }
        Ok(())
    }
}
