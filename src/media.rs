//! Installation media: an ISO that installs a seed image on first boot.
//!
//! Renders a butane config from embedded assets, converts it to ignition with
//! `butane`, downloads the live ISO and embeds the ignition with
//! `coreos-installer`. Both tools run as containers through `podman`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use minijinja::Environment;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::CreateIsoArgs;
use crate::error::IbuError;
use crate::ops::CommandRunner;

pub const BUTANE_TEMPLATE: &str = "ibi-butane.template";
pub const SEED_INSTALL_SCRIPT: &str = "install-rhcos-and-restore-seed.sh";

const BUTANE_FILES_DIR: &str = "butaneFiles";
const BUTANE_CONFIG_FILE: &str = "config.bu";
const IGNITION_FILE: &str = "ibi-ignition.json";
const LIVE_ISO_FILE: &str = "rhcos-live.x86_64.iso";
const IBI_ISO_FILE: &str = "rhcos-ibi.iso";
const BUTANE_IMAGE: &str = "quay.io/coreos/butane:release";
const COREOS_INSTALLER_IMAGE: &str = "quay.io/coreos/coreos-installer:latest";

/// Named static assets compiled into the binary.
#[derive(Debug, Clone, Copy)]
pub struct AssetBundle {
    assets: &'static [(&'static str, &'static str)],
}

impl AssetBundle {
    pub const fn embedded() -> Self {
        Self {
            assets: &[
                (
                    BUTANE_TEMPLATE,
                    include_str!("../assets/ibi-butane.template"),
                ),
                (
                    SEED_INSTALL_SCRIPT,
                    include_str!("../assets/install-rhcos-and-restore-seed.sh"),
                ),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Result<&'static str, IbuError> {
        self.assets
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, content)| *content)
            .ok_or_else(|| IbuError::NotFound(format!("embedded asset {name}")))
    }
}

/// Values substituted into the butane template.
///
/// File fields are paths relative to the butane files directory.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnitionData {
    pub seed_image: String,
    pub seed_version: String,
    pub backup_secret: String,
    pub pull_secret: String,
    pub ssh_public_key: String,
    pub install_seed_script: String,
    pub agent_image: String,
    pub installation_disk: String,
}

/// Inputs of `create-iso`.
#[derive(Debug, Clone, Default)]
pub struct MediaRequest {
    pub seed_image: String,
    pub seed_version: String,
    pub authfile: PathBuf,
    pub pull_secret_file: PathBuf,
    pub ssh_public_key_file: Option<PathBuf>,
    pub agent_image: String,
    pub live_iso_url: String,
    pub installation_disk: String,
}

impl From<&CreateIsoArgs> for MediaRequest {
    fn from(args: &CreateIsoArgs) -> Self {
        Self {
            seed_image: args.seed_image.clone(),
            seed_version: args.seed_version.clone(),
            authfile: args.authfile.clone(),
            pull_secret_file: args.pullsecret_file.clone(),
            ssh_public_key_file: args.ssh_public_key_file.clone(),
            agent_image: args.agent_image.clone(),
            live_iso_url: args.rhcos_live_iso_url.clone(),
            installation_disk: args.installation_disk.clone(),
        }
    }
}

/// Render `template` with `data`.
pub fn render_butane(template: &str, data: &IgnitionData) -> Result<String, IbuError> {
    let mut env = Environment::new();
    env.add_template(BUTANE_TEMPLATE, template)
        .and_then(|()| env.get_template(BUTANE_TEMPLATE)?.render(data))
        .map_err(|e| IbuError::Config(format!("failed to render butane template: {e}")))
}

fn remove_if_exists(path: &Path) -> Result<(), IbuError> {
    if path.exists() {
        info!("{} exists, deleting it", path.display());
        std::fs::remove_file(path).map_err(|e| IbuError::io(path, e))?;
    }
    Ok(())
}

pub struct InstallationIso {
    work_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    assets: AssetBundle,
    http: reqwest::Client,
}

impl InstallationIso {
    pub fn new(work_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            work_dir: work_dir.into(),
            runner,
            assets: AssetBundle::embedded(),
            http: reqwest::Client::new(),
        }
    }

    /// Build the installation ISO and return its path.
    pub async fn create(&self, request: &MediaRequest) -> Result<PathBuf, IbuError> {
        info!("Creating image-based installation ISO");
        let work_dir = self.validate()?;

        info!("Generating ignition config");
        self.render_butane_config(&work_dir, request)?;
        self.render_ignition(&work_dir).await?;
        self.download_live_iso(&work_dir, &request.live_iso_url).await?;
        self.embed_ignition(&work_dir).await?;

        let iso = work_dir.join(IBI_ISO_FILE);
        info!("Installation ISO created at {}", iso.display());
        Ok(iso)
    }

    /// The work directory must exist; returns it as an absolute path for volume mounts.
    fn validate(&self) -> Result<PathBuf, IbuError> {
        std::fs::canonicalize(&self.work_dir).map_err(|e| IbuError::io(&self.work_dir, e))
    }

    fn render_butane_config(
        &self,
        work_dir: &Path,
        request: &MediaRequest,
    ) -> Result<(), IbuError> {
        debug!("Generating butane config");
        let ssh_public_key = match &request.ssh_public_key_file {
            Some(path) => std::fs::read_to_string(path).map_err(|e| IbuError::io(path, e))?,
            None => {
                info!("SSH public key not provided, skipping");
                String::new()
            }
        };

        // Butane resolves `local:` sources relative to its files directory,
        // so secrets are copied there instead of being inlined.
        let files_dir = work_dir.join(BUTANE_FILES_DIR);
        std::fs::create_dir_all(&files_dir).map_err(|e| IbuError::io(&files_dir, e))?;

        let script = files_dir.join("seedInstallScript");
        let script_body = self.assets.get(SEED_INSTALL_SCRIPT)?;
        std::fs::write(&script, script_body).map_err(|e| IbuError::io(&script, e))?;

        let pull_secret = files_dir.join("pullSecret");
        std::fs::copy(&request.pull_secret_file, &pull_secret)
            .map_err(|e| IbuError::io(&request.pull_secret_file, e))?;

        let backup_secret = files_dir.join("backupSecret");
        std::fs::copy(&request.authfile, &backup_secret)
            .map_err(|e| IbuError::io(&request.authfile, e))?;

        let relative = |path: &Path| {
            path.strip_prefix(work_dir)
                .unwrap_or(path)
                .display()
                .to_string()
        };
        let data = IgnitionData {
            seed_image: request.seed_image.clone(),
            seed_version: request.seed_version.clone(),
            backup_secret: relative(&backup_secret),
            pull_secret: relative(&pull_secret),
            ssh_public_key,
            install_seed_script: relative(&script),
            agent_image: request.agent_image.clone(),
            installation_disk: request.installation_disk.clone(),
        };

        let rendered = render_butane(self.assets.get(BUTANE_TEMPLATE)?, &data)?;
        let config = work_dir.join(BUTANE_CONFIG_FILE);
        std::fs::write(&config, rendered).map_err(|e| IbuError::io(&config, e))
    }

    async fn render_ignition(&self, work_dir: &Path) -> Result<(), IbuError> {
        let ignition = work_dir.join(IGNITION_FILE);
        remove_if_exists(&ignition)?;

        let volume = format!("{}:/data:rw,Z", work_dir.display());
        let config = format!("/data/{BUTANE_CONFIG_FILE}");
        let content = self
            .runner
            .run(
                "podman",
                &[
                    "run",
                    "-v",
                    volume.as_str(),
                    "--rm",
                    BUTANE_IMAGE,
                    "--pretty",
                    "--strict",
                    "-d",
                    "/data",
                    config.as_str(),
                ],
            )
            .await?;

        info!("Writing ignition config to {}", ignition.display());
        std::fs::write(&ignition, content).map_err(|e| IbuError::io(&ignition, e))
    }

    async fn download_live_iso(&self, work_dir: &Path, url: &str) -> Result<(), IbuError> {
        let iso = work_dir.join(LIVE_ISO_FILE);
        if iso.exists() {
            info!("Live ISO {} exists, skipping download", iso.display());
            return Ok(());
        }

        info!("Downloading live ISO from {}", url);
        let download_error = |e: reqwest::Error| IbuError::tool("download", e.to_string());
        let mut response = self.http.get(url).send().await.map_err(download_error)?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(IbuError::tool(
                "download",
                format!("failed to download ISO from {url}, status: {}", response.status()),
            ));
        }

        // Write to a partial file so an interrupted download is not mistaken for a complete ISO.
        let partial = iso.with_extension("iso.part");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| IbuError::io(&partial, e))?;
        while let Some(chunk) = response.chunk().await.map_err(download_error)? {
            file.write_all(&chunk)
                .await
                .map_err(|e| IbuError::io(&partial, e))?;
        }
        file.flush().await.map_err(|e| IbuError::io(&partial, e))?;
        tokio::fs::rename(&partial, &iso)
            .await
            .map_err(|e| IbuError::io(&iso, e))
    }

    async fn embed_ignition(&self, work_dir: &Path) -> Result<(), IbuError> {
        remove_if_exists(&work_dir.join(IBI_ISO_FILE))?;

        let volume = format!("{}:/data:rw,Z", work_dir.display());
        let ignition = format!("/data/{IGNITION_FILE}");
        let output = format!("/data/{IBI_ISO_FILE}");
        let input = format!("/data/{LIVE_ISO_FILE}");
        self.runner
            .run(
                "podman",
                &[
                    "run",
                    "-v",
                    volume.as_str(),
                    COREOS_INSTALLER_IMAGE,
                    "iso",
                    "ignition",
                    "embed",
                    "-i",
                    ignition.as_str(),
                    "-o",
                    output.as_str(),
                    input.as_str(),
                ],
            )
            .await?;
        Ok(())
    }
}
