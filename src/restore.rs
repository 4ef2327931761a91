//! Identity transplant: clean up a freshly booted seed-derived node and
//! rewrite its certificates for the target cluster identity.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::config::{BundleLayout, HostLayout, RestoreArgs};
use crate::error::IbuError;
use crate::handler::RestoreReport;
use crate::ops::CommandRunner;
use crate::seed::{SeedClusterInfo, SeedReconfiguration, load, write_json};

const ETCD_ENDPOINT: &str = "localhost:2379";
const CRYPTO_DIR: &str = "recert-crypto";
const CONFIG_FILE: &str = "recert_config.json";
const SUMMARY_FILE: &str = "recert-summary.yaml";
const ADMIN_CA_FILE: &str = "admin-kubeconfig-client-ca.crt";

/// Restore options from the command line.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub container_registry: Option<String>,
    pub authfile: Option<PathBuf>,
    pub recert_image: Option<String>,
    pub skip_validation: bool,
    pub backup_dir: PathBuf,
}

impl From<&RestoreArgs> for RestoreOptions {
    fn from(args: &RestoreArgs) -> Self {
        Self {
            container_registry: args.container_registry.clone(),
            authfile: args.authfile.clone(),
            recert_image: args.recert_image.clone(),
            skip_validation: args.recert_skip_validation,
            backup_dir: args.backup_dir.clone(),
        }
    }
}

/// Configuration handed to the certificate rewrite tool.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RecertConfig {
    pub dry_run: bool,
    pub etcd_endpoint: String,
    pub static_dirs: Vec<String>,
    pub static_files: Vec<String>,
    pub cn_san_replace_rules: Vec<String>,
    pub use_key_rules: Vec<String>,
    pub use_cert_rules: Vec<String>,
    pub cluster_rename: String,
    pub hostname: String,
    pub ip: String,
    pub summary_file_clean: String,
    pub kubeadmin_password_hash: String,
    pub pull_secret: String,
}

/// Replace the registry host of `image` with `registry`.
pub fn rebase_image(image: &str, registry: &str) -> String {
    match image.split_once('/') {
        Some((_, rest)) => format!("{}/{rest}", registry.trim_end_matches('/')),
        None => format!("{}/{image}", registry.trim_end_matches('/')),
    }
}

/// Build the rewrite configuration: seed identity in, target identity out.
///
/// `crypto_dir` is the host path holding the retained keys.
pub fn recert_config(
    target: &SeedReconfiguration,
    seed: &SeedClusterInfo,
    crypto_dir: &Path,
    summary_file: &Path,
    dry_run: bool,
) -> RecertConfig {
    let seed_domain = seed.cluster_domain();
    let target_domain = format!("{}.{}", target.cluster_name, target.base_domain);

    let mut cn_san_replace_rules = vec![
        format!("api-int.{seed_domain}:api-int.{target_domain}"),
        format!("api.{seed_domain}:api.{target_domain}"),
        format!("*.apps.{seed_domain}:*.apps.{target_domain}"),
    ];
    if !seed.node_ip.is_empty() && !target.node_ip.is_empty() {
        cn_san_replace_rules.push(format!("{}:{}", seed.node_ip, target.node_ip));
    }
    if !seed.sno_hostname.is_empty() && !target.hostname.is_empty() {
        cn_san_replace_rules.push(format!("{}:{}", seed.sno_hostname, target.hostname));
    }

    let use_key_rules = target
        .kubeconfig_crypto_retention
        .key_files()
        .iter()
        .filter(|(_, _, pem)| !pem.is_empty())
        .map(|(file, rule, _)| format!("{rule} {}", crypto_dir.join(file).display()))
        .collect();

    let mut use_cert_rules = Vec::new();
    if !target
        .kubeconfig_crypto_retention
        .kube_apiserver_crypto
        .admin_client_ca_certificate
        .is_empty()
    {
        use_cert_rules.push(crypto_dir.join(ADMIN_CA_FILE).display().to_string());
    }

    RecertConfig {
        dry_run,
        etcd_endpoint: ETCD_ENDPOINT.to_string(),
        static_dirs: vec![
            "/kubelet".to_string(),
            "/kubernetes".to_string(),
            "/machine-config-daemon".to_string(),
        ],
        static_files: vec![
            "/host-etc/mcs-machine-config-content.json".to_string(),
            "/host-etc/mco/proxy.env".to_string(),
        ],
        cn_san_replace_rules,
        use_key_rules,
        use_cert_rules,
        cluster_rename: format!(
            "{}:{}:{}",
            target.cluster_name, target.base_domain, target.infra_id
        ),
        hostname: target.hostname.clone(),
        ip: target.node_ip.clone(),
        summary_file_clean: summary_file.display().to_string(),
        kubeadmin_password_hash: target.kubeadmin_password_hash.clone(),
        pull_secret: target.pull_secret.clone(),
    }
}

fn remove_path(path: &Path) -> Result<(), IbuError> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => {
            info!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IbuError::io(path, e)),
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), IbuError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IbuError::io(parent, e))?;
    }
    std::fs::write(path, contents).map_err(|e| IbuError::io(path, e))
}

/// Cleans up seed leftovers and runs the certificate rewrite.
pub struct Restorer {
    layout: HostLayout,
    runner: Arc<dyn CommandRunner>,
    options: RestoreOptions,
}

impl Restorer {
    pub fn new(layout: HostLayout, runner: Arc<dyn CommandRunner>, options: RestoreOptions) -> Self {
        Self {
            layout,
            runner,
            options,
        }
    }

    /// Run the restore and record its outcome for the operator.
    pub async fn run_and_report(&self) -> Result<(), IbuError> {
        let result = self.run().await;
        let report = match &result {
            Ok(()) => RestoreReport::new(true, "Seed cluster restored"),
            Err(e) => RestoreReport::new(false, e.to_string()),
        };
        if let Err(e) = report.write(&self.layout.restore_report()) {
            error!("Failed to write restore report: {}", e);
        }
        result
    }

    /// Clean up and restore the seed cluster. Stops at the first failure.
    pub async fn run(&self) -> Result<(), IbuError> {
        self.cleanup_stale_artifacts()?;

        let var = self.layout.booted_var();
        let bundle = BundleLayout::under(&var);
        let target: SeedReconfiguration = load(&bundle.descriptor_file())?;
        let seed: SeedClusterInfo = load(&var.join(&self.layout.seed_cluster_info_file))?;
        info!(
            "Restoring identity {}.{} onto seed {}",
            target.cluster_name,
            target.base_domain,
            seed.cluster_domain()
        );

        let image = self.recert_image(&seed)?;
        let work_dir = self.layout.work_dir();
        let host_work_dir = Path::new("/").join(&self.layout.work_dir);
        self.write_crypto(&target, &work_dir.join(CRYPTO_DIR))?;

        if self.options.skip_validation {
            info!("Skipping recert validation");
        } else {
            self.recert(&target, &seed, &image, &work_dir, &host_work_dir, true)
                .await?;
        }
        self.recert(&target, &seed, &image, &work_dir, &host_work_dir, false)
            .await?;

        info!("Seed cluster restored successfully");
        Ok(())
    }

    fn cleanup_stale_artifacts(&self) -> Result<(), IbuError> {
        info!("Cleaning up stale seed artifacts");
        remove_path(&self.layout.host_path(&self.options.backup_dir))?;
        for artifact in &self.layout.stale_artifacts {
            remove_path(&self.layout.host_path(artifact))?;
        }
        Ok(())
    }

    fn recert_image(&self, seed: &SeedClusterInfo) -> Result<String, IbuError> {
        let image = self
            .options
            .recert_image
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| seed.recert_image_pull_spec.clone());
        if image.is_empty() {
            return Err(IbuError::Config(
                "no recert image given and none recorded in the seed".to_string(),
            ));
        }
        Ok(match &self.options.container_registry {
            Some(registry) if !registry.is_empty() => rebase_image(&image, registry),
            _ => image,
        })
    }

    fn write_crypto(&self, target: &SeedReconfiguration, dir: &Path) -> Result<(), IbuError> {
        info!("Writing retained crypto material to {}", dir.display());
        let crypto = &target.kubeconfig_crypto_retention;
        for (file, _, pem) in crypto.key_files() {
            if !pem.is_empty() {
                write_file(&dir.join(file), pem)?;
            }
        }
        let admin_ca = &crypto.kube_apiserver_crypto.admin_client_ca_certificate;
        if !admin_ca.is_empty() {
            write_file(&dir.join(ADMIN_CA_FILE), admin_ca)?;
        }
        Ok(())
    }

    async fn recert(
        &self,
        target: &SeedReconfiguration,
        seed: &SeedClusterInfo,
        image: &str,
        work_dir: &Path,
        host_work_dir: &Path,
        dry_run: bool,
    ) -> Result<(), IbuError> {
        let config = recert_config(
            target,
            seed,
            &host_work_dir.join(CRYPTO_DIR),
            &host_work_dir.join(SUMMARY_FILE),
            dry_run,
        );
        write_json(&work_dir.join(CONFIG_FILE), &config)?;

        let mount = format!("{}:{}", host_work_dir.display(), host_work_dir.display());
        let env = format!(
            "RECERT_CONFIG={}",
            host_work_dir.join(CONFIG_FILE).display()
        );
        let authfile = self
            .options
            .authfile
            .as_ref()
            .map(|p| p.display().to_string());

        let mut args = vec![
            "run",
            "--rm",
            "--network=host",
            "--privileged",
            "--replace",
            "--name",
            "recert",
            "-v",
            "/etc:/host-etc",
            "-v",
            "/etc/kubernetes:/kubernetes",
            "-v",
            "/var/lib/kubelet:/kubelet",
            "-v",
            "/etc/machine-config-daemon:/machine-config-daemon",
            "-v",
            mount.as_str(),
        ];
        if let Some(authfile) = authfile.as_deref() {
            args.extend(["--authfile", authfile]);
        }
        args.extend(["-e", env.as_str(), image]);

        info!(
            "Running recert{} with {}",
            if dry_run { " dry run" } else { "" },
            image
        );
        self.runner.run("podman", &args).await?;
        Ok(())
    }
}
