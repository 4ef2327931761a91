//! CLI configuration and host filesystem layout.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Image-based upgrade operator and seed restore tool for single-node clusters.
#[derive(Parser, Debug, Clone)]
#[command(name = "ibu")]
#[command(about = "Image-based upgrade operator and seed restore tool")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "IBU_LOG_LEVEL")]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the ImageBasedUpgrade controller
    Operator(OperatorArgs),
    /// Clean up and restore the seed cluster on a freshly booted seed-derived node
    Restore(RestoreArgs),
    /// Create an installation ISO that installs a seed image on first boot
    CreateIso(CreateIsoArgs),
}

#[derive(Args, Debug, Clone)]
pub struct OperatorArgs {
    /// Path where the host root filesystem is mounted
    #[arg(long, env = "IBU_HOST_ROOT", default_value = "/host")]
    pub host_root: PathBuf,

    /// Health server port
    #[arg(long, env = "IBU_HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    /// Metrics server port
    #[arg(long, env = "IBU_METRICS_PORT", default_value = "8081")]
    pub metrics_port: u16,

    /// Admission webhook port
    #[arg(long, env = "IBU_WEBHOOK_PORT", default_value = "9443")]
    pub webhook_port: u16,

    /// PEM certificate for the admission webhook (webhook disabled when unset)
    #[arg(long, env = "IBU_WEBHOOK_CERT")]
    pub webhook_cert: Option<PathBuf>,

    /// PEM private key for the admission webhook
    #[arg(long, env = "IBU_WEBHOOK_KEY")]
    pub webhook_key: Option<PathBuf>,

    /// Registry auth file used when pulling the seed image
    #[arg(long, env = "IBU_AUTHFILE")]
    pub authfile: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    /// Registry that replaces the registry host of the recert image (disconnected mirrors)
    #[arg(long, short = 'r')]
    pub container_registry: Option<String>,

    /// Registry auth file
    #[arg(long, short = 'a')]
    pub authfile: Option<PathBuf>,

    /// Recert container image; defaults to the one recorded in the seed
    #[arg(long)]
    pub recert_image: Option<String>,

    /// Skip the recert dry run
    #[arg(long, default_value = "false")]
    pub recert_skip_validation: bool,

    /// Backup directory removed before restoring
    #[arg(long, default_value = "/var/tmp/backup")]
    pub backup_dir: PathBuf,

    /// Path where the host root filesystem is mounted
    #[arg(long, env = "IBU_HOST_ROOT", default_value = "/host")]
    pub host_root: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct CreateIsoArgs {
    /// Seed image pull-spec
    #[arg(long, short = 's')]
    pub seed_image: String,

    /// OCP version of the seed image
    #[arg(long, short = 'v')]
    pub seed_version: String,

    /// Registry auth file written to the node as the backup secret
    #[arg(long, short = 'a')]
    pub authfile: PathBuf,

    /// Cluster pull secret file
    #[arg(long, short = 'p')]
    pub pullsecret_file: PathBuf,

    /// SSH public key file added to the installed node
    #[arg(long, short = 'k')]
    pub ssh_public_key_file: Option<PathBuf>,

    /// Agent image that runs the restore on first boot
    #[arg(long, short = 'l', default_value = "quay.io/openshift-kni/lifecycle-agent-operator:latest")]
    pub agent_image: String,

    /// Live ISO URL
    #[arg(long, short = 'u')]
    pub rhcos_live_iso_url: String,

    /// Installation disk
    #[arg(long, short = 'i')]
    pub installation_disk: String,

    /// Work directory for generated files
    #[arg(long, short = 'w')]
    pub work_dir: PathBuf,
}

/// Host filesystem locations used by the gatherer, restorer and stage handler.
///
/// Every path except `host_root` is relative to `host_root`, so tests point the
/// whole layout at a temporary directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub host_root: PathBuf,
    /// Network connection files or directories copied into the bundle.
    pub network_paths: Vec<PathBuf>,
    /// SSH authorized keys written by the machine config daemon.
    pub ssh_key_file: PathBuf,
    /// CA bundle copied next to the bundle manifests.
    pub ca_bundle_file: PathBuf,
    /// Seed cluster info, relative to a stateroot `var` directory.
    pub seed_cluster_info_file: PathBuf,
    /// Report written by `ibu restore` and read back by the operator.
    pub restore_report_file: PathBuf,
    /// Work directory for recert configuration and crypto material.
    pub work_dir: PathBuf,
    /// Seed-time artifacts removed before restoring.
    pub stale_artifacts: Vec<PathBuf>,
    /// Ostree deployment root.
    pub ostree_deploy_dir: PathBuf,
}

impl Default for HostLayout {
    fn default() -> Self {
        Self::new("/host")
    }
}

impl HostLayout {
    pub fn new(host_root: impl Into<PathBuf>) -> Self {
        Self {
            host_root: host_root.into(),
            network_paths: vec![PathBuf::from("etc/NetworkManager/system-connections")],
            ssh_key_file: PathBuf::from("home/core/.ssh/authorized_keys.d/ignition"),
            ca_bundle_file: PathBuf::from(
                "etc/pki/ca-trust/source/anchors/openshift-config-user-ca-bundle.crt",
            ),
            seed_cluster_info_file: PathBuf::from("lib/lca/workspace/manifest.json"),
            restore_report_file: PathBuf::from("var/lib/lca/restore-report.json"),
            work_dir: PathBuf::from("var/lib/lca/workspace"),
            stale_artifacts: vec![
                PathBuf::from("var/lib/lca/workspace/seed-install"),
                PathBuf::from("var/lib/lca/workspace/recert-summary-seed.yaml"),
            ],
            ostree_deploy_dir: PathBuf::from("sysroot/ostree/deploy"),
        }
    }

    /// Resolve a host-relative path under the host root.
    pub fn host_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        let relative = relative.as_ref();
        self.host_root
            .join(relative.strip_prefix("/").unwrap_or(relative))
    }

    /// `var` directory of the booted stateroot.
    pub fn booted_var(&self) -> PathBuf {
        self.host_path("var")
    }

    /// `var` directory of the given stateroot.
    pub fn stateroot_var(&self, stateroot: &str) -> PathBuf {
        self.host_path(self.ostree_deploy_dir.join(stateroot).join("var"))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.host_path(&self.work_dir)
    }

    pub fn restore_report(&self) -> PathBuf {
        self.host_path(&self.restore_report_file)
    }
}

/// Fixed layout of a cluster configuration bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub const MANIFESTS_DIR: &'static str = "manifests";
    pub const NETWORK_DIR: &'static str = "network-configuration";
    pub const DESCRIPTOR_FILE: &'static str = "seed-reconfiguration.json";
    pub const PROXY_FILE: &'static str = "proxy.json";
    pub const IDMS_FILE: &'static str = "image-digest-mirror-set.json";
    pub const ICSP_FILE: &'static str = "image-content-source-policy-list.json";
    pub const CA_BUNDLE_FILE: &'static str = "user-ca-bundle.json";

    /// Bundle under a stateroot `var` directory.
    pub fn under(var_root: impl AsRef<Path>) -> Self {
        Self {
            root: var_root
                .as_ref()
                .join("opt/openshift/cluster-configuration"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join(Self::MANIFESTS_DIR)
    }

    pub fn network_dir(&self) -> PathBuf {
        self.root.join(Self::NETWORK_DIR)
    }

    pub fn descriptor_file(&self) -> PathBuf {
        self.root.join(Self::DESCRIPTOR_FILE)
    }

    pub fn manifest(&self, file_name: &str) -> PathBuf {
        self.manifests_dir().join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_operator_defaults() {
        let cli = Cli::try_parse_from(["ibu", "operator"]).unwrap();
        let Command::Operator(args) = cli.command else {
            panic!("expected operator subcommand");
        };
        assert_eq!(args.host_root, PathBuf::from("/host"));
        assert_eq!(args.health_port, 8080);
        assert_eq!(args.metrics_port, 8081);
        assert_eq!(args.webhook_port, 9443);
        assert!(args.webhook_cert.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_restore_flags() {
        let cli = Cli::try_parse_from([
            "ibu",
            "restore",
            "--recert-image",
            "quay.io/edge-infrastructure/recert:v0",
            "--recert-skip-validation",
            "-a",
            "/var/lib/auth.json",
        ])
        .unwrap();
        let Command::Restore(args) = cli.command else {
            panic!("expected restore subcommand");
        };
        assert!(args.recert_skip_validation);
        assert_eq!(
            args.recert_image.as_deref(),
            Some("quay.io/edge-infrastructure/recert:v0")
        );
        assert_eq!(args.authfile, Some(PathBuf::from("/var/lib/auth.json")));
        assert_eq!(args.backup_dir, PathBuf::from("/var/tmp/backup"));
    }

    #[test]
    fn test_create_iso_requires_seed_image() {
        assert!(Cli::try_parse_from(["ibu", "create-iso"]).is_err());
    }

    #[test]
    fn test_host_path_strips_leading_slash() {
        let layout = HostLayout::new("/tmp/root");
        assert_eq!(
            layout.host_path("/var/tmp/backup"),
            PathBuf::from("/tmp/root/var/tmp/backup")
        );
        assert_eq!(
            layout.host_path("etc/hostname"),
            PathBuf::from("/tmp/root/etc/hostname")
        );
    }

    #[test]
    fn test_stateroot_var() {
        let layout = HostLayout::new("/host");
        assert_eq!(
            layout.stateroot_var("rhcos_4.16.2"),
            PathBuf::from("/host/sysroot/ostree/deploy/rhcos_4.16.2/var")
        );
    }

    #[test]
    fn test_bundle_layout_paths() {
        let bundle = BundleLayout::under("/host/var");
        assert_eq!(
            bundle.descriptor_file(),
            PathBuf::from("/host/var/opt/openshift/cluster-configuration/seed-reconfiguration.json")
        );
        assert_eq!(
            bundle.manifest(BundleLayout::PROXY_FILE),
            PathBuf::from("/host/var/opt/openshift/cluster-configuration/manifests/proxy.json")
        );
        assert_eq!(
            bundle.network_dir(),
            PathBuf::from("/host/var/opt/openshift/cluster-configuration/network-configuration")
        );
    }
}
