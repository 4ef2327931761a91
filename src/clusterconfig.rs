//! Cluster configuration gatherer.
//!
//! Captures the running cluster's configuration and identity into a bundle
//! under a target stateroot `var` directory. Steps run sequentially and the
//! first failure aborts the rest.

pub mod accessor;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::config::{BundleLayout, HostLayout};
use crate::error::IbuError;
use crate::seed::reconfiguration::SEED_RECONFIGURATION_VERSION;
use crate::seed::{KubeconfigCryptoRetention, SeedReconfiguration, write_json};

pub use accessor::{ClusterAccessor, ClusterInfo, KubeClusterAccessor};
use types::{TypeRegistry, clean_metadata, name_of, spec_only};

const OPENSHIFT_CONFIG_NS: &str = "openshift-config";
const PULL_SECRET_NAME: &str = "pull-secret";
const PULL_SECRET_KEY: &str = ".dockerconfigjson";
const CA_BUNDLE_CM_NAME: &str = "user-ca-bundle";
const KUBEADMIN_NS: &str = "kube-system";
const KUBEADMIN_SECRET: &str = "kubeadmin";

/// Build the seed identity descriptor from gathered facts.
pub fn seed_reconfiguration_from_cluster_info(
    info: &ClusterInfo,
    crypto: KubeconfigCryptoRetention,
    ssh_key: String,
    infra_id: String,
    pull_secret: String,
    kubeadmin_password_hash: String,
) -> SeedReconfiguration {
    SeedReconfiguration {
        api_version: SEED_RECONFIGURATION_VERSION,
        base_domain: info.base_domain.clone(),
        cluster_name: info.cluster_name.clone(),
        cluster_id: info.cluster_id.clone(),
        infra_id,
        node_ip: info.node_ip.clone(),
        release_registry: info.release_registry.clone(),
        hostname: info.hostname.clone(),
        kubeconfig_crypto_retention: crypto,
        ssh_key,
        pull_secret,
        kubeadmin_password_hash,
    }
}

/// Gathers cluster configuration into a bundle.
pub struct ClusterConfigGatherer {
    accessor: Arc<dyn ClusterAccessor>,
    layout: HostLayout,
    registry: TypeRegistry,
}

impl ClusterConfigGatherer {
    pub fn new(accessor: Arc<dyn ClusterAccessor>, layout: HostLayout) -> Self {
        Self {
            accessor,
            layout,
            registry: TypeRegistry::default(),
        }
    }

    /// Write the bundle under `var_root` and return its layout.
    pub async fn gather(&self, var_root: &Path) -> Result<BundleLayout, IbuError> {
        info!("Fetching cluster configuration");
        let bundle = BundleLayout::under(var_root);
        self.prepare(&bundle)?;

        self.fetch_proxy(&bundle).await?;
        self.fetch_idms(&bundle).await?;
        self.fetch_identity(&bundle).await?;
        self.fetch_ca_bundle(&bundle).await?;
        self.fetch_icsps(&bundle).await?;
        self.fetch_network_config(&bundle)?;

        info!("Successfully fetched cluster configuration");
        Ok(bundle)
    }

    /// Empty kubeadmin hash when the secret is absent: the target deletes its credential.
    pub async fn kubeadmin_password_hash(&self) -> Result<String, IbuError> {
        Ok(self
            .accessor
            .get_secret_data(KUBEADMIN_NS, KUBEADMIN_SECRET, KUBEADMIN_SECRET)
            .await?
            .unwrap_or_default())
    }

    fn prepare(&self, bundle: &BundleLayout) -> Result<(), IbuError> {
        let root = bundle.root();
        if root.exists() {
            std::fs::remove_dir_all(root).map_err(|e| IbuError::io(root, e))?;
        }
        let manifests = bundle.manifests_dir();
        info!("Creating cluster configuration folder {}", manifests.display());
        std::fs::create_dir_all(&manifests).map_err(|e| IbuError::io(&manifests, e))
    }

    async fn fetch_proxy(&self, bundle: &BundleLayout) -> Result<(), IbuError> {
        info!("Fetching cluster-wide proxy");
        let proxy = self.accessor.get_proxy().await?;
        let proxy = self.registry.tag("Proxy", spec_only(&proxy))?;
        let path = bundle.manifest(BundleLayout::PROXY_FILE);
        info!("Writing proxy to {}", path.display());
        write_json(&path, &proxy)
    }

    fn to_list(&self, kind: &str, items: &[Value]) -> Result<Value, IbuError> {
        let mut cleaned = items
            .iter()
            .map(|obj| self.registry.tag(kind, spec_only(obj)))
            .collect::<Result<Vec<_>, _>>()?;
        cleaned.sort_by(|a, b| name_of(a).cmp(name_of(b)));
        self.registry.list(kind, cleaned)
    }

    async fn fetch_idms(&self, bundle: &BundleLayout) -> Result<(), IbuError> {
        info!("Fetching image digest mirror sets");
        let items = self.accessor.list_image_digest_mirror_sets().await?;
        if items.is_empty() {
            info!("ImageDigestMirrorSetList is empty, skipping");
            return Ok(());
        }
        let path = bundle.manifest(BundleLayout::IDMS_FILE);
        info!("Writing {} image digest mirror sets to {}", items.len(), path.display());
        write_json(&path, &self.to_list("ImageDigestMirrorSet", &items)?)
    }

    async fn fetch_icsps(&self, bundle: &BundleLayout) -> Result<(), IbuError> {
        info!("Fetching image content source policies");
        let items = self.accessor.list_image_content_source_policies().await?;
        if items.is_empty() {
            info!("ImageContentSourcePolicyList is empty, skipping");
            return Ok(());
        }
        let path = bundle.manifest(BundleLayout::ICSP_FILE);
        info!("Writing {} image content source policies to {}", items.len(), path.display());
        write_json(&path, &self.to_list("ImageContentSourcePolicy", &items)?)
    }

    async fn fetch_identity(&self, bundle: &BundleLayout) -> Result<(), IbuError> {
        info!("Fetching cluster identity");
        let info = self.accessor.cluster_info().await?;
        info!(
            "Cluster {}.{} at OCP {} (mirror registry configured: {})",
            info.cluster_name, info.base_domain, info.ocp_version, info.mirror_registry_configured
        );
        let crypto = self.accessor.kubeconfig_crypto_retention().await?;

        let ssh_path = self.layout.host_path(&self.layout.ssh_key_file);
        let ssh_key = std::fs::read_to_string(&ssh_path).map_err(|e| IbuError::io(&ssh_path, e))?;

        let infra_id = self.accessor.infra_id().await?;

        info!("Fetching pull-secret");
        let pull_secret = self
            .accessor
            .get_secret_data(OPENSHIFT_CONFIG_NS, PULL_SECRET_NAME, PULL_SECRET_KEY)
            .await?
            .ok_or_else(|| {
                IbuError::NotFound(format!("secret {OPENSHIFT_CONFIG_NS}/{PULL_SECRET_NAME}"))
            })?;

        let kubeadmin_password_hash = self.kubeadmin_password_hash().await?;
        if kubeadmin_password_hash.is_empty() {
            info!("No kubeadmin secret found, the target will delete its kubeadmin credential");
        }

        let descriptor = seed_reconfiguration_from_cluster_info(
            &info,
            crypto,
            ssh_key,
            infra_id,
            pull_secret,
            kubeadmin_password_hash,
        );
        let path = bundle.descriptor_file();
        info!("Writing seed reconfiguration to {}", path.display());
        write_json(&path, &descriptor)
    }

    async fn fetch_ca_bundle(&self, bundle: &BundleLayout) -> Result<(), IbuError> {
        info!("Fetching user ca bundle");
        let Some(cm) = self
            .accessor
            .get_config_map(OPENSHIFT_CONFIG_NS, CA_BUNDLE_CM_NAME)
            .await?
        else {
            info!("Config map {OPENSHIFT_CONFIG_NS}/{CA_BUNDLE_CM_NAME} not found, skipping");
            return Ok(());
        };

        let mut obj = serde_json::to_value(&cm)?;
        let meta = clean_metadata(&obj);
        if let Some(map) = obj.as_object_mut() {
            map.insert("metadata".into(), meta);
        }
        let obj = self.registry.tag("ConfigMap", obj)?;
        let path = bundle.manifest(BundleLayout::CA_BUNDLE_FILE);
        info!("Writing user ca bundle to {}", path.display());
        write_json(&path, &obj)?;

        let host_file = self.layout.host_path(&self.layout.ca_bundle_file);
        if let Some(name) = host_file.file_name()
            && host_file.is_file()
        {
            let dest = bundle.root().join(name);
            info!("Copying {} to {}", host_file.display(), dest.display());
            std::fs::copy(&host_file, &dest).map_err(|e| IbuError::io(&host_file, e))?;
        }
        Ok(())
    }

    fn fetch_network_config(&self, bundle: &BundleLayout) -> Result<(), IbuError> {
        info!("Fetching node network files");
        let dest_dir = bundle.network_dir();
        std::fs::create_dir_all(&dest_dir).map_err(|e| IbuError::io(&dest_dir, e))?;

        for relative in &self.layout.network_paths {
            let src = self.layout.host_path(relative);
            let Some(base) = src.file_name() else {
                continue;
            };
            if src.is_dir() {
                info!("Copying network files from {} to {}", src.display(), dest_dir.display());
                copy_dir_files(&src, &dest_dir.join(base))?;
            } else if src.is_file() {
                info!("Copying network file {} to {}", src.display(), dest_dir.display());
                std::fs::copy(&src, dest_dir.join(base)).map_err(|e| IbuError::io(&src, e))?;
            } else {
                info!("Network path {} does not exist, skipping", src.display());
            }
        }
        Ok(())
    }
}

/// Copy the regular files of `src` into `dest`, keeping base names.
fn copy_dir_files(src: &Path, dest: &Path) -> Result<(), IbuError> {
    std::fs::create_dir_all(dest).map_err(|e| IbuError::io(dest, e))?;
    let entries = std::fs::read_dir(src).map_err(|e| IbuError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| IbuError::io(src, e))?;
        let path = entry.path();
        if path.is_file() {
            std::fs::copy(&path, dest.join(entry.file_name()))
                .map_err(|e| IbuError::io(&path, e))?;
        }
    }
    Ok(())
}
