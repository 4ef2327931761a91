//! Read-only access to the running cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use kube::Api;
use kube::api::ListParams;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::Value;

use crate::error::IbuError;
use crate::seed::KubeconfigCryptoRetention;
use crate::seed::reconfiguration::{IngressCrypto, KubeApiserverCrypto};

/// Identity facts about the running cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub ocp_version: String,
    pub base_domain: String,
    pub cluster_name: String,
    pub cluster_id: String,
    pub node_ip: String,
    pub release_registry: String,
    pub hostname: String,
    pub mirror_registry_configured: bool,
}

/// Cluster queries the gatherer and stage handler depend on.
///
/// `get_*` methods return `Ok(None)` for a missing object; list failures and
/// any other API error are returned as errors.
#[async_trait]
pub trait ClusterAccessor: Send + Sync {
    /// The cluster-wide proxy named `cluster`.
    async fn get_proxy(&self) -> Result<Value, IbuError>;

    async fn list_image_digest_mirror_sets(&self) -> Result<Vec<Value>, IbuError>;

    async fn list_image_content_source_policies(&self) -> Result<Vec<Value>, IbuError>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, IbuError>;

    /// One key of a secret, decoded as UTF-8.
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, IbuError>;

    async fn cluster_info(&self) -> Result<ClusterInfo, IbuError>;

    async fn infra_id(&self) -> Result<String, IbuError>;

    async fn kubeconfig_crypto_retention(&self) -> Result<KubeconfigCryptoRetention, IbuError>;

    /// True when every node reports `Ready=True`.
    async fn node_ready(&self) -> Result<bool, IbuError>;
}

const KUBE_APISERVER_OPERATOR_NS: &str = "openshift-kube-apiserver-operator";
const INGRESS_OPERATOR_NS: &str = "openshift-ingress-operator";
const OPENSHIFT_CONFIG_NS: &str = "openshift-config";

/// Split `https://api.<cluster>.<domain>:6443` into `(cluster, domain)`.
pub fn split_api_server_url(url: &str) -> Option<(String, String)> {
    let host = url
        .split("://")
        .nth(1)
        .unwrap_or(url)
        .split(['/', ':'])
        .next()?;
    let rest = host.strip_prefix("api.")?;
    let (cluster, domain) = rest.split_once('.')?;
    if cluster.is_empty() || domain.is_empty() {
        return None;
    }
    Some((cluster.to_string(), domain.to_string()))
}

/// Registry host of an image pull-spec.
pub fn registry_of(image: &str) -> &str {
    image.split('/').next().unwrap_or_default()
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

/// `ClusterAccessor` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterAccessor {
    client: kube::Client,
}

impl KubeClusterAccessor {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, group: &str, version: &str, kind: &str, plural: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, plural);
        Api::all_with(self.client.clone(), &resource)
    }

    async fn get_dynamic(
        &self,
        (group, version, kind, plural): (&str, &str, &str, &str),
        name: &str,
    ) -> Result<Value, IbuError> {
        let obj = self
            .dynamic(group, version, kind, plural)
            .get(name)
            .await
            .map_err(|e| IbuError::kube(&format!("get {kind} {name}"), &e))?;
        Ok(serde_json::to_value(obj)?)
    }

    async fn list_dynamic(
        &self,
        (group, version, kind, plural): (&str, &str, &str, &str),
    ) -> Result<Vec<Value>, IbuError> {
        let list = self
            .dynamic(group, version, kind, plural)
            .list(&ListParams::default())
            .await
            .map_err(|e| IbuError::kube(&format!("list {plural}"), &e))?;
        list.items
            .into_iter()
            .map(|o| serde_json::to_value(o).map_err(IbuError::from))
            .collect()
    }

    async fn required_secret(&self, namespace: &str, name: &str, key: &str) -> Result<String, IbuError> {
        self.get_secret_data(namespace, name, key)
            .await?
            .ok_or_else(|| IbuError::NotFound(format!("secret {namespace}/{name} key {key}")))
    }
}

const PROXY: (&str, &str, &str, &str) = ("config.openshift.io", "v1", "Proxy", "proxies");
const IDMS: (&str, &str, &str, &str) = (
    "config.openshift.io",
    "v1",
    "ImageDigestMirrorSet",
    "imagedigestmirrorsets",
);
const ICSP: (&str, &str, &str, &str) = (
    "operator.openshift.io",
    "v1alpha1",
    "ImageContentSourcePolicy",
    "imagecontentsourcepolicies",
);
const CLUSTER_VERSION: (&str, &str, &str, &str) =
    ("config.openshift.io", "v1", "ClusterVersion", "clusterversions");
const INFRASTRUCTURE: (&str, &str, &str, &str) =
    ("config.openshift.io", "v1", "Infrastructure", "infrastructures");

#[async_trait]
impl ClusterAccessor for KubeClusterAccessor {
    async fn get_proxy(&self) -> Result<Value, IbuError> {
        self.get_dynamic(PROXY, "cluster").await
    }

    async fn list_image_digest_mirror_sets(&self) -> Result<Vec<Value>, IbuError> {
        self.list_dynamic(IDMS).await
    }

    async fn list_image_content_source_policies(&self) -> Result<Vec<Value>, IbuError> {
        self.list_dynamic(ICSP).await
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, IbuError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| IbuError::kube(&format!("get configmap {namespace}/{name}"), &e))
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, IbuError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| IbuError::kube(&format!("get secret {namespace}/{name}"), &e))?;
        let Some(bytes) = secret.and_then(|s| s.data).and_then(|mut d| d.remove(key)) else {
            return Ok(None);
        };
        String::from_utf8(bytes.0)
            .map(Some)
            .map_err(|e| IbuError::Validation(format!("secret {namespace}/{name} key {key}: {e}")))
    }

    async fn cluster_info(&self) -> Result<ClusterInfo, IbuError> {
        let version = self.get_dynamic(CLUSTER_VERSION, "version").await?;
        let infra = self.get_dynamic(INFRASTRUCTURE, "cluster").await?;

        let api_url = str_at(&infra, "/status/apiServerURL");
        let (cluster_name, base_domain) = split_api_server_url(api_url).ok_or_else(|| {
            IbuError::Validation(format!("unexpected api server url {api_url:?}"))
        })?;

        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| IbuError::kube("list nodes", &e))?;
        let node = node_list
            .items
            .first()
            .ok_or_else(|| IbuError::NotFound("no nodes in cluster".to_string()))?;
        let hostname = node.metadata.name.clone().unwrap_or_default();
        let node_ip = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
            .map(|a| a.address.clone())
            .unwrap_or_default();

        let mirror_registry_configured = !self.list_image_digest_mirror_sets().await?.is_empty()
            || !self.list_image_content_source_policies().await?.is_empty();

        Ok(ClusterInfo {
            ocp_version: str_at(&version, "/status/desired/version").to_string(),
            base_domain,
            cluster_name,
            cluster_id: str_at(&version, "/spec/clusterID").to_string(),
            node_ip,
            release_registry: registry_of(str_at(&version, "/status/desired/image")).to_string(),
            hostname,
            mirror_registry_configured,
        })
    }

    async fn infra_id(&self) -> Result<String, IbuError> {
        let infra = self.get_dynamic(INFRASTRUCTURE, "cluster").await?;
        Ok(str_at(&infra, "/status/infrastructureName").to_string())
    }

    async fn kubeconfig_crypto_retention(&self) -> Result<KubeconfigCryptoRetention, IbuError> {
        let admin_ca = self
            .get_config_map(OPENSHIFT_CONFIG_NS, "admin-kubeconfig-client-ca")
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut d| d.remove("ca-bundle.crt"))
            .ok_or_else(|| {
                IbuError::NotFound("configmap openshift-config/admin-kubeconfig-client-ca".into())
            })?;

        Ok(KubeconfigCryptoRetention {
            kube_apiserver_crypto: KubeApiserverCrypto {
                localhost_serving_signer_private_key: self
                    .required_secret(KUBE_APISERVER_OPERATOR_NS, "localhost-serving-signer", "tls.key")
                    .await?,
                service_network_serving_signer_private_key: self
                    .required_secret(
                        KUBE_APISERVER_OPERATOR_NS,
                        "service-network-serving-signer",
                        "tls.key",
                    )
                    .await?,
                loadbalancer_serving_signer_private_key: self
                    .required_secret(
                        KUBE_APISERVER_OPERATOR_NS,
                        "loadbalancer-serving-signer",
                        "tls.key",
                    )
                    .await?,
                admin_client_ca_certificate: admin_ca,
            },
            ingress_crypto: IngressCrypto {
                ingress_ca_private_key: self
                    .required_secret(INGRESS_OPERATOR_NS, "router-ca", "tls.key")
                    .await?,
            },
        })
    }

    async fn node_ready(&self) -> Result<bool, IbuError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| IbuError::kube("list nodes", &e))?;
        let ready = !list.items.is_empty()
            && list.items.iter().all(|n| {
                n.status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|conds| {
                        conds.iter().any(|c| c.type_ == "Ready" && c.status == "True")
                    })
            });
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_api_server_url() {
        assert_eq!(
            split_api_server_url("https://api.sno.example.com:6443"),
            Some(("sno".to_string(), "example.com".to_string()))
        );
        assert_eq!(
            split_api_server_url("api.edge-1.lab.example.org"),
            Some(("edge-1".to_string(), "lab.example.org".to_string()))
        );
        assert_eq!(split_api_server_url("https://kubernetes.default.svc"), None);
        assert_eq!(split_api_server_url("https://api.local:6443"), None);
    }

    #[test]
    fn test_registry_of() {
        assert_eq!(
            registry_of("quay.io/openshift-release-dev/ocp-release@sha256:abc"),
            "quay.io"
        );
        assert_eq!(registry_of("mirror.lab:5000/ocp/release:4.16"), "mirror.lab:5000");
    }

    #[test]
    fn test_str_at_missing_is_empty() {
        let v = serde_json::json!({"status": {"desired": {"version": "4.16.2"}}});
        assert_eq!(str_at(&v, "/status/desired/version"), "4.16.2");
        assert_eq!(str_at(&v, "/spec/clusterID"), "");
    }
}
