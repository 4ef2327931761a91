//! Seed identity descriptor: the target cluster's identity captured before the upgrade.

use serde::{Deserialize, Serialize};

use super::Versioned;
use crate::error::IbuError;

/// Current descriptor schema version. Bump it whenever a field changes meaning.
pub const SEED_RECONFIGURATION_VERSION: u64 = 1;

/// Identity of the cluster being upgraded, replayed into the seed-derived filesystem.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SeedReconfiguration {
    pub api_version: u64,
    pub base_domain: String,
    pub cluster_name: String,
    pub cluster_id: String,
    pub infra_id: String,
    pub node_ip: String,
    pub release_registry: String,
    pub hostname: String,
    pub kubeconfig_crypto_retention: KubeconfigCryptoRetention,
    pub ssh_key: String,
    pub pull_secret: String,
    /// Empty means "delete the kubeadmin credential on the target".
    pub kubeadmin_password_hash: String,
}

impl Versioned for SeedReconfiguration {
    const DOCUMENT: &'static str = "seed reconfiguration";
    const VERSION_FIELD: &'static str = "api_version";
    const SUPPORTED: &'static [u64] = &[SEED_RECONFIGURATION_VERSION];

    fn decode_version(version: u64, value: serde_yaml::Value) -> Result<Self, IbuError> {
        match version {
            1 => Ok(serde_yaml::from_value(value)?),
            other => Err(IbuError::SchemaIncompatible {
                document: Self::DOCUMENT,
                found: other.to_string(),
                supported: SEED_RECONFIGURATION_VERSION.to_string(),
            }),
        }
    }
}

/// Crypto material that must survive the identity transplant unchanged.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct KubeconfigCryptoRetention {
    pub kube_apiserver_crypto: KubeApiserverCrypto,
    pub ingress_crypto: IngressCrypto,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct KubeApiserverCrypto {
    pub localhost_serving_signer_private_key: String,
    pub service_network_serving_signer_private_key: String,
    pub loadbalancer_serving_signer_private_key: String,
    pub admin_client_ca_certificate: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressCrypto {
    pub ingress_ca_private_key: String,
}

impl KubeconfigCryptoRetention {
    /// Key files written for the rewrite tool, as `(file name, recert rule name, PEM)`.
    pub fn key_files(&self) -> [(&'static str, &'static str, &str); 4] {
        let api = &self.kube_apiserver_crypto;
        [
            (
                "localhost-serving-signer.key",
                "kube-apiserver-localhost-signer",
                api.localhost_serving_signer_private_key.as_str(),
            ),
            (
                "service-network-serving-signer.key",
                "kube-apiserver-service-network-signer",
                api.service_network_serving_signer_private_key.as_str(),
            ),
            (
                "loadbalancer-serving-signer.key",
                "kube-apiserver-lb-signer",
                api.loadbalancer_serving_signer_private_key.as_str(),
            ),
            (
                "ingress-ca.key",
                "ingresskey-ingress-operator",
                self.ingress_crypto.ingress_ca_private_key.as_str(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::decode;

    #[test]
    fn test_descriptor_field_names() {
        let rc = SeedReconfiguration {
            api_version: SEED_RECONFIGURATION_VERSION,
            cluster_id: "abc".to_string(),
            infra_id: "sno-x7k2p".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&rc).unwrap();
        assert_eq!(json["api_version"], 1);
        assert_eq!(json["cluster_id"], "abc");
        assert_eq!(json["infra_id"], "sno-x7k2p");
        assert!(json["kubeconfig_crypto_retention"]["kube_apiserver_crypto"].is_object());
    }

    #[test]
    fn test_decode_yaml_descriptor() {
        let yaml = "api_version: 1\nbase_domain: example.com\ncluster_name: sno\ncluster_id: id\ninfra_id: sno-1\nnode_ip: 192.0.2.10\nrelease_registry: quay.io\nhostname: sno-node\nkubeconfig_crypto_retention:\n  kube_apiserver_crypto:\n    localhost_serving_signer_private_key: a\n    service_network_serving_signer_private_key: b\n    loadbalancer_serving_signer_private_key: c\n    admin_client_ca_certificate: d\n  ingress_crypto:\n    ingress_ca_private_key: e\nssh_key: ssh-ed25519 AAAA\npull_secret: '{}'\nkubeadmin_password_hash: ''\n";
        let rc: SeedReconfiguration = decode(yaml).unwrap();
        assert_eq!(rc.base_domain, "example.com");
        assert_eq!(rc.hostname, "sno-node");
        assert_eq!(rc.kubeadmin_password_hash, "");
        assert_eq!(
            rc.kubeconfig_crypto_retention.ingress_crypto.ingress_ca_private_key,
            "e"
        );
    }

    #[test]
    fn test_key_files_cover_all_signers() {
        let crypto = KubeconfigCryptoRetention {
            kube_apiserver_crypto: KubeApiserverCrypto {
                localhost_serving_signer_private_key: "l".to_string(),
                service_network_serving_signer_private_key: "s".to_string(),
                loadbalancer_serving_signer_private_key: "b".to_string(),
                admin_client_ca_certificate: "ca".to_string(),
            },
            ingress_crypto: IngressCrypto {
                ingress_ca_private_key: "i".to_string(),
            },
        };
        let pems: Vec<&str> = crypto.key_files().iter().map(|(_, _, pem)| *pem).collect();
        assert_eq!(pems, vec!["l", "s", "b", "i"]);
    }
}
