//! Custom error types for ibu.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while capturing, transplanting or upgrading a cluster.
#[derive(Error, Debug)]
pub enum IbuError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Kubernetes API access denied: {0}")]
    AccessDenied(String),

    #[error(
        "Incompatible {document} schema version {found} (supported: {supported}), refusing to continue"
    )]
    SchemaIncompatible {
        document: &'static str,
        found: String,
        supported: String,
    },

    #[error("Seed version mismatch: seed image was built from {seed}, but {desired} was requested")]
    VersionMismatch { seed: String, desired: String },

    #[error("[{tool}] {message}")]
    ExternalTool { tool: String, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IbuError {
    /// Wrap an I/O error together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify a kube client error.
    ///
    /// A 404 from the API server becomes `NotFound` so callers can recover it
    /// as expected absence. 401 and 403 need an RBAC or credential fix and are
    /// not retried. Everything else is a transient API failure.
    pub fn kube(context: &str, err: &kube::Error) -> Self {
        match err {
            kube::Error::Api(status) if status.code == 404 => {
                Self::NotFound(format!("{context}: {}", status.message))
            }
            kube::Error::Api(status) if matches!(status.code, 401 | 403) => {
                Self::AccessDenied(format!("{context}: {}", status.message))
            }
            _ => Self::KubernetesApi(format!("{context}: {err}")),
        }
    }

    /// Create an external tool failure.
    pub fn tool(tool: &str, message: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    /// Returns true if this error is transient and a later reconcile may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::KubernetesApi(_))
    }
}

impl From<serde_json::Error> for IbuError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for IbuError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
