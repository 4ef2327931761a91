//! Versioned seed records and the compatibility rule for reading them.
//!
//! Both records carry an explicit version tag. Readers check the tag against
//! a registry of supported versions before decoding anything else, and an
//! unknown or missing tag is a hard `SchemaIncompatible` failure.

pub mod cluster_info;
pub mod reconfiguration;

use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::IbuError;

pub use cluster_info::{SeedClusterInfo, SeedFlow, check_seed_version};
pub use reconfiguration::{KubeconfigCryptoRetention, SeedReconfiguration};

/// A persisted record keyed by an explicit version field.
pub trait Versioned: Sized {
    /// Human-readable document name used in errors.
    const DOCUMENT: &'static str;
    /// Name of the version tag field.
    const VERSION_FIELD: &'static str;
    /// Versions this build can read.
    const SUPPORTED: &'static [u64];

    /// Decode a document whose tag has already been checked.
    fn decode_version(version: u64, value: serde_yaml::Value) -> Result<Self, IbuError>;
}

fn incompatible<T: Versioned>(found: impl Into<String>) -> IbuError {
    IbuError::SchemaIncompatible {
        document: T::DOCUMENT,
        found: found.into(),
        supported: T::SUPPORTED
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Decode a YAML or JSON document after checking its version tag.
pub fn decode<T: Versioned>(text: &str) -> Result<T, IbuError> {
    let value: serde_yaml::Value = serde_yaml::from_str(text)?;
    let tag = value
        .get(T::VERSION_FIELD)
        .ok_or_else(|| incompatible::<T>("<missing>"))?;
    let version = tag.as_u64().ok_or_else(|| {
        incompatible::<T>(serde_yaml::to_string(tag).map_or_else(
            |_| "<unreadable>".to_string(),
            |s| s.trim().to_string(),
        ))
    })?;
    if !T::SUPPORTED.contains(&version) {
        return Err(incompatible::<T>(version.to_string()));
    }
    T::decode_version(version, value)
}

/// Read and decode a versioned record from disk.
pub fn load<T: Versioned>(path: &Path) -> Result<T, IbuError> {
    info!("Reading {} from {}", T::DOCUMENT, path.display());
    let text = std::fs::read_to_string(path).map_err(|e| IbuError::io(path, e))?;
    decode(&text)
}

/// Serialize a value as JSON to `path`, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), IbuError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IbuError::io(parent, e))?;
    }
    let data = serde_json::to_vec(value)?;
    std::fs::write(path, data).map_err(|e| IbuError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_newer_version_before_decoding() {
        // Fields are garbage on purpose: the tag check must fail first.
        let err = decode::<SeedReconfiguration>("api_version: 2\nbase_domain: [1, 2]\n")
            .unwrap_err();
        match err {
            IbuError::SchemaIncompatible {
                document,
                found,
                supported,
            } => {
                assert_eq!(document, SeedReconfiguration::DOCUMENT);
                assert_eq!(found, "2");
                assert_eq!(supported, "1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_rejects_missing_tag() {
        let err = decode::<SeedClusterInfo>(r#"{"cluster_name": "seed"}"#).unwrap_err();
        assert!(matches!(
            err,
            IbuError::SchemaIncompatible { ref found, .. } if found == "<missing>"
        ));
    }

    #[test]
    fn test_decode_rejects_non_integer_tag() {
        let err = decode::<SeedClusterInfo>(r#"{"seed_format_version": "v1"}"#).unwrap_err();
        assert!(matches!(err, IbuError::SchemaIncompatible { .. }));
    }

    #[test]
    fn test_decode_invalid_document_is_serialization_error() {
        let err = decode::<SeedClusterInfo>("{not yaml").unwrap_err();
        assert!(matches!(err, IbuError::Serialization(_)));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load::<SeedClusterInfo>(&dir.path().join("manifest.json")).unwrap_err();
        assert!(matches!(err, IbuError::Io { .. }));
    }

    #[test]
    fn test_write_json_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/record.json");
        write_json(&path, &serde_json::json!({"k": "v"})).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), r#"{"k":"v"}"#);
    }
}
