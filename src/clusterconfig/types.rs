//! Kind/version lookup and metadata stripping for gathered objects.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::IbuError;

/// Maps a kind to the API version it is written with.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    kinds: BTreeMap<&'static str, &'static str>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let kinds = [
            ("ConfigMap", "v1"),
            ("Proxy", "config.openshift.io/v1"),
            ("ImageDigestMirrorSet", "config.openshift.io/v1"),
            ("ImageDigestMirrorSetList", "config.openshift.io/v1"),
            ("ImageContentSourcePolicy", "operator.openshift.io/v1alpha1"),
            ("ImageContentSourcePolicyList", "operator.openshift.io/v1alpha1"),
        ];
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }
}

impl TypeRegistry {
    /// API version for `kind`; unknown kinds are an error, never a guess.
    pub fn api_version(&self, kind: &str) -> Result<&'static str, IbuError> {
        self.kinds.get(kind).copied().ok_or_else(|| {
            IbuError::Validation(format!("unable to find API version for kind {kind}"))
        })
    }

    /// Set `apiVersion` and `kind` on an object.
    pub fn tag(&self, kind: &str, mut obj: Value) -> Result<Value, IbuError> {
        let api_version = self.api_version(kind)?;
        if let Some(map) = obj.as_object_mut() {
            map.insert("apiVersion".into(), Value::from(api_version));
            map.insert("kind".into(), Value::from(kind));
        }
        Ok(obj)
    }

    /// Wrap tagged items in a tagged `<kind>List`.
    pub fn list(&self, kind: &str, items: Vec<Value>) -> Result<Value, IbuError> {
        let list_kind = format!("{kind}List");
        let mut list = Map::new();
        list.insert("metadata".into(), Value::Object(Map::new()));
        list.insert("items".into(), Value::Array(items));
        self.tag(&list_kind, Value::Object(list))
    }
}

fn metadata_field<'a>(obj: &'a Value, field: &str) -> Option<&'a Value> {
    obj.get("metadata")
        .and_then(|m| m.get(field))
        .filter(|v| !v.is_null())
}

/// Metadata reduced to name, namespace and labels.
pub fn clean_metadata(obj: &Value) -> Value {
    let mut meta = Map::new();
    for field in ["name", "namespace", "labels"] {
        if let Some(v) = metadata_field(obj, field) {
            meta.insert(field.into(), v.clone());
        }
    }
    Value::Object(meta)
}

/// Object reduced to name, namespace and `spec`.
pub fn spec_only(obj: &Value) -> Value {
    let mut meta = Map::new();
    for field in ["name", "namespace"] {
        if let Some(v) = metadata_field(obj, field) {
            meta.insert(field.into(), v.clone());
        }
    }
    let mut out = Map::new();
    out.insert("metadata".into(), Value::Object(meta));
    out.insert(
        "spec".into(),
        obj.get("spec").cloned().unwrap_or_else(|| Value::Object(Map::new())),
    );
    Value::Object(out)
}

/// Object name, used to order list items.
pub fn name_of(obj: &Value) -> &str {
    metadata_field(obj, "name")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server_object() -> Value {
        json!({
            "apiVersion": "config.openshift.io/v1",
            "kind": "Proxy",
            "metadata": {
                "name": "cluster",
                "uid": "8f1e",
                "resourceVersion": "4711",
                "generation": 2,
                "managedFields": [{"manager": "cluster-version-operator"}],
                "labels": {"a": "b"},
                "annotations": {"release.openshift.io/create-only": "true"}
            },
            "spec": {"trustedCA": {"name": ""}},
            "status": {"httpProxy": ""}
        })
    }

    #[test]
    fn test_clean_metadata_keeps_identity_only() {
        let meta = clean_metadata(&server_object());
        assert_eq!(meta, json!({"name": "cluster", "labels": {"a": "b"}}));
    }

    #[test]
    fn test_spec_only_drops_status_and_server_fields() {
        let obj = spec_only(&server_object());
        assert_eq!(
            obj,
            json!({"metadata": {"name": "cluster"}, "spec": {"trustedCA": {"name": ""}}})
        );
    }

    #[test]
    fn test_tag_is_looked_up() {
        let registry = TypeRegistry::default();
        let obj = registry.tag("Proxy", spec_only(&server_object())).unwrap();
        assert_eq!(obj["apiVersion"], "config.openshift.io/v1");
        assert_eq!(obj["kind"], "Proxy");
        assert!(registry.tag("Route", json!({})).is_err());
    }

    #[test]
    fn test_list_wraps_items() {
        let registry = TypeRegistry::default();
        let list = registry
            .list("ImageContentSourcePolicy", vec![json!({"metadata": {"name": "a"}})])
            .unwrap();
        assert_eq!(list["kind"], "ImageContentSourcePolicyList");
        assert_eq!(list["apiVersion"], "operator.openshift.io/v1alpha1");
        assert_eq!(list["items"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_name_of() {
        assert_eq!(name_of(&server_object()), "cluster");
        assert_eq!(name_of(&json!({})), "");
    }
}
