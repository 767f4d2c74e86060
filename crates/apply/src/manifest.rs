use ctrlkit_core::{Error, Result};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

/// Decode a multi-document YAML stream into schemaless objects.
///
/// Empty documents and documents without a `kind` are skipped.
pub fn decode_manifests(yaml: &str, max_bytes: usize) -> Result<Vec<DynamicObject>> {
    if yaml.len() > max_bytes {
        return Err(Error::Validation(format!("YAML payload too large (>{} bytes)", max_bytes)));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value = serde_yaml::Value::deserialize(doc)?;
        let json = serde_json::to_value(value)?;
        let has_kind = json.get("kind").and_then(Json::as_str).is_some_and(|k| !k.is_empty());
        if !has_kind {
            debug!(document = idx, "skipping document without kind");
            continue;
        }
        out.push(serde_json::from_value(json)?);
    }
    Ok(out)
}

/// Empty schemaless object of the given kind.
pub fn new_object(group: &str, version: &str, kind: &str, name: &str) -> DynamicObject {
    DynamicObject::new(name, &ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind)))
}
