//! Content-addressed object identifiers.
//!
//! Two objects with the same type and the same core fields get the same id,
//! so repeated ingests of one indicator collapse onto one record. The core
//! fields are everything except the id, timestamps, custom `x_` fields and
//! references.

use ahash::AHashMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use stixgraph_store::{Document, RELATIONSHIP_TYPE};

use crate::error::{Error, Result};

const EXCLUDED_FIELDS: [&str; 3] = ["id", "created", "modified"];

pub(crate) fn is_reference_field(key: &str) -> bool {
    key.ends_with("_ref") || key.ends_with("_refs")
}

fn is_core_field(key: &str) -> bool {
    !EXCLUDED_FIELDS.contains(&key) && !key.starts_with("x_") && !is_reference_field(key)
}

/// Canonical serialization: core fields only, keys sorted.
fn canonical_form(object: &Map<String, Value>) -> String {
    let core: serde_json::Map<String, Value> = object
        .iter()
        .filter(|(key, _)| is_core_field(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    // serde_json maps are ordered by key at every level
    Value::Object(core).to_string()
}

fn object_type(object: &Map<String, Value>) -> Result<&str> {
    object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidObject("object has no string `type`".to_string()))
}

/// `"<type>--<uuid>"` derived from the object's core fields.
pub fn content_id(object: &Document) -> Result<String> {
    let stix_type = object_type(object)?;
    if stix_type == RELATIONSHIP_TYPE {
        return Err(Error::IdentityUnsupported(stix_type.to_string()));
    }
    let digest = Sha256::digest(canonical_form(object).as_bytes());
    let mut seed = [0u8; 16];
    seed.copy_from_slice(&digest[..16]);
    let uuid = uuid::Builder::from_random_bytes(seed).into_uuid();
    Ok(format!("{stix_type}--{uuid}"))
}

fn rewrite_reference(value: &mut Value, ids: &AHashMap<String, String>) {
    match value {
        Value::String(reference) => {
            if let Some(new_id) = ids.get(reference.as_str()) {
                *reference = new_id.clone();
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_reference(item, ids);
            }
        }
        _ => {}
    }
}

/// Replaces the id of every non-relationship object with its content id and
/// rewrites references to the old ids across the batch.
pub fn assign_content_ids(objects: Vec<Document>) -> Result<Vec<Document>> {
    let mut ids: AHashMap<String, String> = AHashMap::new();
    for object in &objects {
        if object_type(object)? == RELATIONSHIP_TYPE {
            continue;
        }
        let old = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidObject("object has no string `id`".to_string()))?;
        ids.insert(old.to_string(), content_id(object)?);
    }

    let rewritten = objects
        .into_iter()
        .map(|mut object| {
            if let Some(Value::String(id)) = object.get_mut("id") {
                if let Some(new_id) = ids.get(id.as_str()) {
                    *id = new_id.clone();
                }
            }
            for (key, value) in object.iter_mut() {
                if is_reference_field(key) {
                    rewrite_reference(value, &ids);
                }
            }
            object
        })
        .collect();
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_id_ignores_timestamps_custom_and_references() {
        let a = doc(json!({
            "type": "ipv4-addr", "id": "ipv4-addr--1", "value": "1.2.3.4",
            "created": "2020-01-01T00:00:00Z", "x_ip": 16909060,
        }));
        let b = doc(json!({
            "type": "ipv4-addr", "id": "ipv4-addr--2", "value": "1.2.3.4",
            "modified": "2021-01-01T00:00:00Z", "resolves_to_refs": ["mac-addr--1"],
        }));
        let id = content_id(&a).unwrap();
        assert_eq!(id, content_id(&b).unwrap());
        assert!(id.starts_with("ipv4-addr--"));
        let uuid = uuid::Uuid::parse_str(&id["ipv4-addr--".len()..]).unwrap();
        assert_eq!(uuid.get_version_num(), 4);
    }

    #[test]
    fn test_core_fields_change_the_id() {
        let a = doc(json!({"type": "ipv4-addr", "value": "1.2.3.4"}));
        let b = doc(json!({"type": "ipv4-addr", "value": "1.2.3.5"}));
        let c = doc(json!({"type": "domain-name", "value": "1.2.3.4"}));
        let ids = [a, b, c].map(|o| content_id(&o).unwrap());
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[2]);
    }

    #[test]
    fn test_relationships_are_unsupported() {
        let rel = doc(json!({"type": "relationship", "id": "relationship--1"}));
        assert!(matches!(content_id(&rel), Err(Error::IdentityUnsupported(_))));
        assert!(matches!(
            content_id(&doc(json!({"id": "x--1"}))),
            Err(Error::InvalidObject(_))
        ));
    }

    #[test]
    fn test_batch_references_are_rewritten() {
        let batch = vec![
            doc(json!({"type": "identity", "id": "identity--old", "name": "ACME"})),
            doc(json!({"type": "ipv4-addr", "id": "ipv4-addr--old", "value": "1.1.1.1",
                       "created_by_ref": "identity--old"})),
            doc(json!({"type": "relationship", "id": "relationship--1",
                       "source_ref": "identity--old", "target_ref": "ipv4-addr--old",
                       "object_refs": ["identity--old", "unknown--1"]})),
        ];
        let out = assign_content_ids(batch).unwrap();
        let identity = out[0]["id"].as_str().unwrap();
        let address = out[1]["id"].as_str().unwrap();
        assert_ne!(identity, "identity--old");
        assert_eq!(out[1]["created_by_ref"], identity);
        assert_eq!(out[2]["id"], "relationship--1");
        assert_eq!(out[2]["source_ref"], identity);
        assert_eq!(out[2]["target_ref"], address);
        assert_eq!(out[2]["object_refs"], json!([identity, "unknown--1"]));
    }
}
