//! Deterministic serialization of document field subsets.
//!
//! The canonicalizer selects an explicit list of field names from a
//! document's JSON object and produces a deterministic byte sequence:
//! compact JSON with all object keys, at every nesting level, sorted
//! alphabetically. The content-hash and signature fields are always
//! excluded, even when named in the input list, so that a document can
//! carry its own integrity metadata without affecting the hash.

use crate::ConcordatError;
use std::collections::HashSet;

/// Field holding the content hash; never participates in hashing.
pub const HASH_FIELD: &str = "contentHash";

/// Field holding the signature record; never participates in hashing.
pub const SIGNATURE_FIELD: &str = "signature";

/// Produce the canonical byte sequence for the named fields of a document.
///
/// Field order in the output is a stable sort by field name; nested values
/// serialize with recursively sorted keys. Fields absent from the document
/// are omitted from the output.
///
/// # Errors
/// Returns `ConcordatError::InvalidInput` if the field list is empty, if it
/// contains duplicates, or if the value is not a JSON object.
pub fn canonical_bytes(
    value: &serde_json::Value,
    fields: &[String],
) -> Result<String, ConcordatError> {
    if fields.is_empty() {
        return Err(ConcordatError::InvalidInput(
            "field list must not be empty; a document must hash at least its identity fields"
                .to_string(),
        ));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for field in fields {
        if !seen.insert(field.as_str()) {
            return Err(ConcordatError::InvalidInput(format!(
                "duplicate field name in canonical field list: {}",
                field
            )));
        }
    }

    let obj = value.as_object().ok_or_else(|| {
        ConcordatError::InvalidInput("canonical input must be a JSON object".to_string())
    })?;

    let mut selected = serde_json::Map::new();
    for field in fields {
        if field == HASH_FIELD || field == SIGNATURE_FIELD {
            continue;
        }
        if let Some(v) = obj.get(field) {
            selected.insert(field.clone(), v.clone());
        }
    }

    Ok(canonicalize_json(&serde_json::Value::Object(selected)))
}

/// Deterministic JSON serialization with recursively sorted object keys.
///
/// Produces identical output regardless of key insertion order. Null-valued
/// object members are omitted, matching the convention that absent and null
/// fields hash the same.
pub fn canonicalize_json(value: &serde_json::Value) -> String {
    let sorted = sort_keys(value);
    // serde_json::to_string produces compact JSON without extra whitespace
    serde_json::to_string(&sorted).unwrap_or_default()
}

/// Recursively sort all object keys in a JSON value.
fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted_map = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    if v.is_null() {
                        continue;
                    }
                    sorted_map.insert(key.clone(), sort_keys(v));
                }
            }
            serde_json::Value::Object(sorted_map)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}
