//! Version-chain management for documents.
//!
//! Every version of a document is an immutable record keyed by
//! `(id, version)`; `previousVersion` is a lookup key into that space,
//! never an owning pointer, so a malformed chain cannot leak -- cycle and
//! conflict detection are pure graph checks over stored records.
//!
//! Updates are optimistic: an update whose supplied "previous" document is
//! not the currently stored head is rejected with `VersionConflict`, and
//! the caller must re-fetch and retry.

use crate::agent::AgentSession;
use crate::crypto;
use crate::document::{self, Document, DocumentLevel};
use crate::storage::{Kind, Storage};
use crate::ConcordatError;
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Persistence helpers
// ---------------------------------------------------------------------------

/// Serialize and store one version of a document.
pub fn persist_document(
    storage: &dyn Storage,
    kind: Kind,
    doc: &Document,
) -> Result<(), ConcordatError> {
    let bytes = serde_json::to_vec(doc)
        .map_err(|e| ConcordatError::SerializationError(format!("serialize document: {}", e)))?;
    storage.put(kind, &doc.id, &doc.version, &bytes)
}

/// Load one stored version of a document.
pub fn load(
    storage: &dyn Storage,
    kind: Kind,
    id: &str,
    version: &str,
) -> Result<Option<Document>, ConcordatError> {
    match storage.get(kind, id, version)? {
        Some(bytes) => {
            let doc = serde_json::from_slice(&bytes).map_err(|e| {
                ConcordatError::SerializationError(format!("deserialize document: {}", e))
            })?;
            Ok(Some(doc))
        }
        None => Ok(None),
    }
}

/// The currently stored head version identifier, if any.
pub fn head_version(
    storage: &dyn Storage,
    kind: Kind,
    id: &str,
) -> Result<Option<String>, ConcordatError> {
    Ok(storage.list_versions(kind, id)?.into_iter().last())
}

/// Load the currently stored head document, if any.
pub fn latest(
    storage: &dyn Storage,
    kind: Kind,
    id: &str,
) -> Result<Option<Document>, ConcordatError> {
    match head_version(storage, kind, id)? {
        Some(version) => load(storage, kind, id, &version),
        None => Ok(None),
    }
}

/// Assert that `expected` is the stored head for `id`.
///
/// # Errors
/// Returns `ConcordatError::VersionConflict` when another version has been
/// stored since the caller last read the document.
pub fn expect_head(
    storage: &dyn Storage,
    kind: Kind,
    id: &str,
    expected: &str,
) -> Result<(), ConcordatError> {
    match head_version(storage, kind, id)? {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(ConcordatError::VersionConflict {
            id: id.to_string(),
            expected: expected.to_string(),
            actual,
        }),
        None => Err(ConcordatError::StorageError(format!(
            "no stored versions for {} {}",
            kind.as_str(),
            id
        ))),
    }
}

// ---------------------------------------------------------------------------
// Create / update
// ---------------------------------------------------------------------------

/// Create, sign, and persist the first version of a document.
///
/// Assigns a fresh `id`, sets `version == originalVersion`, and leaves
/// `previousVersion` unset. The signed field set is the identity fields
/// plus `extra_fields`.
pub fn create_version(
    storage: &dyn Storage,
    session: &AgentSession,
    kind: Kind,
    level: DocumentLevel,
    content: serde_json::Map<String, serde_json::Value>,
    extra_fields: &[String],
) -> Result<Document, ConcordatError> {
    let now = crypto::timestamp();
    let version = uuid::Uuid::new_v4().to_string();
    let mut doc = Document {
        id: uuid::Uuid::new_v4().to_string(),
        version: version.clone(),
        original_version: version,
        original_date: now.clone(),
        previous_version: None,
        version_date: now,
        level,
        content_hash: String::new(),
        signature: None,
        content,
    };
    document::sign_document(&mut doc, extra_fields, session)?;
    persist_document(storage, kind, &doc)?;
    tracing::debug!(id = %doc.id, version = %doc.version, "created document");
    Ok(doc)
}

/// Create, sign, and persist a successor version of a document.
///
/// Preserves `id`, `originalVersion`, and `originalDate`; assigns a fresh
/// `version` and links `previousVersion` to the supplied head.
///
/// # Errors
/// Returns `ConcordatError::VersionConflict` if `latest` is not the stored
/// head (optimistic-concurrency check).
pub fn update_version(
    storage: &dyn Storage,
    session: &AgentSession,
    kind: Kind,
    latest: &Document,
    content: serde_json::Map<String, serde_json::Value>,
    extra_fields: &[String],
) -> Result<Document, ConcordatError> {
    expect_head(storage, kind, &latest.id, &latest.version)?;

    let mut doc = Document {
        id: latest.id.clone(),
        version: uuid::Uuid::new_v4().to_string(),
        original_version: latest.original_version.clone(),
        original_date: latest.original_date.clone(),
        previous_version: Some(latest.version.clone()),
        version_date: crypto::timestamp(),
        level: latest.level,
        content_hash: String::new(),
        signature: None,
        content,
    };
    document::sign_document(&mut doc, extra_fields, session)?;
    persist_document(storage, kind, &doc)?;
    tracing::debug!(
        id = %doc.id,
        version = %doc.version,
        previous = %latest.version,
        "updated document"
    );
    Ok(doc)
}

// ---------------------------------------------------------------------------
// Chain traversal
// ---------------------------------------------------------------------------

/// Walk the version chain from the stored head back to the original
/// version, returning documents newest first.
///
/// # Errors
/// Returns `ConcordatError::BrokenChain` if a `previousVersion` link is
/// missing from storage, a version id repeats (cycle), or the chain does
/// not terminate at `originalVersion`.
pub fn walk_chain(
    storage: &dyn Storage,
    kind: Kind,
    id: &str,
) -> Result<Vec<Document>, ConcordatError> {
    let head = latest(storage, kind, id)?.ok_or_else(|| {
        ConcordatError::StorageError(format!("no stored versions for {} {}", kind.as_str(), id))
    })?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut chain = Vec::new();
    let mut current = head;

    loop {
        if !seen.insert(current.version.clone()) {
            return Err(ConcordatError::BrokenChain {
                id: id.to_string(),
                detail: format!("version {} repeats in the chain", current.version),
            });
        }
        match current.previous_version.clone() {
            Some(prev_version) => {
                chain.push(current);
                current = load(storage, kind, id, &prev_version)?.ok_or_else(|| {
                    ConcordatError::BrokenChain {
                        id: id.to_string(),
                        detail: format!("previous version {} is not stored", prev_version),
                    }
                })?;
            }
            None => {
                if current.version != current.original_version {
                    return Err(ConcordatError::BrokenChain {
                        id: id.to_string(),
                        detail: format!(
                            "chain terminates at {} instead of original version {}",
                            current.version, current.original_version
                        ),
                    });
                }
                chain.push(current);
                break;
            }
        }
    }

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{self, AgentProfile};
    use crate::crypto::{Algorithm, KeyPair};
    use crate::storage::MemoryStorage;

    fn make_session() -> AgentSession {
        let keys = KeyPair::generate(Algorithm::Ed25519).unwrap();
        let (_, session) = agent::create_agent(keys, AgentProfile::default()).unwrap();
        session
    }

    fn content(text: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("body".to_string(), serde_json::json!(text));
        map
    }

    fn body_field() -> Vec<String> {
        vec!["body".to_string()]
    }

    #[test]
    fn test_create_version_initializes_chain() {
        let storage = MemoryStorage::new();
        let session = make_session();
        let doc = create_version(
            &storage,
            &session,
            Kind::Document,
            DocumentLevel::Raw,
            content("first"),
            &body_field(),
        )
        .unwrap();

        assert_eq!(doc.version, doc.original_version);
        assert!(doc.previous_version.is_none());
        assert_eq!(
            head_version(&storage, Kind::Document, &doc.id).unwrap(),
            Some(doc.version.clone())
        );
    }

    #[test]
    fn test_update_version_links_and_preserves_identity() {
        let storage = MemoryStorage::new();
        let session = make_session();
        let v1 = create_version(
            &storage,
            &session,
            Kind::Document,
            DocumentLevel::Config,
            content("first"),
            &body_field(),
        )
        .unwrap();
        let v2 = update_version(
            &storage,
            &session,
            Kind::Document,
            &v1,
            content("second"),
            &body_field(),
        )
        .unwrap();

        assert_eq!(v2.id, v1.id);
        assert_eq!(v2.original_version, v1.original_version);
        assert_eq!(v2.original_date, v1.original_date);
        assert_ne!(v2.version, v1.version);
        assert_eq!(v2.previous_version.as_deref(), Some(v1.version.as_str()));
        assert_ne!(v2.content_hash, v1.content_hash);
    }

    #[test]
    fn test_update_from_stale_version_conflicts() {
        let storage = MemoryStorage::new();
        let session = make_session();
        let v1 = create_version(
            &storage,
            &session,
            Kind::Document,
            DocumentLevel::Config,
            content("first"),
            &body_field(),
        )
        .unwrap();
        update_version(
            &storage,
            &session,
            Kind::Document,
            &v1,
            content("second"),
            &body_field(),
        )
        .unwrap();

        let err = update_version(
            &storage,
            &session,
            Kind::Document,
            &v1,
            content("competing"),
            &body_field(),
        )
        .unwrap_err();
        assert!(matches!(err, ConcordatError::VersionConflict { .. }));
    }

    #[test]
    fn test_walk_chain_reaches_original_in_order() {
        let storage = MemoryStorage::new();
        let session = make_session();
        let mut doc = create_version(
            &storage,
            &session,
            Kind::Document,
            DocumentLevel::Config,
            content("v1"),
            &body_field(),
        )
        .unwrap();
        for i in 2..=5 {
            doc = update_version(
                &storage,
                &session,
                Kind::Document,
                &doc,
                content(&format!("v{}", i)),
                &body_field(),
            )
            .unwrap();
        }

        let chain = walk_chain(&storage, Kind::Document, &doc.id).unwrap();
        assert_eq!(chain.len(), 5);
        assert_eq!(chain[0].version, doc.version);
        assert_eq!(chain[4].version, chain[4].original_version);

        // No repeated version ids anywhere in the chain.
        let mut versions: Vec<&str> = chain.iter().map(|d| d.version.as_str()).collect();
        versions.sort();
        versions.dedup();
        assert_eq!(versions.len(), 5);
    }

    #[test]
    fn test_walk_chain_detects_missing_link() {
        let storage = MemoryStorage::new();
        let session = make_session();
        let v1 = create_version(
            &storage,
            &session,
            Kind::Document,
            DocumentLevel::Config,
            content("v1"),
            &body_field(),
        )
        .unwrap();
        let mut v2 = update_version(
            &storage,
            &session,
            Kind::Document,
            &v1,
            content("v2"),
            &body_field(),
        )
        .unwrap();

        // Corrupt the stored head so its back-reference dangles.
        v2.previous_version = Some("missing-version".to_string());
        persist_document(&storage, Kind::Document, &v2).unwrap();

        let err = walk_chain(&storage, Kind::Document, &v1.id).unwrap_err();
        assert!(matches!(err, ConcordatError::BrokenChain { .. }));
    }

    #[test]
    fn test_walk_chain_detects_cycle() {
        let storage = MemoryStorage::new();
        let session = make_session();
        let v1 = create_version(
            &storage,
            &session,
            Kind::Document,
            DocumentLevel::Config,
            content("v1"),
            &body_field(),
        )
        .unwrap();
        let mut v2 = update_version(
            &storage,
            &session,
            Kind::Document,
            &v1,
            content("v2"),
            &body_field(),
        )
        .unwrap();

        // Rewrite v1 to point back at v2, forming a cycle.
        let mut corrupted = v1.clone();
        corrupted.previous_version = Some(v2.version.clone());
        persist_document(&storage, Kind::Document, &corrupted).unwrap();
        v2.previous_version = Some(v1.version.clone());
        persist_document(&storage, Kind::Document, &v2).unwrap();

        let err = walk_chain(&storage, Kind::Document, &v1.id).unwrap_err();
        assert!(matches!(err, ConcordatError::BrokenChain { .. }));
    }
}
