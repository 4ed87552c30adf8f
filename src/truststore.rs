//! Local cache of vetted signer keys.
//!
//! A trust store maps agent ids to a public key plus the agent document the
//! key was taken from. Entries are created only by an explicit trust action
//! that first verifies the document's self-signature, and removed only by
//! an explicit revoke. The key and its origin document live and die as a
//! pair: mutations happen under one lock, so a concurrent trust and untrust
//! on the same id can never leave a half-updated entry.

use crate::agent;
use crate::crypto::PublicKey;
use crate::document::Document;
use crate::storage::validate_segment;
use crate::{crypto, ConcordatError};
use std::collections::HashMap;
use std::sync::Mutex;

/// One vetted signer: key material, origin document, and cache time.
#[derive(Debug, Clone)]
pub struct TrustEntry {
    pub key: PublicKey,
    pub document: Document,
    pub cached_at: String,
}

/// Thread-safe cache of vetted signer keys keyed by agent id.
#[derive(Default)]
pub struct TrustStore {
    entries: Mutex<HashMap<String, TrustEntry>>,
}

impl TrustStore {
    /// Create a new, empty trust store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Vet and cache an agent document's key.
    ///
    /// The document's self-signature is verified against its embedded key
    /// before anything is stored. Re-trusting an already-trusted id
    /// replaces the entry.
    ///
    /// # Errors
    /// Returns `ConcordatError::InvalidInput` for unsafe agent ids and
    /// `ConcordatError::UntrustedSelfSignature` when the self-signature
    /// check fails.
    pub fn trust(&self, doc: &Document) -> Result<String, ConcordatError> {
        validate_segment(&doc.id)?;

        if let Err(e) = agent::verify_self_signed(doc) {
            tracing::warn!(agent_id = %doc.id, error = %e, "rejecting untrusted agent document");
            return Err(ConcordatError::UntrustedSelfSignature(doc.id.clone()));
        }
        let key = agent::embedded_key(doc)?;

        let entry = TrustEntry {
            key,
            document: doc.clone(),
            cached_at: crypto::timestamp(),
        };
        let mut entries = self.lock()?;
        entries.insert(doc.id.clone(), entry);
        tracing::info!(agent_id = %doc.id, "agent trusted");
        Ok(doc.id.clone())
    }

    /// Whether an agent id has a cached entry.
    pub fn is_trusted(&self, id: &str) -> bool {
        self.lock().map(|e| e.contains_key(id)).unwrap_or(false)
    }

    /// The cached origin document for an agent, if trusted.
    pub fn get(&self, id: &str) -> Option<Document> {
        self.lock().ok()?.get(id).map(|e| e.document.clone())
    }

    /// The cached public key for an agent, if trusted.
    pub fn key(&self, id: &str) -> Option<PublicKey> {
        self.lock().ok()?.get(id).map(|e| e.key.clone())
    }

    /// Remove an agent's key and origin document as an atomic pair.
    ///
    /// Returns `true` if an entry existed.
    pub fn untrust(&self, id: &str) -> bool {
        let removed = self
            .lock()
            .map(|mut e| e.remove(id).is_some())
            .unwrap_or(false);
        if removed {
            tracing::info!(agent_id = %id, "agent untrusted");
        }
        removed
    }

    /// Number of trusted agents.
    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, TrustEntry>>, ConcordatError> {
        self.entries
            .lock()
            .map_err(|_| ConcordatError::StorageError("trust store lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{create_agent, AgentProfile, KEY_FIELD};
    use crate::crypto::{Algorithm, KeyPair};

    fn make_agent() -> Document {
        let keys = KeyPair::generate(Algorithm::Ed25519).unwrap();
        let (doc, _) = create_agent(keys, AgentProfile::default()).unwrap();
        doc
    }

    #[test]
    fn test_trust_and_lookup() {
        let store = TrustStore::new();
        let doc = make_agent();

        let id = store.trust(&doc).unwrap();
        assert_eq!(id, doc.id);
        assert!(store.is_trusted(&doc.id));
        assert!(store.key(&doc.id).is_some());
        assert_eq!(store.get(&doc.id).unwrap().id, doc.id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_trust_rejects_bad_self_signature() {
        let store = TrustStore::new();
        let mut doc = make_agent();

        // Swap in a key that did not sign the document.
        let other = KeyPair::generate(Algorithm::Ed25519).unwrap();
        doc.content.insert(
            KEY_FIELD.to_string(),
            serde_json::Value::String(other.public_key_hex().unwrap()),
        );

        let err = store.trust(&doc).unwrap_err();
        assert!(matches!(err, ConcordatError::UntrustedSelfSignature(_)));
        assert!(!store.is_trusted(&doc.id));
    }

    #[test]
    fn test_untrust_removes_pair() {
        let store = TrustStore::new();
        let doc = make_agent();
        store.trust(&doc).unwrap();

        assert!(store.untrust(&doc.id));
        assert!(!store.is_trusted(&doc.id));
        assert!(store.key(&doc.id).is_none());
        assert!(store.get(&doc.id).is_none());
        assert!(!store.untrust(&doc.id));
    }

    #[test]
    fn test_unsafe_ids_rejected() {
        let store = TrustStore::new();
        let mut doc = make_agent();
        doc.id = "../escape".to_string();
        assert!(store.trust(&doc).is_err());
    }

    #[test]
    fn test_concurrent_trust_untrust_keeps_entries_whole() {
        use std::sync::Arc;

        let store = Arc::new(TrustStore::new());
        let doc = Arc::new(make_agent());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            let doc = Arc::clone(&doc);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    if i % 2 == 0 {
                        let _ = store.trust(&doc);
                    } else {
                        store.untrust(&doc.id);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Either fully present (key and document both) or fully absent.
        let key = store.key(&doc.id);
        let document = store.get(&doc.id);
        assert_eq!(key.is_some(), document.is_some());
    }
}
