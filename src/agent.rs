//! Agent sessions and self-signed agent documents.
//!
//! An agent is a document whose application fields embed its own public key
//! and algorithm; the document is signed with the matching private key, so
//! its authorship is verifiable from the document alone. An [`AgentSession`]
//! couples an agent's id/version with its private keys. Sessions are plain
//! values constructed once and passed by reference, so multiple independent
//! signer identities can coexist in one process.

use crate::crypto::{self, Algorithm, KeyPair};
use crate::document::{self, Document, DocumentLevel, SignerInfo, VerifyPolicy};
use crate::storage::{Kind, Storage};
use crate::version;
use crate::ConcordatError;

/// Application field embedding the agent's hex-encoded public key.
pub const KEY_FIELD: &str = "publicKey";

/// Application field embedding the agent's algorithm name.
pub const ALGORITHM_FIELD: &str = "algorithm";

/// Application field carrying the agent's human-readable name.
pub const DISPLAY_NAME_FIELD: &str = "displayName";

/// Application field carrying the agent's claimed DNS-anchor domain.
pub const DOMAIN_FIELD: &str = "domain";

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A signing identity: an agent's id and current version plus its keys.
pub struct AgentSession {
    agent_id: String,
    agent_version: String,
    keys: KeyPair,
}

impl AgentSession {
    /// The agent's immutable id.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The agent document version this session currently signs as.
    pub fn agent_version(&self) -> &str {
        &self.agent_version
    }

    /// The session's key pair.
    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    /// Point the session at a newer version of its agent document.
    pub fn advance_version(&mut self, version: &str) {
        self.agent_version = version.to_string();
    }
}

// ---------------------------------------------------------------------------
// Create / update
// ---------------------------------------------------------------------------

/// Optional descriptive fields of an agent document.
#[derive(Debug, Clone, Default)]
pub struct AgentProfile {
    pub display_name: Option<String>,
    /// Domain at which the agent publishes its DNS trust-anchor record.
    pub domain: Option<String>,
}

/// Create a new self-signed agent document and its session.
///
/// The document embeds the public half of `keys` and is signed with the
/// private half, so [`verify_self_signed`] succeeds on the result. The
/// document is not persisted; use [`version::persist_document`] with
/// [`Kind::Agent`] to store it.
pub fn create_agent(
    keys: KeyPair,
    profile: AgentProfile,
) -> Result<(Document, AgentSession), ConcordatError> {
    let now = crypto::timestamp();
    let id = uuid::Uuid::new_v4().to_string();
    let first_version = uuid::Uuid::new_v4().to_string();

    let mut content = serde_json::Map::new();
    content.insert(
        KEY_FIELD.to_string(),
        serde_json::Value::String(keys.public_key_hex()?),
    );
    content.insert(
        ALGORITHM_FIELD.to_string(),
        serde_json::Value::String(keys.algorithm().to_string()),
    );
    let mut extra_fields = vec![KEY_FIELD.to_string(), ALGORITHM_FIELD.to_string()];
    if let Some(name) = &profile.display_name {
        content.insert(
            DISPLAY_NAME_FIELD.to_string(),
            serde_json::Value::String(name.clone()),
        );
        extra_fields.push(DISPLAY_NAME_FIELD.to_string());
    }
    if let Some(domain) = &profile.domain {
        content.insert(
            DOMAIN_FIELD.to_string(),
            serde_json::Value::String(domain.clone()),
        );
        extra_fields.push(DOMAIN_FIELD.to_string());
    }

    let mut doc = Document {
        id: id.clone(),
        version: first_version.clone(),
        original_version: first_version.clone(),
        original_date: now.clone(),
        previous_version: None,
        version_date: now,
        level: DocumentLevel::Config,
        content_hash: String::new(),
        signature: None,
        content,
    };

    let session = AgentSession {
        agent_id: id,
        agent_version: first_version,
        keys,
    };
    document::sign_document(&mut doc, &extra_fields, &session)?;

    Ok((doc, session))
}

/// Changes to apply when updating an agent document. `None` keeps the
/// existing value.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub display_name: Option<String>,
    pub domain: Option<String>,
}

/// Update an agent's document to a new version, re-sign it, and persist it.
///
/// Preserves `id`, `originalVersion`, and `originalDate`; the session is
/// advanced to the new version before signing so the self-signature
/// references the version it lives in.
///
/// # Errors
/// Returns `ConcordatError::VersionConflict` if `latest` is not the stored
/// head for this agent.
pub fn update_agent(
    storage: &dyn Storage,
    session: &mut AgentSession,
    latest: &Document,
    update: AgentUpdate,
) -> Result<Document, ConcordatError> {
    if latest.id != session.agent_id {
        return Err(ConcordatError::InvalidInput(
            "session does not own this agent document".to_string(),
        ));
    }
    version::expect_head(storage, Kind::Agent, &latest.id, &latest.version)?;

    let mut content = latest.content.clone();
    let mut extra_fields = vec![KEY_FIELD.to_string(), ALGORITHM_FIELD.to_string()];
    if let Some(name) = update.display_name {
        content.insert(
            DISPLAY_NAME_FIELD.to_string(),
            serde_json::Value::String(name),
        );
    }
    if let Some(domain) = update.domain {
        content.insert(DOMAIN_FIELD.to_string(), serde_json::Value::String(domain));
    }
    if content.contains_key(DISPLAY_NAME_FIELD) {
        extra_fields.push(DISPLAY_NAME_FIELD.to_string());
    }
    if content.contains_key(DOMAIN_FIELD) {
        extra_fields.push(DOMAIN_FIELD.to_string());
    }

    let new_version = uuid::Uuid::new_v4().to_string();
    let mut doc = Document {
        id: latest.id.clone(),
        version: new_version.clone(),
        original_version: latest.original_version.clone(),
        original_date: latest.original_date.clone(),
        previous_version: Some(latest.version.clone()),
        version_date: crypto::timestamp(),
        level: latest.level,
        content_hash: String::new(),
        signature: None,
        content,
    };

    session.advance_version(&new_version);
    document::sign_document(&mut doc, &extra_fields, session)?;
    version::persist_document(storage, Kind::Agent, &doc)?;

    Ok(doc)
}

// ---------------------------------------------------------------------------
// Self-signature verification
// ---------------------------------------------------------------------------

/// Extract the public key embedded in an agent document.
pub fn embedded_key(doc: &Document) -> Result<crypto::PublicKey, ConcordatError> {
    let algorithm_name = doc
        .content
        .get(ALGORITHM_FIELD)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ConcordatError::InvalidInput("agent document has no algorithm field".to_string())
        })?;
    let algorithm: Algorithm = algorithm_name.parse()?;
    let key_hex = doc
        .content
        .get(KEY_FIELD)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ConcordatError::InvalidInput("agent document has no publicKey field".to_string())
        })?;
    crypto::PublicKey::from_hex(algorithm, key_hex)
}

/// The domain an agent document claims for DNS anchoring, if any.
pub fn claimed_domain(doc: &Document) -> Option<&str> {
    doc.content.get(DOMAIN_FIELD).and_then(|v| v.as_str())
}

/// Verify that an agent document is signed by its own embedded key.
///
/// Checks that the signature's signer id is the document's own id, that the
/// recorded key fingerprint matches the embedded key, and that the document
/// verifies under that key.
pub fn verify_self_signed(doc: &Document) -> Result<SignerInfo, ConcordatError> {
    let sig = doc
        .signature
        .as_ref()
        .ok_or_else(|| ConcordatError::InvalidInput("agent document is unsigned".to_string()))?;
    if sig.signer_id != doc.id {
        return Err(ConcordatError::InvalidInput(format!(
            "agent document {} is signed by {}, not by itself",
            doc.id, sig.signer_id
        )));
    }

    let key = embedded_key(doc)?;
    let fingerprint = key.fingerprint()?;
    if !crypto::constant_time_equal(fingerprint.as_bytes(), sig.key_fingerprint.as_bytes()) {
        return Err(ConcordatError::IdentityConflict {
            agent_id: doc.id.clone(),
            detail: "signature fingerprint does not match embedded key".to_string(),
        });
    }

    document::verify_document(doc, &key, &VerifyPolicy::default())
}
