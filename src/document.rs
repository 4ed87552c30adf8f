//! Signed document model, content-hash binding, and verification.
//!
//! A document is a JSON object carrying identity/version fields, a content
//! hash over an explicit field subset, and a signature record binding the
//! hash to a signer identity, algorithm, and key fingerprint. Application
//! fields live alongside the protocol fields in the same flat object.

use crate::agent::AgentSession;
use crate::canonical;
use crate::crypto::{self, Algorithm};
use crate::ConcordatError;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Intent tag describing how a document's content is expected to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentLevel {
    /// Immutable source material.
    Raw,
    /// Mutable settings.
    Config,
    /// Generated output.
    Artifact,
    /// Computed from other documents.
    Derived,
}

/// Signature record binding a content hash to a signer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSignature {
    pub signer_id: String,
    pub signer_version: String,
    #[serde(rename = "signingAlgorithm")]
    pub algorithm: Algorithm,
    pub key_fingerprint: String,
    pub signed_at: String,
    /// The exact list of field names that were hashed and signed,
    /// in sorted order.
    pub fields: Vec<String>,
    /// Hex-encoded signature bytes over the content-hash digest.
    pub value: String,
}

/// A versioned, signable document.
///
/// `id` is immutable for the lifetime of the entity; `version` changes on
/// every content-affecting mutation. Application fields are flattened into
/// the same JSON object as the protocol fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub version: String,
    pub original_version: String,
    pub original_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    pub version_date: String,
    pub level: DocumentLevel,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<DocumentSignature>,
    #[serde(flatten)]
    pub content: serde_json::Map<String, serde_json::Value>,
}

/// Identity fields included in every document's hashed field set.
pub const IDENTITY_FIELDS: [&str; 7] = [
    "id",
    "version",
    "originalVersion",
    "originalDate",
    "previousVersion",
    "versionDate",
    "level",
];

/// Information about the signer of a successfully verified document.
#[derive(Debug, Clone, PartialEq)]
pub struct SignerInfo {
    pub signer_id: String,
    pub signer_version: String,
    pub algorithm: Algorithm,
    pub key_fingerprint: String,
    pub signed_at: String,
}

/// Optional verification policy. All checks default to off.
#[derive(Debug, Clone, Default)]
pub struct VerifyPolicy {
    /// Accept only these algorithms; `None` accepts any supported algorithm.
    pub allowed_algorithms: Option<Vec<Algorithm>>,
    /// Reject signatures older than this; `None` accepts any age.
    pub max_signature_age: Option<chrono::Duration>,
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Build the sorted hashed-field list for a document: the identity fields
/// plus the given application field names.
pub fn signed_field_list(extra_fields: &[String]) -> Vec<String> {
    let mut fields: Vec<String> = IDENTITY_FIELDS.iter().map(|s| s.to_string()).collect();
    for field in extra_fields {
        if !fields.iter().any(|f| f == field) {
            fields.push(field.clone());
        }
    }
    fields.sort();
    fields
}

/// Compute a document's content hash over the given field list.
pub fn compute_content_hash(
    doc: &Document,
    fields: &[String],
) -> Result<String, ConcordatError> {
    let value = serde_json::to_value(doc)
        .map_err(|e| ConcordatError::SerializationError(format!("document to JSON: {}", e)))?;
    let canonical = canonical::canonical_bytes(&value, fields)?;
    Ok(crypto::sha256_string(&canonical))
}

/// Sign a document in place over the given application fields.
///
/// Computes the canonical bytes over the identity fields plus
/// `extra_fields`, hashes them into `contentHash`, signs the digest with
/// the session's key, and attaches a signature record carrying the exact
/// sorted field list.
///
/// # Errors
/// Returns `ConcordatError::InvalidInput` for a malformed field list or
/// `ConcordatError::CryptoError` for signing failures.
pub fn sign_document(
    doc: &mut Document,
    extra_fields: &[String],
    session: &AgentSession,
) -> Result<(), ConcordatError> {
    let fields = signed_field_list(extra_fields);
    let content_hash = compute_content_hash(doc, &fields)?;
    let digest = hex::decode(&content_hash)
        .map_err(|e| ConcordatError::CryptoError(format!("digest decode: {}", e)))?;
    let sig_bytes = session.keys().sign_digest(&digest)?;

    doc.content_hash = content_hash;
    doc.signature = Some(DocumentSignature {
        signer_id: session.agent_id().to_string(),
        signer_version: session.agent_version().to_string(),
        algorithm: session.keys().algorithm(),
        key_fingerprint: session.keys().fingerprint()?,
        signed_at: crypto::timestamp(),
        fields,
        value: hex::encode(sig_bytes),
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verify a document against a resolved public key.
///
/// The hash check runs before the signature check so callers can tell
/// tampering (`HashMismatch`) apart from a wrong signer
/// (`SignatureInvalid`). Policy checks run only when configured.
///
/// # Errors
/// - `ConcordatError::InvalidInput` if the document carries no signature
/// - `ConcordatError::UnknownAlgorithm` if the algorithm is outside the
///   configured allow-list
/// - `ConcordatError::HashMismatch` if the recomputed content hash differs
/// - `ConcordatError::SignatureInvalid` if the signature bytes do not
///   verify under the resolved key
/// - `ConcordatError::SignatureExpired` if the signature is older than the
///   configured maximum age
pub fn verify_document(
    doc: &Document,
    key: &crypto::PublicKey,
    policy: &VerifyPolicy,
) -> Result<SignerInfo, ConcordatError> {
    let sig = doc
        .signature
        .as_ref()
        .ok_or_else(|| ConcordatError::InvalidInput("document is unsigned".to_string()))?;

    if let Some(allowed) = &policy.allowed_algorithms {
        if !allowed.contains(&sig.algorithm) {
            return Err(ConcordatError::UnknownAlgorithm(sig.algorithm.to_string()));
        }
    }

    let computed = compute_content_hash(doc, &sig.fields)?;
    if !crypto::constant_time_equal(computed.as_bytes(), doc.content_hash.as_bytes()) {
        return Err(ConcordatError::HashMismatch {
            expected: doc.content_hash.clone(),
            computed,
        });
    }

    let digest = hex::decode(&computed)
        .map_err(|e| ConcordatError::CryptoError(format!("digest decode: {}", e)))?;
    let sig_bytes = hex::decode(&sig.value).unwrap_or_default();
    if !key.verify_digest(&digest, &sig_bytes) {
        return Err(ConcordatError::SignatureInvalid {
            signer: sig.signer_id.clone(),
        });
    }

    if let Some(max_age) = policy.max_signature_age {
        let signed_at = crypto::parse_timestamp(&sig.signed_at).ok_or_else(|| {
            ConcordatError::InvalidInput(format!("unparseable signature timestamp: {}", sig.signed_at))
        })?;
        if chrono::Utc::now().signed_duration_since(signed_at) > max_age {
            return Err(ConcordatError::SignatureExpired {
                signed_at: sig.signed_at.clone(),
            });
        }
    }

    Ok(SignerInfo {
        signer_id: sig.signer_id.clone(),
        signer_version: sig.signer_version.clone(),
        algorithm: sig.algorithm,
        key_fingerprint: sig.key_fingerprint.clone(),
        signed_at: sig.signed_at.clone(),
    })
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialize a document to a JSON string.
pub fn serialize_document(doc: &Document) -> Result<String, ConcordatError> {
    serde_json::to_string_pretty(doc)
        .map_err(|e| ConcordatError::SerializationError(format!("serialize document: {}", e)))
}

/// Deserialize a JSON string into a document.
pub fn deserialize_document(json: &str) -> Result<Document, ConcordatError> {
    serde_json::from_str(json)
        .map_err(|e| ConcordatError::SerializationError(format!("deserialize document: {}", e)))
}
