//! Multi-party agreement building, signing, and quorum evaluation.
//!
//! An agreement freezes a proposal -- question, context, required signers,
//! quorum, deadline, and algorithm constraints -- into a content hash at
//! creation time. Each required signer independently signs that frozen
//! hash; the engine tallies signatures against the quorum and deadline.
//! Completion is monotonic: signatures are only ever added or overwritten,
//! never removed, so once a quorum is reached it stays reached.

use crate::agent::AgentSession;
use crate::canonical;
use crate::crypto::{self, Algorithm, PublicKey};
use crate::document::Document;
use crate::ConcordatError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One signer's record over the frozen agreement hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgreementSignature {
    pub agent_id: String,
    pub agent_version: String,
    #[serde(rename = "signingAlgorithm")]
    pub algorithm: Algorithm,
    pub key_fingerprint: String,
    pub signed_at: String,
    /// The agreement hash observed at signing time.
    pub agreement_hash: String,
    /// Hex-encoded signature bytes over the agreement-hash digest.
    pub value: String,
}

/// A multi-party agreement over a fixed proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agreement {
    pub id: String,
    pub question: String,
    pub context: String,
    /// Sorted, deduplicated set of signer ids.
    pub required_agent_ids: Vec<String>,
    pub quorum: usize,
    /// Absolute ISO-8601 deadline; `None` means no deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Allow-list of acceptable signing algorithms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_algorithms: Option<Vec<Algorithm>>,
    /// Minimum acceptable algorithm strength in bits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_strength: Option<u32>,
    pub signatures: BTreeMap<String, AgreementSignature>,
    /// Hash of the immutable proposal content, frozen at creation.
    pub agreement_hash: String,
    pub created_at: String,
    /// Snapshot binding: the document this agreement is attached to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_version: Option<String>,
}

/// Options for creating a new agreement.
#[derive(Default)]
pub struct AgreementOptions {
    pub question: String,
    pub context: String,
    pub required_agent_ids: Vec<String>,
    /// Defaults to unanimous (all required signers) when `None`.
    pub quorum: Option<usize>,
    pub timeout: Option<String>,
    pub required_algorithms: Option<Vec<Algorithm>>,
    pub minimum_strength: Option<u32>,
    /// Document snapshot to bind the agreement to.
    pub document: Option<(String, String)>,
}

impl AgreementOptions {
    /// Bind the agreement to a document snapshot.
    pub fn for_document(mut self, doc: &Document) -> Self {
        self.document = Some((doc.id.clone(), doc.version.clone()));
        self
    }
}

/// Result of a pure [`check`] read at a fixed instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgreementStatus {
    pub signed_count: usize,
    pub required: usize,
    pub quorum: usize,
    pub complete: bool,
    pub expired: bool,
}

/// Lifecycle state derived from a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgreementState {
    Open,
    Complete,
    Expired,
}

impl AgreementStatus {
    /// Collapse the status flags into a lifecycle state. `complete` and
    /// `expired` are mutually exclusive for a fixed evaluation instant.
    pub fn state(&self) -> AgreementState {
        if self.complete {
            AgreementState::Complete
        } else if self.expired {
            AgreementState::Expired
        } else {
            AgreementState::Open
        }
    }
}

// ---------------------------------------------------------------------------
// Creation and hashing
// ---------------------------------------------------------------------------

/// Create a new agreement, freezing its proposal hash.
///
/// Required signer ids are sorted and deduplicated; the quorum defaults to
/// unanimous and must be between 1 and the number of required signers.
///
/// # Errors
/// Returns `ConcordatError::InvalidInput` for an empty question, an empty
/// signer set, an out-of-range quorum, or an unparseable timeout.
pub fn create_agreement(opts: AgreementOptions) -> Result<Agreement, ConcordatError> {
    if opts.question.trim().is_empty() {
        return Err(ConcordatError::InvalidInput(
            "question is required".to_string(),
        ));
    }
    if opts.required_agent_ids.is_empty() {
        return Err(ConcordatError::InvalidInput(
            "requiredAgentIds must not be empty".to_string(),
        ));
    }

    let mut required = opts.required_agent_ids.clone();
    required.sort();
    required.dedup();

    let quorum = opts.quorum.unwrap_or(required.len());
    if quorum == 0 || quorum > required.len() {
        return Err(ConcordatError::InvalidInput(format!(
            "quorum must be between 1 and {} (got {})",
            required.len(),
            quorum
        )));
    }

    if let Some(timeout) = &opts.timeout {
        if crypto::parse_timestamp(timeout).is_none() {
            return Err(ConcordatError::InvalidInput(format!(
                "unparseable timeout: {}",
                timeout
            )));
        }
    }

    let (document_id, document_version) = match opts.document {
        Some((id, version)) => (Some(id), Some(version)),
        None => (None, None),
    };

    let mut agreement = Agreement {
        id: uuid::Uuid::new_v4().to_string(),
        question: opts.question,
        context: opts.context,
        required_agent_ids: required,
        quorum,
        timeout: opts.timeout,
        required_algorithms: opts.required_algorithms,
        minimum_strength: opts.minimum_strength,
        signatures: BTreeMap::new(),
        agreement_hash: String::new(),
        created_at: crypto::timestamp(),
        document_id,
        document_version,
    };
    agreement.agreement_hash = compute_agreement_hash(&agreement)?;
    Ok(agreement)
}

/// Hash the immutable proposal content of an agreement.
///
/// Covers everything except the signature map and the hash itself, so any
/// post-creation edit to the proposal is detectable.
pub fn compute_agreement_hash(agreement: &Agreement) -> Result<String, ConcordatError> {
    let proposal = serde_json::json!({
        "question": agreement.question,
        "context": agreement.context,
        "requiredAgentIds": agreement.required_agent_ids,
        "quorum": agreement.quorum,
        "timeout": agreement.timeout,
        "requiredAlgorithms": agreement.required_algorithms,
        "minimumStrength": agreement.minimum_strength,
        "createdAt": agreement.created_at,
        "documentId": agreement.document_id,
        "documentVersion": agreement.document_version,
    });
    Ok(crypto::sha256_string(&canonical::canonicalize_json(
        &proposal,
    )))
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Check whether an algorithm satisfies the agreement's constraints.
///
/// # Errors
/// Returns `ConcordatError::AlgorithmNotPermitted` when the algorithm is
/// outside the allow-list or below the minimum strength.
pub fn check_algorithm_permitted(
    agreement: &Agreement,
    algorithm: Algorithm,
) -> Result<(), ConcordatError> {
    if let Some(required) = &agreement.required_algorithms {
        if !required.contains(&algorithm) {
            return Err(ConcordatError::AlgorithmNotPermitted {
                algorithm: algorithm.to_string(),
                reason: "not in the required algorithm list".to_string(),
            });
        }
    }
    if let Some(minimum) = agreement.minimum_strength {
        if algorithm.strength_bits() < minimum {
            return Err(ConcordatError::AlgorithmNotPermitted {
                algorithm: algorithm.to_string(),
                reason: format!(
                    "strength {} bits is below the required minimum of {} bits",
                    algorithm.strength_bits(),
                    minimum
                ),
            });
        }
    }
    Ok(())
}

/// Sign an agreement as of the current instant. See [`sign_agreement_at`].
pub fn sign_agreement(
    agreement: &mut Agreement,
    session: &AgentSession,
) -> Result<AgreementStatus, ConcordatError> {
    sign_agreement_at(agreement, session, chrono::Utc::now())
}

/// Sign an agreement, evaluating the deadline against `now`.
///
/// Re-signing by the same agent overwrites its prior record idempotently.
/// A signature arriving after the quorum was reached is still recorded (the
/// record is useful for audit) but cannot change the completion outcome. A
/// rejected signature leaves the signature map untouched.
///
/// # Errors
/// - `ConcordatError::NotARequiredSigner` if the session's agent is not in
///   the required set
/// - `ConcordatError::AlgorithmNotPermitted` if the session's algorithm
///   violates the configured constraint
/// - `ConcordatError::AgreementTampered` if the recomputed proposal hash no
///   longer matches the frozen hash
/// - `ConcordatError::AgreementExpired` if the deadline passed before a
///   quorum was reached
pub fn sign_agreement_at(
    agreement: &mut Agreement,
    session: &AgentSession,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<AgreementStatus, ConcordatError> {
    if !agreement
        .required_agent_ids
        .iter()
        .any(|id| id == session.agent_id())
    {
        return Err(ConcordatError::NotARequiredSigner(
            session.agent_id().to_string(),
        ));
    }

    check_algorithm_permitted(agreement, session.keys().algorithm())?;

    let recomputed = compute_agreement_hash(agreement)?;
    if !crypto::constant_time_equal(
        recomputed.as_bytes(),
        agreement.agreement_hash.as_bytes(),
    ) {
        return Err(ConcordatError::AgreementTampered);
    }

    let status = check_at(agreement, now);
    if status.expired {
        let deadline = agreement.timeout.clone().unwrap_or_default();
        return Err(ConcordatError::AgreementExpired(deadline));
    }

    let digest = hex::decode(&agreement.agreement_hash)
        .map_err(|e| ConcordatError::CryptoError(format!("digest decode: {}", e)))?;
    let value = session.keys().sign_digest(&digest)?;

    agreement.signatures.insert(
        session.agent_id().to_string(),
        AgreementSignature {
            agent_id: session.agent_id().to_string(),
            agent_version: session.agent_version().to_string(),
            algorithm: session.keys().algorithm(),
            key_fingerprint: session.keys().fingerprint()?,
            signed_at: crypto::timestamp(),
            agreement_hash: agreement.agreement_hash.clone(),
            value: hex::encode(value),
        },
    );

    let status = check_at(agreement, now);
    tracing::info!(
        agreement_id = %agreement.id,
        signer = %session.agent_id(),
        signed = status.signed_count,
        quorum = status.quorum,
        complete = status.complete,
        "agreement signed"
    );
    Ok(status)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate an agreement's status as of the current instant.
pub fn check(agreement: &Agreement) -> AgreementStatus {
    check_at(agreement, chrono::Utc::now())
}

/// Evaluate an agreement's status at a fixed instant. Pure read; never
/// mutates state.
pub fn check_at(agreement: &Agreement, now: chrono::DateTime<chrono::Utc>) -> AgreementStatus {
    let signed_count = agreement
        .signatures
        .keys()
        .filter(|id| agreement.required_agent_ids.iter().any(|r| r == *id))
        .count();
    let complete = signed_count >= agreement.quorum;
    let expired = !complete
        && agreement
            .timeout
            .as_deref()
            .and_then(crypto::parse_timestamp)
            .map(|deadline| now > deadline)
            .unwrap_or(false);

    AgreementStatus {
        signed_count,
        required: agreement.required_agent_ids.len(),
        quorum: agreement.quorum,
        complete,
        expired,
    }
}

/// Re-verify every recorded signature against resolved keys.
///
/// One invalid signature does not invalidate the others; each signer gets
/// an independent verdict.
#[derive(Debug, Clone)]
pub struct SignerVerification {
    pub agent_id: String,
    pub valid: bool,
    pub message: String,
}

pub fn verify_agreement(
    agreement: &Agreement,
    keys: &HashMap<String, PublicKey>,
) -> Result<Vec<SignerVerification>, ConcordatError> {
    let recomputed = compute_agreement_hash(agreement)?;
    let digest = hex::decode(&recomputed)
        .map_err(|e| ConcordatError::CryptoError(format!("digest decode: {}", e)))?;

    let mut results = Vec::new();
    for (agent_id, sig) in &agreement.signatures {
        let verdict = verify_one(agreement, sig, &recomputed, &digest, keys.get(agent_id));
        results.push(SignerVerification {
            agent_id: agent_id.clone(),
            valid: verdict.is_none(),
            message: verdict.unwrap_or_else(|| "signature is valid".to_string()),
        });
    }
    Ok(results)
}

fn verify_one(
    agreement: &Agreement,
    sig: &AgreementSignature,
    recomputed: &str,
    digest: &[u8],
    key: Option<&PublicKey>,
) -> Option<String> {
    if !agreement.required_agent_ids.iter().any(|r| r == &sig.agent_id) {
        return Some("not a required signer".to_string());
    }
    if !crypto::constant_time_equal(sig.agreement_hash.as_bytes(), recomputed.as_bytes()) {
        return Some("agreement content changed after signing".to_string());
    }
    let key = match key {
        Some(key) => key,
        None => return Some("no resolved key for signer".to_string()),
    };
    if key.algorithm() != sig.algorithm {
        return Some(format!(
            "record claims {} but resolved key is {}",
            sig.algorithm,
            key.algorithm()
        ));
    }
    let value = match hex::decode(&sig.value) {
        Ok(value) => value,
        Err(_) => return Some("signature bytes are not valid hex".to_string()),
    };
    if !key.verify_digest(digest, &value) {
        return Some("signature bytes do not verify".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{create_agent, AgentProfile};
    use crate::crypto::KeyPair;

    fn make_session(algorithm: Algorithm) -> AgentSession {
        let keys = KeyPair::generate(algorithm).unwrap();
        let (_, session) = create_agent(keys, AgentProfile::default()).unwrap();
        session
    }

    fn opts_for(sessions: &[&AgentSession]) -> AgreementOptions {
        AgreementOptions {
            question: "Deploy release 4.2 to production?".to_string(),
            context: "Rollback plan attached".to_string(),
            required_agent_ids: sessions.iter().map(|s| s.agent_id().to_string()).collect(),
            ..Default::default()
        }
    }

    fn past_timestamp() -> String {
        (chrono::Utc::now() - chrono::Duration::seconds(1))
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }

    #[test]
    fn test_two_of_three_scenario() {
        let a = make_session(Algorithm::Ed25519);
        let b = make_session(Algorithm::Ed25519);
        let c = make_session(Algorithm::Ed25519);

        let mut agreement = create_agreement(AgreementOptions {
            quorum: Some(2),
            ..opts_for(&[&a, &b, &c])
        })
        .unwrap();

        let status = sign_agreement(&mut agreement, &a).unwrap();
        assert_eq!(status.signed_count, 1);
        assert!(!status.complete);

        let status = sign_agreement(&mut agreement, &b).unwrap();
        assert_eq!(status.signed_count, 2);
        assert!(status.complete);

        // C never signs; the agreement still reports complete.
        let status = check(&agreement);
        assert!(status.complete);
        assert!(!status.expired);
        assert_eq!(status.state(), AgreementState::Complete);
    }

    #[test]
    fn test_quorum_defaults_to_unanimous() {
        let a = make_session(Algorithm::Ed25519);
        let b = make_session(Algorithm::Ed25519);
        let mut agreement = create_agreement(opts_for(&[&a, &b])).unwrap();
        assert_eq!(agreement.quorum, 2);

        sign_agreement(&mut agreement, &a).unwrap();
        assert!(!check(&agreement).complete);
        sign_agreement(&mut agreement, &b).unwrap();
        assert!(check(&agreement).complete);
    }

    #[test]
    fn test_quorum_bounds_validated() {
        let a = make_session(Algorithm::Ed25519);
        assert!(create_agreement(AgreementOptions {
            quorum: Some(0),
            ..opts_for(&[&a])
        })
        .is_err());
        assert!(create_agreement(AgreementOptions {
            quorum: Some(2),
            ..opts_for(&[&a])
        })
        .is_err());
    }

    #[test]
    fn test_expired_agreement() {
        let a = make_session(Algorithm::Ed25519);
        let mut agreement = create_agreement(AgreementOptions {
            timeout: Some(past_timestamp()),
            ..opts_for(&[&a])
        })
        .unwrap();

        let status = check(&agreement);
        assert!(status.expired);
        assert!(!status.complete);
        assert_eq!(status.state(), AgreementState::Expired);

        let err = sign_agreement(&mut agreement, &a).unwrap_err();
        assert!(matches!(err, ConcordatError::AgreementExpired(_)));
        assert!(agreement.signatures.is_empty());
    }

    #[test]
    fn test_completion_is_monotonic() {
        let a = make_session(Algorithm::Ed25519);
        let b = make_session(Algorithm::Ed25519);
        let c = make_session(Algorithm::Ed25519);
        let mut agreement = create_agreement(AgreementOptions {
            quorum: Some(1),
            ..opts_for(&[&a, &b, &c])
        })
        .unwrap();

        sign_agreement(&mut agreement, &a).unwrap();
        assert!(check(&agreement).complete);

        // Later signatures are recorded for audit but cannot change the
        // completion determination.
        let status = sign_agreement(&mut agreement, &b).unwrap();
        assert!(status.complete);
        assert_eq!(agreement.signatures.len(), 2);
        assert!(check(&agreement).complete);
    }

    #[test]
    fn test_algorithm_allow_list_rejects_without_recording() {
        let a = make_session(Algorithm::Ed25519);
        let mut agreement = create_agreement(AgreementOptions {
            required_algorithms: Some(vec![Algorithm::MlDsa44]),
            ..opts_for(&[&a])
        })
        .unwrap();

        let err = sign_agreement(&mut agreement, &a).unwrap_err();
        assert!(matches!(err, ConcordatError::AlgorithmNotPermitted { .. }));
        assert!(agreement.signatures.is_empty());
    }

    #[test]
    fn test_minimum_strength_rejects_weak_algorithm() {
        let a = make_session(Algorithm::RsaPss);
        let mut agreement = create_agreement(AgreementOptions {
            minimum_strength: Some(128),
            ..opts_for(&[&a])
        })
        .unwrap();

        let err = sign_agreement(&mut agreement, &a).unwrap_err();
        assert!(matches!(err, ConcordatError::AlgorithmNotPermitted { .. }));
    }

    #[test]
    fn test_tampered_agreement_refuses_signatures() {
        let a = make_session(Algorithm::Ed25519);
        let b = make_session(Algorithm::Ed25519);
        let mut agreement = create_agreement(AgreementOptions {
            quorum: Some(1),
            ..opts_for(&[&a, &b])
        })
        .unwrap();
        sign_agreement(&mut agreement, &a).unwrap();

        agreement.question = "Deploy release 6.6 to production?".to_string();

        let err = sign_agreement(&mut agreement, &b).unwrap_err();
        assert!(matches!(err, ConcordatError::AgreementTampered));

        // The earlier signature is now invalid against the edited content.
        let mut keys = HashMap::new();
        keys.insert(
            a.agent_id().to_string(),
            a.keys().public_key().clone(),
        );
        let results = verify_agreement(&agreement, &keys).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].valid);
    }

    #[test]
    fn test_resigning_overwrites_idempotently() {
        let a = make_session(Algorithm::Ed25519);
        let b = make_session(Algorithm::Ed25519);
        let mut agreement = create_agreement(opts_for(&[&a, &b])).unwrap();

        sign_agreement(&mut agreement, &a).unwrap();
        let first = agreement.signatures.get(a.agent_id()).unwrap().clone();
        sign_agreement(&mut agreement, &a).unwrap();

        assert_eq!(agreement.signatures.len(), 1);
        let second = agreement.signatures.get(a.agent_id()).unwrap();
        assert_eq!(second.agreement_hash, first.agreement_hash);
        assert_eq!(check(&agreement).signed_count, 1);
    }

    #[test]
    fn test_unrelated_signer_rejected() {
        let a = make_session(Algorithm::Ed25519);
        let outsider = make_session(Algorithm::Ed25519);
        let mut agreement = create_agreement(opts_for(&[&a])).unwrap();

        let err = sign_agreement(&mut agreement, &outsider).unwrap_err();
        assert!(matches!(err, ConcordatError::NotARequiredSigner(_)));
        assert!(agreement.signatures.is_empty());
    }

    #[test]
    fn test_verify_agreement_mixed_algorithms() {
        let a = make_session(Algorithm::Ed25519);
        let b = make_session(Algorithm::MlDsa44);
        let mut agreement = create_agreement(opts_for(&[&a, &b])).unwrap();
        sign_agreement(&mut agreement, &a).unwrap();
        sign_agreement(&mut agreement, &b).unwrap();

        let mut keys = HashMap::new();
        keys.insert(a.agent_id().to_string(), a.keys().public_key().clone());
        keys.insert(b.agent_id().to_string(), b.keys().public_key().clone());

        let results = verify_agreement(&agreement, &keys).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.valid), "{:?}", results);
    }

    #[test]
    fn test_required_ids_sorted_and_deduped() {
        let agreement = create_agreement(AgreementOptions {
            question: "q".to_string(),
            required_agent_ids: vec![
                "zeta".to_string(),
                "alpha".to_string(),
                "zeta".to_string(),
            ],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(agreement.required_agent_ids, vec!["alpha", "zeta"]);
        assert_eq!(agreement.quorum, 2);
    }

    #[test]
    fn test_wire_format_uses_camel_case() {
        let a = make_session(Algorithm::Ed25519);
        let mut agreement = create_agreement(AgreementOptions {
            timeout: Some("2099-01-01T00:00:00.000Z".to_string()),
            ..opts_for(&[&a])
        })
        .unwrap();
        sign_agreement(&mut agreement, &a).unwrap();

        let json = serde_json::to_string(&agreement).unwrap();
        assert!(json.contains("requiredAgentIds"));
        assert!(json.contains("agreementHash"));
        assert!(json.contains("keyFingerprint"));

        let restored: Agreement = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.agreement_hash, agreement.agreement_hash);
        assert_eq!(
            compute_agreement_hash(&restored).unwrap(),
            restored.agreement_hash
        );
    }
}
