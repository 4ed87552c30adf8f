//! Concordat: verifiable documents and multi-party agreements for
//! autonomous agents.
//!
//! This crate provides the core protocol primitives for producing JSON
//! documents whose authorship, integrity, and version history are
//! cryptographically verifiable without a central authority, and for
//! collecting binding multi-party consent over those documents. It includes:
//!
//! - **crypto**: Ed25519/RSA-PSS/ML-DSA-44 signing, SHA-256 hashing,
//!   key fingerprints
//! - **canonical**: deterministic serialization of explicit field subsets
//! - **document**: signed document model, content-hash binding, verification
//! - **version**: version-chain management with optimistic concurrency
//! - **agent**: signer sessions and self-signed agent documents
//! - **truststore**: local cache of vetted signer keys
//! - **dns**: DNS trust-anchor records with strict/relaxed verification
//! - **directory**: remote key-directory collaborator
//! - **resolver**: ordered key-resolution pipeline
//! - **agreement**: quorum/timeout agreement state machine
//! - **storage**: narrow versioned-storage contract and in-memory backend

pub mod agent;
pub mod agreement;
pub mod canonical;
pub mod crypto;
pub mod directory;
pub mod dns;
pub mod document;
pub mod resolver;
pub mod storage;
pub mod truststore;
pub mod version;

/// Boxed, pinned, Send future. Used for async trait methods on pluggable
/// collaborators (DNS lookup, remote directory) so they stay object-safe.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + 'a + Send>>;

/// Broad failure categories, used by callers to pick a recovery strategy
/// without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A cryptographic guarantee failed. Never retried, surfaced verbatim.
    Integrity,
    /// The operation violated a configured policy rather than a guarantee.
    Policy,
    /// A key-lookup stage declined or failed. Recoverable by retrying or
    /// falling back to another stage.
    Resolution,
    /// Stored state disagrees with the caller's view. Requires intervention.
    Consistency,
    /// Malformed or rejected input.
    Validation,
    /// A storage or network collaborator failed.
    Collaborator,
}

/// Errors that can occur throughout the Concordat protocol.
#[derive(Debug, thiserror::Error)]
pub enum ConcordatError {
    #[error("Content hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },

    #[error("Signature verification failed for signer {signer}")]
    SignatureInvalid { signer: String },

    #[error("Agreement content no longer matches its frozen hash")]
    AgreementTampered,

    #[error("Unknown signing algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Algorithm {algorithm} is not permitted: {reason}")]
    AlgorithmNotPermitted { algorithm: String, reason: String },

    #[error("Signature made at {signed_at} exceeds the maximum allowed age")]
    SignatureExpired { signed_at: String },

    #[error("No key source could resolve agent {0}")]
    Unresolved(String),

    #[error("No trust-anchor record found at {0}")]
    RecordMissing(String),

    #[error("DNS answer for {0} was not authenticated")]
    NotAuthenticated(String),

    #[error("Lookup against {0} timed out")]
    LookupTimeout(String),

    #[error("Conflicting identity evidence for agent {agent_id}: {detail}")]
    IdentityConflict { agent_id: String, detail: String },

    #[error("Version conflict on {id}: expected head {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Agent document {0} failed its self-signature check")]
    UntrustedSelfSignature(String),

    #[error("Broken version chain for {id}: {detail}")]
    BrokenChain { id: String, detail: String },

    #[error("Agent {0} is not a required signer of this agreement")]
    NotARequiredSigner(String),

    #[error("Agreement deadline {0} has passed")]
    AgreementExpired(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Directory error: {0}")]
    DirectoryError(String),
}

impl ConcordatError {
    /// The broad category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        use ConcordatError::*;
        match self {
            HashMismatch { .. } | SignatureInvalid { .. } | AgreementTampered => {
                ErrorCategory::Integrity
            }
            UnknownAlgorithm(_) | AlgorithmNotPermitted { .. } | SignatureExpired { .. } => {
                ErrorCategory::Policy
            }
            Unresolved(_) | RecordMissing(_) | NotAuthenticated(_) | LookupTimeout(_) => {
                ErrorCategory::Resolution
            }
            IdentityConflict { .. }
            | VersionConflict { .. }
            | UntrustedSelfSignature(_)
            | BrokenChain { .. } => ErrorCategory::Consistency,
            NotARequiredSigner(_) | AgreementExpired(_) | InvalidInput(_) => {
                ErrorCategory::Validation
            }
            CryptoError(_) | SerializationError(_) | StorageError(_) | DirectoryError(_) => {
                ErrorCategory::Collaborator
            }
        }
    }

    /// Whether a caller may reasonably retry the failed operation, possibly
    /// in relaxed mode or against another source. Only resolution failures
    /// qualify; `Unresolved` means every stage has already been exhausted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConcordatError::RecordMissing(_)
                | ConcordatError::NotAuthenticated(_)
                | ConcordatError::LookupTimeout(_)
        )
    }
}
