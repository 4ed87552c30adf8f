//! DNS trust-anchor records.
//!
//! An agent that claims a domain publishes a TXT record at
//! `_v1.agent.<namespace>.<domain>` binding its id to the SHA-256
//! fingerprint of its public key. The record value is a semicolon-delimited
//! `key=value` string carrying a protocol version tag, the agent id, the
//! digest algorithm, the fingerprint encoding, and the fingerprint itself.
//!
//! DNS anchoring is a corroboration layer: the fingerprint it yields is
//! compared against the hash of a key obtained from the trust store or the
//! remote directory. It is never itself a key source.
//!
//! The actual DNS transport is pluggable through [`TxtLookup`]; the crate
//! ships [`StaticTxtLookup`], an in-memory implementation for tests and
//! local pinning. Strict mode requires the transport to report an
//! authenticated (DNSSEC-validated) answer.

use crate::{BoxFut, ConcordatError};
use base64::Engine as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Protocol version carried in anchor records.
pub const RECORD_VERSION: &str = "1";

/// Label prefix under which anchor records are published.
pub const LABEL_PREFIX: &str = "_v1.agent";

/// Default bound on a single TXT lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The TXT records returned for one owner name, plus whether the answer
/// was cryptographically authenticated (DNSSEC AD or equivalent).
#[derive(Debug, Clone)]
pub struct TxtAnswer {
    pub records: Vec<String>,
    pub authenticated: bool,
}

/// Pluggable TXT-record transport.
pub trait TxtLookup: Send + Sync {
    /// Look up all TXT records at `name`.
    ///
    /// Implementations return `ConcordatError::RecordMissing` when the name
    /// does not resolve at all.
    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFut<'a, Result<TxtAnswer, ConcordatError>>;
}

/// In-memory TXT zone for tests and local fingerprint pinning.
#[derive(Default)]
pub struct StaticTxtLookup {
    zones: Mutex<HashMap<String, TxtAnswer>>,
}

impl StaticTxtLookup {
    /// Create an empty zone set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish TXT records under `name`.
    pub fn publish(&self, name: &str, records: Vec<String>, authenticated: bool) {
        self.zones.lock().expect("zone lock").insert(
            name.to_string(),
            TxtAnswer {
                records,
                authenticated,
            },
        );
    }

    /// Remove all records under `name`.
    pub fn remove(&self, name: &str) {
        self.zones.lock().expect("zone lock").remove(name);
    }
}

impl TxtLookup for StaticTxtLookup {
    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFut<'a, Result<TxtAnswer, ConcordatError>> {
        Box::pin(async move {
            self.zones
                .lock()
                .expect("zone lock")
                .get(name)
                .cloned()
                .ok_or_else(|| ConcordatError::RecordMissing(name.to_string()))
        })
    }
}

// ---------------------------------------------------------------------------
// Record format
// ---------------------------------------------------------------------------

/// Encoding of the fingerprint value inside an anchor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintEncoding {
    Hex,
    Base64,
}

impl FingerprintEncoding {
    fn as_str(&self) -> &'static str {
        match self {
            FingerprintEncoding::Hex => "hex",
            FingerprintEncoding::Base64 => "base64",
        }
    }
}

/// A parsed trust-anchor TXT record.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorRecord {
    pub version: String,
    pub agent_id: String,
    pub digest: String,
    pub encoding: FingerprintEncoding,
    pub fingerprint: String,
}

impl AnchorRecord {
    /// Build a record for an agent's key fingerprint (lowercase hex input).
    pub fn new(agent_id: &str, fingerprint_hex: &str) -> Self {
        AnchorRecord {
            version: RECORD_VERSION.to_string(),
            agent_id: agent_id.to_string(),
            digest: "sha-256".to_string(),
            encoding: FingerprintEncoding::Hex,
            fingerprint: fingerprint_hex.to_lowercase(),
        }
    }

    /// The owner name at which records for `domain` are published.
    pub fn owner_name(namespace: &str, domain: &str) -> String {
        format!("{}.{}.{}", LABEL_PREFIX, namespace, domain)
    }

    /// Render the record as a TXT value.
    pub fn to_txt(&self) -> String {
        format!(
            "v={};agent={};hash={};enc={};fp={}",
            self.version,
            self.agent_id,
            self.digest,
            self.encoding.as_str(),
            self.fingerprint
        )
    }

    /// Parse a TXT value into a record.
    ///
    /// # Errors
    /// Returns `ConcordatError::InvalidInput` for malformed values, unknown
    /// encodings, or missing keys.
    pub fn parse(txt: &str) -> Result<Self, ConcordatError> {
        let mut pairs: HashMap<&str, &str> = HashMap::new();
        for part in txt.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ConcordatError::InvalidInput(format!("malformed anchor record segment: {}", part))
            })?;
            pairs.insert(key, value);
        }

        let field = |key: &str| {
            pairs.get(key).map(|v| v.to_string()).ok_or_else(|| {
                ConcordatError::InvalidInput(format!("anchor record missing key: {}", key))
            })
        };

        let encoding = match field("enc")?.as_str() {
            "hex" => FingerprintEncoding::Hex,
            "base64" => FingerprintEncoding::Base64,
            other => {
                return Err(ConcordatError::InvalidInput(format!(
                    "unknown fingerprint encoding: {}",
                    other
                )))
            }
        };

        Ok(AnchorRecord {
            version: field("v")?,
            agent_id: field("agent")?,
            digest: field("hash")?,
            encoding,
            fingerprint: field("fp")?,
        })
    }

    /// The fingerprint normalized to lowercase hex regardless of encoding.
    pub fn fingerprint_hex(&self) -> Result<String, ConcordatError> {
        match self.encoding {
            FingerprintEncoding::Hex => {
                let fp = self.fingerprint.to_lowercase();
                if fp.is_empty() || !fp.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(ConcordatError::InvalidInput(
                        "anchor fingerprint is not valid hex".to_string(),
                    ));
                }
                Ok(fp)
            }
            FingerprintEncoding::Base64 => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&self.fingerprint)
                    .map_err(|e| {
                        ConcordatError::InvalidInput(format!(
                            "anchor fingerprint is not valid base64: {}",
                            e
                        ))
                    })?;
                Ok(hex::encode(bytes))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Anchor lookup
// ---------------------------------------------------------------------------

/// Resolves trust-anchor fingerprints for agents that claim a domain.
pub struct DnsAnchor {
    lookup: Arc<dyn TxtLookup>,
    namespace: String,
    timeout: Duration,
}

impl DnsAnchor {
    /// Create an anchor over a TXT transport for a deployment namespace.
    pub fn new(lookup: Arc<dyn TxtLookup>, namespace: &str) -> Self {
        DnsAnchor {
            lookup,
            namespace: namespace.to_string(),
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    /// Override the per-lookup timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Look up the published fingerprint for `agent_id` at `domain`.
    ///
    /// In strict mode the answer must be authenticated; relaxed mode
    /// accepts any resolvable TXT value (useful during propagation
    /// windows). Returns the fingerprint as lowercase hex.
    ///
    /// # Errors
    /// - `ConcordatError::LookupTimeout` when the bounded lookup expires
    /// - `ConcordatError::NotAuthenticated` in strict mode without DNSSEC
    /// - `ConcordatError::RecordMissing` when no record for the agent
    ///   parses at the owner name
    pub async fn lookup(
        &self,
        domain: &str,
        agent_id: &str,
        strict: bool,
    ) -> Result<String, ConcordatError> {
        let name = AnchorRecord::owner_name(&self.namespace, domain);
        let answer = tokio::time::timeout(self.timeout, self.lookup.lookup_txt(&name))
            .await
            .map_err(|_| ConcordatError::LookupTimeout(name.clone()))??;

        if strict && !answer.authenticated {
            return Err(ConcordatError::NotAuthenticated(name));
        }

        for txt in &answer.records {
            match AnchorRecord::parse(txt) {
                Ok(record) if record.version == RECORD_VERSION && record.agent_id == agent_id => {
                    tracing::debug!(%name, agent_id, "trust anchor record found");
                    return record.fingerprint_hex();
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(%name, error = %e, "skipping unparseable TXT record");
                }
            }
        }
        Err(ConcordatError::RecordMissing(name))
    }
}
