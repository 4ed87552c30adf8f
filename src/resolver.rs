//! Ordered key-resolution pipeline.
//!
//! Verification needs a signer's public key. The resolver runs an ordered
//! list of sources -- the local trust store, the DNS trust anchor, and a
//! remote directory -- and returns the first definitive key, tagged with
//! the source that produced it.
//!
//! The DNS stage is corroboration, not a key source: it yields a published
//! fingerprint which must match the fingerprint of whatever key another
//! stage produced. A mismatch is a hard [`ConcordatError::IdentityConflict`]
//! -- silent fallthrough on conflicting identity evidence would be a
//! masquerade vector. Recoverable lookup failures (missing record, timeout)
//! make a stage decline and the pipeline move on; only after every stage
//! has declined does resolution fail with `Unresolved`.

use crate::agent;
use crate::crypto::{self, PublicKey};
use crate::directory::Directory;
use crate::dns::DnsAnchor;
use crate::truststore::TrustStore;
use crate::ConcordatError;
use std::sync::Arc;

/// Environment variable controlling the stage order, e.g.
/// `local,dns,directory`.
pub const SOURCE_ORDER_ENV: &str = "CONCORDAT_KEY_SOURCES";

/// Stage order used when none is configured.
pub const DEFAULT_ORDER: [KeySource; 3] = [KeySource::Local, KeySource::Dns, KeySource::Directory];

/// A key-resolution stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// The local trust store.
    Local,
    /// The DNS trust anchor (corroboration only).
    Dns,
    /// The remote key directory.
    Directory,
}

impl KeySource {
    /// Configuration name of the stage.
    pub fn name(&self) -> &'static str {
        match self {
            KeySource::Local => "local",
            KeySource::Dns => "dns",
            KeySource::Directory => "directory",
        }
    }
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for KeySource {
    type Err = ConcordatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(KeySource::Local),
            "dns" => Ok(KeySource::Dns),
            "directory" => Ok(KeySource::Directory),
            other => Err(ConcordatError::InvalidInput(format!(
                "unknown key source: {}",
                other
            ))),
        }
    }
}

/// Parse a comma-separated source list such as `local,dns,directory`.
pub fn parse_source_order(s: &str) -> Result<Vec<KeySource>, ConcordatError> {
    let mut order = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        order.push(part.parse()?);
    }
    if order.is_empty() {
        return Err(ConcordatError::InvalidInput(
            "key source order must name at least one source".to_string(),
        ));
    }
    Ok(order)
}

/// Read the stage order from [`SOURCE_ORDER_ENV`], falling back to
/// [`DEFAULT_ORDER`] when the variable is unset.
pub fn source_order_from_env() -> Result<Vec<KeySource>, ConcordatError> {
    match std::env::var(SOURCE_ORDER_ENV) {
        Ok(value) => parse_source_order(&value),
        Err(_) => Ok(DEFAULT_ORDER.to_vec()),
    }
}

/// A successfully resolved key, tagged with its producing source.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub agent_id: String,
    pub key: PublicKey,
    pub source: KeySource,
    /// Whether a DNS anchor fingerprint was found and matched the key.
    pub corroborated: bool,
}

/// The resolution pipeline.
pub struct KeyResolver {
    trust_store: Arc<TrustStore>,
    anchor: Option<DnsAnchor>,
    directory: Option<Arc<dyn Directory>>,
    order: Vec<KeySource>,
    strict_dns: bool,
}

impl KeyResolver {
    /// Create a resolver over a trust store with the default stage order.
    pub fn new(trust_store: Arc<TrustStore>) -> Self {
        KeyResolver {
            trust_store,
            anchor: None,
            directory: None,
            order: DEFAULT_ORDER.to_vec(),
            strict_dns: false,
        }
    }

    /// Set the stage order (see [`parse_source_order`]).
    pub fn with_order(mut self, order: Vec<KeySource>) -> Self {
        self.order = order;
        self
    }

    /// Attach a DNS trust anchor; `strict` requires authenticated answers.
    pub fn with_anchor(mut self, anchor: DnsAnchor, strict: bool) -> Self {
        self.anchor = Some(anchor);
        self.strict_dns = strict;
        self
    }

    /// Attach a remote key directory.
    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Resolve an agent's public key.
    ///
    /// `domain` is the agent's claimed DNS-anchor domain; when `None`, the
    /// domain recorded in the trusted agent document (if any) is used, and
    /// without either the DNS stage declines.
    ///
    /// # Errors
    /// - `ConcordatError::IdentityConflict` when the anchor fingerprint
    ///   contradicts a resolved key
    /// - `ConcordatError::NotAuthenticated` in strict mode without DNSSEC
    /// - `ConcordatError::Unresolved` when every stage declines
    pub async fn resolve(
        &self,
        agent_id: &str,
        domain: Option<&str>,
    ) -> Result<ResolvedKey, ConcordatError> {
        let mut candidate: Option<(PublicKey, KeySource)> = None;
        let mut anchor_fingerprint: Option<String> = None;
        let mut anchor_attempted = false;

        for stage in &self.order {
            match stage {
                KeySource::Local => {
                    if candidate.is_none() {
                        if let Some(key) = self.trust_store.key(agent_id) {
                            tracing::debug!(agent_id, "key found in trust store");
                            candidate = Some((key, KeySource::Local));
                        }
                    }
                }
                KeySource::Directory => {
                    if candidate.is_none() {
                        if let Some(directory) = &self.directory {
                            match directory.fetch_key(agent_id).await {
                                Ok(Some(entry)) => {
                                    let key = PublicKey::from_hex(
                                        entry.algorithm,
                                        &entry.public_key,
                                    )?;
                                    tracing::debug!(agent_id, "key found in directory");
                                    candidate = Some((key, KeySource::Directory));
                                }
                                Ok(None) => {
                                    tracing::debug!(agent_id, "directory has no entry");
                                }
                                Err(e) if e.is_retryable() => {
                                    tracing::warn!(agent_id, error = %e, "directory stage declined");
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
                KeySource::Dns => {
                    if !anchor_attempted {
                        anchor_attempted = true;
                        anchor_fingerprint = self.anchor_lookup(agent_id, domain).await?;
                    }
                }
            }

            // Cross-check after every stage so a contradiction surfaces no
            // matter which order the evidence arrived in.
            if let (Some((key, _)), Some(fingerprint)) = (&candidate, &anchor_fingerprint) {
                let key_fingerprint = key.fingerprint()?;
                if !crypto::constant_time_equal(
                    key_fingerprint.as_bytes(),
                    fingerprint.as_bytes(),
                ) {
                    return Err(ConcordatError::IdentityConflict {
                        agent_id: agent_id.to_string(),
                        detail: format!(
                            "DNS anchor fingerprint {} contradicts resolved key fingerprint {}",
                            fingerprint, key_fingerprint
                        ),
                    });
                }
            }
        }

        match candidate {
            Some((key, source)) => Ok(ResolvedKey {
                agent_id: agent_id.to_string(),
                key,
                source,
                corroborated: anchor_fingerprint.is_some(),
            }),
            None => Err(ConcordatError::Unresolved(agent_id.to_string())),
        }
    }

    /// Run the anchor lookup for the DNS stage. Returns `Ok(None)` when the
    /// stage declines (no anchor configured, no domain known, or a
    /// recoverable lookup failure in relaxed mode).
    async fn anchor_lookup(
        &self,
        agent_id: &str,
        domain: Option<&str>,
    ) -> Result<Option<String>, ConcordatError> {
        let Some(anchor) = &self.anchor else {
            return Ok(None);
        };
        let domain = match domain.map(str::to_string).or_else(|| {
            self.trust_store
                .get(agent_id)
                .and_then(|doc| agent::claimed_domain(&doc).map(str::to_string))
        }) {
            Some(domain) => domain,
            None => {
                tracing::debug!(agent_id, "no claimed domain; anchor stage declined");
                return Ok(None);
            }
        };

        match anchor.lookup(&domain, agent_id, self.strict_dns).await {
            Ok(fingerprint) => Ok(Some(fingerprint)),
            Err(e @ ConcordatError::NotAuthenticated(_)) => Err(e),
            Err(e) if e.is_retryable() => {
                tracing::warn!(agent_id, %domain, error = %e, "anchor stage declined");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{create_agent, AgentProfile};
    use crate::crypto::{Algorithm, KeyPair};
    use crate::directory::{DirectoryKey, MemoryDirectory};
    use crate::dns::{AnchorRecord, StaticTxtLookup, TxtLookup};

    const DOMAIN: &str = "agents.example.com";

    fn trusted_agent(store: &TrustStore) -> (String, String) {
        let keys = KeyPair::generate(Algorithm::Ed25519).unwrap();
        let (doc, _) = create_agent(
            keys,
            AgentProfile {
                domain: Some(DOMAIN.to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        let fingerprint = agent::embedded_key(&doc).unwrap().fingerprint().unwrap();
        let id = store.trust(&doc).unwrap();
        (id, fingerprint)
    }

    fn anchor_for(records: Vec<String>, authenticated: bool) -> DnsAnchor {
        let lookup = Arc::new(StaticTxtLookup::new());
        lookup.publish(
            &AnchorRecord::owner_name("prod", DOMAIN),
            records,
            authenticated,
        );
        DnsAnchor::new(lookup as Arc<dyn TxtLookup>, "prod")
    }

    #[test]
    fn test_parse_source_order() {
        assert_eq!(
            parse_source_order("local, dns ,directory").unwrap(),
            vec![KeySource::Local, KeySource::Dns, KeySource::Directory]
        );
        assert!(parse_source_order("local,carrier-pigeon").is_err());
        assert!(parse_source_order("").is_err());
    }

    #[tokio::test]
    async fn test_resolve_from_trust_store() {
        let store = Arc::new(TrustStore::new());
        let (id, fingerprint) = trusted_agent(&store);

        let resolver = KeyResolver::new(store);
        let resolved = resolver.resolve(&id, None).await.unwrap();
        assert_eq!(resolved.source, KeySource::Local);
        assert_eq!(resolved.key.fingerprint().unwrap(), fingerprint);
        assert!(!resolved.corroborated);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_directory() {
        let store = Arc::new(TrustStore::new());
        let keys = KeyPair::generate(Algorithm::Ed25519).unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        directory.publish(DirectoryKey {
            agent_id: "agent-x".to_string(),
            algorithm: Algorithm::Ed25519,
            public_key: keys.public_key_hex().unwrap(),
        });

        let resolver = KeyResolver::new(store).with_directory(directory);
        let resolved = resolver.resolve("agent-x", None).await.unwrap();
        assert_eq!(resolved.source, KeySource::Directory);
    }

    #[tokio::test]
    async fn test_resolve_unresolved_after_all_stages() {
        let store = Arc::new(TrustStore::new());
        let resolver =
            KeyResolver::new(store).with_directory(Arc::new(MemoryDirectory::new()));
        let err = resolver.resolve("nobody", None).await.unwrap_err();
        assert!(matches!(err, ConcordatError::Unresolved(_)));
    }

    #[tokio::test]
    async fn test_anchor_corroborates_trusted_key() {
        let store = Arc::new(TrustStore::new());
        let (id, fingerprint) = trusted_agent(&store);
        let anchor = anchor_for(vec![AnchorRecord::new(&id, &fingerprint).to_txt()], true);

        let resolver = KeyResolver::new(store).with_anchor(anchor, true);
        let resolved = resolver.resolve(&id, None).await.unwrap();
        assert_eq!(resolved.source, KeySource::Local);
        assert!(resolved.corroborated);
    }

    #[tokio::test]
    async fn test_anchor_mismatch_is_hard_conflict() {
        let store = Arc::new(TrustStore::new());
        let (id, _) = trusted_agent(&store);

        // Publish a fingerprint for a different key, authenticated.
        let other = KeyPair::generate(Algorithm::Ed25519).unwrap();
        let anchor = anchor_for(
            vec![AnchorRecord::new(&id, &other.fingerprint().unwrap()).to_txt()],
            true,
        );

        let resolver = KeyResolver::new(store).with_anchor(anchor, true);
        let err = resolver.resolve(&id, None).await.unwrap_err();
        assert!(matches!(err, ConcordatError::IdentityConflict { .. }));
    }

    #[tokio::test]
    async fn test_strict_anchor_requires_authentication() {
        let store = Arc::new(TrustStore::new());
        let (id, fingerprint) = trusted_agent(&store);
        let anchor = anchor_for(vec![AnchorRecord::new(&id, &fingerprint).to_txt()], false);

        let resolver = KeyResolver::new(store).with_anchor(anchor, true);
        let err = resolver.resolve(&id, None).await.unwrap_err();
        assert!(matches!(err, ConcordatError::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn test_relaxed_anchor_missing_record_declines() {
        let store = Arc::new(TrustStore::new());
        let (id, _) = trusted_agent(&store);
        // Anchor configured but nothing published for this domain.
        let anchor = DnsAnchor::new(Arc::new(StaticTxtLookup::new()), "prod");

        let resolver = KeyResolver::new(store).with_anchor(anchor, false);
        let resolved = resolver.resolve(&id, None).await.unwrap();
        assert_eq!(resolved.source, KeySource::Local);
        assert!(!resolved.corroborated);
    }

    #[tokio::test]
    async fn test_order_prefers_directory_when_listed_first() {
        let store = Arc::new(TrustStore::new());
        let (id, _) = trusted_agent(&store);

        // Publish a *different* key in the directory under the same id.
        let other = KeyPair::generate(Algorithm::Ed25519).unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        directory.publish(DirectoryKey {
            agent_id: id.clone(),
            algorithm: Algorithm::Ed25519,
            public_key: other.public_key_hex().unwrap(),
        });

        let resolver = KeyResolver::new(store)
            .with_directory(directory)
            .with_order(vec![KeySource::Directory, KeySource::Local]);
        let resolved = resolver.resolve(&id, None).await.unwrap();
        assert_eq!(resolved.source, KeySource::Directory);
        assert_eq!(
            resolved.key.fingerprint().unwrap(),
            other.fingerprint().unwrap()
        );
    }
}
