//! Remote key-directory collaborator.
//!
//! A directory service maps agent ids to published public keys. The core
//! consumes it through the narrow [`Directory`] trait; the crate ships an
//! HTTP implementation with a bounded request timeout and an in-memory
//! implementation for tests. Directory lookups are one of the two network
//! suspension points in the resolution pipeline.

use crate::crypto::Algorithm;
use crate::storage::validate_segment;
use crate::{BoxFut, ConcordatError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Default bound on a single directory fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// A published key entry as served by a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryKey {
    pub agent_id: String,
    pub algorithm: Algorithm,
    /// Hex-encoded canonical public key bytes.
    pub public_key: String,
}

/// Pluggable key-directory lookup.
pub trait Directory: Send + Sync {
    /// Fetch the published key for an agent. `Ok(None)` means the directory
    /// answered but has no entry -- a "no key here" outcome, not an error.
    fn fetch_key<'a>(
        &'a self,
        agent_id: &'a str,
    ) -> BoxFut<'a, Result<Option<DirectoryKey>, ConcordatError>>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Directory client over HTTP.
///
/// Expects `GET {base_url}/agents/{agent_id}/key` to return a
/// [`DirectoryKey`] JSON body, or 404 when the agent is unknown.
pub struct HttpDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDirectory {
    /// Create a client with the default fetch timeout.
    pub fn new(base_url: &str) -> Result<Self, ConcordatError> {
        Self::with_timeout(base_url, DEFAULT_FETCH_TIMEOUT)
    }

    /// Create a client with an explicit per-request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ConcordatError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConcordatError::DirectoryError(format!("build HTTP client: {}", e)))?;
        Ok(HttpDirectory {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl Directory for HttpDirectory {
    fn fetch_key<'a>(
        &'a self,
        agent_id: &'a str,
    ) -> BoxFut<'a, Result<Option<DirectoryKey>, ConcordatError>> {
        Box::pin(async move {
            validate_segment(agent_id)?;
            let url = format!("{}/agents/{}/key", self.base_url, agent_id);

            let response = self.client.get(&url).send().await.map_err(|e| {
                if e.is_timeout() {
                    ConcordatError::LookupTimeout(url.clone())
                } else {
                    ConcordatError::DirectoryError(format!("GET {}: {}", url, e))
                }
            })?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(ConcordatError::DirectoryError(format!(
                    "GET {} returned {}",
                    url,
                    response.status()
                )));
            }

            let key: DirectoryKey = response.json().await.map_err(|e| {
                ConcordatError::DirectoryError(format!("decode directory response: {}", e))
            })?;
            Ok(Some(key))
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory directory for tests and single-process setups.
#[derive(Default)]
pub struct MemoryDirectory {
    keys: Mutex<HashMap<String, DirectoryKey>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish or replace an agent's key entry.
    pub fn publish(&self, key: DirectoryKey) {
        self.keys
            .lock()
            .expect("directory lock")
            .insert(key.agent_id.clone(), key);
    }

    /// Remove an agent's key entry.
    pub fn remove(&self, agent_id: &str) {
        self.keys.lock().expect("directory lock").remove(agent_id);
    }
}

impl Directory for MemoryDirectory {
    fn fetch_key<'a>(
        &'a self,
        agent_id: &'a str,
    ) -> BoxFut<'a, Result<Option<DirectoryKey>, ConcordatError>> {
        Box::pin(async move {
            Ok(self
                .keys
                .lock()
                .expect("directory lock")
                .get(agent_id)
                .cloned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[tokio::test]
    async fn test_memory_directory_fetch() {
        let directory = MemoryDirectory::new();
        let keys = KeyPair::generate(Algorithm::Ed25519).unwrap();
        directory.publish(DirectoryKey {
            agent_id: "agent-1".to_string(),
            algorithm: Algorithm::Ed25519,
            public_key: keys.public_key_hex().unwrap(),
        });

        let found = directory.fetch_key("agent-1").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().agent_id, "agent-1");

        assert!(directory.fetch_key("agent-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_directory_remove() {
        let directory = MemoryDirectory::new();
        let keys = KeyPair::generate(Algorithm::Ed25519).unwrap();
        directory.publish(DirectoryKey {
            agent_id: "agent-1".to_string(),
            algorithm: Algorithm::Ed25519,
            public_key: keys.public_key_hex().unwrap(),
        });
        directory.remove("agent-1");
        assert!(directory.fetch_key("agent-1").await.unwrap().is_none());
    }

    #[test]
    fn test_http_directory_rejects_bad_base_url() {
        // Building the client itself succeeds; fetch validates the id.
        let directory = HttpDirectory::new("http://localhost:9").unwrap();
        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(directory.fetch_key("../escape"))
            .unwrap_err();
        assert!(matches!(err, ConcordatError::InvalidInput(_)));
    }

    #[test]
    fn test_directory_key_wire_format() {
        let key = DirectoryKey {
            agent_id: "agent-1".to_string(),
            algorithm: Algorithm::MlDsa44,
            public_key: "00ff".to_string(),
        };
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("agentId"));
        assert!(json.contains("ml-dsa-44"));
        assert!(json.contains("publicKey"));
    }
}
