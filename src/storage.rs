//! Versioned document storage.
//!
//! The core is storage-agnostic: it calls only the narrow [`Storage`]
//! contract of put/get/list-versions over opaque bytes. [`MemoryStorage`]
//! is a thread-safe in-memory implementation suitable for testing and
//! single-process use; filesystem or object-store adapters live outside
//! this crate.
//!
//! Every identifier used to build a storage location must be a safe
//! relative path segment, so adapters that map keys onto directories
//! cannot be escaped via crafted ids.

use crate::ConcordatError;
use std::collections::HashMap;
use std::sync::Mutex;

/// The kinds of records the core persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Self-signed agent documents.
    Agent,
    /// Application documents.
    Document,
}

impl Kind {
    /// Stable name used in storage locations.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Agent => "agent",
            Kind::Document => "document",
        }
    }
}

/// Validate an identifier for use as a relative path segment.
///
/// Rejects empty strings, `.`, `..`, and anything containing a path
/// separator or NUL byte.
pub fn validate_segment(id: &str) -> Result<(), ConcordatError> {
    if id.is_empty() {
        return Err(ConcordatError::InvalidInput(
            "identifier must not be empty".to_string(),
        ));
    }
    if id == "." || id == ".." {
        return Err(ConcordatError::InvalidInput(format!(
            "identifier must not be a relative path component: {:?}",
            id
        )));
    }
    if id.contains('/') || id.contains('\\') || id.contains('\0') {
        return Err(ConcordatError::InvalidInput(format!(
            "identifier contains forbidden characters: {:?}",
            id
        )));
    }
    Ok(())
}

/// Narrow contract for versioned record storage.
///
/// Implementations must keep `list_versions` in insertion order, which the
/// version chain manager relies on for head lookup.
pub trait Storage: Send + Sync {
    /// Store the bytes for one version of a record. Re-putting an existing
    /// `(kind, id, version)` overwrites it.
    fn put(&self, kind: Kind, id: &str, version: &str, bytes: &[u8])
        -> Result<(), ConcordatError>;

    /// Retrieve the bytes for one version of a record.
    fn get(&self, kind: Kind, id: &str, version: &str)
        -> Result<Option<Vec<u8>>, ConcordatError>;

    /// List all stored versions of a record, oldest first.
    fn list_versions(&self, kind: Kind, id: &str) -> Result<Vec<String>, ConcordatError>;
}

/// In-memory storage backed by a `HashMap` behind a `Mutex`.
#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<(Kind, String), Vec<(String, Vec<u8>)>>>,
}

impl MemoryStorage {
    /// Create a new, empty `MemoryStorage`.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn put(
        &self,
        kind: Kind,
        id: &str,
        version: &str,
        bytes: &[u8],
    ) -> Result<(), ConcordatError> {
        validate_segment(id)?;
        validate_segment(version)?;
        let mut records = self
            .records
            .lock()
            .map_err(|_| ConcordatError::StorageError("storage lock poisoned".to_string()))?;
        let versions = records.entry((kind, id.to_string())).or_default();
        if let Some(slot) = versions.iter_mut().find(|(v, _)| v == version) {
            slot.1 = bytes.to_vec();
        } else {
            versions.push((version.to_string(), bytes.to_vec()));
        }
        Ok(())
    }

    fn get(
        &self,
        kind: Kind,
        id: &str,
        version: &str,
    ) -> Result<Option<Vec<u8>>, ConcordatError> {
        validate_segment(id)?;
        validate_segment(version)?;
        let records = self
            .records
            .lock()
            .map_err(|_| ConcordatError::StorageError("storage lock poisoned".to_string()))?;
        Ok(records.get(&(kind, id.to_string())).and_then(|versions| {
            versions
                .iter()
                .find(|(v, _)| v == version)
                .map(|(_, bytes)| bytes.clone())
        }))
    }

    fn list_versions(&self, kind: Kind, id: &str) -> Result<Vec<String>, ConcordatError> {
        validate_segment(id)?;
        let records = self
            .records
            .lock()
            .map_err(|_| ConcordatError::StorageError("storage lock poisoned".to_string()))?;
        Ok(records
            .get(&(kind, id.to_string()))
            .map(|versions| versions.iter().map(|(v, _)| v.clone()).collect())
            .unwrap_or_default())
    }
}
