//! Polymorphic storage backends for published artifact blobs.
//!
//! [`StorageBackend`] is the contract every variant implements: an
//! in-memory backend for development, a filesystem/PVC backend, and an
//! object-store-over-HTTP backend speaking an S3-compatible subset.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Errors a [`StorageBackend`] can surface. Transport errors from the
/// underlying medium pass through as [`StorageError::Unavailable`]
/// unchanged, per the component contract.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The key failed validation (contains `..`, a leading `/`, or is empty).
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The requested key does not exist.
    #[error("key not found: {key:?}")]
    NotFound {
        /// The missing key.
        key: String,
    },
    /// The backend's underlying medium is unreachable or returned an
    /// unexpected response.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Validate a storage key per the shared grammar: no `..` segments, no
/// leading `/`, non-empty.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: "empty key".to_string(),
        });
    }
    if key.starts_with('/') {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: "leading slash not allowed".to_string(),
        });
    }
    if key.split('/').any(|segment| segment == "..") {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: "`..` path segments are not allowed".to_string(),
        });
    }
    Ok(())
}

/// Contract every storage backend implements.
///
/// `put` must be safely concurrent and idempotent for identical keys (the
/// revision-addressed key scheme means a re-`put` of the same key always
/// carries the same bytes). `delete` of an absent key succeeds.
pub trait StorageBackend: Send + Sync {
    /// Store bytes at `key`, returning the URL it can be fetched from.
    fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError>;
    /// Read the bytes stored at `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    /// List all keys under `prefix`. Order is unspecified.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    /// Delete `key`. Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// The deterministic URL for `key`, independent of whether it is
    /// currently populated.
    fn url_for(&self, key: &str) -> String;
}

// ---------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------

/// Non-persistent, development-only backend. Warns at construction.
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    url_prefix: String,
}

impl MemoryStorage {
    /// Create a new in-memory backend. `url_prefix` is prepended to keys
    /// when resolving [`StorageBackend::url_for`], e.g. `"memory://"`.
    pub fn new(url_prefix: impl Into<String>) -> Self {
        log::warn!("using in-memory storage backend: artifacts do not survive a restart");
        Self {
            objects: Mutex::new(HashMap::new()),
            url_prefix: url_prefix.into(),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new("memory://")
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        validate_key(key)?;
        self.objects
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(key.to_string(), data.to_vec());
        Ok(self.url_for(key))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        self.objects
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(key);
        Ok(())
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}{key}", self.url_prefix)
    }
}

// ---------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------

/// Filesystem/PVC-rooted storage backend.
pub struct FilesystemStorage {
    base_path: PathBuf,
    url_prefix: String,
}

impl FilesystemStorage {
    /// Root the backend at `base_path`. Keys are joined relative to it;
    /// [`StorageBackend::url_for`] prefixes keys with `url_prefix`, e.g. the
    /// artifact server's own base URL.
    pub fn new(base_path: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            url_prefix: url_prefix.into(),
        }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }
}

impl StorageBackend for FilesystemStorage {
    fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        validate_key(key)?;
        let full_path = self.full_path(key);

        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Unavailable(format!("create dir {parent:?}: {e}")))?;
        }

        // Write to a temp file then rename, so a concurrent reader never
        // observes a partially written blob.
        let tmp_path = full_path.with_extension("tmp");
        std::fs::write(&tmp_path, data)
            .map_err(|e| StorageError::Unavailable(format!("write {tmp_path:?}: {e}")))?;
        std::fs::rename(&tmp_path, &full_path)
            .map_err(|e| StorageError::Unavailable(format!("rename to {full_path:?}: {e}")))?;

        Ok(self.url_for(key))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        let full_path = self.full_path(key);
        std::fs::read(&full_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    key: key.to_string(),
                }
            } else {
                StorageError::Unavailable(format!("read {full_path:?}: {e}"))
            }
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let base = self.full_path(prefix);
        let mut results = Vec::new();
        if !base.exists() {
            return Ok(results);
        }

        fn walk(dir: &Path, root: &Path, results: &mut Vec<String>) -> std::io::Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, root, results)?;
                } else if path.extension().and_then(|e| e.to_str()) != Some("tmp")
                    && let Ok(relative) = path.strip_prefix(root)
                    && let Some(s) = relative.to_str()
                {
                    results.push(s.replace('\\', "/"));
                }
            }
            Ok(())
        }

        walk(&base, &self.base_path, &mut results)
            .map_err(|e| StorageError::Unavailable(format!("list {base:?}: {e}")))?;
        Ok(results)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let full_path = self.full_path(key);
        match std::fs::remove_file(&full_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Unavailable(format!("delete {full_path:?}: {e}"))),
        }
        // Best-effort: clean up a now-empty parent directory.
        if let Some(parent) = full_path.parent() {
            let _ = std::fs::remove_dir(parent);
        }
        Ok(())
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{key}", self.url_prefix.trim_end_matches('/'))
    }
}

// ---------------------------------------------------------------------
// Object-store-over-HTTP backend
// ---------------------------------------------------------------------

/// Object store reachable over HTTP, speaking an S3-compatible subset:
/// `PUT`/`DELETE`/`GET` on `<endpoint>/<bucket>/<key>`, listing via
/// `?list-type=2&prefix=…`.
pub struct ObjectStoreStorage {
    client: reqwest::blocking::Client,
    endpoint: String,
    bucket: String,
    /// Placeholder credential header. A real S3 deployment needs SigV4
    /// request signing, not a static header; see DESIGN.md for the
    /// resolved open question on this.
    credential: Option<String>,
}

impl ObjectStoreStorage {
    /// Build a client against `endpoint`/`bucket`, optionally sending
    /// `credential` as an `Authorization` header on every request.
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        credential: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Unavailable(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            credential,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{key}",
            self.endpoint.trim_end_matches('/'),
            self.bucket.trim_matches('/')
        )
    }

    fn with_credential(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.credential {
            Some(cred) => builder.header(reqwest::header::AUTHORIZATION, cred),
            None => builder,
        }
    }
}

impl StorageBackend for ObjectStoreStorage {
    fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        validate_key(key)?;
        let request = self
            .with_credential(self.client.put(self.object_url(key)))
            .body(data.to_vec());
        let response = request
            .send()
            .map_err(|e| StorageError::Unavailable(format!("PUT {key}: {e}")))?;
        if !response.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "PUT {key} returned {}",
                response.status()
            )));
        }
        Ok(self.url_for(key))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        let response = self
            .with_credential(self.client.get(self.object_url(key)))
            .send()
            .map_err(|e| StorageError::Unavailable(format!("GET {key}: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "GET {key} returned {}",
                response.status()
            )));
        }
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| StorageError::Unavailable(format!("read body for {key}: {e}")))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let list_url = format!(
            "{}/{}?list-type=2&prefix={prefix}",
            self.endpoint.trim_end_matches('/'),
            self.bucket.trim_matches('/')
        );
        let response = self
            .with_credential(self.client.get(&list_url))
            .send()
            .map_err(|e| StorageError::Unavailable(format!("LIST {prefix}: {e}")))?;
        if !response.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "LIST {prefix} returned {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .map_err(|e| StorageError::Unavailable(format!("read list body: {e}")))?;
        Ok(parse_list_keys(&body))
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let response = self
            .with_credential(self.client.delete(self.object_url(key)))
            .send()
            .map_err(|e| StorageError::Unavailable(format!("DELETE {key}: {e}")))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::Unavailable(format!(
                "DELETE {key} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn url_for(&self, key: &str) -> String {
        self.object_url(key)
    }
}

/// Extract `<Key>…</Key>` entries from a `ListObjectsV2`-shaped XML body.
/// This is a minimal scanner, not a general XML parser: it is sufficient
/// for the well-formed, single-line-per-tag responses S3-compatible
/// object stores emit for this call.
fn parse_list_keys(body: &str) -> Vec<String> {
    const OPEN: &str = "<Key>";
    const CLOSE: &str = "</Key>";
    let mut keys = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(OPEN) {
        rest = &rest[start + OPEN.len()..];
        let Some(end) = rest.find(CLOSE) else {
            break;
        };
        keys.push(rest[..end].to_string());
        rest = &rest[end + CLOSE.len()..];
    }
    keys
}
