//! # Object Store Boundary
//!
//! The partitioning pipeline coordinates exclusively through a flat
//! key/value blob namespace: ingestion chunks, interim scatter objects, and
//! final segments are all store objects. This module provides the
//! [`ObjectStore`] trait, the key-naming conventions every writer must
//! agree on, a consolidated retrying read, and two implementations:
//!
//! - [`InMemoryStore`]: thread-safe map, used by tests and local runs.
//! - [`LocalDirStore`]: one file per object under a root directory.
//!
//! ## Key conventions
//!
//! Correctness of the scatter/merge engine depends on every task computing
//! identical keys from the shared boundary list:
//!
//! ```text
//! {prefix}/{chunk_id}                      ingestion chunks / final segments
//! {prefix}/chunk/{group_id}/{chunk_id}     interim scatter objects
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::{decode_records, encode_records};

/// Errors raised at the object-store boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No object exists under the requested key.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Backend-specific failure (network, quota, corrupt listing, ...).
    #[error("store backend error: {0}")]
    Backend(String),

    /// I/O error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Blob did not decode as the expected record type.
    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A retried read ran out of attempts.
    #[error("read of {key} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Key that could not be read.
        key: String,
        /// Number of attempts made.
        attempts: u32,
        /// Message of the final failure.
        last_error: String,
    },
}

/// Flat key/value blob namespace shared by all pipeline tasks.
///
/// Implementations must be safe for concurrent use: scatter tasks write
/// interim objects from many threads at once. Writers never collide because
/// every key is namespaced by (group, chunk) or (stage, segment).
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any existing object.
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Fetch the object stored under `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// List all keys starting with `prefix`, in lexicographic order.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Delete every object whose key starts with `prefix`; returns the
    /// number of objects removed. Deleting a non-existent prefix is a no-op.
    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;
}

/// Key of an ingestion chunk or a final segment: `{prefix}/{id}`.
pub fn object_key(prefix: &str, id: usize) -> String {
    format!("{prefix}/{id}")
}

/// Key of an interim scatter object: `{prefix}/chunk/{group_id}/{chunk_id}`.
pub fn interim_key(prefix: &str, group_id: usize, chunk_id: usize) -> String {
    format!("{prefix}/chunk/{group_id}/{chunk_id}")
}

/// Listing/cleanup prefix for one coarse group's interim objects.
pub fn interim_prefix(prefix: &str, group_id: usize) -> String {
    format!("{prefix}/chunk/{group_id}/")
}

/// Bounded retry policy for store reads.
///
/// Reads are the only retried operation: merge fan-in races object
/// propagation in eventually-visible backends, while writes either succeed
/// or fail the stage. Backoff grows multiplicatively between attempts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Sleep before the second attempt.
    pub initial_backoff: Duration,
    /// Backoff multiplier applied after each failed attempt.
    pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries, for tests and strongly consistent stores.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            backoff_multiplier: 1,
        }
    }
}

/// Read `key`, retrying transient failures per `policy`.
///
/// This is the single retrying-read entry point used at every merge fan-in
/// call site. Exhausted retries surface as
/// [`StoreError::RetriesExhausted`], which fails the whole stage.
pub fn get_with_retry(
    store: &dyn ObjectStore,
    policy: &RetryPolicy,
    key: &str,
) -> Result<Vec<u8>, StoreError> {
    let mut backoff = policy.initial_backoff;
    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts.max(1) {
        match store.get(key) {
            Ok(bytes) => return Ok(bytes),
            Err(err) => {
                log::warn!(
                    "read of {key} failed (attempt {attempt}/{}): {err}",
                    policy.max_attempts
                );
                last_error = err.to_string();
            }
        }
        if attempt < policy.max_attempts {
            std::thread::sleep(backoff);
            backoff *= policy.backoff_multiplier;
        }
    }
    Err(StoreError::RetriesExhausted {
        key: key.to_string(),
        attempts: policy.max_attempts.max(1),
        last_error,
    })
}

/// Encode `records` and store them under `key`.
pub fn put_records<R: Serialize>(
    store: &dyn ObjectStore,
    key: &str,
    records: &[R],
) -> Result<(), StoreError> {
    store.put(key, encode_records(records)?)
}

/// Fetch and decode the records stored under `key`, with retries.
pub fn get_records<R: DeserializeOwned>(
    store: &dyn ObjectStore,
    policy: &RetryPolicy,
    key: &str,
) -> Result<Vec<R>, StoreError> {
    let bytes = get_with_retry(store, policy, key)?;
    Ok(decode_records(&bytes)?)
}

/// Thread-safe in-memory store.
///
/// Keys are held in a `BTreeMap`, so listings are deterministic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for InMemoryStore {
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(key.to_string(), bytes);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let doomed: Vec<String> = objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            objects.remove(key);
        }
        Ok(doomed.len())
    }
}

/// Store backed by a local directory, one file per object.
///
/// Key separators map to subdirectories, so the on-disk layout mirrors the
/// key conventions and is inspectable with ordinary file tools.
#[derive(Debug)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.split('/') {
            path.push(part);
        }
        path
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), StoreError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalDirStore {
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(fs::read(path)?)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        if self.root.is_dir() {
            self.collect_keys(&self.root.clone(), &mut keys)?;
        }
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let keys = self.list(prefix)?;
        for key in &keys {
            fs::remove_file(self.path_for(key))?;
        }
        Ok(keys.len())
    }
}
