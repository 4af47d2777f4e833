//! An in-memory [`Blobstore`] test double, grounded on the `Tickable`
//! fixture in `eden/mononoke/blobstore/test_utils/lib.rs`: a single
//! `Mutex`-guarded map stands in for the backend, with no real I/O or
//! latency. Used across every Kronoa crate's test suite instead of each
//! one growing its own fake store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use kronoa_error::BackendError;
use kronoa_path::BackendKey;

use crate::trait_def::Blobstore;
use crate::types::{ETag, ListEntry, Precondition};

#[derive(Debug, Default)]
struct Entry {
    value: Bytes,
    version: u64,
}

/// An in-memory backend good enough to exercise every layer above
/// [`Blobstore`] in tests: supports `conditional_write` (so the lock
/// driver and counter-fallback logic can be tested without a real
/// networked backend) and linearises `atomic_increment` under its own
/// mutex, which is sound for the single-process test suites that use it.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: directly inspect a key's bytes without going through the
    /// `Blobstore` trait, used to assert on sidecar contents.
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        self.entries.lock().unwrap().get(key).map(|e| e.value.clone())
    }
}

#[async_trait]
impl Blobstore for MemoryBackend {
    async fn read(&self, key: &BackendKey) -> Result<Bytes, BackendError> {
        self.entries
            .lock()
            .unwrap()
            .get(key.as_str())
            .map(|e| e.value.clone())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &BackendKey, value: Bytes) -> Result<(), BackendError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.as_str().to_owned()).or_default();
        entry.value = value;
        entry.version += 1;
        Ok(())
    }

    async fn create_if_absent(&self, key: &BackendKey, value: Bytes) -> Result<bool, BackendError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key.as_str()) {
            return Ok(false);
        }
        entries.insert(key.as_str().to_owned(), Entry { value, version: 1 });
        Ok(true)
    }

    async fn delete(&self, key: &BackendKey) -> Result<(), BackendError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.remove(key.as_str()).is_none() {
            return Err(BackendError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn exists(&self, key: &BackendKey) -> Result<bool, BackendError> {
        Ok(self.entries.lock().unwrap().contains_key(key.as_str()))
    }

    async fn list(
        &self,
        prefix: &BackendKey,
        delimiter: Option<char>,
    ) -> Result<Vec<ListEntry>, BackendError> {
        let entries = self.entries.lock().unwrap();
        let prefix_str = prefix.as_str();
        let mut keys: Vec<ListEntry> = Vec::new();
        let mut seen_prefixes = std::collections::BTreeSet::new();
        for key in entries.keys().filter(|k| k.starts_with(prefix_str)) {
            let rest = &key[prefix_str.len()..];
            match delimiter {
                Some(delim) => {
                    if let Some(idx) = rest.find(delim) {
                        let common = format!("{prefix_str}{}{delim}", &rest[..idx]);
                        if seen_prefixes.insert(common.clone()) {
                            keys.push(ListEntry::CommonPrefix(common));
                        }
                    } else if !rest.is_empty() {
                        keys.push(ListEntry::Key(key.clone()));
                    }
                }
                None => keys.push(ListEntry::Key(key.clone())),
            }
        }
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(keys)
    }

    async fn atomic_increment(&self, key: &BackendKey, initial: i64) -> Result<i64, BackendError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.as_str().to_owned()).or_insert(Entry {
            value: Bytes::from(initial.to_string()),
            version: 0,
        });
        if entry.version == 0 {
            entry.version = 1;
            return Ok(initial);
        }
        let current: i64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| BackendError::Io(std::io::Error::other("corrupt counter")))?;
        let next = current + 1;
        entry.value = Bytes::from(next.to_string());
        entry.version += 1;
        Ok(next)
    }

    async fn conditional_write(
        &self,
        key: &BackendKey,
        precondition: Precondition,
        value: Bytes,
    ) -> Result<ETag, BackendError> {
        let mut entries = self.entries.lock().unwrap();
        match precondition {
            Precondition::IfAbsent => {
                if entries.contains_key(key.as_str()) {
                    return Err(BackendError::PreconditionFailed(key.to_string()));
                }
                entries.insert(key.as_str().to_owned(), Entry { value, version: 1 });
                Ok(ETag("1".into()))
            }
            Precondition::IfMatch(expected) => {
                let current_version = entries.get(key.as_str()).map(|e| e.version);
                let expected_version: u64 = expected
                    .0
                    .parse()
                    .map_err(|_| BackendError::PreconditionFailed(key.to_string()))?;
                if current_version != Some(expected_version) {
                    return Err(BackendError::PreconditionFailed(key.to_string()));
                }
                let entry = entries.get_mut(key.as_str()).unwrap();
                entry.value = value;
                entry.version += 1;
                Ok(ETag(entry.version.to_string()))
            }
        }
    }

    async fn read_with_etag(&self, key: &BackendKey) -> Result<(Bytes, Option<ETag>), BackendError> {
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .get(key.as_str())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        Ok((entry.value.clone(), Some(ETag(entry.version.to_string()))))
    }
}
