/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Content-addressed object store with deduplication (`spec.md` §4.E).
//!
//! Objects are keyed by the lowercase hex of their SHA-256 digest, sharded
//! two hex characters deep (`objects/<shard>/<hex>.dat`), with a companion
//! `.ref` sidecar recording which editions have ever staged the object.
//! The dedup hash is a hard part of the wire contract (`spec.md` §9): the
//! key layout, `.ref` format and the `"sha256:"` mapping-file prefix all
//! depend on it, so this crate is the only place SHA-256 is computed.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use kronoa_backend::Blobstore;
use kronoa_error::{BackendError, EditionId, KronoaError};
use kronoa_path::BackendKey;
use sha2::{Digest, Sha256};

/// The lowercase-hex SHA-256 digest identifying an object.
pub type ObjectHash = String;

#[derive(Clone)]
pub struct ObjectStore {
    backend: Arc<dyn Blobstore>,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn Blobstore>) -> Self {
        Self { backend }
    }

    /// Compute the SHA-256 of `bytes` and return its lowercase hex
    /// representation, without touching the backend. Exposed so sessions
    /// can compute a hash for buffering before deciding whether to write.
    pub fn hash_of(bytes: &[u8]) -> ObjectHash {
        let digest = Sha256::digest(bytes);
        hex::encode(digest)
    }

    fn dat_key(hex: &str) -> BackendKey {
        BackendKey::try_from(format!("objects/{}/{}.dat", &hex[..2], hex)).expect("valid hex produces a valid key")
    }

    fn ref_key(hex: &str) -> BackendKey {
        BackendKey::try_from(format!("objects/{}/{}.ref", &hex[..2], hex)).expect("valid hex produces a valid key")
    }

    /// Store `bytes`, returning its content hash. A second `put` of
    /// identical bytes is a no-op: if the backend already has an object at
    /// the computed key, the bytes are not rewritten.
    #[tracing::instrument(skip(self, bytes))]
    pub async fn put(&self, bytes: Bytes) -> Result<ObjectHash, KronoaError> {
        let hex = Self::hash_of(&bytes);
        let key = Self::dat_key(&hex);
        if self.backend.exists(&key).await.map_err(KronoaError::Storage)? {
            return Ok(hex);
        }
        self.backend
            .write(&key, bytes)
            .await
            .map_err(KronoaError::Storage)?;
        Ok(hex)
    }

    pub async fn get(&self, hex: &str) -> Result<Bytes, KronoaError> {
        validate_hex(hex)?;
        match self.backend.read(&Self::dat_key(hex)).await {
            Ok(bytes) => Ok(bytes),
            Err(BackendError::NotFound(_)) => Err(KronoaError::IntegrityError {
                expected: format!("object {hex}"),
                actual: "missing".into(),
            }),
            Err(e) => Err(KronoaError::Storage(e)),
        }
    }

    /// Whether the `.dat` object for `hex` exists. Used by the edition
    /// graph's integrity check (`spec.md` §4.E) when a mapping resolves to
    /// this hash.
    pub async fn exists(&self, hex: &str) -> Result<bool, KronoaError> {
        validate_hex(hex)?;
        self.backend
            .exists(&Self::dat_key(hex))
            .await
            .map_err(KronoaError::Storage)
    }

    /// Union `edition` into the `.ref` sidecar for `hex`. Must only be
    /// called under the admin lease (`spec.md` §4.E/§9); this crate does
    /// not itself enforce that — the publish pipeline holds the lease for
    /// the duration of the walk that calls this.
    #[tracing::instrument(skip(self))]
    pub async fn append_reference(&self, hex: &str, edition: EditionId) -> Result<(), KronoaError> {
        validate_hex(hex)?;
        let key = Self::ref_key(hex);
        let mut ids = self.read_references(hex).await?;
        if ids.insert(edition) {
            self.write_references(&key, &ids).await?;
        }
        Ok(())
    }

    /// The sorted set of editions that have staged `hex`, or the empty set
    /// if no `.ref` sidecar exists yet.
    pub async fn read_references(&self, hex: &str) -> Result<BTreeSet<EditionId>, KronoaError> {
        validate_hex(hex)?;
        match self.backend.read(&Self::ref_key(hex)).await {
            Ok(bytes) => parse_references(&bytes),
            Err(BackendError::NotFound(_)) => Ok(BTreeSet::new()),
            Err(e) => Err(KronoaError::Storage(e)),
        }
    }

    async fn write_references(
        &self,
        key: &BackendKey,
        ids: &BTreeSet<EditionId>,
    ) -> Result<(), KronoaError> {
        let body = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        self.backend
            .write(key, Bytes::from(body))
            .await
            .map_err(KronoaError::Storage)
    }
}

fn parse_references(bytes: &Bytes) -> Result<BTreeSet<EditionId>, KronoaError> {
    let text = std::str::from_utf8(bytes).map_err(|_| KronoaError::IntegrityError {
        expected: "utf-8 reference file".into(),
        actual: "invalid utf-8".into(),
    })?;
    let mut ids = BTreeSet::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let id: EditionId = line.parse().map_err(|_| KronoaError::IntegrityError {
            expected: "decimal edition id".into(),
            actual: line.to_owned(),
        })?;
        ids.insert(id);
    }
    Ok(ids)
}

fn validate_hex(hex: &str) -> Result<(), KronoaError> {
    if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(KronoaError::IntegrityError {
            expected: "64 lowercase hex characters".into(),
            actual: hex.to_owned(),
        })
    }
}

/// Minimal hex encoding so this crate doesn't need a dedicated `hex`
/// dependency for a one-line job.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for byte in bytes.as_ref() {
            write!(out, "{byte:02x}").expect("writing to a String never fails");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kronoa_backend::MemoryBackend;

    fn store() -> ObjectStore {
        ObjectStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn put_is_content_addressed_and_dedups() {
        let store = store();
        let hex1 = store.put(Bytes::from("hello")).await.unwrap();
        let hex2 = store.put(Bytes::from("hello")).await.unwrap();
        assert_eq!(hex1, hex2);
        assert_eq!(hex1.len(), 64);
        assert_eq!(store.get(&hex1).await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn different_bytes_get_different_hashes() {
        let store = store();
        let a = store.put(Bytes::from("a")).await.unwrap();
        let b = store.put(Bytes::from("b")).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn get_missing_object_is_integrity_error() {
        let store = store();
        let fake_hex = "0".repeat(64);
        assert!(matches!(
            store.get(&fake_hex).await,
            Err(KronoaError::IntegrityError { .. })
        ));
    }

    #[tokio::test]
    async fn append_reference_unions_and_sorts() {
        let store = store();
        let hex = store.put(Bytes::from("x")).await.unwrap();
        store.append_reference(&hex, 10_002).await.unwrap();
        store.append_reference(&hex, 10_001).await.unwrap();
        store.append_reference(&hex, 10_002).await.unwrap(); // idempotent
        let ids: Vec<EditionId> = store.read_references(&hex).await.unwrap().into_iter().collect();
        assert_eq!(ids, vec![10_001, 10_002]);
    }

    #[tokio::test]
    async fn read_references_on_unstaged_object_is_empty() {
        let store = store();
        let hex = store.put(Bytes::from("z")).await.unwrap();
        assert!(store.read_references(&hex).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_hash() {
        let store = store();
        assert!(store.get("not-a-hash").await.is_err());
        assert!(store.append_reference("UPPERCASE0000000000000000000000000000000000000000000000000000", 1).await.is_err());
    }
}
