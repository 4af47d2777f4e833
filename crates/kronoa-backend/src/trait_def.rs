use async_trait::async_trait;
use bytes::Bytes;
use kronoa_error::BackendError;
use kronoa_path::BackendKey;

use crate::types::{ETag, ListEntry, OverwriteStatus, Precondition, PutBehaviour};

/// The flat key-value blob service every Kronoa storage adapter must
/// satisfy. Shaped directly after `eden/mononoke/blobstore`'s `Blobstore`/
/// `BlobstorePutOps` traits (`get`/`put`/`put_explicit` returning
/// `OverwriteStatus`), generalized with the remaining operations
/// `spec.md` §4.B requires of a backend.
///
/// Implementors are expected to be cheaply `Clone`/`Arc`-shared, the way
/// `memblob`/`fileblob` are; every method takes `&self`.
#[async_trait]
pub trait Blobstore: Send + Sync + std::fmt::Debug {
    /// Read the bytes at `key`. `Err(BackendError::NotFound)` if absent.
    async fn read(&self, key: &BackendKey) -> Result<Bytes, BackendError>;

    /// Overwrite `key` with `value`, creating any intermediate key space
    /// the backend needs.
    async fn write(&self, key: &BackendKey, value: Bytes) -> Result<(), BackendError>;

    /// Atomic create-if-absent. Returns `Ok(true)` if the backend observed
    /// no prior object at `key` (and wrote `value`); `Ok(false)` if a prior
    /// object already existed (nothing was written).
    async fn create_if_absent(&self, key: &BackendKey, value: Bytes) -> Result<bool, BackendError>;

    /// `delete` is `not-found` if the key is already absent.
    async fn delete(&self, key: &BackendKey) -> Result<(), BackendError>;

    async fn exists(&self, key: &BackendKey) -> Result<bool, BackendError>;

    /// When `delimiter` is `Some('/')`, results distinguish immediate
    /// children (`ListEntry::CommonPrefix`, ending in `/`) from leaf keys
    /// (`ListEntry::Key`). When `delimiter` is `None`, every key whose name
    /// begins with `prefix` is returned as a `ListEntry::Key`. Results are
    /// sorted.
    async fn list(
        &self,
        prefix: &BackendKey,
        delimiter: Option<char>,
    ) -> Result<Vec<ListEntry>, BackendError>;

    /// First call for a given `key` returns `initial` and stores it;
    /// subsequent calls read the current integer, return `current + 1`,
    /// and store it. Must be linearisable under concurrent callers; may
    /// raise `BackendError::ConcurrentModification` to let the caller
    /// retry under bounded backoff.
    async fn atomic_increment(&self, key: &BackendKey, initial: i64) -> Result<i64, BackendError>;

    /// Optional conditional-write primitive (`If-Match`/`If-None-Match`),
    /// used by the lock driver (§4.J) and by `atomic_increment` in
    /// adapters without a native counter. Backends that cannot support it
    /// return `BackendError::Unsupported`; the local filesystem adapter is
    /// the one shipped example (single-process use only, per `spec.md`
    /// §9's adapter-consistency-hazards note).
    async fn conditional_write(
        &self,
        key: &BackendKey,
        precondition: Precondition,
        value: Bytes,
    ) -> Result<ETag, BackendError> {
        let _ = (key, precondition, value);
        Err(BackendError::Unsupported("conditional_write".into()))
    }

    /// Read paired with the value's current ETag, when the backend tracks
    /// one. Default falls back to [`Blobstore::read`] with no ETag.
    async fn read_with_etag(&self, key: &BackendKey) -> Result<(Bytes, Option<ETag>), BackendError> {
        Ok((self.read(key).await?, None))
    }

    fn put_behaviour_supported(&self, behaviour: PutBehaviour) -> bool {
        matches!(behaviour, PutBehaviour::Overwrite | PutBehaviour::IfAbsent)
    }
}

/// Convenience extension mirroring `eden/mononoke/blobstore`'s
/// `put_explicit` signature (`PutBehaviour` in, `OverwriteStatus` out) on
/// top of the narrower
/// `write`/`create_if_absent` primitives every backend implements
/// directly. Blanket-implemented for every `Blobstore`.
#[async_trait]
pub trait BlobstorePutOps: Blobstore {
    async fn put_explicit(
        &self,
        key: &BackendKey,
        value: Bytes,
        behaviour: PutBehaviour,
    ) -> Result<OverwriteStatus, BackendError> {
        match behaviour {
            PutBehaviour::Overwrite => {
                self.write(key, value).await?;
                Ok(OverwriteStatus::NotChecked)
            }
            PutBehaviour::IfAbsent => {
                if self.create_if_absent(key, value).await? {
                    Ok(OverwriteStatus::Created)
                } else {
                    Ok(OverwriteStatus::Prevented)
                }
            }
        }
    }
}

impl<T: Blobstore + ?Sized> BlobstorePutOps for T {}
