/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Local filesystem [`Blobstore`] adapter (`spec.md` §4.C).
//!
//! Keys map to path components with `/` as the separator; directory
//! components are created as needed. Writes go through a temp-file-then-
//! rename sequence in the same directory (in the spirit of
//! `sapling-atomicfile`'s "atomically write a file with retries", built
//! from `fs-err` and `tempfile`) so a concurrent reader never observes a
//! partial object. `create_if_absent` uses `O_EXCL`-style exclusive
//! creation per `spec.md`'s requirement.
//!
//! `atomic_increment` and `conditional_write` are guarded by an in-process
//! mutex only: as `spec.md` §4.C/§9 note, this adapter does not
//! linearise across independent OS processes, just within one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use kronoa_backend::{Blobstore, ETag, ListEntry, Precondition};
use kronoa_error::BackendError;
use kronoa_path::BackendKey;

/// A `Blobstore` over a local directory tree. `root` is created if it does
/// not already exist.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    // Serializes read-modify-write sequences (`atomic_increment`,
    // `conditional_write`) within this process. See module docs.
    guard: Mutex<()>,
}

impl FsBackend {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        fs_err::tokio::create_dir_all(&root).await?;
        Ok(Self {
            root,
            guard: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &BackendKey) -> PathBuf {
        let trimmed = key.as_str().strip_suffix('/').unwrap_or(key.as_str());
        self.root.join(trimmed)
    }

    async fn write_atomic(&self, path: &Path, value: Bytes) -> Result<(), BackendError> {
        if let Some(parent) = path.parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            std::io::Write::write_all(&mut tmp, &value)?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| BackendError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    fn etag_for(meta: &std::fs::Metadata) -> ETag {
        use std::time::UNIX_EPOCH;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        ETag(format!("{}-{}", mtime, meta.len()))
    }
}

#[async_trait]
impl Blobstore for FsBackend {
    async fn read(&self, key: &BackendKey) -> Result<Bytes, BackendError> {
        let path = self.path_for(key);
        match fs_err::tokio::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BackendError::NotFound(key.to_string()))
            }
            Err(e) => Err(BackendError::Io(e.into())),
        }
    }

    #[tracing::instrument(skip(self, value), fields(key = %key))]
    async fn write(&self, key: &BackendKey, value: Bytes) -> Result<(), BackendError> {
        let path = self.path_for(key);
        self.write_atomic(&path, value).await
    }

    #[tracing::instrument(skip(self, value), fields(key = %key))]
    async fn create_if_absent(&self, key: &BackendKey, value: Bytes) -> Result<bool, BackendError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        match options.open(&path).await {
            Ok(mut file) => {
                tokio::io::AsyncWriteExt::write_all(&mut file, &value).await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(BackendError::Io(e)),
        }
    }

    async fn delete(&self, key: &BackendKey) -> Result<(), BackendError> {
        let path = self.path_for(key);
        match fs_err::tokio::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BackendError::NotFound(key.to_string()))
            }
            Err(e) => Err(BackendError::Io(e.into())),
        }
    }

    async fn exists(&self, key: &BackendKey) -> Result<bool, BackendError> {
        let path = self.path_for(key);
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    async fn list(
        &self,
        prefix: &BackendKey,
        delimiter: Option<char>,
    ) -> Result<Vec<ListEntry>, BackendError> {
        let trimmed_prefix = prefix.as_str().strip_suffix('/').unwrap_or(prefix.as_str());
        let dir = if trimmed_prefix.is_empty() {
            self.root.clone()
        } else {
            self.root.join(trimmed_prefix)
        };
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(BackendError::Io(e.into())),
        };
        let key_prefix = if trimmed_prefix.is_empty() {
            String::new()
        } else {
            format!("{trimmed_prefix}/")
        };
        while let Some(entry) = read_dir.next_entry().await.map_err(std::io::Error::from)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await.map_err(std::io::Error::from)?;
            let full_key = format!("{key_prefix}{name}");
            if file_type.is_dir() {
                match delimiter {
                    Some(_) => entries.push(ListEntry::CommonPrefix(format!("{full_key}/"))),
                    None => collect_leaves(&dir.join(&name), &full_key, &mut entries).await?,
                }
            } else {
                entries.push(ListEntry::Key(full_key));
            }
        }
        entries.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(entries)
    }

    async fn atomic_increment(&self, key: &BackendKey, initial: i64) -> Result<i64, BackendError> {
        let _guard = self.guard.lock().unwrap();
        let path = self.path_for(key);
        let current = match fs_err::tokio::read(&path).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let parsed: i64 = text.trim().parse().map_err(|_| {
                    BackendError::Io(std::io::Error::other(format!(
                        "corrupt counter at {}",
                        key
                    )))
                })?;
                Some(parsed)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(BackendError::Io(e.into())),
        };
        let next = match current {
            None => initial,
            Some(c) => c + 1,
        };
        self.write_atomic(&path, Bytes::from(next.to_string())).await?;
        Ok(next)
    }

    async fn conditional_write(
        &self,
        key: &BackendKey,
        precondition: Precondition,
        value: Bytes,
    ) -> Result<ETag, BackendError> {
        let _guard = self.guard.lock().unwrap();
        let path = self.path_for(key);
        match precondition {
            Precondition::IfAbsent => {
                if !self.create_if_absent(key, value).await? {
                    return Err(BackendError::PreconditionFailed(key.to_string()));
                }
            }
            Precondition::IfMatch(expected) => {
                let meta = tokio::fs::metadata(&path).await.map_err(|e| {
                    if e.kind() == ErrorKind::NotFound {
                        BackendError::PreconditionFailed(key.to_string())
                    } else {
                        BackendError::Io(e.into())
                    }
                })?;
                if Self::etag_for(&meta) != expected {
                    return Err(BackendError::PreconditionFailed(key.to_string()));
                }
                self.write_atomic(&path, value).await?;
            }
        }
        let meta = tokio::fs::metadata(&path).await?;
        Ok(Self::etag_for(&meta))
    }

    async fn read_with_etag(&self, key: &BackendKey) -> Result<(Bytes, Option<ETag>), BackendError> {
        let path = self.path_for(key);
        let meta = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                BackendError::NotFound(key.to_string())
            } else {
                BackendError::Io(e.into())
            }
        })?;
        let bytes = self.read(key).await?;
        Ok((bytes, Some(Self::etag_for(&meta))))
    }
}

/// Flatten a subdirectory into leaf keys for a no-delimiter `list`.
fn collect_leaves<'a>(
    dir: &'a Path,
    key_prefix: &'a str,
    out: &'a mut Vec<ListEntry>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), BackendError>> + Send + 'a>> {
    Box::pin(async move {
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await.map_err(std::io::Error::from)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await.map_err(std::io::Error::from)?;
            let full_key = format!("{key_prefix}{name}");
            if file_type.is_dir() {
                collect_leaves(&dir.join(&name), &format!("{full_key}/"), out).await?;
            } else {
                out.push(ListEntry::Key(full_key));
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kronoa_backend::{BlobstorePutOps, PutBehaviour};

    fn key(s: &str) -> BackendKey {
        BackendKey::try_from(s).unwrap()
    }

    async fn backend() -> (FsBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::open(dir.path()).await.unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let (b, _dir) = backend().await;
        b.write(&key("a/b.txt"), Bytes::from("hello")).await.unwrap();
        assert_eq!(b.read(&key("a/b.txt")).await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let (b, _dir) = backend().await;
        assert!(matches!(
            b.read(&key("missing")).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_if_absent_is_exclusive() {
        let (b, _dir) = backend().await;
        assert!(b.create_if_absent(&key("x"), Bytes::from("1")).await.unwrap());
        assert!(!b.create_if_absent(&key("x"), Bytes::from("2")).await.unwrap());
        assert_eq!(b.read(&key("x")).await.unwrap(), Bytes::from("1"));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let (b, _dir) = backend().await;
        assert!(matches!(
            b.delete(&key("missing")).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn atomic_increment_starts_at_initial_and_advances() {
        let (b, _dir) = backend().await;
        assert_eq!(b.atomic_increment(&key("editions/.head"), 10_000).await.unwrap(), 10_000);
        assert_eq!(b.atomic_increment(&key("editions/.head"), 10_000).await.unwrap(), 10_001);
    }

    #[tokio::test]
    async fn list_with_delimiter_reports_common_prefixes() {
        let (b, _dir) = backend().await;
        b.write(&key("objects/ab/file1.dat"), Bytes::from("x")).await.unwrap();
        b.write(&key("objects/cd/file2.dat"), Bytes::from("y")).await.unwrap();
        let entries = b.list(&key("objects/"), Some('/')).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.is_common_prefix()));
    }

    #[tokio::test]
    async fn conditional_write_if_match_rejects_stale_etag() {
        let (b, _dir) = backend().await;
        let etag = b
            .conditional_write(&key("lock"), Precondition::IfAbsent, Bytes::from("1"))
            .await
            .unwrap();
        let result = b
            .conditional_write(
                &key("lock"),
                Precondition::IfMatch(ETag("stale".into())),
                Bytes::from("2"),
            )
            .await;
        assert!(matches!(result, Err(BackendError::PreconditionFailed(_))));
        b.conditional_write(&key("lock"), Precondition::IfMatch(etag), Bytes::from("3"))
            .await
            .unwrap();
        assert_eq!(b.read(&key("lock")).await.unwrap(), Bytes::from("3"));
    }

    #[tokio::test]
    async fn put_explicit_if_absent_matches_backend_semantics() {
        let (b, _dir) = backend().await;
        use kronoa_backend::OverwriteStatus;
        let status = b
            .put_explicit(&key("k"), Bytes::from("1"), PutBehaviour::IfAbsent)
            .await
            .unwrap();
        assert_eq!(status, OverwriteStatus::Created);
    }
}
