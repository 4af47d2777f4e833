use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use kronoa_backend::Blobstore;
use kronoa_editions::{EditionGraph, ResolveStatus};
use kronoa_error::{EditionId, KronoaError, PointerSource, GENESIS_EDITION};
use kronoa_objectstore::ObjectStore;
use kronoa_path::{BackendKey, ContentPath};

use crate::types::{PendingEntry, PointerBlob, SessionMode, StatStatus, WorkingRecord};

const HEAD_COUNTER_KEY: &str = "editions/.head";

fn label_json_key(label: &str) -> Result<BackendKey, KronoaError> {
    BackendKey::try_from(format!(".{label}.json"))
}

fn validate_label(label: &str) -> Result<(), KronoaError> {
    if label.is_empty() || label.contains('/') || label.contains("..") || label.starts_with('.') {
        return Err(KronoaError::InvalidPath(label.to_owned()));
    }
    Ok(())
}

/// A single editor's view of the repository: buffered writes/deletes,
/// ancestry-aware reads, and the explicit transaction machinery of
/// `spec.md` §4.G.
pub struct Session {
    backend: Arc<dyn Blobstore>,
    objects: ObjectStore,
    graph: EditionGraph,
    mode: SessionMode,
    edition: EditionId,
    pending: BTreeMap<ContentPath, PendingEntry>,
    in_transaction: bool,
}

impl Session {
    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    /// The edition this session is anchored to. Stable for the lifetime of
    /// a read-only session (`spec.md` §8 pointer-monotonicity property).
    pub fn edition(&self) -> EditionId {
        self.edition
    }

    /// Open a read-only session at the current production or staging
    /// pointer, or at an arbitrary named edition (preview mode).
    pub async fn open_readonly(
        backend: Arc<dyn Blobstore>,
        objects: ObjectStore,
        graph: EditionGraph,
        mode: ReadonlyOpen,
    ) -> Result<Session, KronoaError> {
        let (mode, edition) = match mode {
            ReadonlyOpen::Production => {
                let edition = read_pointer(&backend, PointerSource::Production.pointer_key()).await?;
                (SessionMode::Production, edition)
            }
            ReadonlyOpen::Staging => {
                let edition = read_pointer(&backend, PointerSource::Staging.pointer_key()).await?;
                (SessionMode::Staging, edition)
            }
            ReadonlyOpen::Edition(id) => (SessionMode::Edition(id), id),
            ReadonlyOpen::Submitted(id) => (SessionMode::Submitted, id),
        };
        Ok(Session {
            backend,
            objects,
            graph,
            mode,
            edition,
            pending: BTreeMap::new(),
            in_transaction: false,
        })
    }

    /// `Checkout(label, source)` from `spec.md` §4.G.
    #[tracing::instrument(skip(backend, objects, graph), fields(label))]
    pub async fn checkout(
        backend: Arc<dyn Blobstore>,
        objects: ObjectStore,
        graph: EditionGraph,
        label: &str,
        source: PointerSource,
    ) -> Result<Session, KronoaError> {
        validate_label(label)?;
        let label_key = label_json_key(label)?;

        let created = backend
            .create_if_absent(&label_key, Bytes::new())
            .await
            .map_err(KronoaError::Storage)?;
        if !created {
            return Err(KronoaError::LabelInUse(label.to_owned()));
        }

        match checkout_after_reservation(&backend, source).await {
            Ok((base, new_id)) => {
                let record = WorkingRecord { edition: new_id, base, source };
                let body = Bytes::from(serde_json::to_vec(&record).expect("WorkingRecord always serializes"));
                backend.write(&label_key, body).await.map_err(KronoaError::Storage)?;
                Ok(Session {
                    backend,
                    objects,
                    graph,
                    mode: SessionMode::Editing { label: label.to_owned() },
                    edition: new_id,
                    pending: BTreeMap::new(),
                    in_transaction: false,
                })
            }
            Err(e) => {
                let _ = backend.delete(&label_key).await;
                Err(e)
            }
        }
    }

    fn require_editing(&self) -> Result<&str, KronoaError> {
        match &self.mode {
            SessionMode::Editing { label } => Ok(label.as_str()),
            _ => Err(KronoaError::NotInEditingMode),
        }
    }

    fn mapping_key(&self, path: &ContentPath) -> BackendKey {
        BackendKey::try_from(format!("editions/{}/{path}", self.edition)).expect("edition + validated path is valid")
    }

    /// `read(path)` — conflates tombstone with not-found at the surface,
    /// per `spec.md` §7.
    pub async fn read(&self, path: &ContentPath) -> Result<Bytes, KronoaError> {
        match self.stat(path).await? {
            StatStatus::Exists { hash, .. } => self.objects.get(&hash).await,
            StatStatus::Deleted { .. } | StatStatus::NotFound => Err(KronoaError::NotFound(path.to_string())),
        }
    }

    pub async fn exists(&self, path: &ContentPath) -> Result<bool, KronoaError> {
        Ok(matches!(self.stat(path).await?, StatStatus::Exists { .. }))
    }

    /// `stat(path)` — three-valued status, consulting the pending buffer
    /// first in editing mode (`spec.md` §4.G/§7).
    pub async fn stat(&self, path: &ContentPath) -> Result<StatStatus, KronoaError> {
        if self.mode.is_editing() {
            if let Some(entry) = self.pending.get(path) {
                return Ok(match entry {
                    PendingEntry::Write { hash, bytes } => StatStatus::Exists {
                        hash: hash.clone(),
                        size: bytes.len() as u64,
                        resolved_from: self.edition,
                    },
                    PendingEntry::Delete => StatStatus::Deleted { resolved_from: self.edition },
                });
            }
        }
        match self.graph.resolve(self.edition, path).await? {
            ResolveStatus::Exists { hash, size, resolved_from } => {
                Ok(StatStatus::Exists { hash, size, resolved_from })
            }
            ResolveStatus::Deleted { resolved_from } => Ok(StatStatus::Deleted { resolved_from }),
            ResolveStatus::NotFound => Ok(StatStatus::NotFound),
        }
    }

    /// `write(path, bytes)`. Buffers under a transaction; otherwise writes
    /// through immediately (auto-commit, `spec.md` §4.G).
    pub async fn write(&mut self, path: ContentPath, bytes: Bytes) -> Result<(), KronoaError> {
        self.require_editing()?;
        let hash = ObjectStore::hash_of(&bytes);
        if self.in_transaction {
            self.pending.insert(path, PendingEntry::Write { hash, bytes });
            return Ok(());
        }
        self.objects.put(bytes).await?;
        let key = self.mapping_key(&path);
        self.backend
            .write(&key, Bytes::from(format!("sha256:{hash}")))
            .await
            .map_err(KronoaError::Storage)
    }

    /// `delete(path)`.
    pub async fn delete(&mut self, path: ContentPath) -> Result<(), KronoaError> {
        self.require_editing()?;
        if self.in_transaction {
            self.pending.insert(path, PendingEntry::Delete);
            return Ok(());
        }
        let key = self.mapping_key(&path);
        self.backend
            .write(&key, Bytes::from("deleted"))
            .await
            .map_err(KronoaError::Storage)
    }

    /// `copy(src, dst)`: resolve `src` through ancestry and the pending
    /// buffer, reject on `deleted`/`not-found`, create a new mapping at
    /// `dst` pointing to the same hash. No bytes move.
    ///
    /// If `src` was itself written earlier in the same open transaction,
    /// its bytes only live in the pending buffer — the object store write
    /// happens at `commit`, not at `write` — so that case is handled by
    /// reusing the buffered `Write` entry directly rather than round-
    /// tripping through `objects.get`, which would fail with
    /// `IntegrityError` against an object that hasn't been stored yet.
    pub async fn copy(&mut self, src: &ContentPath, dst: ContentPath) -> Result<(), KronoaError> {
        self.require_editing()?;
        if let Some(entry) = self.pending.get(src).cloned() {
            return match entry {
                PendingEntry::Write { hash, bytes } => {
                    self.pending.insert(dst, PendingEntry::Write { hash, bytes });
                    Ok(())
                }
                PendingEntry::Delete => Err(KronoaError::NotFound(src.to_string())),
            };
        }
        let (hash, size) = match self.stat(src).await? {
            StatStatus::Exists { hash, size, .. } => (hash, size),
            StatStatus::Deleted { .. } | StatStatus::NotFound => return Err(KronoaError::NotFound(src.to_string())),
        };
        if self.in_transaction {
            let bytes = self.objects.get(&hash).await?;
            debug_assert_eq!(bytes.len() as u64, size);
            self.pending.insert(dst, PendingEntry::Write { hash, bytes });
            return Ok(());
        }
        let key = self.mapping_key(&dst);
        self.backend
            .write(&key, Bytes::from(format!("sha256:{hash}")))
            .await
            .map_err(KronoaError::Storage)
    }

    /// `discard(path)`: drop any pending entry and unconditionally delete
    /// the mapping file under the current edition, letting the path
    /// resolve through ancestry again.
    pub async fn discard(&mut self, path: &ContentPath) -> Result<(), KronoaError> {
        self.require_editing()?;
        self.pending.remove(path);
        let key = self.mapping_key(path);
        match self.backend.delete(&key).await {
            Ok(()) | Err(kronoa_error::BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(KronoaError::Storage(e)),
        }
    }

    pub fn begin(&mut self) -> Result<(), KronoaError> {
        self.require_editing()?;
        if self.in_transaction {
            return Err(KronoaError::AlreadyInTransaction);
        }
        self.in_transaction = true;
        Ok(())
    }

    /// `commit`: write every buffered object and mapping. Not
    /// all-or-nothing at the backend level (`spec.md` §7) — a failure
    /// partway through leaves the working edition with a partial mapping
    /// set and the remaining pending entries in the buffer so the caller
    /// can retry.
    pub async fn commit(&mut self) -> Result<(), KronoaError> {
        self.require_editing()?;
        if !self.in_transaction {
            return Err(KronoaError::NotInTransaction);
        }
        while let Some((path, entry)) = self.pending.pop_first() {
            let result = match &entry {
                PendingEntry::Write { hash, bytes } => {
                    self.objects.put(bytes.clone()).await.map(|_| Bytes::from(format!("sha256:{hash}")))
                }
                PendingEntry::Delete => Ok(Bytes::from("deleted")),
            };
            match result {
                Ok(body) => {
                    let key = self.mapping_key(&path);
                    if let Err(e) = self.backend.write(&key, body).await {
                        self.pending.insert(path, entry);
                        return Err(KronoaError::Storage(e));
                    }
                }
                Err(e) => {
                    self.pending.insert(path, entry);
                    return Err(e);
                }
            }
        }
        self.in_transaction = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), KronoaError> {
        self.require_editing()?;
        if !self.in_transaction {
            return Err(KronoaError::NotInTransaction);
        }
        self.pending.clear();
        self.in_transaction = false;
        Ok(())
    }

    /// `submit(message)`: auto-commit any live transaction, write the
    /// pending record, delete the label file, transition to `submitted`.
    #[tracing::instrument(skip(self, message))]
    pub async fn submit(&mut self, message: String) -> Result<(), KronoaError> {
        let label = self.require_editing()?.to_owned();
        if self.in_transaction {
            self.commit().await?;
        }

        let label_key = label_json_key(&label)?;
        let working: WorkingRecord = {
            let bytes = self.backend.read(&label_key).await.map_err(KronoaError::Storage)?;
            serde_json::from_slice(&bytes).map_err(|e| KronoaError::PendingCorrupt {
                edition: self.edition,
                reason: e.to_string(),
            })?
        };

        let record = crate::types::PendingRecord {
            edition: self.edition,
            base: working.base,
            source: working.source,
            label: label.clone(),
            message,
            submitted_at: Utc::now(),
        };
        let pending_key = BackendKey::try_from(format!(".pending/{}.json", self.edition))?;
        let body = Bytes::from(serde_json::to_vec(&record).expect("PendingRecord always serializes"));
        self.backend.write(&pending_key, body).await.map_err(KronoaError::Storage)?;
        self.backend.delete(&label_key).await.map_err(KronoaError::Storage)?;
        self.mode = SessionMode::Submitted;
        Ok(())
    }

    /// `list(directory)`: immediate children merged across ancestry, with
    /// the in-memory pending buffer consulted first in editing mode.
    /// Subdirectories whose entire contents are shadowed by pending
    /// deletes are suppressed by recursing: a subdirectory only survives
    /// if at least one entry remains under it once the buffer is applied
    /// (`spec.md` §9's buffered-transactions-vs-ancestor-visibility note).
    #[tracing::instrument(skip(self), fields(directory = %directory))]
    pub async fn list(&self, directory: &BackendKey) -> Result<Vec<String>, KronoaError> {
        let mut names: BTreeMap<String, Entry> = BTreeMap::new();
        for name in self.graph.list(self.edition, directory).await? {
            if let Some(base) = name.strip_suffix('/') {
                names.insert(base.to_owned(), Entry::Dir);
            } else {
                names.insert(name, Entry::File);
            }
        }

        if self.mode.is_editing() {
            let prefix = directory.as_str();
            for (path, entry) in &self.pending {
                let path_str = path.as_str();
                let Some(rest) = path_str.strip_prefix(prefix) else { continue };
                if rest.is_empty() {
                    continue;
                }
                match rest.split_once('/') {
                    None => match entry {
                        PendingEntry::Write { .. } => {
                            names.insert(rest.to_owned(), Entry::File);
                        }
                        PendingEntry::Delete => {
                            names.remove(rest);
                        }
                    },
                    Some((dir, _)) => {
                        names.entry(dir.to_owned()).or_insert(Entry::Dir);
                    }
                }
            }
        }

        let mut out = Vec::new();
        for (name, kind) in names {
            match kind {
                Entry::File => out.push(name),
                Entry::Dir => {
                    let child_prefix = directory.join(&name);
                    let child_prefix = BackendKey::try_from(format!("{child_prefix}/"))?;
                    let nested = Box::pin(self.list(&child_prefix)).await?;
                    if !nested.is_empty() {
                        out.push(format!("{name}/"));
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

enum Entry {
    File,
    Dir,
}

pub enum ReadonlyOpen {
    Production,
    Staging,
    Edition(EditionId),
    Submitted(EditionId),
}

async fn read_pointer(backend: &Arc<dyn Blobstore>, key: &str) -> Result<EditionId, KronoaError> {
    let key = BackendKey::try_from(key)?;
    let bytes = backend.read(&key).await.map_err(KronoaError::Storage)?;
    let blob: PointerBlob = serde_json::from_slice(&bytes).map_err(|e| KronoaError::IntegrityError {
        expected: "pointer JSON".into(),
        actual: e.to_string(),
    })?;
    Ok(blob.edition)
}

async fn checkout_after_reservation(
    backend: &Arc<dyn Blobstore>,
    source: PointerSource,
) -> Result<(EditionId, EditionId), KronoaError> {
    let base = read_pointer(backend, source.pointer_key()).await?;
    let head_key = BackendKey::try_from(HEAD_COUNTER_KEY)?;
    let new_id = backend
        .atomic_increment(&head_key, GENESIS_EDITION as i64)
        .await
        .map_err(KronoaError::Storage)? as EditionId;
    let origin_key = BackendKey::try_from(format!("editions/{new_id}/.origin"))?;
    backend
        .write(&origin_key, Bytes::from(base.to_string()))
        .await
        .map_err(KronoaError::Storage)?;
    Ok((base, new_id))
}
