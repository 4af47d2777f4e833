/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Edition graph: parent links, flatten markers and ancestry-aware path
//! resolution (`spec.md` §3/§4.F).
//!
//! Every edition lives under `editions/<id>/`. Its parent is named by the
//! body of `editions/<id>/.origin` (a decimal integer); a zero-byte
//! `editions/<id>/.flattened` marks it as a traversal boundary. Path
//! mappings are plain-text blobs at `editions/<id>/<path>`, either
//! `sha256:<hex>` or the tombstone literal `deleted`.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use kronoa_backend::{Blobstore, ListEntry};
use kronoa_error::{EditionId, KronoaError};
use kronoa_objectstore::ObjectStore;
use kronoa_path::{BackendKey, ContentPath};

const MAPPING_SHA_PREFIX: &str = "sha256:";
const MAPPING_DELETED: &str = "deleted";

/// The outcome of resolving a path against an edition's ancestry
/// (`spec.md` §4.F/§7 — `stat`'s three-valued status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveStatus {
    /// The path resolves to a live object.
    Exists {
        hash: String,
        size: u64,
        /// The edition whose mapping actually answered the lookup
        /// (`spec.md` §4.G `stat(path).resolvedFrom`, supplemented in
        /// `SPEC_FULL.md` §2 with the edition that carried the mapping).
        resolved_from: EditionId,
    },
    /// The nearest ancestor mapping is a tombstone.
    Deleted { resolved_from: EditionId },
    /// No ancestor, up to and including a flatten boundary, has any
    /// mapping for this path.
    NotFound,
}

impl ResolveStatus {
    pub fn is_present(&self) -> bool {
        matches!(self, ResolveStatus::Exists { .. })
    }
}

/// Operations over the edition graph: ancestry resolution, directory
/// listing and flattening. Holds no session state of its own — it is a
/// thin, shareable view over the backend and object store, the way the
/// teacher's `dag`/`manifest` crates separate graph algorithms from
/// session bookkeeping.
#[derive(Clone)]
pub struct EditionGraph {
    backend: Arc<dyn Blobstore>,
    objects: ObjectStore,
}

impl EditionGraph {
    pub fn new(backend: Arc<dyn Blobstore>, objects: ObjectStore) -> Self {
        Self { backend, objects }
    }

    fn origin_key(edition: EditionId) -> BackendKey {
        BackendKey::try_from(format!("editions/{edition}/.origin")).expect("edition id is valid")
    }

    fn flattened_key(edition: EditionId) -> BackendKey {
        BackendKey::try_from(format!("editions/{edition}/.flattened")).expect("edition id is valid")
    }

    fn mapping_key(edition: EditionId, path: &ContentPath) -> BackendKey {
        BackendKey::try_from(format!("editions/{edition}/{path}")).expect("validated content path is a valid key")
    }

    /// Read `editions/<edition>/.origin`, if present, as a parsed integer.
    /// `spec.md` §4.F: `.origin` must parse as an integer or resolution is
    /// an `integrity-error`.
    async fn read_origin(&self, edition: EditionId) -> Result<Option<EditionId>, KronoaError> {
        match self.backend.read(&Self::origin_key(edition)).await {
            Ok(bytes) => {
                let text = std::str::from_utf8(&bytes).map_err(|_| KronoaError::IntegrityError {
                    expected: "utf-8 .origin body".into(),
                    actual: "invalid utf-8".into(),
                })?;
                let id: EditionId = text.trim().parse().map_err(|_| KronoaError::IntegrityError {
                    expected: "decimal edition id".into(),
                    actual: text.trim().to_owned(),
                })?;
                Ok(Some(id))
            }
            Err(kronoa_error::BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(KronoaError::Storage(e)),
        }
    }

    async fn is_flattened(&self, edition: EditionId) -> Result<bool, KronoaError> {
        self.backend
            .exists(&Self::flattened_key(edition))
            .await
            .map_err(KronoaError::Storage)
    }

    /// Parse a raw mapping-file body into either a content hash or the
    /// tombstone marker. `spec.md` §6: exactly `"sha256:" + 64 lowercase
    /// hex` or the literal `"deleted"`; anything else is an integrity
    /// error.
    fn parse_mapping(body: &[u8]) -> Result<MappingValue, KronoaError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| KronoaError::IntegrityError {
                expected: "utf-8 mapping body".into(),
                actual: "invalid utf-8".into(),
            })?
            .trim();
        if text == MAPPING_DELETED {
            return Ok(MappingValue::Deleted);
        }
        if let Some(hex) = text.strip_prefix(MAPPING_SHA_PREFIX) {
            if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
                return Ok(MappingValue::Hash(hex.to_owned()));
            }
        }
        Err(KronoaError::IntegrityError {
            expected: "\"sha256:<64 lowercase hex>\" or \"deleted\"".into(),
            actual: text.to_owned(),
        })
    }

    /// `Resolve(edition, path)` from `spec.md` §4.F.
    #[tracing::instrument(skip(self), fields(edition, path = %path))]
    pub async fn resolve(&self, edition: EditionId, path: &ContentPath) -> Result<ResolveStatus, KronoaError> {
        let mut cur = edition;
        loop {
            let key = Self::mapping_key(cur, path);
            match self.backend.read(&key).await {
                Ok(bytes) => {
                    return match Self::parse_mapping(&bytes)? {
                        MappingValue::Hash(hash) => {
                            if !self.objects.exists(&hash).await? {
                                return Err(KronoaError::IntegrityError {
                                    expected: format!("object {hash} referenced by editions/{cur}/{path}"),
                                    actual: "missing".into(),
                                });
                            }
                            let size = self.objects.get(&hash).await?.len() as u64;
                            Ok(ResolveStatus::Exists { hash, size, resolved_from: cur })
                        }
                        MappingValue::Deleted => Ok(ResolveStatus::Deleted { resolved_from: cur }),
                    };
                }
                Err(kronoa_error::BackendError::NotFound(_)) => {
                    if self.is_flattened(cur).await? {
                        return Ok(ResolveStatus::NotFound);
                    }
                    match self.read_origin(cur).await? {
                        Some(parent) => cur = parent,
                        None => return Ok(ResolveStatus::NotFound),
                    }
                }
                Err(e) => return Err(KronoaError::Storage(e)),
            }
        }
    }

    /// `List(edition, directory)` from `spec.md` §4.F: merge immediate
    /// children across ancestry, first observation wins (child shadows
    /// parent), tombstones excluded, entries beginning with `.` skipped.
    #[tracing::instrument(skip(self), fields(edition, directory = %directory))]
    pub async fn list(&self, edition: EditionId, directory: &BackendKey) -> Result<Vec<String>, KronoaError> {
        let mut seen: BTreeMap<String, Option<String>> = BTreeMap::new();
        let mut cur = edition;
        loop {
            let prefix = BackendKey::try_from(format!("editions/{cur}/{directory}"))
                .map_err(|_| KronoaError::InvalidPath(directory.to_string()))?;
            let entries = self
                .backend
                .list(&prefix, Some('/'))
                .await
                .map_err(KronoaError::Storage)?;
            for entry in entries {
                let name = entry_name(&entry, &prefix);
                if name.starts_with('.') {
                    continue;
                }
                if seen.contains_key(&name) {
                    continue;
                }
                match entry {
                    ListEntry::CommonPrefix(_) => {
                        seen.insert(name.clone(), Some(format!("{name}/")));
                    }
                    ListEntry::Key(_) => {
                        let path_str = format!("{directory}{name}");
                        let content_path = ContentPath::try_from(path_str.as_str())?;
                        let status = self.resolve(cur, &content_path).await?;
                        seen.insert(name.clone(), status.is_present().then(|| name.clone()));
                    }
                }
            }
            if self.is_flattened(cur).await? {
                break;
            }
            match self.read_origin(cur).await? {
                Some(parent) => cur = parent,
                None => break,
            }
        }

        let mut out: Vec<String> = seen.into_values().flatten().collect();
        out.sort();
        Ok(out)
    }

    /// `Flatten(edition)` from `spec.md` §4.F. Must run under the admin
    /// lease; this crate does not enforce that itself. Idempotent: a
    /// second call observes the marker and returns immediately.
    #[tracing::instrument(skip(self), fields(edition))]
    pub async fn flatten(&self, edition: EditionId) -> Result<(), KronoaError> {
        if self.is_flattened(edition).await? {
            return Ok(());
        }

        let mut collected: BTreeMap<String, Bytes> = BTreeMap::new();
        let mut cur = edition;
        loop {
            self.collect_mappings(cur, &mut collected).await?;
            if cur != edition && self.is_flattened(cur).await? {
                break;
            }
            match self.read_origin(cur).await? {
                Some(parent) => cur = parent,
                None => break,
            }
        }

        for (path, body) in collected {
            let key = BackendKey::try_from(format!("editions/{edition}/{path}")).map_err(|_| {
                KronoaError::IntegrityError {
                    expected: "valid content path".into(),
                    actual: path.clone(),
                }
            })?;
            if !self.backend.exists(&key).await.map_err(KronoaError::Storage)? {
                self.backend.write(&key, body).await.map_err(KronoaError::Storage)?;
            }
        }

        self.backend
            .write(&Self::flattened_key(edition), Bytes::new())
            .await
            .map_err(KronoaError::Storage)
    }

    /// Recursively collect every mapping under `editions/<edition>/` into
    /// `into`, first writer wins. Used by `flatten`; walks the whole
    /// key space rather than just one directory since flattening must
    /// preserve the entire path set, including tombstones.
    async fn collect_mappings(
        &self,
        edition: EditionId,
        into: &mut BTreeMap<String, Bytes>,
    ) -> Result<(), KronoaError> {
        let root = BackendKey::try_from(format!("editions/{edition}/")).expect("edition id is valid");
        let mut stack = vec![root];
        while let Some(prefix) = stack.pop() {
            let entries = self
                .backend
                .list(&prefix, Some('/'))
                .await
                .map_err(KronoaError::Storage)?;
            for entry in entries {
                let name = entry_name(&entry, &prefix);
                if name.starts_with('.') {
                    continue;
                }
                match entry {
                    ListEntry::CommonPrefix(_) => {
                        let child = BackendKey::try_from(format!("{prefix}{name}")).expect("prefix + name is valid");
                        stack.push(child);
                    }
                    ListEntry::Key(key) => {
                        let rel = key
                            .strip_prefix(&format!("editions/{edition}/"))
                            .unwrap_or(&key)
                            .to_owned();
                        if into.contains_key(&rel) {
                            continue;
                        }
                        let bytes = self
                            .backend
                            .read(&BackendKey::try_from(key.as_str()).map_err(|_| KronoaError::IntegrityError {
                                expected: "valid backend key".into(),
                                actual: key.clone(),
                            })?)
                            .await
                            .map_err(KronoaError::Storage)?;
                        into.insert(rel, bytes);
                    }
                }
            }
        }
        Ok(())
    }

    /// The set of content hashes mentioned by `edition`'s own mapping
    /// files (not its ancestry). Used by the publish pipeline's `stage`
    /// step to attribute references before the staging pointer moves
    /// (`spec.md` §4.H step 4); tombstones are skipped.
    #[tracing::instrument(skip(self), fields(edition))]
    pub async fn own_mapping_hashes(&self, edition: EditionId) -> Result<Vec<String>, KronoaError> {
        let mut raw = BTreeMap::new();
        self.collect_mappings(edition, &mut raw).await?;
        let mut hashes = Vec::new();
        for body in raw.into_values() {
            if let MappingValue::Hash(hash) = Self::parse_mapping(&body)? {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    /// Whether `ancestor` is reachable from `edition` by following
    /// `.origin` links (not stopping at flatten markers — this is an
    /// integrity check over the raw parent chain, not a content
    /// resolution). Used by `kronoa-publish::stage` to re-verify that a
    /// pending record's declared `source` pointer actually lies on the
    /// edition's lineage before trusting the conflict check (`spec.md` §9
    /// open question).
    pub async fn is_ancestor(&self, edition: EditionId, ancestor: EditionId) -> Result<bool, KronoaError> {
        let mut cur = edition;
        loop {
            if cur == ancestor {
                return Ok(true);
            }
            match self.read_origin(cur).await? {
                Some(parent) => cur = parent,
                None => return Ok(false),
            }
        }
    }

    /// Every id reachable from `seed` by following `.origin`, stopping at
    /// (but including) the first flatten boundary encountered. Used by the
    /// garbage collector's live-set construction (`spec.md` §4.I step 1).
    pub async fn ancestry_closure(&self, seed: EditionId) -> Result<std::collections::BTreeSet<EditionId>, KronoaError> {
        let mut closure = std::collections::BTreeSet::new();
        let mut cur = seed;
        loop {
            if !closure.insert(cur) {
                break;
            }
            if self.is_flattened(cur).await? {
                break;
            }
            match self.read_origin(cur).await? {
                Some(parent) => cur = parent,
                None => break,
            }
        }
        Ok(closure)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MappingValue {
    Hash(String),
    Deleted,
}

fn entry_name(entry: &ListEntry, prefix: &BackendKey) -> String {
    entry
        .as_str()
        .strip_prefix(prefix.as_str())
        .unwrap_or(entry.as_str())
        .trim_end_matches('/')
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kronoa_backend::MemoryBackend;

    async fn graph() -> (EditionGraph, Arc<dyn Blobstore>) {
        let backend: Arc<dyn Blobstore> = Arc::new(MemoryBackend::new());
        let objects = ObjectStore::new(backend.clone());
        (EditionGraph::new(backend.clone(), objects), backend)
    }

    async fn seed_mapping(backend: &Arc<dyn Blobstore>, objects: &ObjectStore, edition: EditionId, path: &str, bytes: &str) {
        let hex = objects.put(Bytes::from(bytes.to_owned())).await.unwrap();
        let key = BackendKey::try_from(format!("editions/{edition}/{path}")).unwrap();
        backend.write(&key, Bytes::from(format!("sha256:{hex}"))).await.unwrap();
    }

    async fn seed_tombstone(backend: &Arc<dyn Blobstore>, edition: EditionId, path: &str) {
        let key = BackendKey::try_from(format!("editions/{edition}/{path}")).unwrap();
        backend.write(&key, Bytes::from("deleted")).await.unwrap();
    }

    async fn link(backend: &Arc<dyn Blobstore>, edition: EditionId, parent: EditionId) {
        let key = BackendKey::try_from(format!("editions/{edition}/.origin")).unwrap();
        backend.write(&key, Bytes::from(parent.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn resolve_finds_mapping_in_ancestor() {
        let (graph, backend) = graph().await;
        let objects = ObjectStore::new(backend.clone());
        seed_mapping(&backend, &objects, 10000, "data.txt", "original").await;
        link(&backend, 10001, 10000).await;

        let path = ContentPath::try_from("data.txt").unwrap();
        let status = graph.resolve(10001, &path).await.unwrap();
        assert_eq!(
            status,
            ResolveStatus::Exists {
                hash: ObjectStore::hash_of(b"original"),
                size: 8,
                resolved_from: 10000,
            }
        );
    }

    #[tokio::test]
    async fn child_mapping_shadows_parent() {
        let (graph, backend) = graph().await;
        let objects = ObjectStore::new(backend.clone());
        seed_mapping(&backend, &objects, 10000, "data.txt", "original").await;
        link(&backend, 10001, 10000).await;
        seed_mapping(&backend, &objects, 10001, "data.txt", "wrong").await;

        let path = ContentPath::try_from("data.txt").unwrap();
        let status = graph.resolve(10001, &path).await.unwrap();
        assert_eq!(status, ResolveStatus::Exists {
            hash: ObjectStore::hash_of(b"wrong"),
            size: 5,
            resolved_from: 10001,
        });
    }

    #[tokio::test]
    async fn tombstone_shadows_ancestor_content() {
        let (graph, backend) = graph().await;
        let objects = ObjectStore::new(backend.clone());
        seed_mapping(&backend, &objects, 10000, "data.txt", "original").await;
        link(&backend, 10001, 10000).await;
        seed_tombstone(&backend, 10001, "data.txt").await;

        let path = ContentPath::try_from("data.txt").unwrap();
        let status = graph.resolve(10001, &path).await.unwrap();
        assert_eq!(status, ResolveStatus::Deleted { resolved_from: 10001 });
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (graph, backend) = graph().await;
        link(&backend, 10001, 10000).await;
        let path = ContentPath::try_from("nope.txt").unwrap();
        assert_eq!(graph.resolve(10001, &path).await.unwrap(), ResolveStatus::NotFound);
    }

    #[tokio::test]
    async fn list_merges_ancestry_and_excludes_tombstones() {
        let (graph, backend) = graph().await;
        let objects = ObjectStore::new(backend.clone());
        seed_mapping(&backend, &objects, 10000, "articles/a.md", "a").await;
        seed_mapping(&backend, &objects, 10000, "articles/b.md", "b").await;
        link(&backend, 10001, 10000).await;
        seed_tombstone(&backend, 10001, "articles/b.md").await;
        seed_mapping(&backend, &objects, 10001, "articles/c.md", "c").await;

        let dir = BackendKey::try_from("articles/").unwrap();
        let names = graph.list(10001, &dir).await.unwrap();
        assert_eq!(names, vec!["a.md".to_string(), "c.md".to_string()]);
    }

    #[tokio::test]
    async fn flatten_is_idempotent_and_preserves_tombstones() {
        let (graph, backend) = graph().await;
        let objects = ObjectStore::new(backend.clone());
        seed_mapping(&backend, &objects, 10000, "a.txt", "a").await;
        seed_mapping(&backend, &objects, 10000, "b.txt", "b").await;
        link(&backend, 10001, 10000).await;
        seed_tombstone(&backend, 10001, "b.txt").await;

        graph.flatten(10001).await.unwrap();
        graph.flatten(10001).await.unwrap();

        let flattened_key = BackendKey::try_from("editions/10001/.flattened").unwrap();
        assert!(backend.exists(&flattened_key).await.unwrap());

        let path_a = ContentPath::try_from("a.txt").unwrap();
        assert!(graph.resolve(10001, &path_a).await.unwrap().is_present());
        let path_b = ContentPath::try_from("b.txt").unwrap();
        assert_eq!(graph.resolve(10001, &path_b).await.unwrap(), ResolveStatus::Deleted { resolved_from: 10001 });
    }

    #[tokio::test]
    async fn ancestry_closure_stops_at_flatten_boundary() {
        let (graph, backend) = graph().await;
        link(&backend, 10001, 10000).await;
        link(&backend, 10002, 10001).await;
        graph.flatten(10001).await.unwrap();

        let closure = graph.ancestry_closure(10002).await.unwrap();
        assert_eq!(closure, [10001, 10002].into_iter().collect());
    }

    #[tokio::test]
    async fn malformed_origin_is_integrity_error() {
        let (graph, backend) = graph().await;
        let key = BackendKey::try_from("editions/10001/.origin").unwrap();
        backend.write(&key, Bytes::from("not-a-number")).await.unwrap();
        let path = ContentPath::try_from("x.txt").unwrap();
        assert!(matches!(
            graph.resolve(10001, &path).await,
            Err(KronoaError::IntegrityError { .. })
        ));
    }
}
