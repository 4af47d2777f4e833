/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Dry-run garbage collector (`spec.md` §4.I).
//!
//! Two-pass design: `.ref` sidecars are only ever updated by `stage()`, so
//! an unstaged working edition legitimately references objects no `.ref`
//! mentions yet. The fast path trusts `.ref`; the fallback scan walks
//! every live edition's own mappings as ground truth. Actual deletion
//! requires a backend-reported modification time the current backend
//! contract does not expose (`spec.md` §9), so this crate only ever
//! reports orphans — it never deletes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use kronoa_backend::{Blobstore, ListEntry};
use kronoa_editions::EditionGraph;
use kronoa_error::{EditionId, KronoaError};
use kronoa_lock::{Clock, Lease};
use kronoa_objectstore::ObjectStore;
use kronoa_path::BackendKey;
use kronoa_session::{PendingRecord, PointerBlob, WorkingRecord};

/// Renew the lease every this-many scanned objects (`spec.md` §4.I step 3),
/// the same cadence `kronoa-publish` uses during its reference walk.
pub const LEASE_RENEW_INTERVAL: usize = 20;

fn lock_key() -> BackendKey {
    BackendKey::try_from(".lock").expect("literal key is valid")
}

/// The outcome of a dry-run sweep: every object is accounted for under
/// exactly one bucket.
#[derive(Debug, Default, Clone)]
pub struct GcReport {
    /// The full live set computed in step 1, for diagnostics.
    pub live_editions: BTreeSet<EditionId>,
    /// Objects whose `.ref` sidecar already names a live edition.
    pub kept_fast_path: usize,
    /// Objects with no live `.ref` entry, but found in a live edition's own
    /// mapping set by the fallback scan.
    pub kept_scan_path: usize,
    /// Objects neither `.ref`-confirmed nor found by the scan. Reported
    /// only — the mtime gap (`spec.md` §9) means none of these are ever
    /// deleted by this collector.
    pub orphans_skipped_by_age: Vec<String>,
    pub objects_scanned: usize,
}

/// Live-set construction and the two-pass object scan, run under the
/// shared admin lease (`spec.md` §4.I / §5).
pub struct Collector {
    backend: Arc<dyn Blobstore>,
    objects: ObjectStore,
    graph: EditionGraph,
    clock: Arc<dyn Clock>,
    wait: Duration,
    lease_duration: Duration,
}

impl Collector {
    pub fn new(
        backend: Arc<dyn Blobstore>,
        objects: ObjectStore,
        graph: EditionGraph,
        clock: Arc<dyn Clock>,
        wait: Duration,
        lease_duration: Duration,
    ) -> Self {
        Self { backend, objects, graph, clock, wait, lease_duration }
    }

    /// Run a full dry-run sweep under the admin lease.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<GcReport, KronoaError> {
        let mut lease = Lease::acquire(
            self.backend.clone(),
            self.clock.clone(),
            lock_key(),
            self.wait,
            self.lease_duration,
        )
        .await?;

        let result = self.sweep(&mut lease).await;
        let _ = lease.release().await;
        result
    }

    async fn sweep(&self, lease: &mut Lease) -> Result<GcReport, KronoaError> {
        let live_editions = self.live_set().await?;

        // Ground truth for the fallback scan path: every hash any live
        // edition's own mapping files mention.
        let mut live_hashes: BTreeSet<String> = BTreeSet::new();
        for &edition in &live_editions {
            for hash in self.graph.own_mapping_hashes(edition).await? {
                live_hashes.insert(hash);
            }
        }

        let mut report = GcReport { live_editions: live_editions.clone(), ..Default::default() };

        for shard in self.shards().await? {
            let entries = self.backend.list(&shard, None).await.map_err(KronoaError::Storage)?;
            for entry in entries {
                let Some(hex) = dat_hex(entry.as_str()) else { continue };
                report.objects_scanned += 1;

                let refs = self.objects.read_references(&hex).await?;
                if refs.iter().any(|id| live_editions.contains(id)) {
                    report.kept_fast_path += 1;
                } else if live_hashes.contains(&hex) {
                    report.kept_scan_path += 1;
                } else {
                    report.orphans_skipped_by_age.push(hex);
                }

                if report.objects_scanned % LEASE_RENEW_INTERVAL == 0 {
                    lease.renew().await?;
                }
            }
        }

        Ok(report)
    }

    /// `spec.md` §4.I step 1: seed with production, staging, every pending
    /// record's edition, and every editing session's working edition;
    /// union the ancestry closure of each seed.
    async fn live_set(&self) -> Result<BTreeSet<EditionId>, KronoaError> {
        let mut seeds = BTreeSet::new();

        for pointer_key in [".production.json", ".staging.json"] {
            if let Ok(bytes) = self.backend.read(&BackendKey::try_from(pointer_key)?).await {
                let blob: PointerBlob = serde_json::from_slice(&bytes).map_err(|e| KronoaError::IntegrityError {
                    expected: "pointer JSON".into(),
                    actual: e.to_string(),
                })?;
                seeds.insert(blob.edition);
            }
        }

        let pending_prefix = BackendKey::try_from(".pending/")?;
        let pending_entries = self.backend.list(&pending_prefix, None).await.map_err(KronoaError::Storage)?;
        for entry in pending_entries {
            if let Ok(bytes) = self.backend.read(&BackendKey::try_from(entry.as_str())?).await {
                if let Ok(record) = serde_json::from_slice::<PendingRecord>(&bytes) {
                    seeds.insert(record.edition);
                }
            }
        }

        let root_prefix = BackendKey::try_from("")?;
        let root_entries = self.backend.list(&root_prefix, Some('/')).await.map_err(KronoaError::Storage)?;
        for entry in root_entries {
            let ListEntry::Key(name) = entry else { continue };
            if !name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            if name == ".production.json" || name == ".staging.json" {
                continue;
            }
            if let Ok(bytes) = self.backend.read(&BackendKey::try_from(name.as_str())?).await {
                if let Ok(record) = serde_json::from_slice::<WorkingRecord>(&bytes) {
                    seeds.insert(record.edition);
                }
            }
        }

        let mut live = BTreeSet::new();
        for seed in seeds {
            for id in self.graph.ancestry_closure(seed).await? {
                live.insert(id);
            }
        }
        Ok(live)
    }

    async fn shards(&self) -> Result<Vec<BackendKey>, KronoaError> {
        let root = BackendKey::try_from("objects/")?;
        let entries = self.backend.list(&root, Some('/')).await.map_err(KronoaError::Storage)?;
        let mut out = Vec::new();
        for entry in entries {
            if let ListEntry::CommonPrefix(p) = entry {
                out.push(BackendKey::try_from(p)?);
            }
        }
        Ok(out)
    }
}

fn dat_hex(key: &str) -> Option<String> {
    let name = key.rsplit('/').next().unwrap_or(key);
    name.strip_suffix(".dat").map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use kronoa_backend::MemoryBackend;
    use kronoa_lock::SystemClock;
    use kronoa_path::ContentPath;
    use kronoa_session::Session;

    use super::*;

    struct Fixture {
        backend: Arc<dyn Blobstore>,
        objects: ObjectStore,
        graph: EditionGraph,
        collector: Collector,
    }

    impl Fixture {
        async fn new() -> Self {
            let backend: Arc<dyn Blobstore> = Arc::new(MemoryBackend::new());
            let objects = ObjectStore::new(backend.clone());
            let graph = EditionGraph::new(backend.clone(), objects.clone());
            let collector = Collector::new(
                backend.clone(),
                objects.clone(),
                graph.clone(),
                Arc::new(SystemClock),
                Duration::from_secs(5),
                Duration::from_secs(60),
            );
            let fx = Self { backend, objects, graph, collector };
            fx.init_genesis().await;
            fx
        }

        async fn init_genesis(&self) {
            let pointer = Bytes::from(r#"{"edition":10000}"#);
            self.backend.write(&BackendKey::try_from(".production.json").unwrap(), pointer.clone()).await.unwrap();
            self.backend.write(&BackendKey::try_from(".staging.json").unwrap(), pointer).await.unwrap();
            self.backend.write(&BackendKey::try_from("editions/.head").unwrap(), Bytes::from("10000")).await.unwrap();
        }

        async fn checkout(&self, label: &str) -> Session {
            Session::checkout(
                self.backend.clone(),
                self.objects.clone(),
                self.graph.clone(),
                label,
                kronoa_error::PointerSource::Staging,
            )
            .await
            .unwrap()
        }
    }

    #[tokio::test]
    async fn live_production_object_is_kept_by_scan_path() {
        let fx = Fixture::new().await;
        let hex = fx.objects.put(Bytes::from("original")).await.unwrap();
        fx.backend
            .write(
                &BackendKey::try_from("editions/10000/data.txt").unwrap(),
                Bytes::from(format!("sha256:{hex}")),
            )
            .await
            .unwrap();

        let report = fx.collector.run().await.unwrap();
        assert_eq!(report.objects_scanned, 1);
        assert_eq!(report.kept_scan_path, 1);
        assert!(report.orphans_skipped_by_age.is_empty());
    }

    #[tokio::test]
    async fn staged_object_is_kept_by_fast_path() {
        let fx = Fixture::new().await;
        let mut session = fx.checkout("alice").await;
        let path = ContentPath::try_from("post.md").unwrap();
        session.write(path, Bytes::from("hi")).await.unwrap();
        let edition = session.edition();
        session.submit("add post".into()).await.unwrap();
        fx.objects.append_reference(&ObjectStore::hash_of(b"hi"), edition).await.unwrap();

        // Fold the pending edition into production so it lands in the live set.
        fx.backend
            .write(
                &BackendKey::try_from(".production.json").unwrap(),
                Bytes::from(format!(r#"{{"edition":{edition}}}"#)),
            )
            .await
            .unwrap();

        let report = fx.collector.run().await.unwrap();
        assert_eq!(report.kept_fast_path, 1);
        assert!(report.orphans_skipped_by_age.is_empty());
    }

    #[tokio::test]
    async fn unreferenced_object_is_reported_as_orphan() {
        let fx = Fixture::new().await;
        fx.objects.put(Bytes::from("dangling")).await.unwrap();

        let report = fx.collector.run().await.unwrap();
        assert_eq!(report.objects_scanned, 1);
        assert_eq!(report.orphans_skipped_by_age.len(), 1);
        assert_eq!(report.kept_fast_path, 0);
        assert_eq!(report.kept_scan_path, 0);
    }

    #[tokio::test]
    async fn unstaged_working_edition_keeps_its_object_via_live_set() {
        let fx = Fixture::new().await;
        let mut session = fx.checkout("bob").await;
        let path = ContentPath::try_from("draft.md").unwrap();
        session.write(path, Bytes::from("draft bytes")).await.unwrap();
        // Still editing: no submit, no stage, no .ref entry. Only the
        // `.bob.json` working record names this edition.

        let report = fx.collector.run().await.unwrap();
        assert!(report.live_editions.contains(&session.edition()));
        assert_eq!(report.kept_scan_path, 1);
        assert!(report.orphans_skipped_by_age.is_empty());
    }

    #[tokio::test]
    async fn flattened_edition_bounds_the_live_set() {
        let fx = Fixture::new().await;
        let hex = fx.objects.put(Bytes::from("old")).await.unwrap();
        fx.backend
            .write(
                &BackendKey::try_from("editions/10000/old.txt").unwrap(),
                Bytes::from(format!("sha256:{hex}")),
            )
            .await
            .unwrap();
        fx.backend.write(&BackendKey::try_from("editions/10001/.origin").unwrap(), Bytes::from("10000")).await.unwrap();
        fx.graph.flatten(10001).await.unwrap();
        fx.backend
            .write(&BackendKey::try_from(".production.json").unwrap(), Bytes::from(r#"{"edition":10001}"#))
            .await
            .unwrap();

        let report = fx.collector.run().await.unwrap();
        assert!(report.live_editions.contains(&10001));
        assert!(!report.live_editions.contains(&10000));
        assert_eq!(report.kept_scan_path, 1);
    }
}
