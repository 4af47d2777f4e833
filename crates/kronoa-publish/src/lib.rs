/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Publish pipeline: submit → stage → deploy, reject, rollback, flatten
//! (`spec.md` §4.H). Every mutation here runs under the admin lease
//! (`kronoa-lock`) and renews it periodically for long-running walks.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use kronoa_backend::Blobstore;
use kronoa_editions::EditionGraph;
use kronoa_error::{EditionId, KronoaError, PointerSource};
use kronoa_lock::{Clock, Lease};
use kronoa_objectstore::ObjectStore;
use kronoa_path::BackendKey;
use kronoa_session::{PendingRecord, PointerBlob};
use serde::{Deserialize, Serialize};

/// Renew the lease every this-many reference updates during `stage`'s
/// walk, and every this-many scanned objects in `kronoa-gc` (`spec.md`
/// §4.H step 4 / §4.I step 3).
pub const LEASE_RENEW_INTERVAL: usize = 20;

/// `<root>/.rejected/<id>.json` (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub edition: EditionId,
    pub reason: String,
    #[serde(rename = "rejectedAt")]
    pub rejected_at: chrono::DateTime<Utc>,
}

fn lock_key() -> BackendKey {
    BackendKey::try_from(".lock").expect("literal key is valid")
}

fn pending_key(edition: EditionId) -> Result<BackendKey, KronoaError> {
    BackendKey::try_from(format!(".pending/{edition}.json"))
}

fn rejected_key(edition: EditionId) -> Result<BackendKey, KronoaError> {
    BackendKey::try_from(format!(".rejected/{edition}.json"))
}

fn origin_key(edition: EditionId) -> Result<BackendKey, KronoaError> {
    BackendKey::try_from(format!("editions/{edition}/.origin"))
}

/// The pipeline: submit/stage/deploy/reject/rollback over a shared
/// backend, object store, edition graph and lease.
pub struct Publisher {
    backend: Arc<dyn Blobstore>,
    objects: ObjectStore,
    graph: EditionGraph,
    clock: Arc<dyn Clock>,
    wait: Duration,
    lease_duration: Duration,
}

impl Publisher {
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

    async fn acquire(&self) -> Result<Lease, KronoaError> {
        Lease::acquire(self.backend.clone(), self.clock.clone(), lock_key(), self.wait, self.lease_duration).await
    }

    async fn read_pointer(&self, key: &str) -> Result<EditionId, KronoaError> {
        let key = BackendKey::try_from(key)?;
        let bytes = self.backend.read(&key).await.map_err(KronoaError::Storage)?;
        let blob: PointerBlob = serde_json::from_slice(&bytes).map_err(|e| KronoaError::IntegrityError {
            expected: "pointer JSON".into(),
            actual: e.to_string(),
        })?;
        Ok(blob.edition)
    }

    async fn write_pointer(&self, key: &str, edition: EditionId) -> Result<(), KronoaError> {
        let key = BackendKey::try_from(key)?;
        let body = Bytes::from(serde_json::to_vec(&PointerBlob { edition }).expect("PointerBlob always serializes"));
        self.backend.write(&key, body).await.map_err(KronoaError::Storage)
    }

    /// `stage(edition)` — `spec.md` §4.H.
    #[tracing::instrument(skip(self), fields(edition))]
    pub async fn stage(&self, edition: EditionId) -> Result<(), KronoaError> {
        let mut lease = self.acquire().await?;
        let result = self.stage_under_lease(edition, &mut lease).await;
        let _ = lease.release().await;
        result
    }

    async fn stage_under_lease(&self, edition: EditionId, lease: &mut Lease) -> Result<(), KronoaError> {
        let pending_key = pending_key(edition)?;
        let pending: PendingRecord = {
            let bytes = match self.backend.read(&pending_key).await {
                Ok(bytes) => bytes,
                Err(kronoa_error::BackendError::NotFound(_)) => return Err(KronoaError::PendingNotFound(edition)),
                Err(e) => return Err(KronoaError::Storage(e)),
            };
            serde_json::from_slice(&bytes).map_err(|e| KronoaError::PendingCorrupt {
                edition,
                reason: e.to_string(),
            })?
        };

        let origin = {
            let bytes = self.backend.read(&origin_key(edition)?).await.map_err(|_| KronoaError::PendingCorrupt {
                edition,
                reason: "edition has no .origin".into(),
            })?;
            std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse::<EditionId>().ok())
                .ok_or_else(|| KronoaError::PendingCorrupt {
                    edition,
                    reason: "malformed .origin".into(),
                })?
        };
        if origin != pending.base {
            return Err(KronoaError::PendingCorrupt {
                edition,
                reason: format!("origin {origin} does not match pending base {}", pending.base),
            });
        }

        let current = self.read_pointer(pending.source.pointer_key()).await?;
        if current != pending.base {
            return Err(KronoaError::ConflictDetected {
                base: pending.base,
                current,
                source: pending.source,
            });
        }

        // §9 open question: re-verify that `current` actually lies on
        // `edition`'s lineage, rather than trusting a forged `source`
        // field whose `base` happened to match by coincidence.
        if !self.graph.is_ancestor(edition, current).await? {
            return Err(KronoaError::IntegrityError {
                expected: format!("{} pointer {current} reachable from edition {edition}", pending.source),
                actual: "not an ancestor".into(),
            });
        }

        let hashes = self.graph.own_mapping_hashes(edition).await?;
        for (i, hash) in hashes.iter().enumerate() {
            self.objects.append_reference(hash, edition).await?;
            if (i + 1) % LEASE_RENEW_INTERVAL == 0 {
                lease.renew().await?;
            }
        }

        self.write_pointer(PointerSource::Staging.pointer_key(), edition).await?;
        match self.backend.delete(&pending_key).await {
            Ok(()) | Err(kronoa_error::BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(KronoaError::Storage(e)),
        }
    }

    /// `deploy()` — copy the staging pointer's bytes to production.
    #[tracing::instrument(skip(self))]
    pub async fn deploy(&self) -> Result<(), KronoaError> {
        let lease = self.acquire().await?;
        let result = async {
            let staging = BackendKey::try_from(PointerSource::Staging.pointer_key())?;
            let bytes = self.backend.read(&staging).await.map_err(KronoaError::Storage)?;
            let production = BackendKey::try_from(PointerSource::Production.pointer_key())?;
            self.backend.write(&production, bytes).await.map_err(KronoaError::Storage)
        }
        .await;
        let _ = lease.release().await;
        result
    }

    /// `set_staging_pointer(edition)` — used for rollback (`spec.md`
    /// §4.H). The caller is responsible for choosing an edition whose
    /// references were previously established.
    #[tracing::instrument(skip(self), fields(edition))]
    pub async fn set_staging_pointer(&self, edition: EditionId) -> Result<(), KronoaError> {
        let lease = self.acquire().await?;
        let result = async {
            if !self.backend.exists(&origin_key(edition)?).await.map_err(KronoaError::Storage)?
                && edition != kronoa_error::GENESIS_EDITION
            {
                return Err(KronoaError::EditionNotFound(edition));
            }
            self.write_pointer(PointerSource::Staging.pointer_key(), edition).await
        }
        .await;
        let _ = lease.release().await;
        result
    }

    /// `reject(edition, reason)` — `spec.md` §4.H.
    #[tracing::instrument(skip(self, reason), fields(edition))]
    pub async fn reject(&self, edition: EditionId, reason: String) -> Result<(), KronoaError> {
        let lease = self.acquire().await?;
        let result = async {
            let pending_key = pending_key(edition)?;
            if !self.backend.exists(&pending_key).await.map_err(KronoaError::Storage)? {
                return Err(KronoaError::PendingNotFound(edition));
            }
            let record = RejectedRecord { edition, reason, rejected_at: Utc::now() };
            let body = Bytes::from(serde_json::to_vec(&record).expect("RejectedRecord always serializes"));
            self.backend.write(&rejected_key(edition)?, body).await.map_err(KronoaError::Storage)?;
            self.backend.delete(&pending_key).await.map_err(KronoaError::Storage)
        }
        .await;
        let _ = lease.release().await;
        result
    }

    /// `flatten(edition)` run under the lease, delegating the walk itself
    /// to [`kronoa_editions::EditionGraph::flatten`].
    #[tracing::instrument(skip(self), fields(edition))]
    pub async fn flatten(&self, edition: EditionId) -> Result<(), KronoaError> {
        let lease = self.acquire().await?;
        let result = self.graph.flatten(edition).await;
        let _ = lease.release().await;
        result
    }

    /// Best-effort iteration of `.pending/`; corrupt records are skipped
    /// rather than surfaced (`spec.md` §4.H).
    pub async fn list_pending(&self) -> Result<Vec<EditionId>, KronoaError> {
        self.list_ids(".pending/").await
    }

    /// Best-effort iteration of `.rejected/`.
    pub async fn list_rejected(&self) -> Result<Vec<EditionId>, KronoaError> {
        self.list_ids(".rejected/").await
    }

    async fn list_ids(&self, prefix: &str) -> Result<Vec<EditionId>, KronoaError> {
        let prefix_key = BackendKey::try_from(prefix)?;
        let entries = self.backend.list(&prefix_key, None).await.map_err(KronoaError::Storage)?;
        let mut ids = Vec::new();
        for entry in entries {
            let name = entry.as_str().strip_prefix(prefix).unwrap_or(entry.as_str());
            if let Some(id_str) = name.strip_suffix(".json") {
                if let Ok(id) = id_str.parse() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// `get_rejection(edition)` — corrupt records ARE surfaced here,
    /// unlike the best-effort `list_rejected` stream (`spec.md` §4.H).
    pub async fn get_rejection(&self, edition: EditionId) -> Result<RejectedRecord, KronoaError> {
        let bytes = match self.backend.read(&rejected_key(edition)?).await {
            Ok(bytes) => bytes,
            Err(kronoa_error::BackendError::NotFound(_)) => return Err(KronoaError::NotFound(format!("rejected/{edition}"))),
            Err(e) => return Err(KronoaError::Storage(e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| KronoaError::RejectedCorrupt { edition, reason: e.to_string() })
    }
}
