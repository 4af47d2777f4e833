/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Repository facade (`spec.md` §6's "recognised configuration").
//!
//! Wires the object store, edition graph, session engine, publish
//! pipeline and garbage collector over a single shared [`Blobstore`],
//! the way the top-level `repo`/`blobrepo` crate composes its
//! `changesets`/`bonsai_hg_mapping`/`filenodes` layers into one handle
//! callers actually construct.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kronoa_backend::Blobstore;
use kronoa_editions::EditionGraph;
use kronoa_error::{EditionId, KronoaError, PointerSource, GENESIS_EDITION};
use kronoa_gc::{Collector, GcReport};
use kronoa_lock::{Clock, SystemClock};
use kronoa_objectstore::ObjectStore;
use kronoa_path::BackendKey;
use kronoa_publish::{Publisher, RejectedRecord};
use kronoa_session::{ReadonlyOpen, Session};

/// `spec.md` §6 default lock wait budget (30 s) and lease length (60 s).
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// A fully wired Kronoa repository over one backend.
#[derive(Clone)]
pub struct Repository {
    backend: Arc<dyn Blobstore>,
    objects: ObjectStore,
    graph: EditionGraph,
    publisher: Arc<Publisher>,
    gc: Arc<Collector>,
}

impl Repository {
    /// Wire a repository with the system clock and `spec.md` §6's default
    /// durations.
    pub fn new(backend: Arc<dyn Blobstore>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock), DEFAULT_LOCK_WAIT, DEFAULT_LEASE_DURATION)
    }

    /// Wire a repository with an injectable clock and explicit durations,
    /// for tests that need to fast-forward lease expiry.
    pub fn with_clock(
        backend: Arc<dyn Blobstore>,
        clock: Arc<dyn Clock>,
        wait: Duration,
        lease_duration: Duration,
    ) -> Self {
        let objects = ObjectStore::new(backend.clone());
        let graph = EditionGraph::new(backend.clone(), objects.clone());
        let publisher = Arc::new(Publisher::new(
            backend.clone(),
            objects.clone(),
            graph.clone(),
            clock.clone(),
            wait,
            lease_duration,
        ));
        let gc = Arc::new(Collector::new(backend.clone(), objects.clone(), graph.clone(), clock, wait, lease_duration));
        Self { backend, objects, graph, publisher, gc }
    }

    /// Bootstrap an empty backend: point `.production.json`/`.staging.json`
    /// at the genesis edition and seed the `editions/.head` counter so the
    /// first `checkout` allocates 10001, not a collision with genesis. A
    /// no-op against an already-initialised root.
    #[tracing::instrument(skip(self))]
    pub async fn init_genesis(&self) -> Result<(), KronoaError> {
        let body = Bytes::from(format!(r#"{{"edition":{GENESIS_EDITION}}}"#));
        for key in [PointerSource::Production.pointer_key(), PointerSource::Staging.pointer_key()] {
            let key = BackendKey::try_from(key)?;
            self.backend.create_if_absent(&key, body.clone()).await.map_err(KronoaError::Storage)?;
        }
        let head_key = BackendKey::try_from("editions/.head")?;
        self.backend
            .create_if_absent(&head_key, Bytes::from(GENESIS_EDITION.to_string()))
            .await
            .map_err(KronoaError::Storage)?;
        Ok(())
    }

    /// The shared backend this repository is wired over, for callers that
    /// need to seed or inspect raw keys outside the session/publish API
    /// (tests, migrations).
    pub fn backend(&self) -> &Arc<dyn Blobstore> {
        &self.backend
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn graph(&self) -> &EditionGraph {
        &self.graph
    }

    /// `Checkout(label, source)` — see [`kronoa_session::Session::checkout`].
    pub async fn checkout(&self, label: &str, source: PointerSource) -> Result<Session, KronoaError> {
        Session::checkout(self.backend.clone(), self.objects.clone(), self.graph.clone(), label, source).await
    }

    pub async fn open_readonly(&self, mode: ReadonlyOpen) -> Result<Session, KronoaError> {
        Session::open_readonly(self.backend.clone(), self.objects.clone(), self.graph.clone(), mode).await
    }

    pub async fn stage(&self, edition: EditionId) -> Result<(), KronoaError> {
        self.publisher.stage(edition).await
    }

    pub async fn deploy(&self) -> Result<(), KronoaError> {
        self.publisher.deploy().await
    }

    pub async fn set_staging_pointer(&self, edition: EditionId) -> Result<(), KronoaError> {
        self.publisher.set_staging_pointer(edition).await
    }

    pub async fn reject(&self, edition: EditionId, reason: String) -> Result<(), KronoaError> {
        self.publisher.reject(edition, reason).await
    }

    pub async fn flatten(&self, edition: EditionId) -> Result<(), KronoaError> {
        self.publisher.flatten(edition).await
    }

    pub async fn list_pending(&self) -> Result<Vec<EditionId>, KronoaError> {
        self.publisher.list_pending().await
    }

    pub async fn list_rejected(&self) -> Result<Vec<EditionId>, KronoaError> {
        self.publisher.list_rejected().await
    }

    pub async fn get_rejection(&self, edition: EditionId) -> Result<RejectedRecord, KronoaError> {
        self.publisher.get_rejection(edition).await
    }

    /// Run a dry-run garbage-collection sweep (`spec.md` §4.I).
    pub async fn gc(&self) -> Result<GcReport, KronoaError> {
        self.gc.run().await
    }
}

#[cfg(test)]
mod tests {
    use kronoa_backend::MemoryBackend;
    use kronoa_path::ContentPath;

    use super::*;

    #[tokio::test]
    async fn init_genesis_is_idempotent() {
        let repo = Repository::new(Arc::new(MemoryBackend::new()));
        repo.init_genesis().await.unwrap();
        repo.init_genesis().await.unwrap();
        let session = repo.open_readonly(ReadonlyOpen::Production).await.unwrap();
        assert_eq!(session.edition(), GENESIS_EDITION);
    }

    #[tokio::test]
    async fn checkout_stage_deploy_round_trip() {
        let repo = Repository::new(Arc::new(MemoryBackend::new()));
        repo.init_genesis().await.unwrap();

        let mut session = repo.checkout("alice", PointerSource::Staging).await.unwrap();
        let path = ContentPath::try_from("hello.txt").unwrap();
        session.write(path.clone(), Bytes::from("hi")).await.unwrap();
        let edition = session.edition();
        session.submit("say hi".into()).await.unwrap();

        repo.stage(edition).await.unwrap();
        repo.deploy().await.unwrap();

        let prod = repo.open_readonly(ReadonlyOpen::Production).await.unwrap();
        assert_eq!(prod.read(&path).await.unwrap(), Bytes::from("hi"));
    }
}
