use std::sync::Arc;
use std::time::Duration as StdDuration;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kronoa_backend::{Blobstore, ETag, Precondition};
use kronoa_error::KronoaError;
use kronoa_path::BackendKey;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

const POLL_INTERVAL: StdDuration = StdDuration::from_millis(100);

/// The `.lock` blob body (`spec.md` §3/§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockBlob {
    owner: String,
    #[serde(rename = "acquiredAt")]
    acquired_at: DateTime<Utc>,
    #[serde(rename = "expiresAt")]
    expires_at: DateTime<Utc>,
}

/// Which side of the exclusive lock this handle currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Acquiring,
    Held,
    Expired,
    Released,
}

fn random_owner() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A held (or formerly held) exclusive lease over a single `.lock` key,
/// implemented over [`Blobstore::create_if_absent`] and
/// [`Blobstore::conditional_write`] only, per `spec.md` §4.J — the backend
/// contract does not grow a dedicated `acquire_lock` method.
pub struct Lease {
    backend: Arc<dyn Blobstore>,
    clock: Arc<dyn Clock>,
    key: BackendKey,
    owner: String,
    lease_duration: ChronoDuration,
    etag: Option<ETag>,
    expires_at: DateTime<Utc>,
    state: LeaseState,
}

impl Lease {
    /// Acquire the lease at `key`, polling every 100 ms until either it
    /// succeeds or `wait` elapses (`spec.md` §5's acquire loop).
    #[tracing::instrument(skip(backend, clock), fields(key = %key))]
    pub async fn acquire(
        backend: Arc<dyn Blobstore>,
        clock: Arc<dyn Clock>,
        key: BackendKey,
        wait: StdDuration,
        lease_duration: StdDuration,
    ) -> Result<Lease, KronoaError> {
        let owner = random_owner();
        let lease_duration = ChronoDuration::from_std(lease_duration)
            .map_err(|_| KronoaError::InvalidPath("lease duration out of range".into()))?;
        let deadline = clock.now() + ChronoDuration::from_std(wait)
            .map_err(|_| KronoaError::InvalidPath("wait budget out of range".into()))?;

        loop {
            let now = clock.now();
            let blob = LockBlob {
                owner: owner.clone(),
                acquired_at: now,
                expires_at: now + lease_duration,
            };
            let body = Bytes::from(serde_json::to_vec(&blob).expect("LockBlob always serializes"));

            match backend.create_if_absent(&key, body.clone()).await {
                Ok(true) => {
                    tracing::debug!(owner = %owner, "lease acquired");
                    return Ok(Lease {
                        backend,
                        clock,
                        key,
                        owner,
                        lease_duration,
                        etag: None,
                        expires_at: blob.expires_at,
                        state: LeaseState::Held,
                    });
                }
                Ok(false) => {
                    // Someone else holds the key; inspect it for expiry.
                    match backend.read(&key).await {
                        Ok(existing) => {
                            let existing: LockBlob = serde_json::from_slice(&existing)
                                .map_err(|_| KronoaError::IntegrityError {
                                    expected: "lock blob JSON".into(),
                                    actual: "malformed lock blob".into(),
                                })?;
                            if existing.expires_at < clock.now() {
                                // Stale lease: steal it by deleting, then retry.
                                let _ = backend.delete(&key).await;
                                continue;
                            }
                        }
                        Err(_) => {
                            // Raced with a concurrent release; retry immediately.
                            continue;
                        }
                    }
                }
                Err(e) => return Err(KronoaError::Storage(e)),
            }

            if clock.now() >= deadline {
                return Err(KronoaError::LockTimeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Extend the lease monotonically: the new `expiresAt` is
    /// `max(current expiresAt, now) + lease_duration`, matching `spec.md`
    /// §5's renew rule. Any mismatch (owner changed, blob gone, the
    /// conditional write lost a race) downgrades the handle to
    /// [`LeaseState::Expired`] and returns `KronoaError::LockExpired`.
    #[tracing::instrument(skip(self), fields(key = %self.key, owner = %self.owner))]
    pub async fn renew(&mut self) -> Result<(), KronoaError> {
        if self.state != LeaseState::Held {
            return Err(KronoaError::LockExpired);
        }
        let (bytes, etag) = match self.backend.read_with_etag(&self.key).await {
            Ok(pair) => pair,
            Err(_) => {
                self.state = LeaseState::Expired;
                return Err(KronoaError::LockExpired);
            }
        };
        let current: LockBlob = match serde_json::from_slice(&bytes) {
            Ok(b) => b,
            Err(_) => {
                self.state = LeaseState::Expired;
                return Err(KronoaError::LockExpired);
            }
        };
        if current.owner != self.owner {
            self.state = LeaseState::Expired;
            return Err(KronoaError::LockExpired);
        }

        let now = self.clock.now();
        let new_expiry = std::cmp::max(current.expires_at, now) + self.lease_duration;
        let next = LockBlob {
            owner: self.owner.clone(),
            acquired_at: current.acquired_at,
            expires_at: new_expiry,
        };
        let body = Bytes::from(serde_json::to_vec(&next).expect("LockBlob always serializes"));

        let precondition = match etag {
            Some(etag) => Precondition::IfMatch(etag),
            None => {
                // Backend doesn't track ETags (e.g. the local adapter under
                // single-process use); fall back to an unconditional write.
                self.backend
                    .write(&self.key, body)
                    .await
                    .map_err(KronoaError::Storage)?;
                self.expires_at = new_expiry;
                return Ok(());
            }
        };

        match self.backend.conditional_write(&self.key, precondition, body).await {
            Ok(new_etag) => {
                self.etag = Some(new_etag);
                self.expires_at = new_expiry;
                Ok(())
            }
            Err(_) => {
                self.state = LeaseState::Expired;
                Err(KronoaError::LockExpired)
            }
        }
    }

    /// Release the lease. Succeeds only if the blob still names this
    /// owner; otherwise the lease had already expired or was stolen, and
    /// this returns `KronoaError::LockExpired` without touching the blob.
    #[tracing::instrument(skip(self), fields(key = %self.key, owner = %self.owner))]
    pub async fn release(mut self) -> Result<(), KronoaError> {
        if self.state != LeaseState::Held {
            return Err(KronoaError::LockExpired);
        }
        let current = self
            .backend
            .read(&self.key)
            .await
            .map_err(|_| KronoaError::LockExpired)?;
        let current: LockBlob = serde_json::from_slice(&current).map_err(|_| KronoaError::LockExpired)?;
        if current.owner != self.owner {
            self.state = LeaseState::Expired;
            return Err(KronoaError::LockExpired);
        }
        self.backend
            .delete(&self.key)
            .await
            .map_err(KronoaError::Storage)?;
        self.state = LeaseState::Released;
        Ok(())
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}
