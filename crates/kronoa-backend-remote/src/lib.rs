/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! HTTP blob-service [`Blobstore`] adapter (`spec.md` §4.D).
//!
//! `spec.md` §1 keeps the concrete wire protocol of a cloud blob service out
//! of scope — only its abstract capability set (conditional PUT via ETag /
//! If-None-Match, paginated prefix listing) is specified. This adapter
//! therefore targets a small generic HTTP blob API (`GET`/`PUT`/`HEAD`/
//! `DELETE` on `<base>/<key>`, `GET <base>/?prefix=&delimiter=&continuation-token=`
//! for listing) rather than a vendor SDK, in the spirit of the pack's
//! HTTP-over-object-store adapters (`yoshidan-google-cloud-rust`'s
//! `storage::http` module) without adopting a vendor-specific schema.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kronoa_backend::{Blobstore, ETag, ListEntry, Precondition};
use kronoa_error::BackendError;
use kronoa_path::BackendKey;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

/// Exponential backoff schedule for retrying a `concurrent-modification`
/// signal, per `spec.md` §4.B: 50, 100, 200, 400, 800 ms, up to five
/// attempts.
pub const RETRY_BACKOFF_MS: [u64; 5] = [50, 100, 200, 400, 800];

#[derive(Debug, Deserialize)]
struct ListPage {
    keys: Vec<String>,
    #[serde(default)]
    common_prefixes: Vec<String>,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

/// A `Blobstore` over a generic HTTP blob service.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: Client,
    base_url: Url,
}

impl RemoteBackend {
    pub fn new(base_url: Url) -> Result<Self, BackendError> {
        let client = Client::builder()
            .build()
            .map_err(|e| BackendError::Transport(e.into()))?;
        Ok(Self { client, base_url })
    }

    pub fn with_client(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn url_for(&self, key: &BackendKey) -> Url {
        // `Url::join` treats a leading `/` on the child as absolute, so we
        // always join against a base that itself ends in `/`.
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(key.as_str()).expect("key is validated, ASCII-safe")
    }

    fn etag_from_headers(resp: &reqwest::Response) -> Option<ETag> {
        resp.headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| ETag(s.trim_matches('"').to_owned()))
    }
}

#[async_trait]
impl Blobstore for RemoteBackend {
    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn read(&self, key: &BackendKey) -> Result<Bytes, BackendError> {
        let resp = self
            .client
            .get(self.url_for(key))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.into()))?;
        match resp.status() {
            StatusCode::OK => resp
                .bytes()
                .await
                .map_err(|e| BackendError::Transport(e.into())),
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(key.to_string())),
            other => Err(BackendError::Transport(anyhow::anyhow!(
                "unexpected status {other} reading {key}"
            ))),
        }
    }

    async fn read_with_etag(&self, key: &BackendKey) -> Result<(Bytes, Option<ETag>), BackendError> {
        let resp = self
            .client
            .get(self.url_for(key))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.into()))?;
        match resp.status() {
            StatusCode::OK => {
                let etag = Self::etag_from_headers(&resp);
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| BackendError::Transport(e.into()))?;
                Ok((bytes, etag))
            }
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(key.to_string())),
            other => Err(BackendError::Transport(anyhow::anyhow!(
                "unexpected status {other} reading {key}"
            ))),
        }
    }

    #[tracing::instrument(skip(self, value), fields(key = %key))]
    async fn write(&self, key: &BackendKey, value: Bytes) -> Result<(), BackendError> {
        let resp = self
            .client
            .put(self.url_for(key))
            .body(value)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.into()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Transport(anyhow::anyhow!(
                "unexpected status {} writing {key}",
                resp.status()
            )))
        }
    }

    #[tracing::instrument(skip(self, value), fields(key = %key))]
    async fn create_if_absent(&self, key: &BackendKey, value: Bytes) -> Result<bool, BackendError> {
        match self
            .conditional_write(key, Precondition::IfAbsent, value)
            .await
        {
            Ok(_) => Ok(true),
            Err(BackendError::PreconditionFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &BackendKey) -> Result<(), BackendError> {
        let resp = self
            .client
            .delete(self.url_for(key))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.into()))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(key.to_string())),
            other => Err(BackendError::Transport(anyhow::anyhow!(
                "unexpected status {other} deleting {key}"
            ))),
        }
    }

    async fn exists(&self, key: &BackendKey) -> Result<bool, BackendError> {
        let resp = self
            .client
            .head(self.url_for(key))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.into()))?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(BackendError::Transport(anyhow::anyhow!(
                "unexpected status {other} checking {key}"
            ))),
        }
    }

    /// Pagination is followed via `next_continuation_token` until the
    /// backend stops returning one; results are sorted before returning,
    /// per `spec.md` §4.D.
    async fn list(
        &self,
        prefix: &BackendKey,
        delimiter: Option<char>,
    ) -> Result<Vec<ListEntry>, BackendError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .get(self.base_url.clone())
                .query(&[("prefix", prefix.as_str())]);
            if let Some(delim) = delimiter {
                req = req.query(&[("delimiter", delim.to_string())]);
            }
            if let Some(token) = &continuation {
                req = req.query(&[("continuation-token", token.as_str())]);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| BackendError::Transport(e.into()))?;
            if !resp.status().is_success() {
                return Err(BackendError::Transport(anyhow::anyhow!(
                    "unexpected status {} listing {prefix}",
                    resp.status()
                )));
            }
            let page: ListPage = resp
                .json()
                .await
                .map_err(|e| BackendError::Transport(e.into()))?;
            keys.extend(page.keys.into_iter().map(ListEntry::Key));
            keys.extend(page.common_prefixes.into_iter().map(ListEntry::CommonPrefix));
            match page.next_continuation_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        keys.dedup();
        Ok(keys)
    }

    /// Implemented as GET-with-ETag then PUT-with-If-Match, retrying with
    /// the schedule in [`RETRY_BACKOFF_MS`] on precondition failure, per
    /// `spec.md` §4.D. When the backend omits an ETag on a GET, this falls
    /// back to an unconditional PUT — a known consistency hazard (`spec.md`
    /// §9) that callers running against such a backend must accept.
    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn atomic_increment(&self, key: &BackendKey, initial: i64) -> Result<i64, BackendError> {
        for (attempt, backoff_ms) in RETRY_BACKOFF_MS.iter().enumerate() {
            match self.read_with_etag(key).await {
                Err(BackendError::NotFound(_)) => {
                    match self
                        .conditional_write(key, Precondition::IfAbsent, Bytes::from(initial.to_string()))
                        .await
                    {
                        Ok(_) => return Ok(initial),
                        Err(BackendError::PreconditionFailed(_)) => {
                            tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
                Ok((bytes, etag)) => {
                    let current: i64 = std::str::from_utf8(&bytes)
                        .ok()
                        .and_then(|s| s.trim().parse().ok())
                        .ok_or_else(|| {
                            BackendError::Transport(anyhow::anyhow!("corrupt counter at {key}"))
                        })?;
                    let next = current + 1;
                    let write_result = match etag {
                        Some(etag) => {
                            self.conditional_write(key, Precondition::IfMatch(etag), Bytes::from(next.to_string()))
                                .await
                        }
                        None => {
                            // No ETag support: fall back to an unconditional
                            // write (spec.md §4.D/§9 consistency hazard).
                            self.write(key, Bytes::from(next.to_string())).await.map(|_| ETag(String::new()))
                        }
                    };
                    match write_result {
                        Ok(_) => return Ok(next),
                        Err(BackendError::PreconditionFailed(_)) => {
                            tracing::debug!(attempt, "atomic_increment precondition failed, retrying");
                            tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Err(BackendError::ConcurrentModification(key.to_string()))
    }

    #[tracing::instrument(skip(self, value), fields(key = %key))]
    async fn conditional_write(
        &self,
        key: &BackendKey,
        precondition: Precondition,
        value: Bytes,
    ) -> Result<ETag, BackendError> {
        let mut req = self.client.put(self.url_for(key));
        req = match &precondition {
            Precondition::IfAbsent => req.header(reqwest::header::IF_NONE_MATCH, "*"),
            Precondition::IfMatch(etag) => {
                req.header(reqwest::header::IF_MATCH, format!("\"{}\"", etag.0))
            }
        };
        let resp = req
            .body(value)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.into()))?;
        match resp.status() {
            s if s.is_success() => {
                Ok(Self::etag_from_headers(&resp).unwrap_or_else(|| ETag(String::new())))
            }
            StatusCode::PRECONDITION_FAILED => Err(BackendError::PreconditionFailed(key.to_string())),
            other => Err(BackendError::Transport(anyhow::anyhow!(
                "unexpected status {other} writing {key} conditionally"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_for_joins_key_under_base() {
        let backend = RemoteBackend::new(Url::parse("https://blobs.example/root").unwrap()).unwrap();
        let key = BackendKey::try_from("editions/10001/.origin").unwrap();
        let url = backend.url_for(&key);
        assert_eq!(url.as_str(), "https://blobs.example/root/editions/10001/.origin");
    }

    #[test]
    fn retry_backoff_matches_spec_schedule() {
        assert_eq!(RETRY_BACKOFF_MS, [50, 100, 200, 400, 800]);
    }
}
