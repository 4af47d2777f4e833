/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error taxonomy shared by every Kronoa crate.
//!
//! Kronoa groups errors by *kind* rather than by the component that raised
//! them: input validation, lookup (missing vs. corrupt), invariant
//! violations, concurrency conflicts, and transport failures. Callers that
//! want to retry should match on [`KronoaError::is_retryable`] rather than
//! on individual variants, since which failures are safely retryable is a
//! property of the taxonomy, not of any one component.

use std::fmt;

/// The edition id type used throughout the core. A plain alias rather than a
/// newtype: editions are compared and hashed as integers everywhere
/// (ancestry walks, `.origin` bodies, the `editions/.head` counter) and a
/// wrapper buys nothing but ceremony.
pub type EditionId = u64;

/// The first edition ever issued. See `spec.md` §3/§6.
pub const GENESIS_EDITION: EditionId = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum KronoaError {
    // --- input -----------------------------------------------------
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("label already in use: {0}")]
    LabelInUse(String),

    #[error("session is not in editing mode")]
    NotInEditingMode,

    #[error("session is read-only")]
    ReadOnlyMode,

    #[error("a transaction is already in progress")]
    AlreadyInTransaction,

    #[error("no transaction is in progress")]
    NotInTransaction,

    // --- lookup ------------------------------------------------------
    #[error("not found: {0}")]
    NotFound(String),

    #[error("edition not found: {0}")]
    EditionNotFound(EditionId),

    #[error("pending record not found for edition {0}")]
    PendingNotFound(EditionId),

    #[error("pending record for edition {edition} is corrupt: {reason}")]
    PendingCorrupt { edition: EditionId, reason: String },

    #[error("rejected record for edition {edition} is corrupt: {reason}")]
    RejectedCorrupt { edition: EditionId, reason: String },

    // --- invariant -----------------------------------------------------
    #[error("integrity error: expected {expected}, found {actual}")]
    IntegrityError { expected: String, actual: String },

    // --- concurrency -----------------------------------------------------
    #[error(
        "conflict detected: pending base {base} does not match current {source} pointer {current}"
    )]
    ConflictDetected {
        base: EditionId,
        current: EditionId,
        source: PointerSource,
    },

    #[error("timed out waiting for the admin lock")]
    LockTimeout,

    #[error("the admin lock lease expired or was stolen")]
    LockExpired,

    #[error("concurrent modification of {0}, retry")]
    ConcurrentModification(String),

    // --- transport -----------------------------------------------------
    #[error("storage backend error: {0}")]
    Storage(#[from] BackendError),
}

impl KronoaError {
    /// Whether a caller may safely retry the operation that produced this
    /// error, per `spec.md` §7: `concurrent-modification` and a
    /// lease expiry mid-operation are optimistically retryable;
    /// `conflict-detected` and corrupt records are definitive.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KronoaError::ConcurrentModification(_) | KronoaError::LockExpired
        )
    }
}

/// Which pointer a pending record or conflict check names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerSource {
    Staging,
    Production,
}

impl fmt::Display for PointerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerSource::Staging => write!(f, "staging"),
            PointerSource::Production => write!(f, "production"),
        }
    }
}

impl PointerSource {
    pub fn pointer_key(self) -> &'static str {
        match self {
            PointerSource::Staging => ".staging.json",
            PointerSource::Production => ".production.json",
        }
    }
}

/// Transport-level failures a [`Blobstore`](kronoa_backend) implementation
/// raises. Kept separate from [`KronoaError`] so adapter crates don't need
/// to depend on the whole taxonomy; it converts via `#[from]` at the
/// component boundary, mirroring how `fileblob`/`memblob`-local
/// `ErrorKind`s stay distinct from the higher-level `blobrepo`/
/// `mononoke_api` error enums.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("precondition failed for key {0}")]
    PreconditionFailed(String),

    #[error("concurrent modification of {0}, retry")]
    ConcurrentModification(String),

    #[error("timed out waiting for the admin lock")]
    LockTimeout,

    #[error("lock lease expired or was stolen")]
    LockExpired,

    #[error("invalid path or key: {0}")]
    InvalidPath(String),

    #[error("underlying I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("underlying transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_kinds_are_retryable() {
        assert!(KronoaError::ConcurrentModification("k".into()).is_retryable());
        assert!(KronoaError::LockExpired.is_retryable());
        assert!(!KronoaError::LockTimeout.is_retryable());
        assert!(!KronoaError::ConflictDetected {
            base: 1,
            current: 2,
            source: PointerSource::Staging,
        }
        .is_retryable());
    }

    #[test]
    fn pointer_source_keys() {
        assert_eq!(PointerSource::Staging.pointer_key(), ".staging.json");
        assert_eq!(PointerSource::Production.pointer_key(), ".production.json");
    }
}
