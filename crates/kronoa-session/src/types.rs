use chrono::{DateTime, Utc};
use kronoa_error::{EditionId, PointerSource};
use serde::{Deserialize, Serialize};

/// The five session modes of `spec.md` §4.G.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// Read-only at the current production pointer.
    Production,
    /// Read-only at the current staging pointer.
    Staging,
    /// Read-write on a working edition identified by `.{label}.json`.
    Editing { label: String },
    /// Read-only on an edition that has been submitted and awaits review.
    Submitted,
    /// Read-only on a named edition, used to preview pending edits.
    Edition(EditionId),
}

impl SessionMode {
    pub fn is_editing(&self) -> bool {
        matches!(self, SessionMode::Editing { .. })
    }
}

/// A buffered change in an editing session's pending map. Matches
/// `spec.md` §4.G: `write(hash, size, optional bytes) | delete`; the bytes
/// are kept here so `commit` can write the object without re-hashing.
#[derive(Debug, Clone)]
pub enum PendingEntry {
    Write { hash: String, bytes: bytes::Bytes },
    Delete,
}

/// `<root>/.{label}.json` while an editor holds a label (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingRecord {
    pub edition: EditionId,
    pub base: EditionId,
    pub source: PointerSource,
}

/// `<root>/.production.json` / `<root>/.staging.json` (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointerBlob {
    pub edition: EditionId,
}

/// `<root>/.pending/<edition>.json` (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRecord {
    pub edition: EditionId,
    pub base: EditionId,
    pub source: PointerSource,
    pub label: String,
    pub message: String,
    #[serde(rename = "submittedAt")]
    pub submitted_at: DateTime<Utc>,
}

/// A `stat` result: three-valued status plus the supplemented
/// `resolved_from` provenance field (`SPEC_FULL.md` §2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatStatus {
    Exists { hash: String, size: u64, resolved_from: EditionId },
    Deleted { resolved_from: EditionId },
    NotFound,
}
