use std::fmt;

/// Whether a `put_explicit` call should overwrite an existing value or
/// refuse to. Named and shaped after the `PutBehaviour` enum in
/// `eden/mononoke/blobstore`'s test doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutBehaviour {
    Overwrite,
    IfAbsent,
}

/// Outcome of a `put_explicit` call, mirroring
/// `eden/mononoke/blobstore::OverwriteStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteStatus {
    /// The backend did not check for a prior value (an unconditional
    /// `Overwrite` put).
    NotChecked,
    /// No prior value existed; the new value was written.
    Created,
    /// A prior value existed and `IfAbsent` was requested, so nothing was
    /// written.
    Prevented,
}

/// One entry of a `list` call. When a delimiter was supplied, common
/// prefixes (subdirectories) and leaf keys are distinguished; without a
/// delimiter every entry is a `Key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    Key(String),
    CommonPrefix(String),
}

impl ListEntry {
    pub fn as_str(&self) -> &str {
        match self {
            ListEntry::Key(s) => s,
            ListEntry::CommonPrefix(s) => s,
        }
    }

    pub fn is_common_prefix(&self) -> bool {
        matches!(self, ListEntry::CommonPrefix(_))
    }
}

impl fmt::Display for ListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque version token returned by backends that support conditional
/// writes (the cloud adapter's ETag; the local adapter's mtime+size pair
/// encoded as a string).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ETag(pub String);

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The precondition attached to a [`Blobstore::conditional_write`] call,
/// matching the cloud adapter's `If-None-Match: *` / `If-Match: <etag>`
/// usage described in `spec.md` §4.D/§5.
#[derive(Debug, Clone)]
pub enum Precondition {
    /// `If-None-Match: *` — succeed only if the key does not yet exist.
    IfAbsent,
    /// `If-Match: <etag>` — succeed only if the current value's ETag
    /// matches exactly.
    IfMatch(ETag),
}
