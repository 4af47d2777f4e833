/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Validated path and key newtypes.
//!
//! Every backend call that takes a caller-supplied name validates it first
//! through one of the two constructors here — a [`ContentPath`] for session
//! operations, a [`BackendKey`] for raw backend calls (listing prefixes,
//! metadata keys). Validation never touches the backend; a rejected
//! construction means no I/O happened, per `spec.md` §4.A.

use std::fmt;

use kronoa_error::KronoaError;

/// A slash-separated relative content path with no leading slash, no `.`/`..`
/// components, and no component beginning with `.` (the dot-prefixed
/// namespace is reserved for Kronoa's own metadata keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentPath(String);

impl ContentPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The final path component, e.g. `"post.md"` for `"articles/post.md"`.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Iterate the path's ancestor directories, most specific first, then
    /// the empty (root) directory. `"a/b/c"` yields `["a/b", "a", ""]`.
    pub fn parent_dirs(&self) -> impl Iterator<Item = &str> {
        std::iter::successors(self.0.rsplit_once('/').map(|(dir, _)| dir), |dir| {
            dir.rsplit_once('/').map(|(dir, _)| dir)
        })
        .chain(std::iter::once(""))
    }
}

impl fmt::Display for ContentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ContentPath {
    type Error = KronoaError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_segments(value, false, true)?;
        Ok(ContentPath(value.to_owned()))
    }
}

impl TryFrom<String> for ContentPath {
    type Error = KronoaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_segments(&value, false, true)?;
        Ok(ContentPath(value))
    }
}

impl AsRef<str> for ContentPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A raw backend key or listing prefix: same traversal rules as
/// [`ContentPath`], but may be empty and may end in `/` (a listing prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendKey(String);

impl BackendKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn join(&self, child: &str) -> BackendKey {
        let mut s = self.0.clone();
        if !s.is_empty() && !s.ends_with('/') {
            s.push('/');
        }
        s.push_str(child);
        BackendKey(s)
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for BackendKey {
    type Error = KronoaError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_segments(value, true, false)?;
        Ok(BackendKey(value.to_owned()))
    }
}

impl TryFrom<String> for BackendKey {
    type Error = KronoaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_segments(&value, true, false)?;
        Ok(BackendKey(value))
    }
}

/// Shared validation for both path kinds. `allow_empty_or_trailing_slash`
/// distinguishes a [`BackendKey`] (permitted empty, trailing slash allowed
/// for listing prefixes) from a [`ContentPath`] (must be non-empty, no
/// leading slash, no trailing slash). `reject_dot_components` is set only
/// for `ContentPath`: the dot-prefixed namespace (`.lock`, `.origin`,
/// `.pending/<id>.json`, ...) is reserved for Kronoa's own metadata keys,
/// which are always `BackendKey`s, never content the caller can address.
fn validate_segments(value: &str, allow_empty_or_trailing_slash: bool, reject_dot_components: bool) -> Result<(), KronoaError> {
    if value.is_empty() {
        if allow_empty_or_trailing_slash {
            return Ok(());
        }
        return Err(KronoaError::InvalidPath(value.to_owned()));
    }
    if value.starts_with('/') {
        return Err(KronoaError::InvalidPath(value.to_owned()));
    }
    if !allow_empty_or_trailing_slash && value.ends_with('/') {
        return Err(KronoaError::InvalidPath(value.to_owned()));
    }

    let trimmed = value.strip_suffix('/').unwrap_or(value);
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(KronoaError::InvalidPath(value.to_owned()));
        }
        if reject_dot_components && segment.starts_with('.') {
            return Err(KronoaError::InvalidPath(value.to_owned()));
        }
    }
    Ok(())
}
