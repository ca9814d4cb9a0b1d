//! Hierarchical path identifiers for groups, apps and pods.
//!
//! A [`PathId`] is an absolute, slash-separated path such as
//! `/prod/web/api`. Paths form the namespace tree: every run-spec and every
//! group is addressed by one, and parent/child relations follow the path
//! segments.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Absolute identifier of a group, application or pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PathId {
    segments: Vec<String>,
}

impl PathId {
    /// The root path `/`.
    pub fn root() -> Self {
        PathId { segments: Vec::new() }
    }

    /// Build a path from segments. Segments must be non-empty and must not
    /// contain slashes.
    pub fn new(segments: Vec<String>) -> Self {
        PathId { segments }
    }

    /// Parse an absolute path. A missing leading slash is accepted and
    /// treated as absolute, matching how user input is normalized at the
    /// API boundary.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let trimmed = s.trim();
        let mut segments = Vec::new();
        for part in trimmed.split('/') {
            if part.is_empty() {
                continue;
            }
            if !part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return Err(ValidationError::InvalidPath(s.to_string()));
            }
            segments.push(part.to_string());
        }
        Ok(PathId { segments })
    }

    /// Whether this is the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The final segment, i.e. the entity's own id within its parent group.
    pub fn basename(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// The parent path; the root is its own parent.
    pub fn parent(&self) -> PathId {
        if self.segments.is_empty() {
            return PathId::root();
        }
        PathId { segments: self.segments[..self.segments.len() - 1].to_vec() }
    }

    /// Append a child segment.
    pub fn join(&self, child: &str) -> PathId {
        let mut segments = self.segments.clone();
        segments.push(child.to_string());
        PathId { segments }
    }

    /// Canonicalize a possibly-relative path against `base`: `..` pops one
    /// level, `.` is dropped, and the result is absolute.
    pub fn canonicalize(s: &str, base: &PathId) -> Result<PathId, ValidationError> {
        let absolute = s.starts_with('/');
        let mut segments: Vec<String> =
            if absolute { Vec::new() } else { base.segments.clone() };
        for part in s.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                other => {
                    if !other.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                        return Err(ValidationError::InvalidPath(s.to_string()));
                    }
                    segments.push(other.to_string());
                }
            }
        }
        Ok(PathId { segments })
    }

    /// Whether `self` equals `other` or lies beneath it in the tree.
    pub fn is_under(&self, other: &PathId) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// All ancestors from the root down to (and excluding) `self`.
    pub fn ancestors(&self) -> Vec<PathId> {
        let mut out = Vec::with_capacity(self.segments.len());
        for i in 0..self.segments.len() {
            out.push(PathId { segments: self.segments[..i].to_vec() });
        }
        out
    }

    /// Filesystem- and environment-safe rendition, e.g. `/prod/web/api`
    /// becomes `prod_web_api`. Used when deriving task and instance ids.
    pub fn safe_id(&self) -> String {
        self.segments.join("_")
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl FromStr for PathId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathId::parse(s)
    }
}

impl Serialize for PathId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PathId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PathId::parse(&s).map_err(D::Error::custom)
    }
}
