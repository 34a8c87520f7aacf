//! Hierarchical run-spec identifiers.
//!
//! An [`AppPath`] is an absolute, forward-slash delimited path such as
//! `/payments/api`. Paths are cheap to clone, totally ordered, and
//! serialize as plain strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing an [`AppPath`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path must not be empty")]
    Empty,

    #[error("path must be absolute (start with '/'): {0}")]
    NotAbsolute(String),

    #[error("path contains an empty segment: {0}")]
    EmptySegment(String),
}

/// Absolute identifier of a run spec or group, e.g. `/payments/api`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppPath(String);

impl AppPath {
    /// The root path `/`.
    pub fn root() -> Self {
        AppPath("/".to_string())
    }

    /// Parse an absolute path, rejecting empty or malformed input.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        if !raw.starts_with('/') {
            return Err(PathError::NotAbsolute(raw.to_string()));
        }
        if raw == "/" {
            return Ok(Self::root());
        }
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        if trimmed[1..].split('/').any(str::is_empty) {
            return Err(PathError::EmptySegment(raw.to_string()));
        }
        Ok(AppPath(trimmed.to_string()))
    }

    /// True for the root path `/`.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments, root-first. Empty for the root path.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// The parent path; the root is its own parent.
    pub fn parent(&self) -> AppPath {
        match self.0.rfind('/') {
            Some(0) | None => AppPath::root(),
            Some(idx) => AppPath(self.0[..idx].to_string()),
        }
    }

    /// Append a segment, producing a child path.
    pub fn join(&self, segment: &str) -> AppPath {
        if self.is_root() {
            AppPath(format!("/{segment}"))
        } else {
            AppPath(format!("{}/{segment}", self.0))
        }
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AppPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppPath::parse(s)
    }
}

impl TryFrom<String> for AppPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AppPath::parse(&value)
    }
}

impl From<AppPath> for String {
    fn from(path: AppPath) -> String {
        path.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_absolute_paths() {
        let path = AppPath::parse("/foo/bar").unwrap();
        assert_eq!(path.as_str(), "/foo/bar");
        assert_eq!(path.segments().collect::<Vec<_>>(), vec!["foo", "bar"]);
    }

    #[test]
    fn parse_strips_trailing_slash() {
        let path = AppPath::parse("/foo/").unwrap();
        assert_eq!(path.as_str(), "/foo");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(AppPath::parse(""), Err(PathError::Empty));
        assert!(matches!(
            AppPath::parse("foo/bar"),
            Err(PathError::NotAbsolute(_))
        ));
        assert!(matches!(
            AppPath::parse("/foo//bar"),
            Err(PathError::EmptySegment(_))
        ));
    }

    #[test]
    fn root_round_trip() {
        let root = AppPath::parse("/").unwrap();
        assert!(root.is_root());
        assert_eq!(root.segments().count(), 0);
        assert_eq!(root.parent(), root);
    }

    #[test]
    fn parent_and_join() {
        let path = AppPath::parse("/a/b/c").unwrap();
        assert_eq!(path.parent().as_str(), "/a/b");
        assert_eq!(path.parent().parent().as_str(), "/a");
        assert_eq!(path.parent().parent().parent(), AppPath::root());
        assert_eq!(AppPath::root().join("x").as_str(), "/x");
        assert_eq!(path.join("d").as_str(), "/a/b/c/d");
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = AppPath::parse("/a").unwrap();
        let b = AppPath::parse("/b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn serde_round_trip() {
        let path = AppPath::parse("/foo/bar").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"/foo/bar\"");
        let back: AppPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }

    #[test]
    fn serde_rejects_invalid() {
        let result: Result<AppPath, _> = serde_json::from_str("\"not-absolute\"");
        assert!(result.is_err());
    }
}
