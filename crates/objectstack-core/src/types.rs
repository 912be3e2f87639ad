//! Shared identifier and path types.

use serde::{Deserialize, Serialize};

/// Identifier of a tenant.
///
/// Single-tenant deployments use a fixed id from configuration; multi-tenant
/// deployments resolve it per request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Wrap a raw tenant id string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Logical location of an object's bytes at the blob backend.
///
/// The backend key is `{tenant}/{bucket}/{name}`; the physical key appends
/// the version as a final segment. Every committed object row references a
/// blob stored at its versioned key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath {
    /// The owning tenant.
    pub tenant_id: TenantId,
    /// The bucket id (tenant-unique).
    pub bucket_id: String,
    /// The object name; may contain `/`.
    pub name: String,
}

impl ObjectPath {
    /// Build a path from its parts.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<TenantId>,
        bucket_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            bucket_id: bucket_id.into(),
            name: name.into(),
        }
    }

    /// The unversioned backend key `{tenant}/{bucket}/{name}`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.tenant_id, self.bucket_id, self.name)
    }

    /// The physical backend key `{tenant}/{bucket}/{name}/{version}`.
    #[must_use]
    pub fn versioned_key(&self, version: &str) -> String {
        format!("{}/{version}", self.key())
    }
}

impl std::fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// A half-open byte range `[start, end)` for partial reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset, inclusive.
    pub start: u64,
    /// One past the last byte offset.
    pub end: u64,
}

impl ByteRange {
    /// Build a range, rejecting empty or inverted bounds.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Number of bytes covered.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers zero bytes. Always false for a constructed
    /// range; present for completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Render as an HTTP `Range` header value (`bytes=start-endInclusive`).
    #[must_use]
    pub fn to_http_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

/// Split an object name into its path tokens.
///
/// Mirrors the `path_tokens` column of the `objects` table: the name split
/// on `/`. Root-level names yield a single token.
#[must_use]
pub fn path_tokens(name: &str) -> Vec<&str> {
    name.split('/').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_build_versioned_backend_key() {
        let path = ObjectPath::new("t1", "avatars", "users/42/pic.png");
        assert_eq!(path.key(), "t1/avatars/users/42/pic.png");
        assert_eq!(
            path.versioned_key("v-abc"),
            "t1/avatars/users/42/pic.png/v-abc"
        );
    }

    #[test]
    fn test_should_reject_inverted_byte_range() {
        assert!(ByteRange::new(10, 10).is_none());
        assert!(ByteRange::new(11, 10).is_none());
        let r = ByteRange::new(0, 100).unwrap();
        assert_eq!(r.len(), 100);
        assert_eq!(r.to_http_header(), "bytes=0-99");
    }

    #[test]
    fn test_should_split_path_tokens() {
        assert_eq!(path_tokens("a/b/c.txt"), vec!["a", "b", "c.txt"]);
        assert_eq!(path_tokens("root.txt"), vec!["root.txt"]);
    }
}
