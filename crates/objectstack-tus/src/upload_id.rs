//! Resumable upload identifiers.
//!
//! An upload id is `{tenant}/{bucket}/{objectName}/{version}`: the tenant
//! is the first segment, the version the last, and the object name keeps
//! every `/` in between. In URLs the id travels base64url-encoded.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use uuid::Uuid;

use objectstack_core::{StorageError, StorageResult, TenantId};

/// Decoded resumable upload identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadId {
    /// The owning tenant.
    pub tenant_id: TenantId,
    /// Destination bucket.
    pub bucket_id: String,
    /// Destination object name; may contain `/`.
    pub object_name: String,
    /// The version minted for this upload session.
    pub version: Uuid,
}

impl UploadId {
    /// Mint an id for a new upload session.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        bucket_id: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            bucket_id: bucket_id.into(),
            object_name: object_name.into(),
            version: Uuid::new_v4(),
        }
    }

    /// The raw `{tenant}/{bucket}/{objectName}/{version}` form.
    #[must_use]
    pub fn as_raw(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.tenant_id, self.bucket_id, self.object_name, self.version
        )
    }

    /// The base64url form used in URLs.
    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.as_raw())
    }

    /// Decode the base64url wire form.
    pub fn decode(encoded: &str) -> StorageResult<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| invalid(encoded))?;
        let raw = String::from_utf8(raw).map_err(|_| invalid(encoded))?;
        Self::parse_raw(&raw)
    }

    /// Parse the raw slash-separated form.
    ///
    /// The tenant is the prefix, the version the suffix; everything in
    /// between after the bucket belongs to the object name.
    pub fn parse_raw(raw: &str) -> StorageResult<Self> {
        let (head, version) = raw.rsplit_once('/').ok_or_else(|| invalid(raw))?;
        let version = Uuid::parse_str(version).map_err(|_| invalid(raw))?;

        let mut segments = head.splitn(3, '/');
        let (Some(tenant), Some(bucket), Some(name)) =
            (segments.next(), segments.next(), segments.next())
        else {
            return Err(invalid(raw));
        };
        if tenant.is_empty() || bucket.is_empty() || name.is_empty() {
            return Err(invalid(raw));
        }

        Ok(Self {
            tenant_id: TenantId::new(tenant),
            bucket_id: bucket.to_owned(),
            object_name: name.to_owned(),
            version,
        })
    }

    /// The blob key of the lock object guarding this id.
    #[must_use]
    pub fn lock_key(&self) -> String {
        format!("__tus_locks/{}/{}.lock", self.tenant_id, self.encode())
    }

    /// The blob key of the persisted upload info.
    #[must_use]
    pub fn info_key(&self) -> String {
        format!("__tus_info/{}/{}.info", self.tenant_id, self.encode())
    }

    /// The resource path signed upload tokens pin
    /// (`bucket/objectName`).
    #[must_use]
    pub fn signed_url_resource(&self) -> String {
        format!("{}/{}", self.bucket_id, self.object_name)
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_raw())
    }
}

fn invalid(raw: &str) -> StorageError {
    StorageError::InvalidParameter {
        message: format!("malformed upload id: {raw}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_round_trip_id_with_nested_name() {
        let id = UploadId::new(TenantId::new("t1"), "b-2", "u/deep/file.bin");
        let decoded = UploadId::decode(&id.encode()).unwrap();
        assert_eq!(decoded, id);
        assert_eq!(decoded.object_name, "u/deep/file.bin");
    }

    #[test]
    fn test_should_parse_raw_form() {
        let version = Uuid::new_v4();
        let raw = format!("tenant-a/bucket-b/dir/sub/name.png/{version}");
        let id = UploadId::parse_raw(&raw).unwrap();
        assert_eq!(id.tenant_id.as_str(), "tenant-a");
        assert_eq!(id.bucket_id, "bucket-b");
        assert_eq!(id.object_name, "dir/sub/name.png");
        assert_eq!(id.version, version);
    }

    #[test]
    fn test_should_reject_malformed_ids() {
        assert!(UploadId::parse_raw("no-separators").is_err());
        assert!(UploadId::parse_raw("t/b/name/not-a-uuid").is_err());
        let version = Uuid::new_v4();
        assert!(UploadId::parse_raw(&format!("t/b/{version}")).is_err());
        assert!(UploadId::decode("!!!").is_err());
    }

    #[test]
    fn test_should_build_control_object_keys() {
        let id = UploadId::new(TenantId::new("t1"), "b", "f.bin");
        assert!(id.lock_key().starts_with("__tus_locks/t1/"));
        assert!(id.lock_key().ends_with(".lock"));
        assert!(id.info_key().starts_with("__tus_info/t1/"));
        assert_eq!(id.signed_url_resource(), "b/f.bin");
    }
}
