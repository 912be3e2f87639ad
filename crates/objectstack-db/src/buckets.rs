//! Bucket repository.
//!
//! Typed operations over the `buckets` table. All functions execute inside
//! a caller-provided transaction so authorization scope and event emission
//! compose with the surrounding operation.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::debug;

use crate::DbTransaction;
use crate::error::DbResult;

/// Bucket kind; immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketType {
    /// Plain object storage.
    Standard,
    /// Table-format (warehouse) bucket placed via the sharding allocator.
    Analytics,
    /// Vector-index bucket placed via the sharding allocator.
    Vector,
}

impl BucketType {
    /// Stable string form stored in the `type` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Analytics => "analytics",
            Self::Vector => "vector",
        }
    }

    /// Parse the stored string form; unknown values fall back to standard.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "analytics" => Self::Analytics,
            "vector" => Self::Vector,
            _ => Self::Standard,
        }
    }
}

/// A row of the `buckets` table.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// Tenant-unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owner subject, when created by an authenticated user.
    pub owner: Option<String>,
    /// Whether unauthenticated reads are allowed.
    pub public: bool,
    /// Per-bucket upload ceiling in bytes.
    pub file_size_limit: Option<i64>,
    /// MIME allow list (`*/*`, `type/*`, or exact types).
    pub allowed_mime_types: Option<Vec<String>>,
    /// Reference to an external credential, for buckets on foreign stores.
    pub credential_id: Option<String>,
    /// Bucket kind; immutable.
    pub bucket_type: BucketType,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted at bucket creation.
#[derive(Debug, Clone)]
pub struct NewBucket {
    /// Tenant-unique identifier.
    pub id: String,
    /// Display name; defaults to the id.
    pub name: Option<String>,
    /// Owner subject.
    pub owner: Option<String>,
    /// Public visibility.
    pub public: bool,
    /// Per-bucket upload ceiling.
    pub file_size_limit: Option<i64>,
    /// MIME allow list.
    pub allowed_mime_types: Option<Vec<String>>,
    /// External credential reference.
    pub credential_id: Option<String>,
    /// Bucket kind.
    pub bucket_type: BucketType,
}

/// Mutable bucket fields (`id` and `type` are immutable).
#[derive(Debug, Clone, Default)]
pub struct BucketUpdate {
    /// New visibility, when changing.
    pub public: Option<bool>,
    /// New size ceiling; `Some(None)` clears it.
    pub file_size_limit: Option<Option<i64>>,
    /// New MIME allow list; `Some(None)` clears it.
    pub allowed_mime_types: Option<Option<Vec<String>>>,
}

fn from_row(row: &PgRow) -> Result<Bucket, sqlx::Error> {
    Ok(Bucket {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner: row.try_get("owner")?,
        public: row.try_get("public")?,
        file_size_limit: row.try_get("file_size_limit")?,
        allowed_mime_types: row.try_get("allowed_mime_types")?,
        credential_id: row.try_get("credential_id")?,
        bucket_type: BucketType::from_str_lossy(row.try_get::<String, _>("type")?.as_str()),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SELECT_COLUMNS: &str = "id, name, owner, public, file_size_limit, allowed_mime_types, credential_id, type, created_at, updated_at";

/// Insert a bucket.
pub async fn create(tx: &mut DbTransaction, bucket: &NewBucket) -> DbResult<Bucket> {
    let row = sqlx::query(
        "INSERT INTO buckets (id, name, owner, public, file_size_limit, allowed_mime_types, credential_id, type) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING id, name, owner, public, file_size_limit, allowed_mime_types, credential_id, type, created_at, updated_at",
    )
    .bind(&bucket.id)
    .bind(bucket.name.as_deref().unwrap_or(&bucket.id))
    .bind(&bucket.owner)
    .bind(bucket.public)
    .bind(bucket.file_size_limit)
    .bind(&bucket.allowed_mime_types)
    .bind(&bucket.credential_id)
    .bind(bucket.bucket_type.as_str())
    .fetch_one(&mut **tx)
    .await?;

    debug!(bucket = bucket.id, "created bucket");
    from_row(&row).map_err(Into::into)
}

/// Fetch a bucket by id.
pub async fn get(tx: &mut DbTransaction, id: &str) -> DbResult<Option<Bucket>> {
    let row = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM buckets WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(from_row).transpose().map_err(Into::into)
}

/// List buckets ordered by id.
pub async fn list(tx: &mut DbTransaction, limit: i64, offset: i64) -> DbResult<Vec<Bucket>> {
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM buckets ORDER BY id LIMIT $1 OFFSET $2"
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(&mut **tx)
    .await?;
    rows.iter().map(from_row).collect::<Result<_, _>>().map_err(Into::into)
}

/// Apply mutable field changes; returns the updated row.
pub async fn update(
    tx: &mut DbTransaction,
    id: &str,
    changes: &BucketUpdate,
) -> DbResult<Option<Bucket>> {
    let row = sqlx::query(
        "UPDATE buckets SET \
           public = COALESCE($2, public), \
           file_size_limit = CASE WHEN $3 THEN $4 ELSE file_size_limit END, \
           allowed_mime_types = CASE WHEN $5 THEN $6 ELSE allowed_mime_types END, \
           updated_at = now() \
         WHERE id = $1 \
         RETURNING id, name, owner, public, file_size_limit, allowed_mime_types, credential_id, type, created_at, updated_at",
    )
    .bind(id)
    .bind(changes.public)
    .bind(changes.file_size_limit.is_some())
    .bind(changes.file_size_limit.flatten())
    .bind(changes.allowed_mime_types.is_some())
    .bind(changes.allowed_mime_types.clone().flatten())
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(from_row).transpose().map_err(Into::into)
}

/// Delete a bucket row. The caller must have enabled the delete guard and
/// verified emptiness.
pub async fn delete(tx: &mut DbTransaction, id: &str) -> DbResult<bool> {
    let result = sqlx::query("DELETE FROM buckets WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Count objects currently in a bucket.
pub async fn count_objects(tx: &mut DbTransaction, bucket_id: &str) -> DbResult<i64> {
    let row: (i64,) = sqlx::query_as("SELECT count(*) FROM objects WHERE bucket_id = $1")
        .bind(bucket_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_round_trip_bucket_type_strings() {
        for t in [BucketType::Standard, BucketType::Analytics, BucketType::Vector] {
            assert_eq!(BucketType::from_str_lossy(t.as_str()), t);
        }
        assert_eq!(BucketType::from_str_lossy("weird"), BucketType::Standard);
    }
}
