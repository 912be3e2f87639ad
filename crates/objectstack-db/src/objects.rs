//! Object repository.
//!
//! Typed operations over the `objects` table: pending-row insertion for the
//! two-phase upload, commit updates, renames, guarded deletes, and the two
//! listing shapes: flat keyset pagination and delimiter ("folder")
//! listings driven by the `prefixes` table.
//!
//! Cursors are opaque base64 strings encoding `(sort_value, id)` of the
//! last returned row, so pagination is stable under concurrent inserts.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::DbTransaction;
use crate::error::{DbError, DbResult};

/// A row of the `objects` table.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    /// Surrogate id.
    pub id: Uuid,
    /// Owning bucket.
    pub bucket_id: String,
    /// Object name; unique within the bucket, may contain `/`.
    pub name: String,
    /// Current version; replaced at each completed upload.
    pub version: Uuid,
    /// Owner subject.
    pub owner: Option<String>,
    /// System metadata (`size`, `eTag`, `mimetype`, `cacheControl`,
    /// `lastModified`, `httpStatusCode`); null while an upload is pending.
    pub metadata: Option<serde_json::Value>,
    /// Opaque caller-provided metadata.
    pub user_metadata: Option<serde_json::Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Last read timestamp.
    pub last_accessed_at: DateTime<Utc>,
}

/// Sort key for flat listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortColumn {
    /// Sort by object name.
    #[default]
    Name,
    /// Sort by creation time.
    CreatedAt,
    /// Sort by last update time.
    UpdatedAt,
}

impl SortColumn {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    fn comparator(self) -> &'static str {
        match self {
            Self::Asc => ">",
            Self::Desc => "<",
        }
    }
}

/// Options for [`list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only names starting with this prefix.
    pub prefix: Option<String>,
    /// Sort key.
    pub sort_column: SortColumn,
    /// Sort direction.
    pub sort_order: SortOrder,
    /// Page size.
    pub limit: i64,
    /// Opaque cursor from the previous page.
    pub cursor: Option<String>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects on this page.
    pub objects: Vec<ObjectRecord>,
    /// Folder names (delimiter listings only).
    pub folders: Vec<String>,
    /// Whether more rows exist.
    pub has_next: bool,
    /// Cursor for the next page, when `has_next`.
    pub next_cursor: Option<String>,
}

fn from_row(row: &PgRow) -> Result<ObjectRecord, sqlx::Error> {
    Ok(ObjectRecord {
        id: row.try_get("id")?,
        bucket_id: row.try_get("bucket_id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        owner: row.try_get("owner")?,
        metadata: row.try_get("metadata")?,
        user_metadata: row.try_get("user_metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_accessed_at: row.try_get("last_accessed_at")?,
    })
}

const SELECT_COLUMNS: &str = "id, bucket_id, name, version, owner, metadata, user_metadata, created_at, updated_at, last_accessed_at";

// ---------------------------------------------------------------------------
// Point operations
// ---------------------------------------------------------------------------

/// Fetch an object by its logical key.
pub async fn find_by_name(
    tx: &mut DbTransaction,
    bucket_id: &str,
    name: &str,
) -> DbResult<Option<ObjectRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM objects WHERE bucket_id = $1 AND name = $2"
    ))
    .bind(bucket_id)
    .bind(name)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(from_row).transpose().map_err(Into::into)
}

/// Insert the pending row of a new upload. Fails with a unique violation
/// when the object already exists (the upsert path updates instead).
pub async fn insert_pending(
    tx: &mut DbTransaction,
    bucket_id: &str,
    name: &str,
    version: Uuid,
    owner: Option<&str>,
    user_metadata: Option<&serde_json::Value>,
) -> DbResult<ObjectRecord> {
    let row = sqlx::query(&format!(
        "INSERT INTO objects (bucket_id, name, version, owner, user_metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING {SELECT_COLUMNS}"
    ))
    .bind(bucket_id)
    .bind(name)
    .bind(version)
    .bind(owner)
    .bind(user_metadata)
    .fetch_one(&mut **tx)
    .await?;
    trace!(bucket_id, name, %version, "inserted pending object row");
    from_row(&row).map_err(Into::into)
}

/// Point an existing object at a new pending version (upsert path).
pub async fn update_pending_version(
    tx: &mut DbTransaction,
    bucket_id: &str,
    name: &str,
    version: Uuid,
    owner: Option<&str>,
) -> DbResult<Option<ObjectRecord>> {
    let row = sqlx::query(&format!(
        "UPDATE objects SET version = $3, owner = COALESCE($4, owner), updated_at = now() \
         WHERE bucket_id = $1 AND name = $2 \
         RETURNING {SELECT_COLUMNS}"
    ))
    .bind(bucket_id)
    .bind(name)
    .bind(version)
    .bind(owner)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(from_row).transpose().map_err(Into::into)
}

/// Commit an upload: attach system metadata to the pending version.
///
/// Matches on `(bucket, name, version)` so a concurrent re-upload that
/// already superseded this version commits nothing here.
pub async fn commit(
    tx: &mut DbTransaction,
    bucket_id: &str,
    name: &str,
    version: Uuid,
    metadata: &serde_json::Value,
    user_metadata: Option<&serde_json::Value>,
    owner: Option<&str>,
) -> DbResult<Option<ObjectRecord>> {
    let row = sqlx::query(&format!(
        "UPDATE objects SET \
           metadata = $4, \
           user_metadata = COALESCE($5, user_metadata), \
           owner = COALESCE($6, owner), \
           updated_at = now() \
         WHERE bucket_id = $1 AND name = $2 AND version = $3 \
         RETURNING {SELECT_COLUMNS}"
    ))
    .bind(bucket_id)
    .bind(name)
    .bind(version)
    .bind(metadata)
    .bind(user_metadata)
    .bind(owner)
    .fetch_optional(&mut **tx)
    .await?;
    debug!(bucket_id, name, %version, committed = row.is_some(), "committed object version");
    row.as_ref().map(from_row).transpose().map_err(Into::into)
}

/// Delete one object row. Requires the delete guard.
pub async fn delete(
    tx: &mut DbTransaction,
    bucket_id: &str,
    name: &str,
) -> DbResult<Option<ObjectRecord>> {
    let row = sqlx::query(&format!(
        "DELETE FROM objects WHERE bucket_id = $1 AND name = $2 RETURNING {SELECT_COLUMNS}"
    ))
    .bind(bucket_id)
    .bind(name)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(from_row).transpose().map_err(Into::into)
}

/// Delete many object rows. Requires the delete guard.
pub async fn delete_many(
    tx: &mut DbTransaction,
    bucket_id: &str,
    names: &[String],
) -> DbResult<Vec<ObjectRecord>> {
    let rows = sqlx::query(&format!(
        "DELETE FROM objects WHERE bucket_id = $1 AND name = ANY($2) RETURNING {SELECT_COLUMNS}"
    ))
    .bind(bucket_id)
    .bind(names)
    .fetch_all(&mut **tx)
    .await?;
    rows.iter().map(from_row).collect::<Result<_, _>>().map_err(Into::into)
}

/// Move an object to a new key (possibly across buckets), assigning a new
/// version for the destination blob.
pub async fn rename(
    tx: &mut DbTransaction,
    src_bucket: &str,
    src_name: &str,
    dst_bucket: &str,
    dst_name: &str,
    new_version: Uuid,
) -> DbResult<Option<ObjectRecord>> {
    let row = sqlx::query(&format!(
        "UPDATE objects SET bucket_id = $3, name = $4, version = $5, updated_at = now() \
         WHERE bucket_id = $1 AND name = $2 \
         RETURNING {SELECT_COLUMNS}"
    ))
    .bind(src_bucket)
    .bind(src_name)
    .bind(dst_bucket)
    .bind(dst_name)
    .bind(new_version)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(from_row).transpose().map_err(Into::into)
}

/// Bump `last_accessed_at` after a read.
pub async fn touch_last_accessed(
    tx: &mut DbTransaction,
    bucket_id: &str,
    name: &str,
) -> DbResult<()> {
    sqlx::query("UPDATE objects SET last_accessed_at = now() WHERE bucket_id = $1 AND name = $2")
        .bind(bucket_id)
        .bind(name)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// Flat keyset-paginated listing.
pub async fn list(
    tx: &mut DbTransaction,
    bucket_id: &str,
    options: &ListOptions,
) -> DbResult<ListPage> {
    let limit = options.limit.max(1);
    let col = options.sort_column.as_sql();
    let dir = options.sort_order.as_sql();
    let cmp = options.sort_order.comparator();

    let cursor = options
        .cursor
        .as_deref()
        .map(decode_cursor)
        .transpose()?;

    // The cursor predicate compares the composite (sort_key, id) so rows
    // sharing a sort value are not skipped or repeated.
    let sql = match options.sort_column {
        SortColumn::Name => format!(
            "SELECT {SELECT_COLUMNS} FROM objects \
             WHERE bucket_id = $1 \
               AND ($2::text IS NULL OR name LIKE $2 || '%') \
               AND ($3::text IS NULL OR (name, id) {cmp} ($3::text, $4::uuid)) \
             ORDER BY {col} {dir}, id {dir} LIMIT $5"
        ),
        _ => format!(
            "SELECT {SELECT_COLUMNS} FROM objects \
             WHERE bucket_id = $1 \
               AND ($2::text IS NULL OR name LIKE $2 || '%') \
               AND ($3::text IS NULL OR ({col}, id) {cmp} ($3::timestamptz, $4::uuid)) \
             ORDER BY {col} {dir}, id {dir} LIMIT $5"
        ),
    };

    let (cursor_value, cursor_id) = match &cursor {
        Some(c) => (Some(c.0.clone()), Some(c.1)),
        None => (None, None),
    };

    let rows = sqlx::query(&sql)
        .bind(bucket_id)
        .bind(options.prefix.as_deref().map(escape_like))
        .bind(cursor_value)
        .bind(cursor_id)
        .bind(limit + 1)
        .fetch_all(&mut **tx)
        .await?;

    let mut objects: Vec<ObjectRecord> = rows
        .iter()
        .map(from_row)
        .collect::<Result<_, _>>()
        .map_err(DbError::from)?;

    let has_next = objects.len() as i64 > limit;
    objects.truncate(limit as usize);

    let next_cursor = if has_next {
        objects.last().map(|last| {
            let sort_value = match options.sort_column {
                SortColumn::Name => last.name.clone(),
                SortColumn::CreatedAt => last.created_at.to_rfc3339(),
                SortColumn::UpdatedAt => last.updated_at.to_rfc3339(),
            };
            encode_cursor(&sort_value, last.id)
        })
    } else {
        None
    };

    Ok(ListPage {
        objects,
        folders: Vec::new(),
        has_next,
        next_cursor,
    })
}

/// Delimiter listing: objects directly under a prefix plus child folders
/// from the `prefixes` table, merged in name order.
pub async fn list_with_delimiter(
    tx: &mut DbTransaction,
    bucket_id: &str,
    prefix: &str,
    limit: i64,
    cursor: Option<&str>,
) -> DbResult<ListPage> {
    let limit = limit.max(1);
    let prefix = prefix.trim_end_matches('/');
    let child_level = if prefix.is_empty() {
        1
    } else {
        prefix.split('/').count() as i32 + 1
    };

    let after = cursor.map(decode_cursor).transpose()?.map(|c| c.0);

    // Objects whose remaining path after the prefix has no separator.
    let object_rows = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM objects \
         WHERE bucket_id = $1 \
           AND (($2 = '' AND strpos(name, '/') = 0) \
             OR ($2 <> '' AND substr(name, 1, char_length($2) + 1) = $2 || '/' \
                 AND strpos(substr(name, char_length($2) + 2), '/') = 0)) \
           AND ($3::text IS NULL OR name > $3) \
         ORDER BY name LIMIT $4"
    ))
    .bind(bucket_id)
    .bind(prefix)
    .bind(after.as_deref())
    .bind(limit + 1)
    .fetch_all(&mut **tx)
    .await?;

    let folder_rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM prefixes \
         WHERE bucket_id = $1 AND level = $2 \
           AND ($3 = '' OR substr(name, 1, char_length($3) + 1) = $3 || '/') \
           AND ($4::text IS NULL OR name > $4) \
         ORDER BY name LIMIT $5",
    )
    .bind(bucket_id)
    .bind(child_level)
    .bind(prefix)
    .bind(after.as_deref())
    .bind(limit + 1)
    .fetch_all(&mut **tx)
    .await?;

    let objects: Vec<ObjectRecord> = object_rows
        .iter()
        .map(from_row)
        .collect::<Result<_, _>>()
        .map_err(DbError::from)?;
    let folders: Vec<String> = folder_rows.into_iter().map(|(name,)| name).collect();

    // Merge the two name-ordered sequences and keep the first `limit`.
    let mut merged: Vec<(String, bool)> = objects
        .iter()
        .map(|o| (o.name.clone(), false))
        .chain(folders.iter().map(|f| (f.clone(), true)))
        .collect();
    merged.sort();
    let has_next = merged.len() as i64 > limit;
    merged.truncate(limit as usize);

    let kept: std::collections::HashSet<String> =
        merged.iter().map(|(name, _)| name.clone()).collect();
    let next_cursor = if has_next {
        merged
            .last()
            .map(|(name, _)| encode_cursor(name, Uuid::nil()))
    } else {
        None
    };

    Ok(ListPage {
        objects: objects
            .into_iter()
            .filter(|o| kept.contains(&o.name))
            .collect(),
        folders: folders.into_iter().filter(|f| kept.contains(f)).collect(),
        has_next,
        next_cursor,
    })
}

// ---------------------------------------------------------------------------
// Cursor codec
// ---------------------------------------------------------------------------

/// Separator between sort value and id inside a cursor.
const CURSOR_SEPARATOR: char = '\u{1f}';

/// Encode `(sort_value, id)` into an opaque cursor.
#[must_use]
pub fn encode_cursor(sort_value: &str, id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(format!("{sort_value}{CURSOR_SEPARATOR}{id}"))
}

/// Decode an opaque cursor back into `(sort_value, id)`.
pub fn decode_cursor(cursor: &str) -> DbResult<(String, Uuid)> {
    let invalid = || {
        DbError::Other(sqlx::Error::Decode(
            format!("invalid list cursor: {cursor}").into(),
        ))
    };
    let raw = URL_SAFE_NO_PAD.decode(cursor).map_err(|_| invalid())?;
    let text = String::from_utf8(raw).map_err(|_| invalid())?;
    let (value, id) = text.rsplit_once(CURSOR_SEPARATOR).ok_or_else(invalid)?;
    let id = Uuid::parse_str(id).map_err(|_| invalid())?;
    Ok((value.to_owned(), id))
}

/// Escape LIKE wildcards in a caller-provided prefix.
#[must_use]
pub fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
