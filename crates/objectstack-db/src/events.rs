//! Lifecycle event queue and blob GC queue.
//!
//! Events are enqueued in the same transaction as the metadata change they
//! describe, so a consumer never observes one without the other. Dispatch
//! (HTTP webhooks, at-least-once, dead-letter) is an external worker; this
//! module only provides the queue operations it consumes.
//!
//! The blob GC queue carries superseded blob versions scheduled for
//! asynchronous deletion after the commit that replaced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::DbTransaction;
use crate::error::DbResult;

/// Lifecycle transition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// New object via plain or resumable upload.
    CreatedPost,
    /// Object replaced via upsert.
    CreatedPut,
    /// Object created as a copy.
    CreatedCopy,
    /// Object created as the destination of a move.
    CreatedMove,
    /// Object deleted.
    RemovedDelete,
    /// Object removed as the source of a move.
    RemovedMove,
}

impl EventKind {
    /// The wire name consumers see.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreatedPost => "ObjectCreated:Post",
            Self::CreatedPut => "ObjectCreated:Put",
            Self::CreatedCopy => "ObjectCreated:Copy",
            Self::CreatedMove => "ObjectCreated:Move",
            Self::RemovedDelete => "ObjectRemoved:Delete",
            Self::RemovedMove => "ObjectRemoved:Move",
        }
    }
}

/// Event payload; `bucket_id` names the destination for moves and copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Destination bucket of the transition.
    pub bucket_id: String,
    /// Object name.
    pub name: String,
    /// System metadata of the object after the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Tenant id, duplicated for consumers that fan out per tenant.
    pub tenant: String,
    /// Request id of the originating request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    /// The previous object state, for moves and replacements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_object: Option<serde_json::Value>,
}

/// A lifecycle event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Version of the object the event describes.
    pub version: String,
    /// Transition kind.
    pub event_type: EventKind,
    /// When the transition was applied.
    pub apply_time: DateTime<Utc>,
    /// Event payload.
    pub payload: EventPayload,
    /// Tenant id.
    pub tenant: String,
}

/// Enqueue an event in the surrounding transaction. Returns the queue row
/// id.
pub async fn enqueue(tx: &mut DbTransaction, event: &Event) -> DbResult<i64> {
    let payload = serde_json::to_value(&event.payload)
        .map_err(|e| crate::DbError::Other(sqlx::Error::Decode(e.into())))?;
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO storage_events (tenant_id, object_version, event_type, apply_time, payload) \
         VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(&event.tenant)
    .bind(&event.version)
    .bind(event.event_type.as_str())
    .bind(event.apply_time)
    .bind(payload)
    .fetch_one(&mut **tx)
    .await?;
    trace!(id = row.0, kind = event.event_type.as_str(), "enqueued lifecycle event");
    Ok(row.0)
}

/// Fetch undispatched events for the dispatch worker, oldest first, with
/// the rows locked and skipped if another worker holds them.
pub async fn take_pending(
    tx: &mut DbTransaction,
    limit: i64,
) -> DbResult<Vec<(i64, String, serde_json::Value)>> {
    let rows: Vec<(i64, String, serde_json::Value)> = sqlx::query_as(
        "SELECT id, event_type, payload FROM storage_events \
         WHERE dispatched_at IS NULL \
         ORDER BY id \
         LIMIT $1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(limit)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

/// Mark events dispatched.
pub async fn mark_dispatched(tx: &mut DbTransaction, ids: &[i64]) -> DbResult<u64> {
    let result = sqlx::query("UPDATE storage_events SET dispatched_at = now() WHERE id = ANY($1)")
        .bind(ids)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Blob GC queue
// ---------------------------------------------------------------------------

/// Schedule a physical blob key for asynchronous deletion.
///
/// Called in the transaction that supersedes (or abandons) the version, so
/// the schedule and the metadata change commit together.
pub async fn schedule_blob_deletion(
    tx: &mut DbTransaction,
    tenant_id: &str,
    physical_key: &str,
) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO blob_gc_queue (tenant_id, physical_key) VALUES ($1, $2)",
    )
    .bind(tenant_id)
    .bind(physical_key)
    .execute(&mut **tx)
    .await?;
    trace!(tenant_id, physical_key, "scheduled blob deletion");
    Ok(())
}

/// Claim due GC entries for the deletion worker.
pub async fn take_due_blob_deletions(
    tx: &mut DbTransaction,
    limit: i64,
) -> DbResult<Vec<(i64, String)>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        "DELETE FROM blob_gc_queue WHERE id IN ( \
           SELECT id FROM blob_gc_queue ORDER BY id LIMIT $1 FOR UPDATE SKIP LOCKED \
         ) RETURNING id, physical_key",
    )
    .bind(limit)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_render_event_kind_wire_names() {
        assert_eq!(EventKind::CreatedPost.as_str(), "ObjectCreated:Post");
        assert_eq!(EventKind::CreatedPut.as_str(), "ObjectCreated:Put");
        assert_eq!(EventKind::RemovedMove.as_str(), "ObjectRemoved:Move");
    }

    #[test]
    fn test_should_serialize_payload_in_camel_case() {
        let payload = EventPayload {
            bucket_id: "b-dst".to_owned(),
            name: "a/b.txt".to_owned(),
            metadata: None,
            tenant: "t1".to_owned(),
            req_id: Some("req-1".to_owned()),
            old_object: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["bucketId"], "b-dst");
        assert_eq!(json["reqId"], "req-1");
        assert!(json.get("oldObject").is_none());
    }
}
