//! Prefix hierarchy maintenance.
//!
//! The `prefixes` table is derived state: a row `(bucket, p, level)` exists
//! iff at least one object or child prefix lies beneath `p`. Insertion-side
//! maintenance runs in a trigger (see the migrations); this module carries
//! the deletion side, which cannot be a per-row trigger because correctness
//! under concurrent batches requires a globally consistent locking order.
//!
//! Cleanup works bottom-up, one level at a time:
//!
//! 1. Row-lock the candidate prefixes of the level in `(bucket_id, name)`
//!    order. Concurrent cleanups and opposite-direction moves take locks in
//!    the same order, so they cannot deadlock.
//! 2. Delete each candidate only if, under its row lock, it has zero child
//!    objects and zero child prefixes. An object inserted between the check
//!    and the delete makes the count non-zero and the prefix survives.
//! 3. Parents of deleted prefixes become the next level's candidates.
//!    Levels are finite, so the recursion terminates.
//!
//! Child matching compares `substr(name, 1, len+1) = prefix || '/'` rather
//! than `LIKE`, so a prefix `a/b/c` never captures a sibling `a/b/cd`.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::DbTransaction;
use crate::error::DbResult;

/// Proper ancestor prefixes of an object name, shallowest first.
///
/// `a/b/c/f.txt` yields `["a", "a/b", "a/b/c"]`; root-level names yield
/// nothing.
#[must_use]
pub fn ancestors(name: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut end = 0_usize;
    for (idx, ch) in name.char_indices() {
        if ch == '/' {
            if idx > end {
                out.push(name[..idx].to_owned());
            }
            end = idx + 1;
        }
    }
    out
}

/// Number of `/`-separated segments in a prefix name.
#[must_use]
pub fn level(name: &str) -> i32 {
    name.split('/').count() as i32
}

/// Ensure every ancestor prefix of `name` exists.
///
/// Insertion order is shallowest-first and `ON CONFLICT DO NOTHING`, so
/// concurrent inserts of sibling objects are safe.
pub async fn ensure_for_object(
    tx: &mut DbTransaction,
    bucket_id: &str,
    name: &str,
) -> DbResult<()> {
    let ancestors = ancestors(name);
    if ancestors.is_empty() {
        return Ok(());
    }

    for prefix in &ancestors {
        sqlx::query(
            "INSERT INTO prefixes (bucket_id, name, level) VALUES ($1, $2, $3) \
             ON CONFLICT (bucket_id, name) DO NOTHING",
        )
        .bind(bucket_id)
        .bind(prefix)
        .bind(level(prefix))
        .execute(&mut **tx)
        .await?;
    }
    trace!(bucket_id, name, count = ancestors.len(), "ensured ancestor prefixes");
    Ok(())
}

/// Remove now-empty ancestor prefixes of the given deleted object names.
///
/// Returns the number of prefix rows deleted.
pub async fn cleanup_after_delete(
    tx: &mut DbTransaction,
    bucket_id: &str,
    deleted_names: &[String],
) -> DbResult<u64> {
    // Candidate set: the deepest ancestor of each deleted name.
    let mut by_level: std::collections::BTreeMap<i32, BTreeSet<String>> = Default::default();
    for name in deleted_names {
        if let Some(deepest) = ancestors(name).pop() {
            by_level.entry(level(&deepest)).or_default().insert(deepest);
        }
    }
    let Some(mut current_level) = by_level.keys().next_back().copied() else {
        return Ok(0);
    };

    let mut deleted_total = 0_u64;
    while current_level >= 1 {
        let candidates: BTreeSet<String> = by_level.remove(&current_level).unwrap_or_default();
        if candidates.is_empty() {
            current_level -= 1;
            continue;
        }

        let names: Vec<String> = candidates.into_iter().collect();

        // Lock candidates in (bucket_id, name) order before deciding their
        // fate; the ORDER BY makes the acquisition order global.
        sqlx::query(
            "SELECT 1 FROM prefixes \
             WHERE bucket_id = $1 AND name = ANY($2) \
             ORDER BY bucket_id, name \
             FOR UPDATE",
        )
        .bind(bucket_id)
        .bind(&names)
        .fetch_all(&mut **tx)
        .await?;

        // Count-then-delete under the row locks.
        let deleted: Vec<(String,)> = sqlx::query_as(
            "DELETE FROM prefixes p \
             WHERE p.bucket_id = $1 AND p.name = ANY($2) \
               AND NOT EXISTS ( \
                 SELECT 1 FROM objects o \
                 WHERE o.bucket_id = p.bucket_id \
                   AND substr(o.name, 1, char_length(p.name) + 1) = p.name || '/') \
               AND NOT EXISTS ( \
                 SELECT 1 FROM prefixes c \
                 WHERE c.bucket_id = p.bucket_id \
                   AND c.level = p.level + 1 \
                   AND substr(c.name, 1, char_length(p.name) + 1) = p.name || '/') \
             RETURNING p.name",
        )
        .bind(bucket_id)
        .bind(&names)
        .fetch_all(&mut **tx)
        .await?;

        deleted_total += deleted.len() as u64;

        // Parents of what was deleted are the next level's candidates.
        let mut parents = BTreeSet::new();
        for (name,) in &deleted {
            if let Some((parent, _)) = name.rsplit_once('/') {
                parents.insert(parent.to_owned());
            }
        }
        current_level -= 1;
        if !parents.is_empty() {
            by_level.entry(current_level).or_default().extend(parents);
        }
    }

    debug!(bucket_id, deleted = deleted_total, "cleaned up empty prefixes");
    Ok(deleted_total)
}

/// Search prefixes below `prefix` (direct children), name-ordered.
pub async fn search_children(
    tx: &mut DbTransaction,
    bucket_id: &str,
    prefix: &str,
    limit: i64,
) -> DbResult<Vec<String>> {
    let prefix = prefix.trim_end_matches('/');
    let child_level = if prefix.is_empty() {
        1
    } else {
        level(prefix) + 1
    };

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM prefixes \
         WHERE bucket_id = $1 AND level = $2 \
           AND ($3 = '' OR substr(name, 1, char_length($3) + 1) = $3 || '/') \
         ORDER BY name LIMIT $4",
    )
    .bind(bucket_id)
    .bind(child_level)
    .bind(prefix)
    .bind(limit)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Whether a prefix row exists.
pub async fn exists(tx: &mut DbTransaction, bucket_id: &str, name: &str) -> DbResult<bool> {
    let row: Option<(i32,)> =
        sqlx::query_as("SELECT 1 FROM prefixes WHERE bucket_id = $1 AND name = $2")
            .bind(bucket_id)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_compute_ancestors_shallowest_first() {
        assert_eq!(ancestors("a/b/c/f.txt"), vec!["a", "a/b", "a/b/c"]);
        assert_eq!(ancestors("a/f.txt"), vec!["a"]);
        assert!(ancestors("root.txt").is_empty());
    }

    #[test]
    fn test_should_ignore_duplicate_separators() {
        // "a//b/f" has an empty middle segment; its ancestors skip the
        // degenerate empty-name prefix.
        assert_eq!(ancestors("a//b/f"), vec!["a", "a//b"]);
    }

    #[test]
    fn test_should_count_levels() {
        assert_eq!(level("a"), 1);
        assert_eq!(level("a/b/c"), 3);
    }
}
