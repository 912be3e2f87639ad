//! Prefix hierarchy scenarios: derived rows, concurrent cleanup, the
//! cross-prefix move deadlock case, and the direct-delete guard.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use objectstack_storage::{PlainUpload, UploadTarget};

use crate::{byte_stream, test_env};

async fn upload(env: &crate::TestEnv, bucket: &str, name: &str) {
    env.uploader()
        .upload_new_object(
            PlainUpload {
                target: UploadTarget {
                    bucket_id: bucket.to_owned(),
                    object_name: name.to_owned(),
                    owner: None,
                    is_upsert: false,
                },
                content_type: Some("application/octet-stream".to_owned()),
                cache_control: None,
                user_metadata: None,
                declared_size: None,
                req_id: None,
            },
            byte_stream(b"data".to_vec()),
            env.options.spill_memory_limit,
            &env.options.spill_tmp_root,
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|e| panic!("upload {name} failed: {e}"));
}

async fn prefix_names(env: &crate::TestEnv, bucket: &str) -> Vec<String> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM prefixes WHERE bucket_id = $1 ORDER BY name")
            .bind(bucket)
            .fetch_all(env.conn.pool())
            .await
            .expect("query prefixes");
    rows.into_iter().map(|(n,)| n).collect()
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_derive_one_prefix_row_per_ancestor() {
    let Some(env) = test_env().await else { return };
    let bucket = env.create_bucket("b-pfx").await;

    upload(&env, &bucket, "a/b/c/f.txt").await;
    upload(&env, &bucket, "a/b/g.txt").await;
    upload(&env, &bucket, "root.txt").await;

    assert_eq!(prefix_names(&env, &bucket).await, vec!["a", "a/b", "a/b/c"]);

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_clean_all_prefixes_under_concurrent_deletes() {
    let Some(env) = test_env().await else { return };
    let bucket = env.create_bucket("b-race").await;

    let names = ["a/b/c/f1", "a/b/c/f2", "a/b/c/f3", "a/b/c/f4"];
    for name in names {
        upload(&env, &bucket, name).await;
    }

    // Delete all four concurrently.
    let mut handles = Vec::new();
    for name in names {
        let storage = env.storage();
        let bucket = bucket.clone();
        handles.push(tokio::spawn(async move {
            storage.delete_object(&bucket, name, None).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("delete");
    }

    // All rows gone, zero prefixes remain.
    let remaining: (i64,) = sqlx::query_as("SELECT count(*) FROM objects WHERE bucket_id = $1")
        .bind(&bucket)
        .fetch_one(env.conn.pool())
        .await
        .expect("count objects");
    assert_eq!(remaining.0, 0);
    assert!(prefix_names(&env, &bucket).await.is_empty());

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_survive_opposite_direction_moves_without_deadlock() {
    let Some(env) = test_env().await else { return };
    let bucket = env.create_bucket("b-moves").await;

    for i in 1..=4 {
        upload(&env, &bucket, &format!("photos/p{i}.jpg")).await;
        upload(&env, &bucket, &format!("docs/d{i}.pdf")).await;
    }

    // Four moves in each direction, all at once.
    let mut handles = Vec::new();
    for i in 1..=4 {
        let storage = env.storage();
        let b = bucket.clone();
        handles.push(tokio::spawn(async move {
            storage
                .move_object(
                    &b,
                    &format!("photos/p{i}.jpg"),
                    &b,
                    &format!("docs/moved-p{i}.jpg"),
                    None,
                    &CancellationToken::new(),
                )
                .await
        }));
        let storage = env.storage();
        let b = bucket.clone();
        handles.push(tokio::spawn(async move {
            storage
                .move_object(
                    &b,
                    &format!("docs/d{i}.pdf"),
                    &b,
                    &format!("photos/moved-d{i}.pdf"),
                    None,
                    &CancellationToken::new(),
                )
                .await
        }));
    }

    let all = futures::future::join_all(handles);
    let results = tokio::time::timeout(Duration::from_secs(5), all)
        .await
        .expect("moves deadlocked");
    for result in results {
        result.expect("join").expect("move");
    }

    // Each top-level prefix retained content, so both still exist.
    let prefixes = prefix_names(&env, &bucket).await;
    assert!(prefixes.contains(&"photos".to_owned()));
    assert!(prefixes.contains(&"docs".to_owned()));

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_block_direct_delete_without_guard() {
    let Some(env) = test_env().await else { return };
    let bucket = env.create_bucket("b-guard").await;
    upload(&env, &bucket, "protected.txt").await;

    let mut tx = env.conn.transaction().await.expect("begin");
    let result = sqlx::query("DELETE FROM objects WHERE bucket_id = $1")
        .bind(&bucket)
        .execute(&mut *tx)
        .await;

    let err = result.expect_err("direct delete must be refused");
    match err {
        sqlx::Error::Database(db) => {
            assert_eq!(db.code().as_deref(), Some("42501"));
        }
        other => panic!("unexpected error: {other}"),
    }

    env.pool_manager.stop().await;
}
