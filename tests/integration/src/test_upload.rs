//! Plain upload scenarios: create, replace via upsert, quota and MIME
//! enforcement, metadata fidelity.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use objectstack_core::StorageError;
use objectstack_storage::{PlainUpload, UploadTarget};

use crate::{byte_stream, test_env, unique_name};

fn png_upload(bucket: &str, name: &str, upsert: bool) -> PlainUpload {
    PlainUpload {
        target: UploadTarget {
            bucket_id: bucket.to_owned(),
            object_name: name.to_owned(),
            owner: None,
            is_upsert: upsert,
        },
        content_type: Some("image/png".to_owned()),
        cache_control: Some("3600".to_owned()),
        user_metadata: None,
        declared_size: None,
        req_id: Some(unique_name("req")),
    }
}

async fn event_types(env: &crate::TestEnv, bucket: &str, name: &str) -> Vec<String> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT event_type FROM storage_events \
         WHERE payload ->> 'bucketId' = $1 AND payload ->> 'name' = $2 \
         ORDER BY id",
    )
    .bind(bucket)
    .bind(name)
    .fetch_all(env.conn.pool())
    .await
    .expect("query events");
    rows.into_iter().map(|(t,)| t).collect()
}

async fn gc_entries(env: &crate::TestEnv, like: &str) -> i64 {
    let row: (i64,) =
        sqlx::query_as("SELECT count(*) FROM blob_gc_queue WHERE physical_key LIKE $1")
            .bind(format!("%{like}%"))
            .fetch_one(env.conn.pool())
            .await
            .expect("query gc queue");
    row.0
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_upload_then_replace_with_upsert() {
    let Some(env) = test_env().await else { return };
    let bucket = env.create_bucket("b-1").await;
    let uploader = env.uploader();
    let cancel = CancellationToken::new();

    // First upload: 3746 PNG bytes, cache-control 3600.
    let body: Vec<u8> = (0..=255_u8).cycle().take(3746).collect();
    let first = uploader
        .upload_new_object(
            png_upload(&bucket, "public/cat.png", false),
            byte_stream(body.clone()),
            env.options.spill_memory_limit,
            &env.options.spill_tmp_root,
            &cancel,
        )
        .await
        .expect("first upload");
    let first_version = first.version;
    let metadata = first.metadata.expect("committed metadata");
    assert_eq!(metadata["size"], 3746);
    assert_eq!(metadata["mimetype"], "image/png");
    assert_eq!(metadata["cacheControl"], "max-age=3600");

    // Replace with upsert.
    let replacement: Vec<u8> = vec![0xCC; 2048];
    let second = uploader
        .upload_new_object(
            png_upload(&bucket, "public/cat.png", true),
            byte_stream(replacement.clone()),
            env.options.spill_memory_limit,
            &env.options.spill_tmp_root,
            &cancel,
        )
        .await
        .expect("upsert upload");
    assert_ne!(second.version, first_version);
    assert_eq!(second.metadata.expect("metadata")["size"], 2048);

    // Exactly one row exists.
    let page = env
        .storage()
        .list_objects(&bucket, &objectstack_db::objects::ListOptions {
            limit: 10,
            ..Default::default()
        })
        .await
        .expect("list");
    assert_eq!(page.objects.len(), 1);

    // Lifecycle events in order, superseded blob scheduled for deletion.
    assert_eq!(
        event_types(&env, &bucket, "public/cat.png").await,
        vec!["ObjectCreated:Post", "ObjectCreated:Put"]
    );
    assert_eq!(gc_entries(&env, &first_version.to_string()).await, 1);

    // The current content reads back.
    let (record, blob) = env
        .storage()
        .read_object(&bucket, "public/cat.png", None, &cancel)
        .await
        .expect("read back");
    assert_eq!(record.version, second.version);
    let mut content = Vec::new();
    let mut stream = blob.stream;
    while let Some(chunk) = stream.next().await {
        content.extend_from_slice(&chunk.expect("stream chunk"));
    }
    assert_eq!(content, replacement);

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_match_blob_head_with_row_metadata() {
    let Some(env) = test_env().await else { return };
    let bucket = env.create_bucket("b-meta").await;
    let cancel = CancellationToken::new();

    let body: Vec<u8> = vec![0x11; 70_000];
    let record = env
        .uploader()
        .upload_new_object(
            png_upload(&bucket, "dir/large.png", false),
            byte_stream(body),
            env.options.spill_memory_limit,
            &env.options.spill_tmp_root,
            &cancel,
        )
        .await
        .expect("upload");

    let path = format!("{}/{}/dir/large.png", env.tenant.id, bucket);
    let head = env
        .blob
        .head(&path, &record.version.to_string())
        .await
        .expect("blob head");
    let metadata = record.metadata.expect("metadata");
    assert_eq!(metadata["size"], head.size);
    assert_eq!(metadata["eTag"], head.etag);

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_reject_upload_over_bucket_limit() {
    let Some(env) = test_env().await else { return };
    let storage = env.storage();
    let bucket = unique_name("b-small");
    storage
        .create_bucket(objectstack_db::buckets::NewBucket {
            id: bucket.clone(),
            name: None,
            owner: None,
            public: false,
            file_size_limit: Some(1024),
            allowed_mime_types: None,
            credential_id: None,
            bucket_type: objectstack_db::buckets::BucketType::Standard,
        })
        .await
        .expect("create bucket");

    let cancel = CancellationToken::new();
    let result = env
        .uploader()
        .upload_new_object(
            png_upload(&bucket, "too-big.png", false),
            byte_stream(vec![0_u8; 4096]),
            env.options.spill_memory_limit,
            &env.options.spill_tmp_root,
            &cancel,
        )
        .await;
    assert!(matches!(result, Err(StorageError::EntityTooLarge { .. })));

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_reject_disallowed_mime_type() {
    let Some(env) = test_env().await else { return };
    let storage = env.storage();
    let bucket = unique_name("b-mime");
    storage
        .create_bucket(objectstack_db::buckets::NewBucket {
            id: bucket.clone(),
            name: None,
            owner: None,
            public: false,
            file_size_limit: None,
            allowed_mime_types: Some(vec!["image/*".to_owned()]),
            credential_id: None,
            bucket_type: objectstack_db::buckets::BucketType::Standard,
        })
        .await
        .expect("create bucket");

    let cancel = CancellationToken::new();
    let mut upload = png_upload(&bucket, "notes.txt", false);
    upload.content_type = Some("text/plain".to_owned());
    let result = env
        .uploader()
        .upload_new_object(
            upload,
            byte_stream(b"hello".to_vec()),
            env.options.spill_memory_limit,
            &env.options.spill_tmp_root,
            &cancel,
        )
        .await;
    assert!(matches!(result, Err(StorageError::InvalidMimeType { .. })));

    env.pool_manager.stop().await;
}
