//! Resumable upload scenarios: signed session creation, chunked appends,
//! completion, token expiry, and cross-process lock hand-off.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use objectstack_core::{StorageError, TenantId};
use objectstack_db::LockNotifier;
use objectstack_tus::{CreateUpload, PgUploadLocker, UploadId, UploadLocker};

use crate::{chunked_stream, test_env, unique_name};

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_complete_signed_resumable_upload() {
    let Some(env) = test_env().await else { return };
    let bucket = env.create_bucket("b-2").await;
    let lifecycle = env.tus_lifecycle();
    let cancel = CancellationToken::new();

    let id = UploadId::new(TenantId::new("test-tenant"), bucket.clone(), "u/file.bin");

    // The server mints a signed token for the upload resource.
    let signer = env.storage().url_signer();
    let token = signer
        .sign_upload_url(
            &id.signed_url_resource(),
            Some("user-X".to_owned()),
            false,
            Duration::from_secs(3600),
        )
        .expect("sign");
    let verified = lifecycle
        .verify_signature(&signer, &token, &id)
        .expect("verify");
    assert_eq!(verified.owner.as_deref(), Some("user-X"));

    let total: Vec<u8> = (0..=255_u8).cycle().take(29_526).collect();
    lifecycle
        .create(
            &id,
            CreateUpload {
                declared_size: Some(total.len() as u64),
                content_type: Some("application/octet-stream".to_owned()),
                cache_control: None,
                user_metadata: None,
                owner: verified.owner.clone(),
                is_upsert: verified.upsert,
            },
            &cancel,
        )
        .await
        .expect("create session");

    // Two PATCH rounds, chunked within each.
    let (head, tail) = total.split_at(12_000);
    let info = lifecycle
        .append(&id, 0, chunked_stream(head.to_vec(), 4096), &cancel)
        .await
        .expect("first append");
    assert_eq!(info.offset, 12_000);

    let info = lifecycle
        .append(&id, 12_000, chunked_stream(tail.to_vec(), 4096), &cancel)
        .await
        .expect("final append");
    assert_eq!(info.offset, 29_526);

    // The object committed with the session's owner and size.
    let record = env
        .storage()
        .object_info(&bucket, "u/file.bin")
        .await
        .expect("find object");
    assert_eq!(record.owner.as_deref(), Some("user-X"));
    assert_eq!(record.metadata.expect("metadata")["size"], 29_526);

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_reject_expired_upload_token() {
    let Some(env) = test_env().await else { return };
    let lifecycle = env.tus_lifecycle();
    let id = UploadId::new(TenantId::new("test-tenant"), "b-2", "u/file.bin");

    let signer = env.storage().url_signer();
    let token = signer
        .sign_upload_url(&id.signed_url_resource(), None, false, Duration::ZERO)
        .expect("sign");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let result = lifecycle.verify_signature(&signer, &token, &id);
    match result {
        Err(StorageError::InvalidJwt { message }) => assert_eq!(message, "jwt expired"),
        other => panic!("expected jwt expired, got {other:?}"),
    }

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_reject_offset_mismatch() {
    let Some(env) = test_env().await else { return };
    let bucket = env.create_bucket("b-off").await;
    let lifecycle = env.tus_lifecycle();
    let cancel = CancellationToken::new();

    let id = UploadId::new(TenantId::new("test-tenant"), bucket, "f.bin");
    lifecycle
        .create(
            &id,
            CreateUpload {
                declared_size: Some(100),
                ..CreateUpload::default()
            },
            &cancel,
        )
        .await
        .expect("create");

    let result = lifecycle
        .append(&id, 50, chunked_stream(vec![0_u8; 10], 10), &cancel)
        .await;
    assert!(matches!(result, Err(StorageError::Conflict { .. })));

    env.pool_manager.stop().await;
}

/// Two independently subscribed notifiers stand in for two worker
/// processes sharing the metadata store.
#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_hand_off_lock_between_processes() {
    let Some(env) = test_env().await else { return };
    let bucket = env.create_bucket("b-lock").await;
    let id = UploadId::new(
        TenantId::new("test-tenant"),
        bucket,
        unique_name("contended"),
    );

    let notifier_a = LockNotifier::start(env.conn.pool().clone())
        .await
        .expect("notifier a");
    let notifier_b = LockNotifier::start(env.conn.pool().clone())
        .await
        .expect("notifier b");
    let locker_a = PgUploadLocker::new(env.conn.clone(), notifier_a);
    let locker_b = PgUploadLocker::new(env.conn.clone(), notifier_b);

    let cancel = CancellationToken::new();
    let lock_a = locker_a.lock(&id, &cancel).await.expect("process A locks");
    let invited = lock_a.release_requested().clone();

    // Process B starts waiting; its first failed attempt broadcasts the
    // release request.
    let id_b = id.clone();
    let waiter = tokio::spawn(async move {
        let started = std::time::Instant::now();
        let lock = locker_b
            .lock(&id_b, &CancellationToken::new())
            .await
            .expect("process B acquires after hand-off");
        (started.elapsed(), lock)
    });

    // A holds until the invitation arrives through the channel, then
    // releases cooperatively.
    tokio::time::timeout(Duration::from_secs(5), invited.cancelled())
        .await
        .expect("release request never arrived");
    let released_at = std::time::Instant::now();
    lock_a.unlock().await.expect("unlock A");

    let (_wait_time, lock_b) = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("process B starved")
        .expect("join");
    let handoff = released_at.elapsed();
    assert!(
        handoff < Duration::from_secs(1),
        "hand-off took {handoff:?} after unlock"
    );
    lock_b.unlock().await.expect("unlock B");

    env.pool_manager.stop().await;
}
