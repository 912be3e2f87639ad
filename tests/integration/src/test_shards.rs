//! Sharding allocator scenarios: capacity enforcement under concurrency,
//! idempotent reserves, confirm/cancel, and lease expiry.

use std::sync::Arc;
use std::time::Duration;

use objectstack_core::StorageError;
use objectstack_shard::{FillFirst, ReserveRequest, ShardAllocator};

use crate::{test_env, unique_name};

fn request(kind: &str, logical: &str) -> ReserveRequest {
    ReserveRequest {
        kind: kind.to_owned(),
        tenant_id: "test-tenant".to_owned(),
        bucket_name: "embeddings".to_owned(),
        logical_name: logical.to_owned(),
        lease: None,
    }
}

fn allocator(env: &crate::TestEnv) -> ShardAllocator {
    ShardAllocator::new(env.conn.clone(), Arc::new(FillFirst))
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_grant_only_remaining_capacity_under_concurrency() {
    let Some(env) = test_env().await else { return };
    let alloc = Arc::new(allocator(&env));
    let kind = unique_name("vector");

    alloc.create_shard(&kind, "s1", 3).await.expect("create shard");

    // Fill two of the three slots.
    for i in 0..2 {
        let r = alloc
            .reserve(&request(&kind, &format!("pre-{i}")))
            .await
            .expect("pre-fill reserve");
        alloc
            .confirm(r.id, &r.resource_id)
            .await
            .expect("pre-fill confirm");
    }

    // Five contenders race for the last slot.
    let mut handles = Vec::new();
    for i in 0..5 {
        let alloc = Arc::clone(&alloc);
        let kind = kind.clone();
        handles.push(tokio::spawn(async move {
            alloc.reserve(&request(&kind, &format!("contender-{i}"))).await
        }));
    }

    let mut successes = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => successes += 1,
            Err(
                StorageError::NoActiveShard { .. }
                | StorageError::NoAvailableShard { .. },
            ) => exhausted += 1,
            Err(other) => panic!("unexpected reserve failure: {other:?}"),
        }
    }
    assert_eq!(successes, 1, "exactly one contender wins the last slot");
    assert_eq!(exhausted, 4);

    let stats = alloc.shard_stats(&kind).await.expect("stats");
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].capacity, 3);
    assert_eq!(stats[0].used, 3);
    assert_eq!(stats[0].free, 0);

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_return_same_reservation_for_repeated_reserve() {
    let Some(env) = test_env().await else { return };
    let alloc = allocator(&env);
    let kind = unique_name("vector");
    alloc.create_shard(&kind, "s1", 4).await.expect("create shard");

    let first = alloc.reserve(&request(&kind, "idem")).await.expect("reserve");
    let second = alloc.reserve(&request(&kind, "idem")).await.expect("re-reserve");
    assert_eq!(first.id, second.id);
    assert_eq!(first.slot_no, second.slot_no);

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_free_slot_on_cancel_and_reuse_it() {
    let Some(env) = test_env().await else { return };
    let alloc = allocator(&env);
    let kind = unique_name("vector");
    alloc.create_shard(&kind, "s1", 2).await.expect("create shard");

    let first = alloc.reserve(&request(&kind, "short-lived")).await.expect("reserve");
    alloc.cancel(first.id).await.expect("cancel");

    // The freed slot is handed out again, lowest slot first.
    let second = alloc.reserve(&request(&kind, "replacement")).await.expect("reserve");
    assert_eq!(second.slot_no, first.slot_no);

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_expire_unconfirmed_leases() {
    let Some(env) = test_env().await else { return };
    let alloc = allocator(&env);
    let kind = unique_name("vector");
    alloc.create_shard(&kind, "s1", 2).await.expect("create shard");

    let mut req = request(&kind, "slow-client");
    req.lease = Some(Duration::from_millis(50));
    let reservation = alloc.reserve(&req).await.expect("reserve");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let expired = alloc.expire_leases().await.expect("expire sweep");
    assert!(expired >= 1);

    // Confirming the expired reservation fails...
    let confirm = alloc.confirm(reservation.id, &reservation.resource_id).await;
    assert!(matches!(confirm, Err(StorageError::ExpiredReservation { .. })));

    // ...and the resource can be reserved afresh (possibly the same slot).
    let fresh = alloc.reserve(&req).await.expect("fresh reserve");
    assert_ne!(fresh.id, reservation.id);
    alloc.confirm(fresh.id, &fresh.resource_id).await.expect("confirm");

    env.pool_manager.stop().await;
}

#[tokio::test]
#[ignore = "requires OBJECTSTACK_TEST_DATABASE_URL"]
async fn test_should_fail_without_active_shard() {
    let Some(env) = test_env().await else { return };
    let alloc = allocator(&env);
    let kind = unique_name("vector-empty");

    let result = alloc.reserve(&request(&kind, "homeless")).await;
    assert!(matches!(result, Err(StorageError::NoActiveShard { .. })));

    env.pool_manager.stop().await;
}
