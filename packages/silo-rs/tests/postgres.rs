//! Integration tests for the PostgreSQL backend.
//!
//! These exercise the same semantics the in-memory oracle pins down,
//! plus the behaviors only a real database shows: skip-locked claiming
//! under concurrency, ownership-gated updates across sessions, and the
//! unique-constraint dedup path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use silo::{
    Backend, GetTimeout, Message, PutRecord, Queue, QueueConfig, SiloError, HASH_SIZE,
    MAX_PAYLOAD_SIZE,
};
use tokio::time::sleep;

fn record(payload: &[u8], topic: i64) -> PutRecord {
    PutRecord::new(payload.to_vec(), topic)
}

fn hashed(payload: &[u8], topic: i64, seed: u8) -> PutRecord {
    let mut hash = vec![0u8; HASH_SIZE];
    hash[0] = seed;
    PutRecord::with_hash(payload.to_vec(), topic, hash)
}

#[tokio::test]
async fn put_then_get_then_empty() {
    let (_, backend) = common::fresh_backend("put_get").await;

    let inserted = backend
        .batch_put(vec![record(b"a", 1)], 0, 0, 0, 100, None)
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let got = backend.batch_get(1, 1, 100).await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, b"a");

    assert!(backend.batch_get(1, 1, 100).await.unwrap().is_empty());
}

#[tokio::test]
async fn create_is_idempotent() {
    let (_, backend) = common::fresh_backend("idempotent").await;
    backend.create().await.unwrap();

    backend
        .batch_put(vec![record(b"x", 1)], 0, 0, 0, 100, None)
        .await
        .unwrap();
    backend.create().await.unwrap();
    assert_eq!(backend.get_topic_size(1).await.unwrap(), 1);

    backend.destroy().await.unwrap();
    backend.destroy().await.unwrap();
}

#[tokio::test]
async fn higher_priority_delivered_first() {
    let (_, backend) = common::fresh_backend("priority").await;

    backend
        .batch_put(vec![record(b"a", 1)], 0, 0, 0, 100, None)
        .await
        .unwrap();
    backend
        .batch_put(vec![record(b"b", 1)], 1, 0, 0, 100, None)
        .await
        .unwrap();

    let got = backend.batch_get(1, 1, 100).await.unwrap();
    assert_eq!(got[0].payload, b"b");
}

#[tokio::test]
async fn same_priority_is_fifo() {
    let (_, backend) = common::fresh_backend("fifo").await;

    backend
        .batch_put(
            vec![record(b"first", 1), record(b"second", 1)],
            0,
            0,
            0,
            100,
            None,
        )
        .await
        .unwrap();

    let got = backend.batch_get(1, 2, 100).await.unwrap();
    assert_eq!(got[0].payload, b"first");
    assert_eq!(got[1].payload, b"second");
}

#[tokio::test]
async fn visibility_timeout_reclaim() {
    let (_, backend) = common::fresh_backend("reclaim").await;

    backend
        .batch_put(vec![record(b"stall", 1)], 0, 0, 0, 100, None)
        .await
        .unwrap();

    let got = backend.batch_get(1, 1, 0).await.unwrap();
    assert_eq!(got.len(), 1);
    assert!(backend.batch_get(1, 1, 0).await.unwrap().is_empty());

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(backend.release_stalled_messages().await.unwrap(), 1);

    let again = backend.batch_get(1, 1, 100).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].payload, b"stall");
}

#[tokio::test]
async fn live_leases_are_not_reclaimed() {
    let (_, backend) = common::fresh_backend("live_lease").await;

    backend
        .batch_put(vec![record(b"held", 1)], 0, 0, 0, 100, None)
        .await
        .unwrap();
    backend.batch_get(1, 1, 100).await.unwrap();

    assert_eq!(backend.release_stalled_messages().await.unwrap(), 0);
}

#[tokio::test]
async fn stalled_release_carries_no_backoff_penalty() {
    let (_, backend) = common::fresh_backend("no_penalty").await;

    // Base delay of 60s would hide the message for a minute if the sweep
    // were a nack.
    backend
        .batch_put(vec![record(b"crash", 1)], 0, 0, 60, 100, None)
        .await
        .unwrap();

    backend.batch_get(1, 1, 0).await.unwrap();
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(backend.release_stalled_messages().await.unwrap(), 1);

    let got = backend.batch_get(1, 1, 100).await.unwrap();
    assert_eq!(got.len(), 1);
}

#[tokio::test]
async fn touch_extends_the_lease() {
    let (_, backend) = common::fresh_backend("touch").await;

    backend
        .batch_put(vec![record(b"held", 1)], 0, 0, 0, 100, None)
        .await
        .unwrap();
    let got = backend.batch_get(1, 1, 1).await.unwrap();

    sleep(Duration::from_millis(700)).await;
    backend.batch_touch(&[got[0].id], 100).await.unwrap();
    sleep(Duration::from_millis(700)).await;

    assert_eq!(backend.release_stalled_messages().await.unwrap(), 0);
}

#[tokio::test]
async fn ack_deletes_and_frees_the_dedup_key() {
    let (_, backend) = common::fresh_backend("ack_dedup").await;

    assert_eq!(
        backend
            .batch_put(vec![hashed(b"", 1, 1)], 0, 0, 0, 100, None)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        backend
            .batch_put(vec![hashed(b"", 1, 1)], 0, 0, 0, 100, None)
            .await
            .unwrap(),
        0
    );
    assert_eq!(backend.get_topic_size(1).await.unwrap(), 1);

    let got = backend.batch_get(1, 1, 100).await.unwrap();
    backend.ack(got[0].id).await.unwrap();

    assert_eq!(backend.get_topic_size(1).await.unwrap(), 0);
    assert_eq!(
        backend
            .batch_put(vec![hashed(b"", 1, 1)], 0, 0, 0, 100, None)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn dedup_applies_within_a_single_batch() {
    let (_, backend) = common::fresh_backend("batch_dedup").await;

    let inserted = backend
        .batch_put(
            vec![hashed(b"x", 1, 7), hashed(b"x", 1, 7), record(b"y", 1)],
            0,
            0,
            0,
            100,
            None,
        )
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    // Same hash under a different topic is a different dedup key.
    let inserted = backend
        .batch_put(vec![hashed(b"x", 2, 7)], 0, 0, 0, 100, None)
        .await
        .unwrap();
    assert_eq!(inserted, 1);
}

#[tokio::test]
async fn ack_of_unleased_row_is_a_silent_noop() {
    let (_, backend) = common::fresh_backend("ack_noop").await;

    backend
        .batch_put(vec![record(b"keep", 1)], 0, 0, 0, 100, None)
        .await
        .unwrap();
    let got = backend.batch_get(1, 1, 100).await.unwrap();
    let id = got[0].id;

    backend.batch_nack(&[id]).await.unwrap();

    // Unleased again: ack must not delete, and unknown ids are ignored.
    backend.ack(id).await.unwrap();
    backend.ack(999_999).await.unwrap();
    assert_eq!(backend.get_topic_size(1).await.unwrap(), 1);
}

#[tokio::test]
async fn nack_applies_exponential_backoff() {
    let (_, backend) = common::fresh_backend("backoff").await;

    backend
        .batch_put(vec![record(b"retry", 1)], 0, 0, 1, 100, None)
        .await
        .unwrap();

    let got = backend.batch_get(1, 1, 100).await.unwrap();
    backend.batch_nack(&[got[0].id]).await.unwrap();

    // First nack: 1 * 2^0 = 1 second.
    assert!(backend.batch_get(1, 1, 100).await.unwrap().is_empty());
    sleep(Duration::from_millis(1300)).await;

    let got = backend.batch_get(1, 1, 100).await.unwrap();
    assert_eq!(got.len(), 1);
    backend.batch_nack(&[got[0].id]).await.unwrap();

    // Second nack: 1 * 2^1 = 2 seconds.
    sleep(Duration::from_millis(1300)).await;
    assert!(backend.batch_get(1, 1, 100).await.unwrap().is_empty());
    sleep(Duration::from_millis(1000)).await;
    assert_eq!(backend.batch_get(1, 1, 100).await.unwrap().len(), 1);
}

#[tokio::test]
async fn delayed_messages_wait_for_their_delivery_time() {
    let (_, backend) = common::fresh_backend("delay").await;

    backend
        .batch_put(vec![record(b"later", 1)], 0, 1, 0, 100, None)
        .await
        .unwrap();

    assert!(backend.batch_get(1, 1, 100).await.unwrap().is_empty());
    assert_eq!(backend.get_topic_size(1).await.unwrap(), 0);

    sleep(Duration::from_millis(1300)).await;
    assert_eq!(backend.batch_get(1, 1, 100).await.unwrap().len(), 1);
}

#[tokio::test]
async fn list_topics_counts_only_deliverable() {
    let (_, backend) = common::fresh_backend("topics").await;

    backend
        .batch_put(
            vec![record(b"a", 1), record(b"b", 1), record(b"c", 2)],
            0,
            0,
            0,
            100,
            None,
        )
        .await
        .unwrap();
    backend
        .batch_put(vec![record(b"future", 3)], 0, 600, 0, 100, None)
        .await
        .unwrap();
    backend.batch_get(1, 1, 100).await.unwrap();

    let topics = backend.list_topics().await.unwrap();
    assert_eq!(topics, vec![(1, 1), (2, 1)]);
    assert_eq!(backend.get_topic_size(1).await.unwrap(), 1);
    assert_eq!(backend.get_topic_size(3).await.unwrap(), 0);
}

#[tokio::test]
async fn validation_rejects_bad_input_without_side_effects() {
    let (_, backend) = common::fresh_backend("validation").await;

    let bad_hash = PutRecord::with_hash(b"x".to_vec(), 1, vec![0u8; 3]);
    let result = backend
        .batch_put(vec![record(b"ok", 1), bad_hash], 0, 0, 0, 100, None)
        .await;
    assert!(matches!(result, Err(SiloError::InvalidArgument(_))));

    let oversized = record(&vec![0u8; MAX_PAYLOAD_SIZE + 1], 1);
    let result = backend
        .batch_put(vec![record(b"ok", 1), oversized], 0, 0, 0, 100, None)
        .await;
    assert!(matches!(result, Err(SiloError::InvalidArgument(_))));

    assert_eq!(backend.get_topic_size(1).await.unwrap(), 0);

    let max_sized = record(&vec![0u8; MAX_PAYLOAD_SIZE], 1);
    assert_eq!(
        backend
            .batch_put(vec![max_sized], 0, 0, 0, 100, None)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_claimers_receive_disjoint_rows() {
    let (prefix, backend_a) = common::fresh_backend("contention").await;
    let backend_b = common::session(&prefix).await;

    let records = (0..10).map(|i| record(&[i as u8], 1)).collect();
    backend_a
        .batch_put(records, 0, 0, 0, 100, None)
        .await
        .unwrap();

    let claim_a = {
        let backend = backend_a.clone();
        tokio::spawn(async move { backend.batch_get(1, 5, 100).await })
    };
    let claim_b = {
        let backend = backend_b.clone();
        tokio::spawn(async move { backend.batch_get(1, 5, 100).await })
    };

    let got_a = claim_a.await.unwrap().unwrap();
    let got_b = claim_b.await.unwrap().unwrap();

    assert_eq!(got_a.len() + got_b.len(), 10);
    let mut ids: Vec<i64> = got_a.iter().chain(got_b.iter()).map(|d| d.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 10, "a row was claimed twice");
}

#[tokio::test]
async fn stale_session_cannot_disturb_a_reclaimed_message() {
    let (prefix, session_a) = common::fresh_backend("stale_owner").await;
    let session_b = common::session(&prefix).await;

    session_a
        .batch_put(vec![hashed(b"m", 1, 3)], 0, 0, 60, 100, None)
        .await
        .unwrap();

    // A's lease expires; the sweep reclaims; B re-leases.
    let got_a = session_a.batch_get(1, 1, 0).await.unwrap();
    let id = got_a[0].id;
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(session_a.release_stalled_messages().await.unwrap(), 1);
    let got_b = session_b.batch_get(1, 1, 100).await.unwrap();
    assert_eq!(got_b[0].id, id);

    // A's stale nack and touch are no-ops against B's lease.
    session_a.batch_nack(&[id]).await.unwrap();
    session_a.batch_touch(&[id], 600).await.unwrap();
    assert_eq!(session_a.get_topic_size(1).await.unwrap(), 0);

    // B still owns the message: its ack deletes the row and frees the
    // dedup key. Had A's nack stripped B's lease, the ack would no-op
    // and this re-put would be skipped.
    session_b.ack(id).await.unwrap();
    assert_eq!(
        session_b
            .batch_put(vec![hashed(b"m", 1, 3)], 0, 0, 60, 100, None)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn topic_locks_are_exclusive_across_sessions() {
    let (prefix, session_a) = common::fresh_backend("topic_lock").await;
    let session_b = common::session(&prefix).await;

    session_a
        .batch_put(vec![record(b"a", 1), record(b"b", 2)], 0, 0, 0, 100, None)
        .await
        .unwrap();

    let first = session_a.acquire_topic(100).await.unwrap();
    let second = session_b.acquire_topic(100).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_some());
    assert_ne!(first, second);
    assert!(session_b.acquire_topic(100).await.unwrap().is_none());

    session_a
        .batch_release_topic(&[first.unwrap()])
        .await
        .unwrap();
    assert_eq!(session_b.acquire_topic(100).await.unwrap(), first);
}

#[tokio::test]
async fn expired_topic_locks_are_reclaimable() {
    let (_, backend) = common::fresh_backend("lock_expiry").await;

    backend
        .batch_put(vec![record(b"a", 1)], 0, 0, 0, 100, None)
        .await
        .unwrap();

    assert_eq!(backend.acquire_topic(0).await.unwrap(), Some(1));
    sleep(Duration::from_millis(1200)).await;

    // Expired: acquirable again, and the sweep deletes expired rows.
    assert_eq!(backend.acquire_topic(100).await.unwrap(), Some(1));
    backend.batch_touch_topic(&[1], 0).await.unwrap();
    sleep(Duration::from_millis(1200)).await;
    assert_eq!(backend.release_stalled_topic_locks().await.unwrap(), 1);
}

#[tokio::test]
async fn rate_limit_is_test_and_set() {
    let (_, backend) = common::fresh_backend("rate_limit").await;

    let key_a = vec![1u8; HASH_SIZE];
    let key_b = vec![2u8; HASH_SIZE];

    let accepted = backend
        .rate_limit(&[key_a.clone(), key_b.clone()], 100)
        .await
        .unwrap();
    assert_eq!(accepted.len(), 2);

    assert!(backend
        .rate_limit(&[key_a.clone()], 100)
        .await
        .unwrap()
        .is_empty());

    // Duplicate keys in one batch are accepted once.
    let key_c = vec![3u8; HASH_SIZE];
    let accepted = backend
        .rate_limit(&[key_c.clone(), key_c.clone()], 100)
        .await
        .unwrap();
    assert_eq!(accepted, vec![key_c]);

    // Override clears, then the key is admitted again.
    backend
        .override_rate_limit(&[key_a.clone()], 0)
        .await
        .unwrap();
    assert_eq!(
        backend.rate_limit(&[key_a.clone()], 100).await.unwrap(),
        vec![key_a.clone()]
    );

    // Override also force-sets over a live entry.
    backend.override_rate_limit(&[key_a], 600).await.unwrap();

    assert!(matches!(
        backend.rate_limit(&[vec![0u8; 4]], 100).await,
        Err(SiloError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn expired_rate_limits_admit_and_purge() {
    let (_, backend) = common::fresh_backend("rate_expiry").await;

    let key = vec![5u8; HASH_SIZE];
    backend.rate_limit(&[key.clone()], 0).await.unwrap();
    sleep(Duration::from_millis(1200)).await;

    // Expired entry behaves as absent for the test-and-set.
    assert_eq!(
        backend.rate_limit(&[key.clone()], 0).await.unwrap(),
        vec![key]
    );

    sleep(Duration::from_millis(1200)).await;
    assert_eq!(backend.purge_expired_rate_limits().await.unwrap(), 1);
}

#[tokio::test]
async fn put_with_rate_limit_interval_drops_throttled_records() {
    let (_, backend) = common::fresh_backend("put_throttle").await;

    assert_eq!(
        backend
            .batch_put(vec![hashed(b"a", 1, 9)], 0, 0, 0, 100, Some(600))
            .await
            .unwrap(),
        1
    );

    let got = backend.batch_get(1, 1, 100).await.unwrap();
    backend.ack(got[0].id).await.unwrap();

    // Dedup key is free again, but the rate limit still rejects the
    // record.
    assert_eq!(
        backend
            .batch_put(vec![hashed(b"a", 1, 9)], 0, 0, 0, 100, Some(600))
            .await
            .unwrap(),
        0
    );

    // Hashless records bypass the limiter.
    assert_eq!(
        backend
            .batch_put(vec![record(b"plain", 1)], 0, 0, 0, 100, Some(600))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn queue_facade_over_postgres() {
    let (_, backend) = common::fresh_backend("facade").await;
    let config = QueueConfig {
        failure_base_delay: 0,
        poll_interval: Duration::from_millis(20),
        timeout: GetTimeout::NoWait,
        ..QueueConfig::default()
    };
    let queue = Queue::new(backend.clone() as Arc<dyn Backend>, config)
        .await
        .unwrap();

    assert!(queue.put(b"job".to_vec(), 1, 0, None).await.unwrap());

    let msg: Message = queue.get(1).await.unwrap();
    let payload = msg
        .scoped(|m| {
            async move {
                let bytes = m.payload().to_vec();
                m.ack().await?;
                Ok(bytes)
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(payload, b"job");
    assert!(matches!(queue.get(1).await, Err(SiloError::QueueEmpty)));
}
