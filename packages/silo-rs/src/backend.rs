//! The backend contract shared by every queue implementation.
//!
//! A backend owns the broker state machine: message lifecycle, leases and
//! visibility, priority ordering, exponential-backoff redelivery,
//! content-addressed deduplication, topic-level exclusive locks, and the
//! rate-limit table. Two implementations ship with the crate:
//!
//! - [`MemoryBackend`](crate::MemoryBackend) — in-process reference
//!   implementation, used as the test oracle
//! - [`PostgresBackend`](crate::PostgresBackend) — production
//!   implementation over PostgreSQL row locking
//!
//! # Implementer notes
//!
//! - Claiming must never hand the same row to two concurrent callers; use
//!   `FOR UPDATE SKIP LOCKED` or equivalent so competing claimers make
//!   progress against disjoint row sets without deadlocking.
//! - Nack applies exponential backoff and increments the failure count;
//!   lease-expiry reclamation does neither. The two paths are distinct on
//!   purpose: a vanished consumer is not a rejection.
//! - `(topic, hash)` is unique among live rows when `hash` is non-null.
//!   Acking a message frees its dedup key.

use async_trait::async_trait;

use crate::error::{Result, SiloError};

/// Width of dedup hashes and rate-limit keys, in bytes.
pub const HASH_SIZE: usize = 16;

/// One record handed to [`Backend::batch_put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecord {
    /// Opaque payload bytes. Backends may bound the length; see
    /// [`Backend::max_payload_size`].
    pub payload: Vec<u8>,
    /// Partition label chosen by the producer.
    pub topic: i64,
    /// Optional dedup key, exactly [`HASH_SIZE`] bytes. `None` disables
    /// deduplication for this record.
    pub hash: Option<Vec<u8>>,
}

impl PutRecord {
    pub fn new(payload: impl Into<Vec<u8>>, topic: i64) -> Self {
        Self {
            payload: payload.into(),
            topic,
            hash: None,
        }
    }

    pub fn with_hash(payload: impl Into<Vec<u8>>, topic: i64, hash: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            topic,
            hash: Some(hash.into()),
        }
    }
}

/// A claimed row as returned by [`Backend::batch_get`].
///
/// This is the raw claim; wrap it in a [`Message`](crate::Message) handle
/// to get ack/nack/touch tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Row id, unique per queue table.
    pub id: i64,
    /// The message payload.
    pub payload: Vec<u8>,
}

/// Abstract queue backend.
///
/// Every operation is a single atomic step against the store. Operations
/// on ids that are absent or not leased are silent no-ops; emptiness is a
/// short or empty result, never an error.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Provision the schema. Idempotent; must be called before any other
    /// operation.
    async fn create(&self) -> Result<()>;

    /// Tear the schema down. Idempotent. After this, behavior of other
    /// operations is undefined until [`create`](Backend::create) runs
    /// again.
    async fn destroy(&self) -> Result<()>;

    /// Maximum accepted payload length in bytes, or `None` for unbounded.
    fn max_payload_size(&self) -> Option<usize>;

    /// Width of dedup hashes and rate-limit keys accepted by this
    /// backend.
    fn hash_size(&self) -> usize {
        HASH_SIZE
    }

    /// Durably insert a batch of records sharing the same delivery
    /// parameters.
    ///
    /// Every payload and hash is validated before any side effect; a
    /// violation fails the whole batch with
    /// [`SiloError::InvalidArgument`]. Records whose `(topic, hash)`
    /// collides with a live row are skipped silently. When
    /// `rate_limit_interval` is set, records carrying a hash are first
    /// passed through the rate-limit test-and-set keyed by that hash and
    /// rejected ones are dropped. Returns the number of rows actually
    /// inserted.
    async fn batch_put(
        &self,
        records: Vec<PutRecord>,
        priority: i32,
        delay: i64,
        failure_base_delay: i64,
        visibility_timeout: i64,
        rate_limit_interval: Option<i64>,
    ) -> Result<usize>;

    /// Atomically claim up to `size` deliverable rows for `topic`,
    /// ordered by `(priority DESC, id ASC)`.
    ///
    /// Each claimed row is stamped with this session's owner id and a
    /// lease of `visibility_timeout` seconds. Returns fewer than `size`
    /// rows (possibly none) when the topic is exhausted; concurrent
    /// callers never observe the same row.
    async fn batch_get(
        &self,
        topic: i64,
        size: usize,
        visibility_timeout: i64,
    ) -> Result<Vec<Delivery>>;

    /// Delete the row iff it is currently leased, freeing its dedup key.
    /// Silent no-op if the row is gone or unleased.
    async fn ack(&self, id: i64) -> Result<()>;

    /// Return leased messages for redelivery with exponential backoff.
    ///
    /// For each id leased by this session: clear the lease, push
    /// `delivery_time` out by `failure_base_delay * 2^failure_count`
    /// seconds, and increment `failure_count`. Ids not leased by this
    /// session are ignored.
    async fn batch_nack(&self, ids: &[i64]) -> Result<()>;

    /// Extend the lease on each id leased by this session to
    /// `visibility_timeout` seconds from now. Other ids are ignored.
    async fn batch_touch(&self, ids: &[i64], visibility_timeout: i64) -> Result<()>;

    /// Reclaim every message whose lease has expired, across all topics.
    ///
    /// Does not increment `failure_count`: the consumer may simply have
    /// vanished, and redelivery should not carry a backoff penalty.
    /// Returns the number of messages reclaimed.
    async fn release_stalled_messages(&self) -> Result<u64>;

    /// Deliverable message counts grouped by topic.
    async fn list_topics(&self) -> Result<Vec<(i64, i64)>>;

    /// Deliverable message count for one topic.
    async fn get_topic_size(&self, topic: i64) -> Result<i64>;

    /// Claim exclusive work on some topic that currently has deliverable
    /// messages and no live lock. Best-effort: returns the locked topic,
    /// or `None` when no topic is both nonempty and free.
    async fn acquire_topic(&self, lease_seconds: i64) -> Result<Option<i64>>;

    /// Drop the locks on the given topics.
    async fn batch_release_topic(&self, topics: &[i64]) -> Result<()>;

    /// Extend the locks on the given topics to `lease_seconds` from now.
    /// Topics without a lock row are ignored.
    async fn batch_touch_topic(&self, topics: &[i64], lease_seconds: i64) -> Result<()>;

    /// Delete topic locks whose expiry has passed. Returns the number
    /// reclaimed.
    async fn release_stalled_topic_locks(&self) -> Result<u64>;

    /// Batch test-and-set throttling.
    ///
    /// For each key with no live entry, install `expires_at = now +
    /// interval_seconds` and include the key in the result; keys with a
    /// live entry are omitted. Atomic per batch.
    async fn rate_limit(&self, keys: &[Vec<u8>], interval_seconds: i64) -> Result<Vec<Vec<u8>>>;

    /// Unconditionally set (positive interval) or clear (non-positive)
    /// each key's rate-limit entry.
    async fn override_rate_limit(&self, keys: &[Vec<u8>], interval_seconds: i64) -> Result<()>;

    /// Delete rate-limit entries whose expiry has passed. Conceptually
    /// they are already absent; this reclaims the storage. Returns the
    /// number deleted.
    async fn purge_expired_rate_limits(&self) -> Result<u64>;
}

/// Validate dedup hashes / rate-limit keys against the backend width.
pub(crate) fn validate_hashes<'a, I>(hashes: I, hash_size: usize) -> Result<()>
where
    I: IntoIterator<Item = &'a Vec<u8>>,
{
    for hash in hashes {
        if hash.len() != hash_size {
            return Err(SiloError::InvalidArgument(format!(
                "hash must be exactly {} bytes, got {}",
                hash_size,
                hash.len()
            )));
        }
    }
    Ok(())
}

/// Validate payload lengths against the backend bound, if any.
pub(crate) fn validate_payloads<'a, I>(payloads: I, max_size: Option<usize>) -> Result<()>
where
    I: IntoIterator<Item = &'a Vec<u8>>,
{
    let Some(max_size) = max_size else {
        return Ok(());
    };
    for payload in payloads {
        if payload.len() > max_size {
            return Err(SiloError::InvalidArgument(format!(
                "payload exceeds maximum size ({} > {})",
                payload.len(),
                max_size
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_validation_rejects_wrong_width() {
        let ok = vec![0u8; HASH_SIZE];
        let short = vec![0u8; HASH_SIZE - 1];

        assert!(validate_hashes([&ok], HASH_SIZE).is_ok());
        assert!(matches!(
            validate_hashes([&short], HASH_SIZE),
            Err(SiloError::InvalidArgument(_))
        ));
    }

    #[test]
    fn payload_validation_honors_unbounded_backends() {
        let big = vec![0u8; 1 << 20];
        assert!(validate_payloads([&big], None).is_ok());
        assert!(matches!(
            validate_payloads([&big], Some(2047)),
            Err(SiloError::InvalidArgument(_))
        ));
    }

    #[test]
    fn put_record_constructors() {
        let plain = PutRecord::new(b"payload".to_vec(), 3);
        assert_eq!(plain.topic, 3);
        assert!(plain.hash.is_none());

        let hashed = PutRecord::with_hash(b"payload".to_vec(), 3, vec![0u8; HASH_SIZE]);
        assert_eq!(hashed.hash.as_ref().map(Vec::len), Some(HASH_SIZE));
    }
}
