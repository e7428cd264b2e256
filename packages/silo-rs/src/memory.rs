//! In-process reference backend.
//!
//! This is the executable specification of the broker state machine:
//! deliberately unoptimized, linear scans everywhere, so the semantics
//! are easy to follow. It is the oracle the SQL backend is tested
//! against. It is not a reference for concurrency behavior; the mutex
//! only makes it usable from async tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::backend::{validate_hashes, validate_payloads, Backend, Delivery, PutRecord};
use crate::error::Result;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    topic: i64,
    hash: Option<Vec<u8>>,
    payload: Vec<u8>,
    priority: i32,
    delivery_time: DateTime<Utc>,
    visibility_timeout: i64,
    failure_base_delay: i64,
    failure_count: i32,
    acquired: bool,
    expire_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    messages: Vec<StoredMessage>,
    unique_constraint: HashSet<(i64, Vec<u8>)>,
    topic_locks: HashMap<i64, DateTime<Utc>>,
    rate_limits: HashMap<Vec<u8>, DateTime<Utc>>,
    next_id: i64,
}

impl MemoryState {
    /// Test-and-set on the rate-limit map; returns the accepted keys.
    fn rate_limit(&mut self, keys: &[Vec<u8>], interval_seconds: i64) -> Vec<Vec<u8>> {
        let now = Utc::now();
        let mut accepted = Vec::new();
        for key in keys {
            let live = self.rate_limits.get(key).is_some_and(|expiry| *expiry > now);
            if !live {
                self.rate_limits
                    .insert(key.clone(), saturating_after(now, interval_seconds));
                accepted.push(key.clone());
            }
        }
        accepted
    }

    /// Topics that currently have at least one deliverable message, with
    /// counts, in topic order.
    fn deliverable_by_topic(&self) -> BTreeMap<i64, i64> {
        let now = Utc::now();
        let mut counts = BTreeMap::new();
        for msg in &self.messages {
            if msg.acquired || msg.delivery_time > now {
                continue;
            }
            *counts.entry(msg.topic).or_insert(0) += 1;
        }
        counts
    }
}

/// Delay arithmetic that cannot overflow the timestamp domain. Backoff
/// doubles without bound, so a poisoned message's delay eventually
/// exceeds what `DateTime` can represent.
fn saturating_after(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    Duration::try_seconds(seconds)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn backoff_seconds(base: i64, failure_count: i32) -> i64 {
    base.saturating_mul(2_i64.saturating_pow(failure_count.clamp(0, 62) as u32))
}

/// Single-process, in-memory queue backend.
///
/// All state lives behind one mutex; operations are serialized. Payloads
/// are unbounded here, unlike the SQL backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create(&self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        *self.state.lock().await = MemoryState::default();
        Ok(())
    }

    fn max_payload_size(&self) -> Option<usize> {
        None
    }

    async fn batch_put(
        &self,
        records: Vec<PutRecord>,
        priority: i32,
        delay: i64,
        failure_base_delay: i64,
        visibility_timeout: i64,
        rate_limit_interval: Option<i64>,
    ) -> Result<usize> {
        validate_hashes(records.iter().filter_map(|r| r.hash.as_ref()), self.hash_size())?;
        validate_payloads(records.iter().map(|r| &r.payload), self.max_payload_size())?;

        let mut state = self.state.lock().await;

        let records = match rate_limit_interval {
            None => records,
            Some(interval) => {
                let keys: Vec<Vec<u8>> = records.iter().filter_map(|r| r.hash.clone()).collect();
                let accepted: HashSet<Vec<u8>> =
                    state.rate_limit(&keys, interval).into_iter().collect();
                records
                    .into_iter()
                    .filter(|r| match &r.hash {
                        Some(hash) => accepted.contains(hash),
                        None => true,
                    })
                    .collect()
            }
        };

        let now = Utc::now();
        let mut inserted = 0;
        for record in records {
            if let Some(hash) = &record.hash {
                let key = (record.topic, hash.clone());
                if state.unique_constraint.contains(&key) {
                    continue;
                }
                state.unique_constraint.insert(key);
            }

            let id = state.next_id;
            state.next_id += 1;
            state.messages.push(StoredMessage {
                id,
                topic: record.topic,
                hash: record.hash,
                payload: record.payload,
                priority,
                delivery_time: saturating_after(now, delay),
                visibility_timeout,
                failure_base_delay,
                failure_count: 0,
                acquired: false,
                expire_time: None,
            });
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn batch_get(
        &self,
        topic: i64,
        size: usize,
        visibility_timeout: i64,
    ) -> Result<Vec<Delivery>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        state
            .messages
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        let mut output = Vec::new();
        for msg in state.messages.iter_mut() {
            if output.len() >= size {
                break;
            }
            if msg.acquired || msg.topic != topic || msg.delivery_time > now {
                continue;
            }

            msg.acquired = true;
            msg.visibility_timeout = visibility_timeout;
            msg.expire_time = Some(saturating_after(now, visibility_timeout));
            output.push(Delivery {
                id: msg.id,
                payload: msg.payload.clone(),
            });
        }

        Ok(output)
    }

    async fn ack(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(idx) = state
            .messages
            .iter()
            .position(|msg| msg.id == id && msg.acquired)
        else {
            return Ok(());
        };

        let msg = state.messages.remove(idx);
        if let Some(hash) = msg.hash {
            state.unique_constraint.remove(&(msg.topic, hash));
        }
        Ok(())
    }

    async fn batch_nack(&self, ids: &[i64]) -> Result<()> {
        let to_nack: HashSet<i64> = ids.iter().copied().collect();
        let mut state = self.state.lock().await;
        let now = Utc::now();

        for msg in state.messages.iter_mut() {
            if !to_nack.contains(&msg.id) || !msg.acquired {
                continue;
            }
            msg.acquired = false;
            msg.expire_time = None;
            let delay = backoff_seconds(msg.failure_base_delay, msg.failure_count);
            msg.failure_count += 1;
            msg.delivery_time = saturating_after(now, delay);
        }
        Ok(())
    }

    async fn batch_touch(&self, ids: &[i64], visibility_timeout: i64) -> Result<()> {
        let to_touch: HashSet<i64> = ids.iter().copied().collect();
        let mut state = self.state.lock().await;
        let now = Utc::now();

        for msg in state.messages.iter_mut() {
            if !to_touch.contains(&msg.id) || !msg.acquired {
                continue;
            }
            msg.visibility_timeout = visibility_timeout;
            msg.expire_time = Some(saturating_after(now, visibility_timeout));
        }
        Ok(())
    }

    async fn release_stalled_messages(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let mut released = 0;
        for msg in state.messages.iter_mut() {
            if !msg.acquired {
                continue;
            }
            let expired = msg.expire_time.is_some_and(|expiry| expiry < now);
            if expired {
                msg.acquired = false;
                msg.expire_time = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn list_topics(&self) -> Result<Vec<(i64, i64)>> {
        let state = self.state.lock().await;
        Ok(state.deliverable_by_topic().into_iter().collect())
    }

    async fn get_topic_size(&self, topic: i64) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state.deliverable_by_topic().get(&topic).copied().unwrap_or(0))
    }

    async fn acquire_topic(&self, lease_seconds: i64) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let candidates: Vec<i64> = state.deliverable_by_topic().into_keys().collect();
        for topic in candidates {
            let live = state
                .topic_locks
                .get(&topic)
                .is_some_and(|expiry| *expiry >= now);
            if !live {
                state
                    .topic_locks
                    .insert(topic, saturating_after(now, lease_seconds));
                return Ok(Some(topic));
            }
        }
        Ok(None)
    }

    async fn batch_release_topic(&self, topics: &[i64]) -> Result<()> {
        let mut state = self.state.lock().await;
        for topic in topics {
            state.topic_locks.remove(topic);
        }
        Ok(())
    }

    async fn batch_touch_topic(&self, topics: &[i64], lease_seconds: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for topic in topics {
            if let Some(expiry) = state.topic_locks.get_mut(topic) {
                *expiry = saturating_after(now, lease_seconds);
            }
        }
        Ok(())
    }

    async fn release_stalled_topic_locks(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let before = state.topic_locks.len();
        state.topic_locks.retain(|_, expiry| *expiry >= now);
        Ok((before - state.topic_locks.len()) as u64)
    }

    async fn rate_limit(&self, keys: &[Vec<u8>], interval_seconds: i64) -> Result<Vec<Vec<u8>>> {
        validate_hashes(keys.iter(), self.hash_size())?;
        let mut state = self.state.lock().await;
        Ok(state.rate_limit(keys, interval_seconds))
    }

    async fn override_rate_limit(&self, keys: &[Vec<u8>], interval_seconds: i64) -> Result<()> {
        validate_hashes(keys.iter(), self.hash_size())?;
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if interval_seconds > 0 {
            for key in keys {
                state
                    .rate_limits
                    .insert(key.clone(), saturating_after(now, interval_seconds));
            }
        } else {
            for key in keys {
                state.rate_limits.remove(key);
            }
        }
        Ok(())
    }

    async fn purge_expired_rate_limits(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let before = state.rate_limits.len();
        state.rate_limits.retain(|_, expiry| *expiry > now);
        Ok((before - state.rate_limits.len()) as u64)
    }
}
