//! User-facing queue session.
//!
//! [`Queue`] binds a backend to a set of delivery defaults and tracks the
//! handles it hands out, so a consumer can bulk-touch or bulk-nack
//! everything it currently holds. The backend contract is non-blocking;
//! the blocking [`Queue::get`] family is a polling loop layered on top,
//! governed by [`GetTimeout`] and `poll_interval`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::backend::{Backend, PutRecord};
use crate::error::{Result, SiloError};
use crate::message::{HandleState, Message};
use crate::topic::{TopicLock, TopicLockState};

/// How long a blocking `get` waits for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetTimeout {
    /// Poll until a message arrives.
    #[default]
    Never,
    /// Probe once and return immediately.
    NoWait,
    /// Poll for at most this long, then give up with
    /// [`SiloError::QueueEmpty`].
    After(Duration),
}

/// Delivery defaults for a queue session.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Seconds before a newly enqueued message becomes deliverable.
    pub new_message_delay: i64,
    /// Base of the exponential nack backoff, in seconds.
    pub failure_base_delay: i64,
    /// Lease duration stamped on claimed messages, in seconds.
    pub visibility_timeout: i64,
    /// Lease duration for topic locks, in seconds.
    pub topic_lock_visibility_timeout: i64,
    /// Gap between probes in blocking `get`.
    pub poll_interval: Duration,
    /// Blocking behavior of `get` / `batch_get`.
    pub timeout: GetTimeout,
    /// Provision the schema when the session opens.
    pub auto_create: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            new_message_delay: 0,
            failure_base_delay: 1,
            visibility_timeout: 60,
            topic_lock_visibility_timeout: 60,
            poll_interval: Duration::from_secs(1),
            timeout: GetTimeout::Never,
            auto_create: true,
        }
    }
}

impl QueueConfig {
    /// Fail fast on out-of-range values, before the session touches the
    /// backend.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(SiloError::InvalidArgument(
                "poll interval must be positive".to_string(),
            ));
        }
        if self.new_message_delay < 0 {
            return Err(SiloError::InvalidArgument(
                "new message delay must be non-negative".to_string(),
            ));
        }
        if self.failure_base_delay < 0 {
            return Err(SiloError::InvalidArgument(
                "failure base delay must be non-negative".to_string(),
            ));
        }
        if self.visibility_timeout <= 0 {
            return Err(SiloError::InvalidArgument(
                "visibility timeout must be positive".to_string(),
            ));
        }
        if self.topic_lock_visibility_timeout <= 0 {
            return Err(SiloError::InvalidArgument(
                "topic lock visibility timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A consumer/producer session over one backend.
///
/// Tracks outstanding message handles and topic locks; released entries
/// are pruned whenever the registries are used.
pub struct Queue {
    backend: Arc<dyn Backend>,
    config: QueueConfig,
    messages: Mutex<Vec<Arc<HandleState>>>,
    topic_locks: Mutex<Vec<Arc<TopicLockState>>>,
}

impl Queue {
    pub async fn new(backend: Arc<dyn Backend>, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        if config.auto_create {
            backend.create().await?;
        }
        Ok(Self {
            backend,
            config,
            messages: Mutex::new(Vec::new()),
            topic_locks: Mutex::new(Vec::new()),
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn create(&self) -> Result<()> {
        self.backend.create().await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.backend.destroy().await
    }

    /// Enqueue one message with this session's delivery defaults.
    /// Returns false when deduplication skipped the record.
    pub async fn put(
        &self,
        payload: impl Into<Vec<u8>>,
        topic: i64,
        priority: i32,
        hash: Option<Vec<u8>>,
    ) -> Result<bool> {
        let record = PutRecord {
            payload: payload.into(),
            topic,
            hash,
        };
        Ok(self.batch_put(vec![record], priority).await? == 1)
    }

    /// Enqueue a batch with this session's delivery defaults. Returns
    /// the number of records actually inserted.
    pub async fn batch_put(&self, records: Vec<PutRecord>, priority: i32) -> Result<usize> {
        self.backend
            .batch_put(
                records,
                priority,
                self.config.new_message_delay,
                self.config.failure_base_delay,
                self.config.visibility_timeout,
                None,
            )
            .await
    }

    /// Claim one message without waiting.
    ///
    /// An empty probe triggers one stalled-message sweep and a single
    /// retry before reporting [`SiloError::QueueEmpty`].
    pub async fn get_nowait(&self, topic: i64) -> Result<Message> {
        if let Some(msg) = self.claim(topic, 1).await?.pop() {
            return Ok(msg);
        }
        if self.backend.release_stalled_messages().await? == 0 {
            return Err(SiloError::QueueEmpty);
        }
        self.claim(topic, 1)
            .await?
            .pop()
            .ok_or(SiloError::QueueEmpty)
    }

    /// Claim one message, waiting according to the configured timeout.
    pub async fn get(&self, topic: i64) -> Result<Message> {
        let deadline = match self.config.timeout {
            GetTimeout::NoWait => return self.get_nowait(topic).await,
            GetTimeout::After(timeout) => Some(Instant::now() + timeout),
            GetTimeout::Never => None,
        };

        loop {
            match self.get_nowait(topic).await {
                Ok(msg) => return Ok(msg),
                Err(SiloError::QueueEmpty) => {}
                Err(err) => return Err(err),
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SiloError::QueueEmpty);
                }
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Claim up to `size` messages without waiting, sweeping stalled
    /// messages once if the first probe comes up short.
    pub async fn batch_get_nowait(&self, topic: i64, size: usize) -> Result<Vec<Message>> {
        let mut out = self.claim(topic, size).await?;
        if out.len() < size && self.backend.release_stalled_messages().await? > 0 {
            out.extend(self.claim(topic, size - out.len()).await?);
        }
        Ok(out)
    }

    /// Claim up to `size` messages, polling until the batch fills or the
    /// configured timeout lapses. A partial batch is not an error.
    pub async fn batch_get(&self, topic: i64, size: usize) -> Result<Vec<Message>> {
        let deadline = match self.config.timeout {
            GetTimeout::NoWait => return self.batch_get_nowait(topic, size).await,
            GetTimeout::After(timeout) => Some(Instant::now() + timeout),
            GetTimeout::Never => None,
        };

        let mut out = Vec::new();
        loop {
            out.extend(self.batch_get_nowait(topic, size - out.len()).await?);
            if out.len() >= size {
                return Ok(out);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(out);
                }
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Extend the lease on every message handle this session still
    /// holds.
    pub async fn touch_all(&self) -> Result<()> {
        let ids = self.held_message_ids().await;
        self.backend
            .batch_touch(&ids, self.config.visibility_timeout)
            .await
    }

    /// Return every message handle this session still holds for
    /// redelivery. Outstanding handles flip to released, so later acks
    /// on them fail with [`SiloError::AlreadyReleased`].
    pub async fn nack_all(&self) -> Result<()> {
        let mut registry = self.messages.lock().await;
        registry.retain(|state| state.is_held());
        let ids: Vec<i64> = registry.iter().map(|state| state.id()).collect();
        self.backend.batch_nack(&ids).await?;
        for state in registry.drain(..) {
            state.mark_nacked();
        }
        Ok(())
    }

    /// Claim exclusive work on some nonempty, unlocked topic.
    pub async fn acquire_topic(&self) -> Result<Option<TopicLock>> {
        let lease = self.config.topic_lock_visibility_timeout;
        let Some(topic) = self.backend.acquire_topic(lease).await? else {
            return Ok(None);
        };

        let state = Arc::new(TopicLockState::new(topic));
        self.topic_locks.lock().await.push(state.clone());
        Ok(Some(TopicLock::with_state(
            lease,
            state,
            self.backend.clone(),
        )))
    }

    /// Release every topic lock this session still holds.
    pub async fn release_topics(&self) -> Result<()> {
        let mut registry = self.topic_locks.lock().await;
        registry.retain(|state| state.is_held());
        let topics: Vec<i64> = registry.iter().map(|state| state.topic()).collect();
        self.backend.batch_release_topic(&topics).await?;
        for state in registry.drain(..) {
            state.mark_released();
        }
        Ok(())
    }

    /// Extend every topic lock this session still holds.
    pub async fn touch_topics(&self) -> Result<()> {
        let topics: Vec<i64> = {
            let mut registry = self.topic_locks.lock().await;
            registry.retain(|state| state.is_held());
            registry.iter().map(|state| state.topic()).collect()
        };
        self.backend
            .batch_touch_topic(&topics, self.config.topic_lock_visibility_timeout)
            .await
    }

    pub async fn list_topics(&self) -> Result<Vec<(i64, i64)>> {
        self.backend.list_topics().await
    }

    pub async fn size(&self, topic: i64) -> Result<i64> {
        self.backend.get_topic_size(topic).await
    }

    pub async fn release_stalled_messages(&self) -> Result<u64> {
        self.backend.release_stalled_messages().await
    }

    pub async fn release_stalled_topic_locks(&self) -> Result<u64> {
        self.backend.release_stalled_topic_locks().await
    }

    pub async fn rate_limit(
        &self,
        keys: &[Vec<u8>],
        interval_seconds: i64,
    ) -> Result<Vec<Vec<u8>>> {
        self.backend.rate_limit(keys, interval_seconds).await
    }

    pub async fn override_rate_limit(&self, keys: &[Vec<u8>], interval_seconds: i64) -> Result<()> {
        self.backend.override_rate_limit(keys, interval_seconds).await
    }

    async fn claim(&self, topic: i64, size: usize) -> Result<Vec<Message>> {
        let deliveries = self
            .backend
            .batch_get(topic, size, self.config.visibility_timeout)
            .await?;
        if deliveries.is_empty() {
            return Ok(Vec::new());
        }

        let mut registry = self.messages.lock().await;
        registry.retain(|state| state.is_held());

        let mut out = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let state = Arc::new(HandleState::new(delivery.id));
            registry.push(state.clone());
            out.push(Message::with_state(
                delivery.payload,
                self.config.visibility_timeout,
                state,
                self.backend.clone(),
            ));
        }
        Ok(out)
    }

    async fn held_message_ids(&self) -> Vec<i64> {
        let mut registry = self.messages.lock().await;
        registry.retain(|state| state.is_held());
        registry.iter().map(|state| state.id()).collect()
    }
}

/// Single-topic convenience wrapper: the topic is fixed at construction
/// and elided from every call.
pub struct MonoQueue {
    queue: Queue,
    topic: i64,
}

impl MonoQueue {
    pub async fn new(backend: Arc<dyn Backend>, config: QueueConfig, topic: i64) -> Result<Self> {
        Ok(Self {
            queue: Queue::new(backend, config).await?,
            topic,
        })
    }

    pub fn topic(&self) -> i64 {
        self.topic
    }

    /// The underlying multi-topic session, for bulk touch/nack and the
    /// administrative operations.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub async fn put(
        &self,
        payload: impl Into<Vec<u8>>,
        priority: i32,
        hash: Option<Vec<u8>>,
    ) -> Result<bool> {
        self.queue.put(payload, self.topic, priority, hash).await
    }

    pub async fn get(&self) -> Result<Message> {
        self.queue.get(self.topic).await
    }

    pub async fn get_nowait(&self) -> Result<Message> {
        self.queue.get_nowait(self.topic).await
    }

    pub async fn batch_get(&self, size: usize) -> Result<Vec<Message>> {
        self.queue.batch_get(self.topic, size).await
    }

    pub async fn size(&self) -> Result<i64> {
        self.queue.size(self.topic).await
    }
}
