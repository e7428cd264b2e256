//! Exclusive topic-lease handle.
//!
//! Counterpart of [`Message`](crate::Message) for coarse-grained
//! partitioning: a consumer that holds a [`TopicLock`] has claimed an
//! entire topic for the lease duration. Acquisition is best-effort, so
//! `acquire_topic` returning nothing is not an error.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::backend::Backend;
use crate::error::{Result, SiloError};

#[derive(Debug)]
pub(crate) struct TopicLockState {
    topic: i64,
    released: AtomicBool,
}

impl TopicLockState {
    pub(crate) fn new(topic: i64) -> Self {
        Self {
            topic,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn topic(&self) -> i64 {
        self.topic
    }

    pub(crate) fn is_held(&self) -> bool {
        !self.released.load(Ordering::Acquire)
    }

    fn try_release(&self) -> bool {
        self.released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_released(&self) {
        self.try_release();
    }
}

/// A time-bounded exclusive claim on one topic.
pub struct TopicLock {
    lease_seconds: i64,
    state: Arc<TopicLockState>,
    backend: Arc<dyn Backend>,
}

impl TopicLock {
    pub fn new(topic: i64, lease_seconds: i64, backend: Arc<dyn Backend>) -> Self {
        Self::with_state(lease_seconds, Arc::new(TopicLockState::new(topic)), backend)
    }

    pub(crate) fn with_state(
        lease_seconds: i64,
        state: Arc<TopicLockState>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            lease_seconds,
            state,
            backend,
        }
    }

    pub fn topic(&self) -> i64 {
        self.state.topic()
    }

    /// True once the lock has been released, by this handle or by a
    /// session-level bulk release.
    pub fn is_released(&self) -> bool {
        !self.state.is_held()
    }

    /// Give the topic back. Callable exactly once.
    pub async fn release(&mut self) -> Result<()> {
        if !self.state.try_release() {
            return Err(SiloError::AlreadyReleased);
        }
        self.backend.batch_release_topic(&[self.state.topic()]).await
    }

    /// Extend the lease by the duration the lock was acquired with.
    pub async fn touch(&mut self) -> Result<()> {
        if self.is_released() {
            return Err(SiloError::AlreadyReleased);
        }
        self.backend
            .batch_touch_topic(&[self.state.topic()], self.lease_seconds)
            .await
    }
}

impl fmt::Debug for TopicLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicLock")
            .field("topic", &self.topic())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for TopicLock {
    fn drop(&mut self) {
        if self.state.is_held() {
            warn!(
                topic = self.state.topic(),
                "topic lock dropped while held; the lock expires with its lease"
            );
        }
    }
}
