//! Per-delivery message handle.
//!
//! A [`Message`] wraps one claimed row and tracks its release state:
//! `ack` and `nack` are each callable exactly once and only while the
//! handle is held; `touch` re-extends the lease with the visibility
//! timeout the message was claimed with.
//!
//! Release state lives in a shared cell so a session-level bulk nack and
//! the individual handle observe each other: after `Queue::nack_all`, a
//! stray `ack` on the handle fails with `AlreadyReleased` instead of
//! deleting a message some other consumer may already own.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use crate::backend::{Backend, Delivery};
use crate::error::{Result, SiloError};

const HELD: u8 = 0;
const ACKED: u8 = 1;
const NACKED: u8 = 2;

/// Shared release-state cell for one claimed row.
#[derive(Debug)]
pub(crate) struct HandleState {
    id: i64,
    status: AtomicU8,
}

impl HandleState {
    pub(crate) fn new(id: i64) -> Self {
        Self {
            id,
            status: AtomicU8::new(HELD),
        }
    }

    pub(crate) fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn is_held(&self) -> bool {
        self.status.load(Ordering::Acquire) == HELD
    }

    /// HELD -> `to`; false if some other path released the handle first.
    fn try_transition(&self, to: u8) -> bool {
        self.status
            .compare_exchange(HELD, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_nacked(&self) {
        self.try_transition(NACKED);
    }
}

/// A claimed message: payload plus the lease it was delivered under.
pub struct Message {
    payload: Vec<u8>,
    visibility_timeout: i64,
    state: Arc<HandleState>,
    backend: Arc<dyn Backend>,
}

impl Message {
    /// Wrap a raw [`Delivery`] into a tracked handle.
    pub fn new(delivery: Delivery, visibility_timeout: i64, backend: Arc<dyn Backend>) -> Self {
        Self::with_state(
            delivery.payload,
            visibility_timeout,
            Arc::new(HandleState::new(delivery.id)),
            backend,
        )
    }

    pub(crate) fn with_state(
        payload: Vec<u8>,
        visibility_timeout: i64,
        state: Arc<HandleState>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            payload,
            visibility_timeout,
            state,
            backend,
        }
    }

    pub fn id(&self) -> i64 {
        self.state.id()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// True once the message has been acked or nacked, by this handle or
    /// by a session-level bulk release.
    pub fn is_released(&self) -> bool {
        !self.state.is_held()
    }

    /// Consume the message: delete it from the queue and free its dedup
    /// key.
    pub async fn ack(&mut self) -> Result<()> {
        if !self.state.try_transition(ACKED) {
            return Err(SiloError::AlreadyReleased);
        }
        self.backend.ack(self.state.id()).await
    }

    /// Reject the message: release the lease and schedule redelivery
    /// with exponential backoff.
    pub async fn nack(&mut self) -> Result<()> {
        if !self.state.try_transition(NACKED) {
            return Err(SiloError::AlreadyReleased);
        }
        self.backend.batch_nack(&[self.state.id()]).await
    }

    /// Extend the lease by the visibility timeout this message was
    /// claimed with.
    pub async fn touch(&mut self) -> Result<()> {
        if self.is_released() {
            return Err(SiloError::AlreadyReleased);
        }
        self.backend
            .batch_touch(&[self.state.id()], self.visibility_timeout)
            .await
    }

    /// Run `f` with the message; on any exit path that did not ack or
    /// nack, nack before returning.
    ///
    /// This is the scoped-acquisition guarantee: a consumer that bails
    /// out mid-processing returns the message for redelivery immediately
    /// instead of sitting on the lease until it expires.
    ///
    /// ```ignore
    /// use futures::FutureExt;
    ///
    /// let n = msg
    ///     .scoped(|m| async move { process(m.payload())?; m.ack().await?; Ok(1) }.boxed())
    ///     .await?;
    /// ```
    pub async fn scoped<T>(
        mut self,
        f: impl for<'a> FnOnce(&'a mut Message) -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        let result = f(&mut self).await;
        if !self.is_released() {
            if let Err(nack_err) = self.nack().await {
                match result {
                    Ok(_) => return Err(nack_err),
                    Err(_) => warn!(
                        id = self.id(),
                        error = %nack_err,
                        "failed to nack message after scoped failure"
                    ),
                }
            }
        }
        result
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id())
            .field("payload_len", &self.payload.len())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if self.state.is_held() {
            warn!(
                id = self.state.id(),
                "message handle dropped while leased; redelivery waits for the visibility timeout"
            );
        }
    }
}
