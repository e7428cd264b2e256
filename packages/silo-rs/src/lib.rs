//! # Silo
//!
//! A persistent, multi-topic message queue whose durability, visibility,
//! and coordination all live in a relational database. Producers enqueue
//! opaque binary payloads tagged with an integer topic; consumers claim
//! messages under a time-bounded lease and either ack (consume) or nack
//! (return for redelivery with exponential backoff). There is no broker
//! process and no wire protocol: the database *is* the wire.
//!
//! ## Architecture
//!
//! ```text
//! producer ──put──►┌──────────────────────┐
//!                  │  Backend (contract)  │
//! consumer ──get──►│                      │
//!     │            │  MemoryBackend       │  reference / test oracle
//!     │            │  PostgresBackend     │  FOR UPDATE SKIP LOCKED
//!     │            └──────────────────────┘
//!     ▼
//!  Message handle ── ack / nack / touch ──► backend
//! ```
//!
//! - [`Backend`] is the abstract contract; both implementations expose
//!   identical semantics.
//! - [`MemoryBackend`] is the single-process executable specification.
//! - [`PostgresBackend`] maps the same state machine onto three tables
//!   and claims rows with `FOR UPDATE SKIP LOCKED`, so concurrent
//!   consumers never contend on the same row.
//! - [`Message`] and [`TopicLock`] are per-claim handles with
//!   exactly-once release semantics.
//! - [`Queue`] is the session facade: delivery defaults, blocking `get`
//!   by polling, and bulk touch/nack over outstanding handles.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a claim is a lease, not a removal. Consumers that
//!   vanish lose the lease at the visibility timeout and the message is
//!   redelivered.
//! - **Priority + FIFO**: within a topic, deliverable messages are
//!   offered in `(priority DESC, id ASC)` order.
//! - **Backoff on rejection**: each nack delays redelivery by
//!   `failure_base_delay * 2^failure_count` seconds. Lease expiry carries
//!   no such penalty.
//! - **Dedup**: a producer-supplied 16-byte hash makes `(topic, hash)`
//!   unique among live messages; acking frees the key.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use silo::{Backend, PostgresBackend, Queue, QueueConfig};
//!
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! let backend = Arc::new(PostgresBackend::new(pool, "squeal")?) as Arc<dyn Backend>;
//! let queue = Queue::new(backend, QueueConfig::default()).await?;
//!
//! queue.put(b"work".to_vec(), 1, 0, None).await?;
//!
//! let mut msg = queue.get(1).await?;
//! process(msg.payload())?;
//! msg.ack().await?;
//! ```

mod backend;
mod error;
mod memory;
mod message;
mod postgres;
mod queue;
mod topic;

pub use crate::backend::{Backend, Delivery, PutRecord, HASH_SIZE};
pub use crate::error::{Result, SiloError};
pub use crate::memory::MemoryBackend;
pub use crate::message::Message;
pub use crate::postgres::{PostgresBackend, DEFAULT_PREFIX, MAX_PAYLOAD_SIZE};
pub use crate::queue::{GetTimeout, MonoQueue, Queue, QueueConfig};
pub use crate::topic::TopicLock;

// Re-export commonly used external types
pub use async_trait::async_trait;
