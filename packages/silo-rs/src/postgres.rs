//! PostgreSQL queue backend.
//!
//! Maps the broker state machine onto three tables derived from a
//! configurable prefix: `{prefix}_queue`, `{prefix}_topic_lock`, and
//! `{prefix}_rate_limit`. Every operation is a single atomic statement;
//! the claim path is a CTE using `FOR UPDATE SKIP LOCKED` so concurrent
//! consumers make progress against disjoint row sets without blocking or
//! deadlocking.
//!
//! Each backend instance is one consumer session: it draws a random
//! 32-bit owner id at construction and scopes nack/touch updates to rows
//! it still owns, so a message that stalled, was reclaimed, and was
//! re-leased elsewhere cannot be disturbed by its previous owner.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::backend::{validate_hashes, validate_payloads, Backend, Delivery, PutRecord};
use crate::error::{Result, SiloError};

/// Largest payload the queue table accepts, in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 2047;

/// Table prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "squeal";

/// Queue backend over a PostgreSQL connection pool.
pub struct PostgresBackend {
    pool: PgPool,
    prefix: String,
    owner_id: i64,
}

fn validate_prefix(prefix: &str) -> Result<()> {
    let mut chars = prefix.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(SiloError::InvalidArgument(format!(
            "table prefix must be a bare SQL identifier, got {prefix:?}"
        )));
    }
    Ok(())
}

/// Drop duplicate keys, keeping first occurrences in order. A repeated
/// key in one upsert batch would otherwise make `ON CONFLICT DO UPDATE`
/// touch the same row twice, which PostgreSQL rejects.
fn dedup_keys(keys: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut seen = std::collections::HashSet::new();
    keys.iter()
        .filter(|key| seen.insert(key.as_slice()))
        .cloned()
        .collect()
}

impl PostgresBackend {
    /// Create a session over `pool` with tables named from `prefix`.
    ///
    /// The prefix becomes part of SQL identifiers, so it is restricted to
    /// bare-identifier characters.
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        let owner_id = i64::from(rand::random::<u32>());
        Ok(Self {
            pool,
            prefix,
            owner_id,
        })
    }

    /// The random owner id identifying this session's leases.
    pub fn owner_id(&self) -> i64 {
        self.owner_id
    }

    fn queue_table(&self) -> String {
        format!("{}_queue", self.prefix)
    }

    fn topic_lock_table(&self) -> String {
        format!("{}_topic_lock", self.prefix)
    }

    fn rate_limit_table(&self) -> String {
        format!("{}_rate_limit", self.prefix)
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn create(&self) -> Result<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {q} (
                    id BIGSERIAL PRIMARY KEY,
                    topic BIGINT NOT NULL,
                    hash BYTEA NULL,
                    priority INT NOT NULL DEFAULT 0,
                    owner_id BIGINT NULL,
                    delivery_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    visibility_timeout BIGINT NOT NULL,
                    failure_base_delay BIGINT NOT NULL,
                    failure_count INT NOT NULL DEFAULT 0,
                    acquire_time TIMESTAMPTZ NULL,
                    payload BYTEA NOT NULL,
                    UNIQUE (topic, hash)
                )",
                q = self.queue_table()
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {p}_queue_claim_idx
                 ON {q} (topic, priority DESC, id) WHERE owner_id IS NULL",
                p = self.prefix,
                q = self.queue_table()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {tl} (
                    topic BIGINT PRIMARY KEY,
                    expires_at TIMESTAMPTZ NOT NULL
                )",
                tl = self.topic_lock_table()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {rl} (
                    key BYTEA PRIMARY KEY,
                    expires_at TIMESTAMPTZ NOT NULL
                )",
                rl = self.rate_limit_table()
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!(prefix = %self.prefix, "queue schema provisioned");
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        for table in [
            self.queue_table(),
            self.topic_lock_table(),
            self.rate_limit_table(),
        ] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&self.pool)
                .await?;
        }
        info!(prefix = %self.prefix, "queue schema dropped");
        Ok(())
    }

    fn max_payload_size(&self) -> Option<usize> {
        Some(MAX_PAYLOAD_SIZE)
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

        let records = match rate_limit_interval {
            None => records,
            Some(interval) => {
                let keys: Vec<Vec<u8>> = records.iter().filter_map(|r| r.hash.clone()).collect();
                let accepted: std::collections::HashSet<Vec<u8>> =
                    self.rate_limit(&keys, interval).await?.into_iter().collect();
                records
                    .into_iter()
                    .filter(|r| match &r.hash {
                        Some(hash) => accepted.contains(hash),
                        None => true,
                    })
                    .collect()
            }
        };

        if records.is_empty() {
            return Ok(0);
        }

        let mut payloads = Vec::with_capacity(records.len());
        let mut topics = Vec::with_capacity(records.len());
        let mut hashes: Vec<Option<Vec<u8>>> = Vec::with_capacity(records.len());
        for record in records {
            payloads.push(record.payload);
            topics.push(record.topic);
            hashes.push(record.hash);
        }

        // UNNEST keeps array order, so ids stay FIFO within the batch.
        // Rows colliding on (topic, hash) -- against live rows or within
        // the batch itself -- are skipped by ON CONFLICT DO NOTHING.
        let sql = format!(
            "INSERT INTO {q}
                (payload, topic, hash, priority, delivery_time, visibility_timeout, failure_base_delay)
             SELECT r.payload, r.topic, r.hash, $4, NOW() + make_interval(secs => $5), $6, $7
             FROM UNNEST($1::BYTEA[], $2::BIGINT[], $3::BYTEA[]) AS r(payload, topic, hash)
             ON CONFLICT (topic, hash) DO NOTHING",
            q = self.queue_table()
        );

        let inserted = sqlx::query(&sql)
            .bind(&payloads)
            .bind(&topics)
            .bind(&hashes)
            .bind(priority)
            .bind(delay)
            .bind(visibility_timeout)
            .bind(failure_base_delay)
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(
            inserted,
            submitted = payloads.len(),
            "inserted message batch"
        );
        Ok(inserted as usize)
    }

    async fn batch_get(
        &self,
        topic: i64,
        size: usize,
        visibility_timeout: i64,
    ) -> Result<Vec<Delivery>> {
        // SKIP LOCKED is what lets competing consumers claim disjoint
        // rows without waiting on each other's transactions.
        let sql = format!(
            "WITH claimed AS (
                SELECT id
                FROM {q}
                WHERE owner_id IS NULL AND topic = $1 AND delivery_time <= NOW()
                ORDER BY priority DESC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {q} AS q
            SET owner_id = $3, acquire_time = NOW(), visibility_timeout = $4
            FROM claimed
            WHERE q.id = claimed.id
            RETURNING q.id, q.payload, q.priority",
            q = self.queue_table()
        );

        let mut rows: Vec<(i64, Vec<u8>, i32)> = sqlx::query_as(&sql)
            .bind(topic)
            .bind(size as i64)
            .bind(self.owner_id)
            .bind(visibility_timeout)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not promise the CTE's ordering.
        rows.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));

        Ok(rows
            .into_iter()
            .map(|(id, payload, _)| Delivery { id, payload })
            .collect())
    }

    async fn ack(&self, id: i64) -> Result<()> {
        let sql = format!(
            "DELETE FROM {q} WHERE id = $1 AND owner_id IS NOT NULL",
            q = self.queue_table()
        );
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn batch_nack(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        // SET expressions read the pre-update row: delivery_time uses the
        // old failure_count, then the count increments.
        let sql = format!(
            "UPDATE {q}
             SET owner_id = NULL,
                 delivery_time = NOW() + make_interval(secs => failure_base_delay * POWER(2, failure_count)),
                 failure_count = failure_count + 1
             WHERE id = ANY($1) AND owner_id = $2",
            q = self.queue_table()
        );
        sqlx::query(&sql)
            .bind(ids)
            .bind(self.owner_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn batch_touch(&self, ids: &[i64], visibility_timeout: i64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {q}
             SET acquire_time = NOW(), visibility_timeout = $3
             WHERE id = ANY($1) AND owner_id = $2",
            q = self.queue_table()
        );
        sqlx::query(&sql)
            .bind(ids)
            .bind(self.owner_id)
            .bind(visibility_timeout)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_stalled_messages(&self) -> Result<u64> {
        let sql = format!(
            "UPDATE {q}
             SET owner_id = NULL
             WHERE owner_id IS NOT NULL
               AND acquire_time + make_interval(secs => visibility_timeout) < NOW()",
            q = self.queue_table()
        );
        let released = sqlx::query(&sql).execute(&self.pool).await?.rows_affected();
        if released > 0 {
            debug!(released, "reclaimed stalled messages");
        }
        Ok(released)
    }

    async fn list_topics(&self) -> Result<Vec<(i64, i64)>> {
        let sql = format!(
            "SELECT topic, COUNT(*)
             FROM {q}
             WHERE owner_id IS NULL AND delivery_time <= NOW()
             GROUP BY topic
             ORDER BY topic",
            q = self.queue_table()
        );
        let topics: Vec<(i64, i64)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(topics)
    }

    async fn get_topic_size(&self, topic: i64) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*)
             FROM {q}
             WHERE topic = $1 AND owner_id IS NULL AND delivery_time <= NOW()",
            q = self.queue_table()
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(topic)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn acquire_topic(&self, lease_seconds: i64) -> Result<Option<i64>> {
        let candidates_sql = format!(
            "SELECT DISTINCT topic
             FROM {q}
             WHERE owner_id IS NULL AND delivery_time <= NOW()
             ORDER BY topic",
            q = self.queue_table()
        );
        let candidates: Vec<i64> = sqlx::query_scalar(&candidates_sql)
            .fetch_all(&self.pool)
            .await?;

        // Upsert-where-expired is the atomic claim: it succeeds iff no
        // live lock row exists. A losing racer just moves on to the next
        // candidate topic.
        let claim_sql = format!(
            "INSERT INTO {tl} (topic, expires_at)
             VALUES ($1, NOW() + make_interval(secs => $2))
             ON CONFLICT (topic) DO UPDATE SET expires_at = EXCLUDED.expires_at
             WHERE {tl}.expires_at < NOW()
             RETURNING topic",
            tl = self.topic_lock_table()
        );

        for topic in candidates {
            let claimed: Option<i64> = sqlx::query_scalar(&claim_sql)
                .bind(topic)
                .bind(lease_seconds)
                .fetch_optional(&self.pool)
                .await?;
            if claimed.is_some() {
                debug!(topic, "acquired topic lock");
                return Ok(Some(topic));
            }
        }
        Ok(None)
    }

    async fn batch_release_topic(&self, topics: &[i64]) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "DELETE FROM {tl} WHERE topic = ANY($1)",
            tl = self.topic_lock_table()
        );
        sqlx::query(&sql).bind(topics).execute(&self.pool).await?;
        Ok(())
    }

    async fn batch_touch_topic(&self, topics: &[i64], lease_seconds: i64) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {tl}
             SET expires_at = NOW() + make_interval(secs => $2)
             WHERE topic = ANY($1)",
            tl = self.topic_lock_table()
        );
        sqlx::query(&sql)
            .bind(topics)
            .bind(lease_seconds)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_stalled_topic_locks(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {tl} WHERE expires_at < NOW()",
            tl = self.topic_lock_table()
        );
        Ok(sqlx::query(&sql).execute(&self.pool).await?.rows_affected())
    }

    async fn rate_limit(&self, keys: &[Vec<u8>], interval_seconds: i64) -> Result<Vec<Vec<u8>>> {
        validate_hashes(keys.iter(), self.hash_size())?;
        let keys = dedup_keys(keys);
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // One upsert is the whole test-and-set: absent and expired keys
        // are installed and returned, live keys fail the conflict guard
        // and drop out of RETURNING.
        let sql = format!(
            "INSERT INTO {rl} (key, expires_at)
             SELECT r.key, NOW() + make_interval(secs => $2)
             FROM UNNEST($1::BYTEA[]) AS r(key)
             ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at
             WHERE {rl}.expires_at <= NOW()
             RETURNING key",
            rl = self.rate_limit_table()
        );
        let accepted: Vec<Vec<u8>> = sqlx::query_scalar(&sql)
            .bind(&keys)
            .bind(interval_seconds)
            .fetch_all(&self.pool)
            .await?;
        Ok(accepted)
    }

    async fn override_rate_limit(&self, keys: &[Vec<u8>], interval_seconds: i64) -> Result<()> {
        validate_hashes(keys.iter(), self.hash_size())?;
        let keys = dedup_keys(keys);
        if keys.is_empty() {
            return Ok(());
        }

        if interval_seconds > 0 {
            let sql = format!(
                "INSERT INTO {rl} (key, expires_at)
                 SELECT r.key, NOW() + make_interval(secs => $2)
                 FROM UNNEST($1::BYTEA[]) AS r(key)
                 ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at",
                rl = self.rate_limit_table()
            );
            sqlx::query(&sql)
                .bind(&keys)
                .bind(interval_seconds)
                .execute(&self.pool)
                .await?;
        } else {
            let sql = format!(
                "DELETE FROM {rl} WHERE key = ANY($1)",
                rl = self.rate_limit_table()
            );
            sqlx::query(&sql).bind(&keys).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn purge_expired_rate_limits(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {rl} WHERE expires_at <= NOW()",
            rl = self.rate_limit_table()
        );
        Ok(sqlx::query(&sql).execute(&self.pool).await?.rows_affected())
    }
}
