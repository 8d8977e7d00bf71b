//! Durable message queue backed by SQLite, with a dead-letter table.
//!
//! Delivery is at-least-once: `receive` hides a message for the visibility
//! timeout instead of deleting it, so a worker that dies mid-job leaves the
//! message to be redelivered. Messages are ordered by due time only.
use crate::db::Pool;
use crate::model::QueueKind;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use tracing::{info, instrument, warn};

/// Producer side of the queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn send(&self, kind: QueueKind, payload: Value) -> Result<i64>;
}

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: i64,
    pub kind: QueueKind,
    pub payload: Value,
    /// Deliveries so far, this one included.
    pub attempt: i32,
}

impl QueueMessage {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| anyhow!("malformed {} payload in message {}: {}", self.kind.as_str(), self.id, e))
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub attempts: i32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Exponential backoff: 5s * 2^attempt, capped at `cap_secs` (no cap when <= 0).
pub fn backoff_secs(attempt: i32, cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if cap_secs <= 0 {
        secs
    } else {
        secs.min(cap_secs)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: Pool,
    visibility_timeout: Duration,
}

impl SqliteQueue {
    pub fn new(pool: Pool, visibility_timeout_secs: u64) -> Self {
        Self {
            pool,
            visibility_timeout: Duration::seconds(visibility_timeout_secs as i64),
        }
    }

    pub async fn send_json<T: Serialize + Sync>(&self, kind: QueueKind, payload: &T) -> Result<i64> {
        self.send(kind, serde_json::to_value(payload)?).await
    }

    /// Claim the next due message and hide it for the visibility timeout.
    #[instrument(skip_all)]
    pub async fn receive(&self, now: DateTime<Utc>) -> Result<Option<QueueMessage>> {
        let mut tx = self.pool.begin().await?;
        // The UPDATE takes the write lock before the row is chosen so two
        // workers cannot claim the same message.
        let row = sqlx::query(
            "UPDATE queue_messages SET attempt = attempt + 1, due_at = ? \
             WHERE id = (SELECT id FROM queue_messages WHERE julianday(due_at) <= julianday(?) \
                         ORDER BY julianday(due_at), id LIMIT 1) \
             RETURNING id, kind, payload, attempt",
        )
        .bind(now + self.visibility_timeout)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let kind_str: String = row.get("kind");
        let payload_str: String = row.get("payload");
        let attempt: i32 = row.get("attempt");
        let Some(kind) = QueueKind::parse(&kind_str) else {
            self.dead_letter_raw(id, &format!("unknown message kind {}", kind_str), now)
                .await?;
            return Err(anyhow!("message {} has unknown kind {}", id, kind_str));
        };
        let payload: Value = match serde_json::from_str(&payload_str) {
            Ok(v) => v,
            Err(e) => {
                self.dead_letter_raw(id, &format!("payload is not JSON: {}", e), now)
                    .await?;
                return Err(anyhow!("message {} payload is not JSON", id));
            }
        };
        Ok(Some(QueueMessage {
            id,
            kind,
            payload,
            attempt,
        }))
    }

    #[instrument(skip_all)]
    pub async fn ack(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Make the message due again after the backoff for its attempt count.
    #[instrument(skip_all)]
    pub async fn retry_later(&self, msg: &QueueMessage, cap_secs: i64, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let due = now + Duration::seconds(backoff_secs(msg.attempt - 1, cap_secs));
        sqlx::query("UPDATE queue_messages SET due_at = ? WHERE id = ?")
            .bind(due)
            .bind(msg.id)
            .execute(&self.pool)
            .await?;
        Ok(due)
    }

    /// Move a message to the dead-letter table.
    #[instrument(skip_all)]
    pub async fn dead_letter(&self, msg: &QueueMessage, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.dead_letter_raw(msg.id, error, now).await
    }

    async fn dead_letter_raw(&self, id: i64, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let moved = sqlx::query(
            "INSERT INTO dead_letters (kind, payload, attempts, last_error, failed_at) \
             SELECT kind, payload, attempt, ?, ? FROM queue_messages WHERE id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if moved > 0 {
            warn!(id, error, "message moved to dead-letter queue");
        }
        Ok(())
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT id, kind, payload, attempts, last_error, failed_at FROM dead_letters ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DeadLetter {
                    id: row.try_get("id")?,
                    kind: row.try_get("kind")?,
                    payload: row.try_get("payload")?,
                    attempts: row.try_get("attempts")?,
                    last_error: row.try_get("last_error")?,
                    failed_at: row.try_get("failed_at")?,
                })
            })
            .collect()
    }

    /// Move dead letters back onto the queue with a fresh attempt count.
    /// `None` redrives everything.
    #[instrument(skip_all)]
    pub async fn redrive(&self, ids: Option<&[i64]>, now: DateTime<Utc>) -> Result<u64> {
        let letters = self.dead_letters().await?;
        let mut tx = self.pool.begin().await?;
        let mut count = 0;
        for letter in letters
            .iter()
            .filter(|l| ids.map_or(true, |ids| ids.contains(&l.id)))
        {
            sqlx::query(
                "INSERT INTO queue_messages (kind, payload, attempt, due_at, created_at) VALUES (?, ?, 0, ?, ?)",
            )
            .bind(&letter.kind)
            .bind(&letter.payload)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM dead_letters WHERE id = ?")
                .bind(letter.id)
                .execute(&mut *tx)
                .await?;
            count += 1;
        }
        tx.commit().await?;
        if count > 0 {
            info!(count, "redrove dead letters");
        }
        Ok(count)
    }

    /// Messages waiting or in flight.
    pub async fn depth(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    #[instrument(skip(self, payload))]
    async fn send(&self, kind: QueueKind, payload: Value) -> Result<i64> {
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO queue_messages (kind, payload, attempt, due_at, created_at) \
             VALUES (?, ?, 0, ?, ?) RETURNING id",
        )
        .bind(kind.as_str())
        .bind(payload.to_string())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}
