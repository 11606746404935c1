//! Embedded SQLite queue with SQS-FIFO semantics.
//!
//! Used for local development and by the test suite. Visibility is a
//! timestamp column; per-group ordering is enforced at poll time by only
//! returning the head message of each group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, warn};

use fcr_common::BrokerReceipt;

use crate::{BrokerError, QueueBroker, QueuePublisher, Result};

/// How long an empty long-poll sleeps between table checks.
const POLL_BACKOFF: Duration = Duration::from_millis(250);

pub struct SqliteBroker {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
    running: AtomicBool,
}

impl SqliteBroker {
    pub fn new(pool: Pool<Sqlite>, queue_name: impl Into<String>, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
        }
    }

    /// Create tables and indexes. Safe to call repeatedly.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS broker_messages (
                message_id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                message_group_id TEXT,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                body TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                receive_count INTEGER DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_broker_visible
            ON broker_messages (queue_name, visible_at, message_group_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "embedded broker schema ready");
        Ok(())
    }

    /// One table scan; returns whatever is visible right now.
    async fn poll_once(&self, max_messages: u32) -> Result<Vec<(BrokerReceipt, String)>> {
        let now = Utc::now().timestamp();
        let hidden_until = now + self.visibility_timeout_seconds as i64;

        // FIFO semantics as SQS implements them: a group with any member
        // still in flight is withheld entirely; otherwise its visible
        // messages are handed out together, in enqueue order.
        let rows = sqlx::query(
            r#"
            WITH blocked AS (
                SELECT DISTINCT COALESCE(message_group_id, message_id) AS grp
                FROM broker_messages
                WHERE queue_name = ? AND receipt_handle IS NOT NULL AND visible_at > ?
            )
            SELECT message_id, body
            FROM broker_messages
            WHERE queue_name = ? AND visible_at <= ?
              AND COALESCE(message_group_id, message_id) NOT IN (SELECT grp FROM blocked)
            ORDER BY enqueued_at, rowid
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(&self.queue_name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id: String = row.get("message_id");
            let body: String = row.get("body");
            let receipt_handle = uuid::Uuid::new_v4().to_string();

            let claimed = sqlx::query(
                r#"
                UPDATE broker_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE message_id = ? AND queue_name = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(hidden_until)
            .bind(&message_id)
            .bind(&self.queue_name)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                // Lost the race to another consumer.
                continue;
            }

            out.push((
                BrokerReceipt {
                    queue: self.queue_name.clone(),
                    message_id,
                    receipt_handle,
                },
                body,
            ));
        }

        Ok(out)
    }
}

#[async_trait]
impl QueueBroker for SqliteBroker {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32, wait: Duration) -> Result<Vec<(BrokerReceipt, String)>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }

        // Emulated long poll: check, sleep, check again until the deadline.
        let deadline = Instant::now() + wait;
        loop {
            let messages = self.poll_once(max_messages).await?;
            if !messages.is_empty() || Instant::now() >= deadline {
                if !messages.is_empty() {
                    debug!(queue = %self.queue_name, count = messages.len(), "polled messages");
                }
                return Ok(messages);
            }
            tokio::time::sleep(POLL_BACKOFF.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    async fn ack(&self, receipt: &BrokerReceipt) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM broker_messages WHERE receipt_handle = ? AND queue_name = ?",
        )
        .bind(&receipt.receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                queue = %self.queue_name,
                message_id = %receipt.message_id,
                "ack found no message; receipt expired or already acked"
            );
            return Err(BrokerError::ReceiptNotFound(receipt.receipt_handle.clone()));
        }

        debug!(queue = %self.queue_name, message_id = %receipt.message_id, "acked");
        Ok(())
    }

    async fn nack(&self, receipt: &BrokerReceipt, delay_seconds: u32) -> Result<()> {
        let visible_at = Utc::now().timestamp() + delay_seconds as i64;

        let result = sqlx::query(
            r#"
            UPDATE broker_messages
            SET visible_at = ?, receipt_handle = NULL
            WHERE receipt_handle = ? AND queue_name = ?
            "#,
        )
        .bind(visible_at)
        .bind(&receipt.receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::ReceiptNotFound(receipt.receipt_handle.clone()));
        }

        debug!(
            queue = %self.queue_name,
            message_id = %receipt.message_id,
            delay_seconds,
            "nacked"
        );
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &BrokerReceipt, seconds: u32) -> Result<()> {
        let visible_at = Utc::now().timestamp() + seconds as i64;

        let result = sqlx::query(
            "UPDATE broker_messages SET visible_at = ? WHERE receipt_handle = ? AND queue_name = ?",
        )
        .bind(visible_at)
        .bind(&receipt.receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::ReceiptNotFound(receipt.receipt_handle.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueuePublisher for SqliteBroker {
    async fn publish(&self, body: &str, message_group_id: Option<&str>) -> Result<String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO broker_messages
                (message_id, queue_name, message_group_id, visible_at, body, enqueued_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message_id)
        .bind(&self.queue_name)
        .bind(message_group_id)
        .bind(now)
        .bind(body)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(
            queue = %self.queue_name,
            message_id = %message_id,
            group = ?message_group_id,
            "published"
        );
        Ok(message_id)
    }
}
