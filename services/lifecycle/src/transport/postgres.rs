use super::{
    record_dead_letter, Delivery, MessageAttributes, OutgoingMessage, Queue, QueueDepth, Receipt,
    ReleaseOutcome,
};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Queue stored in the shared `queue_messages` table.
///
/// Receivers claim rows with `FOR UPDATE SKIP LOCKED`, so any number of
/// service instances can poll the same queue. Dead-letter moves only rewrite
/// the row's `queue` column.
pub struct PgQueue {
    pool: PgPool,
    name: String,
    dead_letter: Option<(String, u32)>,
    retention: Option<Duration>,
}

impl PgQueue {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
            dead_letter: None,
            retention: None,
        }
    }

    pub fn with_dead_letter(mut self, queue: impl Into<String>, max_receive_count: u32) -> Self {
        self.dead_letter = Some((queue.into(), max_receive_count));
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    fn parse_receipt(receipt: &Receipt) -> Result<Uuid> {
        Uuid::parse_str(receipt.as_str())
            .map_err(|e| PipelineError::Queue(format!("invalid receipt {receipt}: {e}")))
    }

    async fn purge_expired(&self) -> Result<()> {
        let Some(retention) = self.retention else {
            return Ok(());
        };

        let purged = sqlx::query(
            r#"
            DELETE FROM queue_messages
            WHERE queue = $1 AND enqueued_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(&self.name)
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if purged > 0 {
            debug!(queue = %self.name, purged, "Dropped messages past retention");
        }
        Ok(())
    }

    /// Move messages whose visibility lapsed after their last allowed receive
    async fn dead_letter_lapsed(&self) -> Result<()> {
        let Some((target, max_receive_count)) = &self.dead_letter else {
            return Ok(());
        };

        let moved = sqlx::query(
            r#"
            UPDATE queue_messages
            SET queue = $2, receive_count = 0, receipt = NULL,
                visible_at = NOW(), enqueued_at = NOW()
            WHERE queue = $1 AND visible_at <= NOW() AND receive_count >= $3
            "#,
        )
        .bind(&self.name)
        .bind(target)
        .bind(i32::try_from(*max_receive_count).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if moved > 0 {
            warn!(
                queue = %self.name,
                dead_letter_queue = %target,
                count = moved,
                "Moving messages to dead-letter queue"
            );
            record_dead_letter(&self.name, moved as usize);
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for PgQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, message: OutgoingMessage) -> Result<String> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, queue, body, attributes)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(&self.name)
        .bind(&message.body)
        .bind(Json(&message.attributes))
        .execute(&self.pool)
        .await?;

        Ok(id.to_string())
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn receive_batch(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>> {
        self.purge_expired().await?;
        self.dead_letter_lapsed().await?;

        let rows = sqlx::query(
            r#"
            WITH ready AS (
                SELECT id FROM queue_messages
                WHERE queue = $1 AND visible_at <= NOW()
                ORDER BY enqueued_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_messages m
            SET receive_count = m.receive_count + 1,
                visible_at = NOW() + make_interval(secs => $3),
                receipt = gen_random_uuid()
            FROM ready
            WHERE m.id = ready.id
            RETURNING m.id, m.body, m.attributes, m.receive_count, m.receipt
            "#,
        )
        .bind(&self.name)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .bind(visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Delivery> {
                let id: Uuid = row.try_get("id")?;
                let receipt: Uuid = row.try_get("receipt")?;
                let attributes: Json<MessageAttributes> = row.try_get("attributes")?;
                let receive_count: i32 = row.try_get("receive_count")?;
                Ok(Delivery {
                    message_id: id.to_string(),
                    receipt: Receipt::new(receipt.to_string()),
                    body: row.try_get("body")?,
                    attributes: attributes.0,
                    receive_count: u32::try_from(receive_count).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<()> {
        let receipt_id = Self::parse_receipt(receipt)?;
        let deleted = sqlx::query("DELETE FROM queue_messages WHERE queue = $1 AND receipt = $2")
            .bind(&self.name)
            .bind(receipt_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted == 0 {
            debug!(queue = %self.name, receipt = %receipt, "Ignoring stale receipt");
        }
        Ok(())
    }

    async fn release(&self, receipt: &Receipt) -> Result<ReleaseOutcome> {
        let receipt_id = Self::parse_receipt(receipt)?;
        let mut tx = self.pool.begin().await?;

        let current: Option<(Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT id, receive_count FROM queue_messages
            WHERE queue = $1 AND receipt = $2
            FOR UPDATE
            "#,
        )
        .bind(&self.name)
        .bind(receipt_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, receive_count)) = current else {
            tx.rollback().await?;
            debug!(queue = %self.name, receipt = %receipt, "Ignoring stale receipt");
            return Ok(ReleaseOutcome::Requeued);
        };

        let exhausted = self
            .dead_letter
            .as_ref()
            .filter(|(_, max)| u32::try_from(receive_count).unwrap_or(0) >= *max);

        let outcome = match exhausted {
            Some((target, _)) => {
                sqlx::query(
                    r#"
                    UPDATE queue_messages
                    SET queue = $2, receive_count = 0, receipt = NULL,
                        visible_at = NOW(), enqueued_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(target)
                .execute(&mut *tx)
                .await?;
                ReleaseOutcome::DeadLettered
            }
            None => {
                sqlx::query(
                    "UPDATE queue_messages SET receipt = NULL, visible_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                ReleaseOutcome::Requeued
            }
        };
        tx.commit().await?;

        if let (ReleaseOutcome::DeadLettered, Some((target, _))) = (outcome, &self.dead_letter) {
            warn!(
                queue = %self.name,
                dead_letter_queue = %target,
                message_id = %id,
                "Moving message to dead-letter queue"
            );
            record_dead_letter(&self.name, 1);
        }
        Ok(outcome)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let (available, in_flight): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE visible_at <= NOW()),
                COUNT(*) FILTER (WHERE visible_at > NOW())
            FROM queue_messages
            WHERE queue = $1
            "#,
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueDepth {
            available: usize::try_from(available).unwrap_or(0),
            in_flight: usize::try_from(in_flight).unwrap_or(0),
        })
    }
}
