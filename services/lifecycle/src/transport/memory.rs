use super::{
    record_dead_letter, Delivery, MessageAttributes, OutgoingMessage, Queue, QueueDepth, Receipt,
    ReleaseOutcome,
};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

struct Entry {
    id: String,
    body: String,
    attributes: MessageAttributes,
    receive_count: u32,
    enqueued_at: Instant,
    visible_at: Instant,
    receipt: Option<Receipt>,
}

impl Entry {
    fn into_message(self) -> OutgoingMessage {
        OutgoingMessage {
            body: self.body,
            attributes: self.attributes,
        }
    }
}

struct DeadLetterTarget {
    queue: Arc<dyn Queue>,
    max_receive_count: u32,
}

/// Process-local queue. Uses tokio's clock so tests can pause and advance time.
pub struct InMemoryQueue {
    name: String,
    entries: Mutex<VecDeque<Entry>>,
    dead_letter: Option<DeadLetterTarget>,
    retention: Option<Duration>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(VecDeque::new()),
            dead_letter: None,
            retention: None,
        }
    }

    /// Move messages to `queue` once they have been received `max_receive_count` times
    pub fn with_dead_letter(mut self, queue: Arc<dyn Queue>, max_receive_count: u32) -> Self {
        self.dead_letter = Some(DeadLetterTarget {
            queue,
            max_receive_count,
        });
        self
    }

    /// Drop messages older than `retention`
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    fn exhausted(&self, receive_count: u32) -> bool {
        self.dead_letter
            .as_ref()
            .is_some_and(|dl| receive_count >= dl.max_receive_count)
    }

    fn purge_expired(&self, entries: &mut VecDeque<Entry>, now: Instant) {
        if let Some(retention) = self.retention {
            let before = entries.len();
            entries.retain(|e| now.duration_since(e.enqueued_at) < retention);
            let purged = before - entries.len();
            if purged > 0 {
                debug!(queue = %self.name, purged, "Dropped messages past retention");
            }
        }
    }

    async fn dead_letter(&self, messages: Vec<OutgoingMessage>) -> Result<()> {
        let Some(target) = &self.dead_letter else {
            return Ok(());
        };
        if messages.is_empty() {
            return Ok(());
        }

        warn!(
            queue = %self.name,
            dead_letter_queue = %target.queue.name(),
            count = messages.len(),
            "Moving messages to dead-letter queue"
        );
        record_dead_letter(&self.name, messages.len());

        for message in messages {
            target.queue.enqueue(message).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, message: OutgoingMessage) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        self.entries.lock().push_back(Entry {
            id: id.clone(),
            body: message.body,
            attributes: message.attributes,
            receive_count: 0,
            enqueued_at: now,
            visible_at: now,
            receipt: None,
        });
        Ok(id)
    }

    async fn receive_batch(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>> {
        let now = Instant::now();
        let mut deliveries = Vec::new();
        let mut exhausted = Vec::new();

        {
            let mut entries = self.entries.lock();
            self.purge_expired(&mut entries, now);

            let mut i = 0;
            while i < entries.len() && deliveries.len() < max {
                if entries[i].visible_at > now {
                    i += 1;
                    continue;
                }

                // visibility lapsed on a message that already spent its budget
                if self.exhausted(entries[i].receive_count) {
                    if let Some(entry) = entries.remove(i) {
                        exhausted.push(entry.into_message());
                    }
                    continue;
                }

                let entry = &mut entries[i];
                let receipt = Receipt::new(Uuid::new_v4().to_string());
                entry.receive_count += 1;
                entry.visible_at = now + visibility_timeout;
                entry.receipt = Some(receipt.clone());
                deliveries.push(Delivery {
                    message_id: entry.id.clone(),
                    receipt,
                    body: entry.body.clone(),
                    attributes: entry.attributes.clone(),
                    receive_count: entry.receive_count,
                });
                i += 1;
            }
        }

        self.dead_letter(exhausted).await?;
        Ok(deliveries)
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries
            .iter()
            .position(|e| e.receipt.as_ref() == Some(receipt))
        {
            Some(idx) => {
                entries.remove(idx);
            }
            None => debug!(queue = %self.name, receipt = %receipt, "Ignoring stale receipt"),
        }
        Ok(())
    }

    async fn release(&self, receipt: &Receipt) -> Result<ReleaseOutcome> {
        let dead = {
            let mut entries = self.entries.lock();
            let Some(idx) = entries
                .iter()
                .position(|e| e.receipt.as_ref() == Some(receipt))
            else {
                debug!(queue = %self.name, receipt = %receipt, "Ignoring stale receipt");
                return Ok(ReleaseOutcome::Requeued);
            };

            if self.exhausted(entries[idx].receive_count) {
                entries.remove(idx).map(Entry::into_message)
            } else {
                let entry = &mut entries[idx];
                entry.visible_at = Instant::now();
                entry.receipt = None;
                None
            }
        };

        match dead {
            Some(message) => {
                self.dead_letter(vec![message]).await?;
                Ok(ReleaseOutcome::DeadLettered)
            }
            None => Ok(ReleaseOutcome::Requeued),
        }
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.purge_expired(&mut entries, now);

        let in_flight = entries.iter().filter(|e| e.visible_at > now).count();
        Ok(QueueDepth {
            available: entries.len() - in_flight,
            in_flight,
        })
    }
}
