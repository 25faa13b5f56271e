//! At-least-once message transport: work queues with visibility timeouts and
//! dead-lettering, plus a fan-out topic with per-subscription filters.
//!
//! A received message stays invisible to other receivers until it is
//! acknowledged, released, or its visibility timeout lapses. Every receive
//! increments the message's receive count; once that count reaches the
//! queue's `max_receive_count`, the next release or lapse moves the message
//! to the dead-letter queue instead of making it visible again.

mod filter;
mod memory;
mod postgres;
mod topic;

pub use filter::FilterPolicy;
pub use memory::InMemoryQueue;
pub use postgres::PgQueue;
pub use topic::{FanoutTopic, PublishReceipt, Topic};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// String attributes carried next to a message body
pub type MessageAttributes = BTreeMap<String, String>;

/// Message handed to a queue or topic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub body: String,
    #[serde(default)]
    pub attributes: MessageAttributes,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            attributes: MessageAttributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Opaque handle identifying one particular receive of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(String);

impl Receipt {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A received message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub receipt: Receipt,
    pub body: String,
    pub attributes: MessageAttributes,
    /// Number of times this message has been received, including this one
    pub receive_count: u32,
}

impl Delivery {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// What happened to a released message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Visible again for another receive
    Requeued,
    /// Retry budget spent; moved to the dead-letter queue
    DeadLettered,
}

/// Snapshot of a queue's contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Messages ready to be received
    pub available: usize,
    /// Messages received and not yet acknowledged or released
    pub in_flight: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.available + self.in_flight
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    /// Add a message; returns its id
    async fn enqueue(&self, message: OutgoingMessage) -> Result<String>;

    /// Receive up to `max` visible messages, hiding them for `visibility_timeout`
    async fn receive_batch(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>>;

    /// Delete a received message. Stale receipts are ignored.
    async fn acknowledge(&self, receipt: &Receipt) -> Result<()>;

    /// Give a received message back for redelivery (or dead-lettering)
    async fn release(&self, receipt: &Receipt) -> Result<ReleaseOutcome>;

    async fn depth(&self) -> Result<QueueDepth>;
}

fn record_dead_letter(queue: &str, count: usize) {
    metrics::counter!("photos.queue.dead_lettered", "queue" => queue.to_string())
        .increment(count as u64);
}
