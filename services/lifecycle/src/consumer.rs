//! Batch consumers driving the pipeline stages.
//!
//! [`QueueConsumer`] pulls batches from a [`Queue`], runs a
//! [`MessageHandler`] over them with bounded concurrency, and resolves each
//! message individually: `Ok` acknowledges it, `Err` releases it for
//! redelivery (and eventually the dead-letter queue). One failing message
//! never holds back the rest of its batch.
//!
//! [`ChangeFeedConsumer`] follows a record store's change feed in sequence
//! order and checkpoints after every handled change. A change that fails on
//! an unavailable backend holds the feed until it goes through; one that
//! fails on its own content is skipped after a bounded number of attempts.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::messages::{ChangeRecord, ChangeSequence, SequencedChange};
use crate::store::{subscribe_changes, RecordStore};
use crate::transport::{Delivery, Queue, ReleaseOutcome};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// How a handler resolved a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Nothing to do; the message is acknowledged anyway
    Skipped { reason: String },
}

impl Outcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }
}

/// Handler for messages pulled from a queue
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stable name used in logs, metrics and checkpoints
    fn name(&self) -> &'static str;

    /// Process one message. Returning an error releases it for redelivery.
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome>;

    /// Called when processing fails
    async fn on_error(&self, delivery: &Delivery, error: &PipelineError) {
        warn!(
            consumer = self.name(),
            message_id = %delivery.message_id,
            receive_count = delivery.receive_count,
            error = %error,
            error_kind = error.kind(),
            "Message processing failed"
        );
    }
}

/// Handler for change records read from a record store's feed
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle_change(&self, change: &ChangeRecord) -> Result<Outcome>;
}

/// Counts of what happened to one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Failed messages that spent their retry budget
    pub dead_lettered: usize,
    /// Failed messages that ran past their deadline
    pub timed_out: usize,
}

impl BatchReport {
    pub fn merge(&mut self, other: BatchReport) {
        self.received += other.received;
        self.completed += other.completed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.timed_out += other.timed_out;
    }
}

/// Batch consumer tuning
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub visibility_timeout: Duration,
    pub message_timeout: Duration,
    pub batch_timeout: Duration,
    pub poll_interval: Duration,
}

impl BatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.consumer.batch_size,
            concurrency: config.consumer.concurrency.max(1),
            visibility_timeout: config.visibility_timeout(),
            message_timeout: config.message_timeout(),
            batch_timeout: config.batch_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Run `handler` over a batch with bounded concurrency.
///
/// Each message gets its own deadline: `message_timeout` from when it
/// starts, capped by the batch deadline. A message that runs past its
/// deadline fails with [`PipelineError::Timeout`]; the others are unaffected.
pub async fn process_batch(
    handler: &dyn MessageHandler,
    deliveries: Vec<Delivery>,
    concurrency: usize,
    message_timeout: Duration,
    batch_timeout: Duration,
) -> Vec<(Delivery, Result<Outcome>)> {
    let batch_deadline = Instant::now() + batch_timeout;

    stream::iter(deliveries)
        .map(|delivery| async move {
            let deadline = (Instant::now() + message_timeout).min(batch_deadline);
            let result = match tokio::time::timeout_at(deadline, handler.handle(&delivery)).await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(message_timeout)),
            };
            (delivery, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

/// Pulls batches from a queue and resolves each message
pub struct QueueConsumer {
    queue: Arc<dyn Queue>,
    handler: Arc<dyn MessageHandler>,
    settings: BatchSettings,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn Queue>,
        handler: Arc<dyn MessageHandler>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            queue,
            handler,
            settings,
        }
    }

    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    /// Receive and process one batch
    #[instrument(skip(self), fields(consumer = self.handler.name(), queue = %self.queue.name()))]
    pub async fn poll_once(&self) -> Result<BatchReport> {
        let deliveries = self
            .queue
            .receive_batch(self.settings.batch_size, self.settings.visibility_timeout)
            .await?;

        let mut report = BatchReport {
            received: deliveries.len(),
            ..Default::default()
        };
        if deliveries.is_empty() {
            return Ok(report);
        }

        let name = self.handler.name();
        let started = std::time::Instant::now();
        debug!(count = deliveries.len(), "Processing batch");

        let results = process_batch(
            self.handler.as_ref(),
            deliveries,
            self.settings.concurrency,
            self.settings.message_timeout,
            self.settings.batch_timeout,
        )
        .await;

        // every delivery is resolved even when one acknowledgement fails;
        // the first queue error is returned after the loop
        let mut queue_error = None;
        for (delivery, result) in results {
            let resolved = match result {
                Ok(outcome) => {
                    match outcome {
                        Outcome::Completed => report.completed += 1,
                        Outcome::Skipped { reason } => {
                            debug!(message_id = %delivery.message_id, reason = %reason, "Message skipped");
                            report.skipped += 1;
                        }
                    }
                    metrics::counter!("photos.messages.processed", "consumer" => name).increment(1);
                    self.queue.acknowledge(&delivery.receipt).await
                }
                Err(e) => {
                    if matches!(e, PipelineError::Timeout(_)) {
                        report.timed_out += 1;
                    }
                    self.handler.on_error(&delivery, &e).await;
                    report.failed += 1;
                    metrics::counter!(
                        "photos.messages.failed",
                        "consumer" => name,
                        "kind" => e.kind()
                    )
                    .increment(1);

                    self.queue.release(&delivery.receipt).await.map(|released| {
                        if released == ReleaseOutcome::DeadLettered {
                            report.dead_lettered += 1;
                        }
                    })
                }
            };

            if let Err(e) = resolved {
                error!(
                    message_id = %delivery.message_id,
                    error = %e,
                    "Failed to resolve message, it will be redelivered"
                );
                metrics::counter!("photos.messages.unresolved", "consumer" => name).increment(1);
                queue_error.get_or_insert(e);
            }
        }

        metrics::histogram!("photos.batch.duration_seconds", "consumer" => name)
            .record(started.elapsed().as_secs_f64());

        match queue_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Poll until cancelled. An in-progress batch is finished before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(consumer = self.name(), queue = %self.queue.name(), "Starting queue consumer");

        while !shutdown.is_cancelled() {
            let idle = match self.poll_once().await {
                Ok(report) => report.received == 0,
                Err(e) => {
                    error!(consumer = self.name(), error = %e, "Batch failed");
                    metrics::counter!("photos.consumer.errors", "consumer" => self.name())
                        .increment(1);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }

        info!(consumer = self.name(), "Queue consumer stopped");
    }
}

/// How far one pass over a batch of changes got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedPass {
    /// Every change was resolved and checkpointed
    Done(BatchReport),
    /// Stopped at a change whose backend is unavailable. The checkpoint sits
    /// just before it, so the next pass delivers it again.
    Stalled(BatchReport),
    /// Another instance holds the feed lease
    Standby,
}

impl FeedPass {
    fn report(self) -> BatchReport {
        match self {
            FeedPass::Done(report) | FeedPass::Stalled(report) => report,
            FeedPass::Standby => BatchReport::default(),
        }
    }
}

/// Follows a record store's change feed.
///
/// Instances sharing a consumer name coordinate through a lease in the
/// record store: only the holder handles changes and moves the checkpoint,
/// the others stand by and take over once the lease lapses.
pub struct ChangeFeedConsumer {
    store: Arc<dyn RecordStore>,
    handler: Arc<dyn ChangeHandler>,
    holder: String,
    batch_size: usize,
    poll_interval: Duration,
    max_backoff: Duration,
    max_attempts: u32,
    lease_ttl: Duration,
}

impl ChangeFeedConsumer {
    pub fn new(store: Arc<dyn RecordStore>, handler: Arc<dyn ChangeHandler>) -> Self {
        let holder = format!("{}-{}", handler.name(), Uuid::new_v4());
        Self {
            store,
            handler,
            holder,
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: 3,
            lease_ttl: Duration::from_secs(30),
        }
    }

    pub fn from_config(
        store: Arc<dyn RecordStore>,
        handler: Arc<dyn ChangeHandler>,
        config: &Config,
    ) -> Self {
        Self::new(store, handler)
            .with_batch_size(config.consumer.change_feed_batch_size)
            .with_poll_interval(config.change_feed_poll_interval())
            .with_max_backoff(config.change_feed_max_backoff())
            .with_max_attempts(config.consumer.change_feed_max_attempts)
            .with_lease_ttl(config.change_feed_lease())
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Wait between empty polls, and between attempts at a failing change
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Cap of the doubling back-off while the feed is stalled
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    /// Handle every change recorded after the checkpoint, up to one batch.
    ///
    /// Returns an empty report while another instance holds the lease.
    pub async fn poll_once(&self) -> Result<BatchReport> {
        if !self.renew_lease().await? {
            return Ok(BatchReport::default());
        }
        let checkpoint = self.store.load_checkpoint(self.name()).await?;
        let batch = self.store.read_changes(checkpoint, self.batch_size).await?;
        Ok(self.handle_batch(batch).await?.report())
    }

    /// Follow the feed until cancelled.
    ///
    /// Failures never end the loop: after a failed read, checkpoint write or
    /// a stalled change the consumer backs off, reloads its checkpoint and
    /// subscribes again from there.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            consumer = self.name(),
            store = %self.store.name(),
            holder = %self.holder,
            "Starting change feed consumer"
        );

        let mut backoff = self.poll_interval;
        while !shutdown.is_cancelled() {
            let healthy = match self.follow(&shutdown).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    error!(consumer = self.name(), error = %e, "Change feed failed");
                    metrics::counter!("photos.consumer.errors", "consumer" => self.name())
                        .increment(1);
                    false
                }
            };

            let wait = if healthy {
                backoff = self.poll_interval;
                self.poll_interval
            } else {
                let wait = backoff;
                backoff = (backoff * 2).min(self.max_backoff.max(self.poll_interval));
                wait
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if let Err(e) = self.store.release_lease(self.name(), &self.holder).await {
            warn!(consumer = self.name(), error = %e, "Failed to release change feed lease");
        }
        info!(consumer = self.name(), "Change feed consumer stopped");
    }

    /// One subscription, from the stored checkpoint until it has to be
    /// re-established. Returns `Ok(false)` when the feed stalled.
    async fn follow(&self, shutdown: &CancellationToken) -> Result<bool> {
        if !self.renew_lease().await? {
            debug!(consumer = self.name(), "Change feed lease held elsewhere");
            return Ok(true);
        }

        let checkpoint = self.store.load_checkpoint(self.name()).await?;
        debug!(consumer = self.name(), checkpoint, "Subscribing to change feed");

        let feed = subscribe_changes(
            self.store.clone(),
            checkpoint,
            self.batch_size,
            self.poll_interval,
        );
        futures::pin_mut!(feed);

        // keep the lease while the feed is idle
        let mut renewal = tokio::time::interval((self.lease_ttl / 3).max(Duration::from_millis(1)));
        renewal.tick().await;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(true),
                _ = renewal.tick() => {
                    if !self.renew_lease().await? {
                        return Ok(true);
                    }
                    continue;
                }
                next = feed.next() => next,
            };

            match next {
                Some(Ok(batch)) => match self.handle_batch(batch).await? {
                    FeedPass::Done(_) => {}
                    FeedPass::Stalled(_) => return Ok(false),
                    FeedPass::Standby => return Ok(true),
                },
                Some(Err(e)) => return Err(e),
                None => return Ok(true),
            }
        }
    }

    async fn renew_lease(&self) -> Result<bool> {
        self.store
            .acquire_lease(self.name(), &self.holder, self.lease_ttl)
            .await
    }

    async fn handle_batch(&self, batch: Vec<SequencedChange>) -> Result<FeedPass> {
        let mut report = BatchReport {
            received: batch.len(),
            ..Default::default()
        };

        for SequencedChange { sequence, change } in batch {
            if !self.renew_lease().await? {
                info!(consumer = self.name(), sequence, "Lost change feed lease");
                return Ok(FeedPass::Standby);
            }

            match self.handle_with_retries(sequence, &change).await {
                Ok(Outcome::Completed) => report.completed += 1,
                Ok(Outcome::Skipped { .. }) => report.skipped += 1,
                Err(e) if e.is_transport() => {
                    warn!(
                        consumer = self.name(),
                        sequence,
                        record_id = %change.key,
                        error = %e,
                        "Change feed stalled, change will be redelivered"
                    );
                    report.failed += 1;
                    return Ok(FeedPass::Stalled(report));
                }
                Err(e) => {
                    error!(
                        consumer = self.name(),
                        sequence,
                        record_id = %change.key,
                        attempts = self.max_attempts,
                        error = %e,
                        "Giving up on change record"
                    );
                    metrics::counter!("photos.changes.failed", "consumer" => self.name())
                        .increment(1);
                    report.failed += 1;
                }
            }
            self.store.save_checkpoint(self.name(), sequence).await?;
        }

        Ok(FeedPass::Done(report))
    }

    /// Returns the last error once every attempt failed
    async fn handle_with_retries(
        &self,
        sequence: ChangeSequence,
        change: &ChangeRecord,
    ) -> Result<Outcome> {
        let name = self.name();
        let mut attempt = 1;

        loop {
            match self.handler.handle_change(change).await {
                Ok(outcome) => {
                    metrics::counter!("photos.changes.processed", "consumer" => name).increment(1);
                    return Ok(outcome);
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        consumer = name,
                        sequence,
                        attempt,
                        error = %e,
                        "Change handling failed, retrying"
                    );
                    tokio::time::sleep(self.poll_interval).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
