//! Wiring of backends, handlers and consumers into one running pipeline.

use crate::config::{Config, MailBackend, ObjectBackend};
use crate::consumer::{BatchReport, BatchSettings, ChangeFeedConsumer, QueueConsumer};
use crate::error::Result;
use crate::handlers::router::{applier_filter, status_filter};
use crate::handlers::{
    ChangeNotifier, IngestValidator, InvalidObjectReaper, MetadataApplier, StatusUpdater,
};
use crate::mail::{LogMailer, Mailer, SesMailer};
use crate::objects::{InMemoryObjectStore, ObjectStore, S3ObjectStore};
use crate::store::{InMemoryRecordStore, PgRecordStore, RecordStore};
use crate::transport::{FanoutTopic, InMemoryQueue, PgQueue, Queue, Topic};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Every collaborator the pipeline talks to
#[derive(Clone)]
pub struct Backends {
    pub records: Arc<dyn RecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub upload_queue: Arc<dyn Queue>,
    pub dead_letter_queue: Arc<dyn Queue>,
    pub applier_queue: Arc<dyn Queue>,
    pub status_queue: Arc<dyn Queue>,
    pub metadata_dead_letter_queue: Arc<dyn Queue>,
    pub topic: Arc<dyn Topic>,
    pub mailer: Arc<dyn Mailer>,
    /// Set for the postgres backend; used by readiness checks
    pub pool: Option<PgPool>,
}

impl Backends {
    /// Process-local backends with an in-memory object store and a logging mailer
    pub fn in_memory(config: &Config) -> Self {
        Self::in_memory_with(
            config,
            Arc::new(InMemoryObjectStore::new(config.objects.bucket.clone())),
            Arc::new(LogMailer),
        )
    }

    pub fn in_memory_with(
        config: &Config,
        objects: Arc<dyn ObjectStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let queues = &config.queues;
        let max_receives = queues.max_receive_count;

        let dead_letter_queue: Arc<dyn Queue> = Arc::new(
            InMemoryQueue::new(queues.dead_letter_queue.clone())
                .with_retention(config.dead_letter_retention()),
        );
        let metadata_dead_letter_queue: Arc<dyn Queue> = Arc::new(
            InMemoryQueue::new(queues.metadata_dead_letter_queue.clone())
                .with_retention(config.dead_letter_retention()),
        );
        let upload_queue: Arc<dyn Queue> = Arc::new(
            InMemoryQueue::new(queues.upload_queue.clone())
                .with_dead_letter(dead_letter_queue.clone(), max_receives),
        );
        let applier_queue: Arc<dyn Queue> = Arc::new(
            InMemoryQueue::new(config.topic.applier_subscription.clone())
                .with_dead_letter(metadata_dead_letter_queue.clone(), max_receives),
        );
        let status_queue: Arc<dyn Queue> = Arc::new(
            InMemoryQueue::new(config.topic.status_subscription.clone())
                .with_dead_letter(metadata_dead_letter_queue.clone(), max_receives),
        );

        Self {
            records: Arc::new(InMemoryRecordStore::new(config.records.store_name.clone())),
            objects,
            topic: metadata_topic(config, applier_queue.clone(), status_queue.clone()),
            upload_queue,
            dead_letter_queue,
            applier_queue,
            status_queue,
            metadata_dead_letter_queue,
            mailer,
            pool: None,
        }
    }

    /// Record store and queues in PostgreSQL
    pub fn postgres(
        config: &Config,
        pool: PgPool,
        objects: Arc<dyn ObjectStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let queues = &config.queues;
        let max_receives = queues.max_receive_count;
        let retention = config.dead_letter_retention();

        let queue = |name: &str| PgQueue::new(pool.clone(), name);

        let dead_letter_queue: Arc<dyn Queue> =
            Arc::new(queue(&queues.dead_letter_queue).with_retention(retention));
        let metadata_dead_letter_queue: Arc<dyn Queue> =
            Arc::new(queue(&queues.metadata_dead_letter_queue).with_retention(retention));
        let upload_queue: Arc<dyn Queue> = Arc::new(
            queue(&queues.upload_queue).with_dead_letter(&queues.dead_letter_queue, max_receives),
        );
        let applier_queue: Arc<dyn Queue> = Arc::new(
            queue(&config.topic.applier_subscription)
                .with_dead_letter(&queues.metadata_dead_letter_queue, max_receives),
        );
        let status_queue: Arc<dyn Queue> = Arc::new(
            queue(&config.topic.status_subscription)
                .with_dead_letter(&queues.metadata_dead_letter_queue, max_receives),
        );

        Self {
            records: Arc::new(PgRecordStore::new(
                pool.clone(),
                config.records.store_name.clone(),
            )),
            objects,
            topic: metadata_topic(config, applier_queue.clone(), status_queue.clone()),
            upload_queue,
            dead_letter_queue,
            applier_queue,
            status_queue,
            metadata_dead_letter_queue,
            mailer,
            pool: Some(pool),
        }
    }

    /// All queues, for depth reporting
    pub fn queues(&self) -> [&Arc<dyn Queue>; 5] {
        [
            &self.upload_queue,
            &self.dead_letter_queue,
            &self.applier_queue,
            &self.status_queue,
            &self.metadata_dead_letter_queue,
        ]
    }
}

/// The metadata topic with the router's two complementary subscriptions
fn metadata_topic(
    config: &Config,
    applier_queue: Arc<dyn Queue>,
    status_queue: Arc<dyn Queue>,
) -> Arc<dyn Topic> {
    Arc::new(
        FanoutTopic::new(config.topic.name.clone())
            .subscribe(applier_queue, applier_filter())
            .subscribe(status_queue, status_filter()),
    )
}

/// Build the configured object store
pub async fn object_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.objects.backend {
        ObjectBackend::Memory => Arc::new(InMemoryObjectStore::new(config.objects.bucket.clone())),
        ObjectBackend::S3 => Arc::new(S3ObjectStore::new(&config.objects).await?),
    };
    Ok(store)
}

/// Build the configured mailer
pub async fn mailer(config: &Config) -> Result<Arc<dyn Mailer>> {
    let mailer: Arc<dyn Mailer> = match config.mail.backend {
        MailBackend::Log => Arc::new(LogMailer),
        MailBackend::Ses => Arc::new(SesMailer::new(&config.mail).await?),
    };
    Ok(mailer)
}

/// Per-consumer results of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub ingest: BatchReport,
    pub reaper: BatchReport,
    pub applier: BatchReport,
    pub status: BatchReport,
    pub notifier: BatchReport,
}

impl PipelineReport {
    pub fn received(&self) -> usize {
        self.ingest.received
            + self.reaper.received
            + self.applier.received
            + self.status.received
            + self.notifier.received
    }

    pub fn merge(&mut self, other: PipelineReport) {
        self.ingest.merge(other.ingest);
        self.reaper.merge(other.reaper);
        self.applier.merge(other.applier);
        self.status.merge(other.status);
        self.notifier.merge(other.notifier);
    }
}

/// Queue depth snapshot as served by the API
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub name: String,
    pub available: usize,
    pub in_flight: usize,
}

/// The five consumers over a shared set of backends
pub struct Pipeline {
    backends: Backends,
    ingest: QueueConsumer,
    reaper: QueueConsumer,
    applier: QueueConsumer,
    status: QueueConsumer,
    notifier: ChangeFeedConsumer,
}

impl Pipeline {
    pub fn new(config: &Config, backends: Backends) -> Self {
        let settings = BatchSettings::from_config(config);
        let policy = config.records.missing_record_policy;

        let ingest = QueueConsumer::new(
            backends.upload_queue.clone(),
            Arc::new(IngestValidator::new(
                backends.records.clone(),
                backends.upload_queue.clone(),
            )),
            settings.clone(),
        );
        let reaper = QueueConsumer::new(
            backends.dead_letter_queue.clone(),
            Arc::new(InvalidObjectReaper::new(backends.objects.clone())),
            settings.clone(),
        );
        let applier = QueueConsumer::new(
            backends.applier_queue.clone(),
            Arc::new(MetadataApplier::new(backends.records.clone(), policy)),
            settings.clone(),
        );
        let status = QueueConsumer::new(
            backends.status_queue.clone(),
            Arc::new(StatusUpdater::new(backends.records.clone(), policy)),
            settings,
        );
        let notifier = ChangeFeedConsumer::from_config(
            backends.records.clone(),
            Arc::new(ChangeNotifier::new(
                backends.mailer.clone(),
                config.mail.sender.clone(),
                config.fallback_recipient(),
            )),
            config,
        );

        Self {
            backends,
            ingest,
            reaper,
            applier,
            status,
            notifier,
        }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// One pass of every consumer, upstream first
    pub async fn drain_once(&self) -> Result<PipelineReport> {
        Ok(PipelineReport {
            ingest: self.ingest.poll_once().await?,
            reaper: self.reaper.poll_once().await?,
            applier: self.applier.poll_once().await?,
            status: self.status.poll_once().await?,
            notifier: self.notifier.poll_once().await?,
        })
    }

    /// Drain repeatedly until a pass receives nothing, or `max_passes` is hit
    pub async fn drain_until_idle(&self, max_passes: usize) -> Result<PipelineReport> {
        let mut total = PipelineReport::default();
        for _ in 0..max_passes {
            let pass = self.drain_once().await?;
            let received = pass.received();
            total.merge(pass);
            if received == 0 {
                break;
            }
        }
        Ok(total)
    }

    pub async fn queue_status(&self) -> Result<Vec<QueueStatus>> {
        let mut statuses = Vec::new();
        for queue in self.backends.queues() {
            let depth = queue.depth().await?;
            statuses.push(QueueStatus {
                name: queue.name().to_string(),
                available: depth.available,
                in_flight: depth.in_flight,
            });
        }
        Ok(statuses)
    }

    /// Run every consumer until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting pipeline consumers");

        tokio::join!(
            self.ingest.run(shutdown.clone()),
            self.reaper.run(shutdown.clone()),
            self.applier.run(shutdown.clone()),
            self.status.run(shutdown.clone()),
            self.notifier.run(shutdown.clone()),
        );

        info!("Pipeline consumers stopped");
    }
}
