use crate::consumer::{MessageHandler, Outcome};
use crate::error::{PipelineError, Result};
use crate::messages::{parse_upload_notifications, UploadNotification};
use crate::model::Attributes;
use crate::store::{CreateOutcome, RecordStore};
use crate::transport::{Delivery, OutgoingMessage, Queue};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Creates a record for every upload with an allowed extension and fails
/// the rest, so they run through the retry budget into the dead-letter
/// queue.
///
/// Rejected references that share a message with valid ones are split off
/// and re-enqueued one per message. Only rejected references ever reach the
/// dead-letter queue, so the reaper never deletes an accepted photo.
pub struct IngestValidator {
    records: Arc<dyn RecordStore>,
    upload_queue: Arc<dyn Queue>,
}

impl IngestValidator {
    pub fn new(records: Arc<dyn RecordStore>, upload_queue: Arc<dyn Queue>) -> Self {
        Self {
            records,
            upload_queue,
        }
    }

    async fn create_record(&self, notification: &UploadNotification) -> Result<()> {
        match self
            .records
            .create_if_absent(&notification.object_key, Attributes::new())
            .await?
        {
            CreateOutcome::Created => {
                info!(id = %notification.object_key, "Photo record created");
                metrics::counter!("photos.records.created").increment(1);
            }
            CreateOutcome::AlreadyExists => {
                debug!(id = %notification.object_key, "Photo record already exists");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for IngestValidator {
    fn name(&self) -> &'static str {
        "ingest-validator"
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id))]
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome> {
        let notifications = match parse_upload_notifications(&delivery.body) {
            Ok(notifications) => notifications,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable upload notification");
                return Ok(Outcome::skipped(e.to_string()));
            }
        };

        if notifications.is_empty() {
            return Ok(Outcome::skipped("no object references"));
        }

        let (accepted, rejected): (Vec<_>, Vec<_>) = notifications
            .into_iter()
            .partition(UploadNotification::has_allowed_extension);

        for notification in &accepted {
            self.create_record(notification).await?;
        }

        let Some(first_rejected) = rejected.first() else {
            return Ok(Outcome::Completed);
        };
        metrics::counter!("photos.uploads.rejected").increment(rejected.len() as u64);

        if accepted.is_empty() {
            return Err(PipelineError::RejectedFormat {
                key: first_rejected.object_key.clone(),
                extension: first_rejected.extension(),
            });
        }

        for notification in &rejected {
            warn!(
                key = %notification.object_key,
                extension = %notification.extension(),
                "Splitting rejected upload into its own message"
            );
            self.upload_queue
                .enqueue(OutgoingMessage::new(notification.to_body()))
                .await?;
        }

        Ok(Outcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecordStore;
    use crate::transport::{InMemoryQueue, Receipt};
    use std::time::Duration;

    fn delivery(body: &str) -> Delivery {
        Delivery {
            message_id: "m-1".to_string(),
            receipt: Receipt::new("r-1"),
            body: body.to_string(),
            attributes: Default::default(),
            receive_count: 1,
        }
    }

    fn s3_body(keys: &[&str]) -> String {
        let records: Vec<_> = keys
            .iter()
            .map(|k| serde_json::json!({ "s3": { "object": { "key": k } } }))
            .collect();
        serde_json::json!({ "Records": records }).to_string()
    }

    fn setup() -> (Arc<InMemoryRecordStore>, Arc<InMemoryQueue>, IngestValidator) {
        let records = Arc::new(InMemoryRecordStore::new("photos"));
        let queue = Arc::new(InMemoryQueue::new("uploads"));
        let validator = IngestValidator::new(records.clone(), queue.clone());
        (records, queue, validator)
    }

    #[tokio::test]
    async fn test_allowed_extensions_create_records_once() {
        let (records, _, validator) = setup();
        let body = s3_body(&["summer+day.JPG", "caf%C3%A9.jpeg", "x.Png"]);

        assert_eq!(
            validator.handle(&delivery(&body)).await.unwrap(),
            Outcome::Completed
        );
        assert_eq!(
            validator.handle(&delivery(&body)).await.unwrap(),
            Outcome::Completed
        );

        assert_eq!(records.len(), 3);
        assert!(records.get("summer day.JPG").await.unwrap().is_some());
        assert!(records.get("café.jpeg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_all_rejected_fails_the_message() {
        let (records, queue, validator) = setup();

        let err = validator
            .handle(&delivery(&s3_body(&["notes.txt"])))
            .await
            .unwrap_err();

        match err {
            PipelineError::RejectedFormat { key, extension } => {
                assert_eq!(key, "notes.txt");
                assert_eq!(extension, ".txt");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(records.is_empty());
        assert_eq!(queue.depth().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_mixed_batch_splits_rejected_references() {
        let (records, queue, validator) = setup();
        let body = s3_body(&["good.jpg", "bad.gif", "also+bad.bmp"]);

        assert_eq!(
            validator.handle(&delivery(&body)).await.unwrap(),
            Outcome::Completed
        );
        assert_eq!(records.len(), 1);

        let split = queue
            .receive_batch(10, Duration::from_secs(30))
            .await
            .unwrap();
        let keys: Vec<_> = split
            .iter()
            .flat_map(|d| parse_upload_notifications(&d.body).unwrap())
            .map(|n| n.object_key)
            .collect();
        assert_eq!(keys, vec!["bad.gif", "also bad.bmp"]);
    }

    #[tokio::test]
    async fn test_enveloped_and_empty_bodies() {
        let (records, _, validator) = setup();

        let inner = s3_body(&["wrapped.png"]);
        let body = serde_json::json!({ "Message": inner }).to_string();
        assert_eq!(
            validator.handle(&delivery(&body)).await.unwrap(),
            Outcome::Completed
        );
        assert!(records.get("wrapped.png").await.unwrap().is_some());

        let empty = serde_json::json!({ "Message": "{}" }).to_string();
        assert!(matches!(
            validator.handle(&delivery(&empty)).await.unwrap(),
            Outcome::Skipped { .. }
        ));
        assert!(matches!(
            validator.handle(&delivery("garbage")).await.unwrap(),
            Outcome::Skipped { .. }
        ));
    }
}
