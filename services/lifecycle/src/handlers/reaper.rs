use crate::consumer::{MessageHandler, Outcome};
use crate::error::Result;
use crate::messages::parse_upload_notifications;
use crate::objects::{DeleteOutcome, ObjectStore};
use crate::transport::Delivery;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Deletes objects whose upload notifications exhausted their retries
pub struct InvalidObjectReaper {
    objects: Arc<dyn ObjectStore>,
}

impl InvalidObjectReaper {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }
}

#[async_trait]
impl MessageHandler for InvalidObjectReaper {
    fn name(&self) -> &'static str {
        "invalid-object-reaper"
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id))]
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome> {
        let notifications = match parse_upload_notifications(&delivery.body) {
            Ok(notifications) => notifications,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable dead-letter message");
                return Ok(Outcome::skipped(e.to_string()));
            }
        };

        if notifications.is_empty() {
            return Ok(Outcome::skipped("no object references"));
        }

        for notification in &notifications {
            let key = &notification.object_key;
            match self.objects.delete_object(key).await? {
                DeleteOutcome::Deleted => {
                    info!(key = %key, bucket = %self.objects.bucket(), "Deleted invalid object");
                    metrics::counter!("photos.objects.reaped").increment(1);
                }
                DeleteOutcome::AlreadyAbsent => {
                    debug!(key = %key, "Invalid object already absent");
                }
            }
        }

        Ok(Outcome::Completed)
    }
}
