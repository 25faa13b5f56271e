use crate::consumer::{MessageHandler, Outcome};
use crate::error::Result;
use crate::messages::StatusUpdate;
use crate::store::{MergeOutcome, MissingRecordPolicy, RecordStore};
use crate::transport::Delivery;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Applies review decisions. The only writer of `status`, `reason` and
/// `statusUpdatedAt`, which are always written together.
pub struct StatusUpdater {
    records: Arc<dyn RecordStore>,
    missing_record_policy: MissingRecordPolicy,
}

impl StatusUpdater {
    pub fn new(records: Arc<dyn RecordStore>, missing_record_policy: MissingRecordPolicy) -> Self {
        Self {
            records,
            missing_record_policy,
        }
    }
}

#[async_trait]
impl MessageHandler for StatusUpdater {
    fn name(&self) -> &'static str {
        "review-status-updater"
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id))]
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome> {
        let status = match StatusUpdate::from_body(&delivery.body).and_then(|u| u.validate()) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Dropping status update");
                metrics::counter!("photos.messages.dropped", "consumer" => self.name(), "kind" => e.kind())
                    .increment(1);
                return Ok(Outcome::skipped(e.to_string()));
            }
        };

        let outcome = self
            .records
            .merge_attributes(&status.id, status.attributes(), self.missing_record_policy)
            .await?;

        match outcome {
            MergeOutcome::Updated | MergeOutcome::Created => {
                info!(
                    id = %status.id,
                    status = %status.status,
                    updated_at = %status.updated_at,
                    "Review status updated"
                );
                metrics::counter!("photos.reviews.applied", "status" => status.status.as_str())
                    .increment(1);
                Ok(Outcome::Completed)
            }
            MergeOutcome::Unchanged => {
                debug!(id = %status.id, "Review status already applied");
                Ok(Outcome::skipped("already applied"))
            }
            MergeOutcome::MissingRecord => {
                info!(id = %status.id, "No record for status update");
                Ok(Outcome::skipped("record does not exist"))
            }
        }
    }
}
