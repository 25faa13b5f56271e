use super::router::METADATA_TYPE_ATTRIBUTE;
use crate::consumer::{MessageHandler, Outcome};
use crate::error::Result;
use crate::messages::MetadataEvent;
use crate::model::{attr, Attributes};
use crate::store::{MergeOutcome, MissingRecordPolicy, RecordStore};
use crate::transport::Delivery;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Attributes owned by other writers
const RESERVED_ATTRIBUTES: [&str; 4] = [
    attr::ID,
    attr::STATUS,
    attr::REASON,
    attr::STATUS_UPDATED_AT,
];

/// Stored attribute name for a metadata type. The lower-case `name` alias
/// maps to `Name`; everything else is used verbatim.
pub fn canonical_attribute(metadata_type: &str) -> &str {
    if metadata_type == "name" {
        attr::NAME
    } else {
        metadata_type
    }
}

/// Writes one attribute per metadata event onto the photo record
pub struct MetadataApplier {
    records: Arc<dyn RecordStore>,
    missing_record_policy: MissingRecordPolicy,
}

impl MetadataApplier {
    pub fn new(records: Arc<dyn RecordStore>, missing_record_policy: MissingRecordPolicy) -> Self {
        Self {
            records,
            missing_record_policy,
        }
    }
}

#[async_trait]
impl MessageHandler for MetadataApplier {
    fn name(&self) -> &'static str {
        "metadata-applier"
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id))]
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome> {
        let update = match MetadataEvent::from_message(
            &delivery.body,
            delivery.attribute(METADATA_TYPE_ATTRIBUTE),
        )
        .and_then(|event| event.validate())
        {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "Dropping metadata event");
                metrics::counter!("photos.messages.dropped", "consumer" => self.name(), "kind" => e.kind())
                    .increment(1);
                return Ok(Outcome::skipped(e.to_string()));
            }
        };

        let attribute = canonical_attribute(&update.metadata_type);
        if RESERVED_ATTRIBUTES.contains(&attribute) {
            warn!(id = %update.id, attribute = %attribute, "Refusing to write reserved attribute");
            return Ok(Outcome::skipped(format!("{attribute} is reserved")));
        }

        let partial = Attributes::from([(attribute.to_string(), update.value.clone())]);
        let outcome = self
            .records
            .merge_attributes(&update.id, partial, self.missing_record_policy)
            .await?;

        match outcome {
            MergeOutcome::Updated | MergeOutcome::Created => {
                info!(id = %update.id, attribute = %attribute, ?outcome, "Metadata applied");
                metrics::counter!("photos.metadata.applied", "attribute" => attribute.to_string())
                    .increment(1);
                Ok(Outcome::Completed)
            }
            MergeOutcome::Unchanged => {
                debug!(id = %update.id, attribute = %attribute, "Metadata already applied");
                Ok(Outcome::skipped("already applied"))
            }
            MergeOutcome::MissingRecord => {
                info!(id = %update.id, "No record for metadata event");
                Ok(Outcome::skipped("record does not exist"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecordStore;
    use crate::transport::Receipt;

    fn delivery(body: &str, metadata_type: Option<&str>) -> Delivery {
        let mut attributes = crate::transport::MessageAttributes::new();
        if let Some(t) = metadata_type {
            attributes.insert(METADATA_TYPE_ATTRIBUTE.to_string(), t.to_string());
        }
        Delivery {
            message_id: "m-1".to_string(),
            receipt: Receipt::new("r-1"),
            body: body.to_string(),
            attributes,
            receive_count: 1,
        }
    }

    async fn setup(policy: MissingRecordPolicy) -> (Arc<InMemoryRecordStore>, MetadataApplier) {
        let records = Arc::new(InMemoryRecordStore::new("photos"));
        records.create_if_absent("x", Attributes::new()).await.unwrap();
        let applier = MetadataApplier::new(records.clone(), policy);
        (records, applier)
    }

    #[test]
    fn test_canonical_attribute() {
        assert_eq!(canonical_attribute("name"), "Name");
        assert_eq!(canonical_attribute("Name"), "Name");
        assert_eq!(canonical_attribute("Caption"), "Caption");
        assert_eq!(canonical_attribute("Date"), "Date");
    }

    #[tokio::test]
    async fn test_name_alias_sets_display_name() {
        let (records, applier) = setup(MissingRecordPolicy::Skip).await;

        let outcome = applier
            .handle(&delivery(r#"{"id":"x","value":"abc"}"#, Some("name")))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(records.get("x").await.unwrap().unwrap().name(), Some("abc"));
    }

    #[tokio::test]
    async fn test_caption_and_numeric_values() {
        let (records, applier) = setup(MissingRecordPolicy::Skip).await;

        applier
            .handle(&delivery(r#"{"id":"x","value":"hi"}"#, Some("Caption")))
            .await
            .unwrap();
        applier
            .handle(&delivery(r#"{"id":"x","value":20240101}"#, Some("Date")))
            .await
            .unwrap();

        let record = records.get("x").await.unwrap().unwrap();
        assert_eq!(record.caption(), Some("hi"));
        assert_eq!(record.date(), Some("20240101"));
    }

    #[tokio::test]
    async fn test_invalid_events_cause_no_write() {
        let (records, applier) = setup(MissingRecordPolicy::Create).await;

        for (body, metadata_type) in [
            (r#"{"value":"abc"}"#, Some("Caption")),
            (r#"{"id":"x","value":null}"#, Some("Caption")),
            (r#"{"id":"x"}"#, Some("Caption")),
            (r#"{"id":"x","value":"abc"}"#, None),
            ("not json", Some("Caption")),
        ] {
            let outcome = applier.handle(&delivery(body, metadata_type)).await.unwrap();
            assert!(matches!(outcome, Outcome::Skipped { .. }), "{body}");
        }

        assert_eq!(records.read_changes(1, 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_reserved_attributes_are_refused() {
        let (records, applier) = setup(MissingRecordPolicy::Skip).await;

        let outcome = applier
            .handle(&delivery(r#"{"id":"x","value":"Pass"}"#, Some("status")))
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert_eq!(records.get("x").await.unwrap().unwrap().status_value(), None);
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let (records, applier) = setup(MissingRecordPolicy::Skip).await;
        let message = delivery(r#"{"id":"x","value":"hi"}"#, Some("Caption"));

        assert_eq!(applier.handle(&message).await.unwrap(), Outcome::Completed);
        assert!(matches!(
            applier.handle(&message).await.unwrap(),
            Outcome::Skipped { .. }
        ));
        assert_eq!(records.read_changes(0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_record_skip_policy() {
        let (records, applier) = setup(MissingRecordPolicy::Skip).await;

        let outcome = applier
            .handle(&delivery(r#"{"id":"ghost","value":"hi"}"#, Some("Caption")))
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert!(records.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_record_create_policy() {
        let (records, applier) = setup(MissingRecordPolicy::Create).await;

        let outcome = applier
            .handle(&delivery(r#"{"id":"ghost","value":"hi"}"#, Some("Caption")))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(
            records.get("ghost").await.unwrap().unwrap().caption(),
            Some("hi")
        );
    }
}
