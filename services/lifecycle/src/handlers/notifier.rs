use crate::consumer::{ChangeHandler, Outcome};
use crate::error::Result;
use crate::mail::{EmailMessage, Mailer};
use crate::messages::{ChangeKind, ChangeRecord};
use crate::model::PhotoRecord;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument};

/// Used when the record carries no reason
pub const REASON_PLACEHOLDER: &str = "N/A";

/// The new image of a change that moved `status` to a different value.
///
/// Only modifications count, and only when the new image has a status.
pub fn status_transition(change: &ChangeRecord) -> Option<&PhotoRecord> {
    if change.kind != ChangeKind::Modify {
        return None;
    }
    let new = change.new_image.as_ref()?;
    let new_status = new.status_value()?;
    let old_status = change.old_image.as_ref().and_then(PhotoRecord::status_value);

    (old_status != Some(new_status)).then_some(new)
}

/// The record's `Name` when it looks like an email address, else `fallback`
pub fn resolve_recipient<'a>(record: &'a PhotoRecord, fallback: &'a str) -> &'a str {
    record
        .name()
        .filter(|name| name.contains('@'))
        .unwrap_or(fallback)
}

pub fn compose_notification(record: &PhotoRecord, from: &str, to: &str) -> EmailMessage {
    let status = record.status_value().unwrap_or_default();
    let reason = record
        .reason()
        .filter(|r| !r.is_empty())
        .unwrap_or(REASON_PLACEHOLDER);

    EmailMessage {
        from: from.to_string(),
        to: to.to_string(),
        subject: format!("Image {} status: {}", record.id, status),
        body: format!(
            "Your image {} is now \"{}\". Reason: {}",
            record.id, status, reason
        ),
    }
}

/// Emails the photo owner whenever a review changes a record's status
pub struct ChangeNotifier {
    mailer: Arc<dyn Mailer>,
    sender: String,
    fallback_recipient: String,
}

impl ChangeNotifier {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        sender: impl Into<String>,
        fallback_recipient: impl Into<String>,
    ) -> Self {
        Self {
            mailer,
            sender: sender.into(),
            fallback_recipient: fallback_recipient.into(),
        }
    }
}

#[async_trait]
impl ChangeHandler for ChangeNotifier {
    fn name(&self) -> &'static str {
        "change-notifier"
    }

    #[instrument(skip(self, change), fields(record_id = %change.key, kind = change.kind.as_str()))]
    async fn handle_change(&self, change: &ChangeRecord) -> Result<Outcome> {
        let Some(record) = status_transition(change) else {
            return Ok(Outcome::skipped("no status transition"));
        };

        let to = resolve_recipient(record, &self.fallback_recipient);
        let message = compose_notification(record, &self.sender, to);
        self.mailer.send(&message).await?;

        info!(to = %message.to, status = ?record.status_value(), "Review notification sent");
        metrics::counter!("photos.notifications.sent").increment(1);
        Ok(Outcome::Completed)
    }
}
