//! Pipeline stages. Each handler is a pure reaction to one message or
//! change record; receiving, acknowledging and retrying are left to the
//! drivers in [`crate::consumer`].

mod ingest;
mod metadata;
mod notifier;
mod reaper;
pub mod router;
mod status;

pub use ingest::IngestValidator;
pub use metadata::{canonical_attribute, MetadataApplier};
pub use notifier::{compose_notification, resolve_recipient, status_transition, ChangeNotifier};
pub use reaper::InvalidObjectReaper;
pub use router::Route;
pub use status::StatusUpdater;
