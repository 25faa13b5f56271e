//! Per-photo record store with conditional writes and an ordered change feed.
//!
//! Every write path is safe under redelivery: creation is conditional on
//! absence, and all other writes merge individual attributes. Each
//! effective write appends one [`ChangeRecord`](crate::messages::ChangeRecord)
//! to the store's feed; writes that change nothing append nothing.

mod memory;
mod postgres;

pub use memory::InMemoryRecordStore;
pub use postgres::{connect_pool, run_migrations, PgRecordStore};

use crate::error::Result;
use crate::messages::{ChangeSequence, SequencedChange};
use crate::model::{Attributes, PhotoRecord};
use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Result of a conditional create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A record with this id already existed and was left untouched
    AlreadyExists,
}

/// Result of a partial-attribute merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Existing record changed
    Updated,
    /// Existing record already held these values
    Unchanged,
    /// Record did not exist and was created from the merged attributes
    Created,
    /// Record did not exist and the merge was skipped
    MissingRecord,
}

/// What a merge does when the target record does not exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingRecordPolicy {
    /// Leave the store untouched
    #[default]
    Skip,
    /// Create the record holding only the merged attributes
    Create,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Logical store name
    fn name(&self) -> &str;

    /// Create a record unless one with this id already exists
    async fn create_if_absent(&self, id: &str, initial: Attributes) -> Result<CreateOutcome>;

    /// Merge attributes into the record; the key attribute is never touched
    async fn merge_attributes(
        &self,
        id: &str,
        partial: Attributes,
        policy: MissingRecordPolicy,
    ) -> Result<MergeOutcome>;

    async fn get(&self, id: &str) -> Result<Option<PhotoRecord>>;

    /// Changes with a sequence strictly greater than `after`, in order
    async fn read_changes(
        &self,
        after: ChangeSequence,
        limit: usize,
    ) -> Result<Vec<SequencedChange>>;

    /// Last sequence a feed consumer has fully handled (0 when new)
    async fn load_checkpoint(&self, consumer: &str) -> Result<ChangeSequence>;

    async fn save_checkpoint(&self, consumer: &str, sequence: ChangeSequence) -> Result<()>;

    /// Take or renew the feed lease for `consumer` on behalf of `holder`.
    ///
    /// Returns `false` while a different holder's lease is still live. Only
    /// the holder of the lease may handle changes and move the checkpoint,
    /// so a consumer scaled to several instances notifies each change once.
    async fn acquire_lease(&self, consumer: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Give up the lease if `holder` still owns it
    async fn release_lease(&self, consumer: &str, holder: &str) -> Result<()>;
}

/// Follow a store's change feed from `from` (exclusive), yielding non-empty
/// batches in sequence order. Read errors are yielded and the stream keeps
/// polling from the same position.
pub fn subscribe_changes(
    store: Arc<dyn RecordStore>,
    from: ChangeSequence,
    batch_size: usize,
    poll_interval: Duration,
) -> impl Stream<Item = Result<Vec<SequencedChange>>> + Send {
    futures::stream::unfold((store, from), move |(store, position)| async move {
        loop {
            match store.read_changes(position, batch_size).await {
                Ok(batch) if batch.is_empty() => tokio::time::sleep(poll_interval).await,
                Ok(batch) => {
                    let next = batch.last().map(|c| c.sequence).unwrap_or(position);
                    return Some((Ok(batch), (store, next)));
                }
                Err(e) => {
                    warn!(store = %store.name(), error = %e, "Change feed read failed");
                    return Some((Err(e), (store, position)));
                }
            }
        }
    })
}
