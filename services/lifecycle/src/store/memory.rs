use super::{CreateOutcome, MergeOutcome, MissingRecordPolicy, RecordStore};
use crate::error::Result;
use crate::messages::{ChangeKind, ChangeRecord, ChangeSequence, SequencedChange};
use crate::model::{Attributes, PhotoRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Process-local record store.
///
/// A single mutex guards records, the change log and checkpoints together,
/// so change sequence order always matches write order.
pub struct InMemoryRecordStore {
    name: String,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, PhotoRecord>,
    changes: Vec<SequencedChange>,
    checkpoints: HashMap<String, ChangeSequence>,
    leases: HashMap<String, Lease>,
    last_sequence: ChangeSequence,
}

struct Lease {
    holder: String,
    expires_at: Instant,
}

impl Inner {
    fn append(&mut self, change: ChangeRecord) {
        self.last_sequence += 1;
        self.changes.push(SequencedChange {
            sequence: self.last_sequence,
            change,
        });
    }
}

impl InMemoryRecordStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Number of records currently stored
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a record, emitting a `REMOVE` change. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.records.remove(id) {
            Some(old) => {
                inner.append(ChangeRecord {
                    kind: ChangeKind::Remove,
                    key: id.to_string(),
                    old_image: Some(old),
                    new_image: None,
                });
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_if_absent(&self, id: &str, initial: Attributes) -> Result<CreateOutcome> {
        let mut inner = self.inner.lock();
        if inner.records.contains_key(id) {
            debug!(store = %self.name, id = %id, "Record already exists");
            return Ok(CreateOutcome::AlreadyExists);
        }

        let record = PhotoRecord::with_attributes(id, initial);
        inner.records.insert(id.to_string(), record.clone());
        inner.append(ChangeRecord {
            kind: ChangeKind::Insert,
            key: id.to_string(),
            old_image: None,
            new_image: Some(record),
        });

        Ok(CreateOutcome::Created)
    }

    async fn merge_attributes(
        &self,
        id: &str,
        partial: Attributes,
        policy: MissingRecordPolicy,
    ) -> Result<MergeOutcome> {
        let mut inner = self.inner.lock();

        let existing = inner.records.get(id).cloned();
        let Some(old) = existing else {
            return match policy {
                MissingRecordPolicy::Skip => Ok(MergeOutcome::MissingRecord),
                MissingRecordPolicy::Create => {
                    let record = PhotoRecord::with_attributes(id, partial);
                    inner.records.insert(id.to_string(), record.clone());
                    inner.append(ChangeRecord {
                        kind: ChangeKind::Insert,
                        key: id.to_string(),
                        old_image: None,
                        new_image: Some(record),
                    });
                    Ok(MergeOutcome::Created)
                }
            };
        };

        let mut new = old.clone();
        if !new.merge(partial) {
            return Ok(MergeOutcome::Unchanged);
        }

        inner.records.insert(id.to_string(), new.clone());
        inner.append(ChangeRecord {
            kind: ChangeKind::Modify,
            key: id.to_string(),
            old_image: Some(old),
            new_image: Some(new),
        });

        Ok(MergeOutcome::Updated)
    }

    async fn get(&self, id: &str) -> Result<Option<PhotoRecord>> {
        Ok(self.inner.lock().records.get(id).cloned())
    }

    async fn read_changes(
        &self,
        after: ChangeSequence,
        limit: usize,
    ) -> Result<Vec<SequencedChange>> {
        let inner = self.inner.lock();
        // sequences are dense and start at 1, so the position is an index
        let start = usize::try_from(after.max(0)).unwrap_or(usize::MAX);
        Ok(inner
            .changes
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_checkpoint(&self, consumer: &str) -> Result<ChangeSequence> {
        Ok(self
            .inner
            .lock()
            .checkpoints
            .get(consumer)
            .copied()
            .unwrap_or(0))
    }

    async fn save_checkpoint(&self, consumer: &str, sequence: ChangeSequence) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.checkpoints.entry(consumer.to_string()).or_insert(0);
        *entry = (*entry).max(sequence);
        Ok(())
    }

    async fn acquire_lease(&self, consumer: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(lease) = inner.leases.get(consumer) {
            if lease.holder != holder && lease.expires_at > now {
                return Ok(false);
            }
        }
        inner.leases.insert(
            consumer.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, consumer: &str, holder: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .leases
            .get(consumer)
            .is_some_and(|lease| lease.holder == holder)
        {
            inner.leases.remove(consumer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_if_absent_is_idempotent() {
        let store = InMemoryRecordStore::new("photos");

        let first = store.create_if_absent("cat.jpg", Attributes::new()).await.unwrap();
        let second = store
            .create_if_absent("cat.jpg", attrs(&[("Caption", "overwrite?")]))
            .await
            .unwrap();

        assert_eq!(first, CreateOutcome::Created);
        assert_eq!(second, CreateOutcome::AlreadyExists);
        assert_eq!(store.len(), 1);

        let record = store.get("cat.jpg").await.unwrap().unwrap();
        assert_eq!(record.caption(), None);
        assert_eq!(store.read_changes(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_emits_modify_with_images() {
        let store = InMemoryRecordStore::new("photos");
        store.create_if_absent("x", Attributes::new()).await.unwrap();

        let outcome = store
            .merge_attributes("x", attrs(&[("Name", "abc")]), MissingRecordPolicy::Skip)
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Updated);

        let changes = store.read_changes(1, 10).await.unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes[0].change;
        assert_eq!(change.kind, ChangeKind::Modify);
        assert_eq!(change.old_image.as_ref().unwrap().name(), None);
        assert_eq!(change.new_image.as_ref().unwrap().name(), Some("abc"));
    }

    #[tokio::test]
    async fn test_unchanged_merge_emits_nothing() {
        let store = InMemoryRecordStore::new("photos");
        store.create_if_absent("x", Attributes::new()).await.unwrap();
        store
            .merge_attributes("x", attrs(&[("Caption", "hi")]), MissingRecordPolicy::Skip)
            .await
            .unwrap();

        let again = store
            .merge_attributes("x", attrs(&[("Caption", "hi")]), MissingRecordPolicy::Skip)
            .await
            .unwrap();

        assert_eq!(again, MergeOutcome::Unchanged);
        assert_eq!(store.read_changes(0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_record_policies() {
        let store = InMemoryRecordStore::new("photos");

        let skipped = store
            .merge_attributes("ghost", attrs(&[("Caption", "hi")]), MissingRecordPolicy::Skip)
            .await
            .unwrap();
        assert_eq!(skipped, MergeOutcome::MissingRecord);
        assert!(store.get("ghost").await.unwrap().is_none());
        assert!(store.read_changes(0, 10).await.unwrap().is_empty());

        let created = store
            .merge_attributes("ghost", attrs(&[("Caption", "hi")]), MissingRecordPolicy::Create)
            .await
            .unwrap();
        assert_eq!(created, MergeOutcome::Created);
        assert_eq!(
            store.get("ghost").await.unwrap().unwrap().caption(),
            Some("hi")
        );

        let changes = store.read_changes(0, 10).await.unwrap();
        assert_eq!(changes[0].change.kind, ChangeKind::Insert);
    }

    #[tokio::test]
    async fn test_remove_emits_remove_change() {
        let store = InMemoryRecordStore::new("photos");
        store.create_if_absent("x", Attributes::new()).await.unwrap();

        assert!(store.remove("x"));
        assert!(!store.remove("x"));

        let changes = store.read_changes(0, 10).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].change.kind, ChangeKind::Remove);
        assert!(changes[1].change.new_image.is_none());
    }

    #[tokio::test]
    async fn test_checkpoints_only_move_forward() {
        let store = InMemoryRecordStore::new("photos");
        assert_eq!(store.load_checkpoint("notifier").await.unwrap(), 0);

        store.save_checkpoint("notifier", 5).await.unwrap();
        store.save_checkpoint("notifier", 3).await.unwrap();

        assert_eq!(store.load_checkpoint("notifier").await.unwrap(), 5);
        assert_eq!(store.load_checkpoint("other").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_has_one_holder_until_it_expires() {
        let store = InMemoryRecordStore::new("photos");
        let ttl = Duration::from_secs(30);

        assert!(store.acquire_lease("notifier", "a", ttl).await.unwrap());
        assert!(!store.acquire_lease("notifier", "b", ttl).await.unwrap());
        // renewal by the holder, and other consumers are independent
        assert!(store.acquire_lease("notifier", "a", ttl).await.unwrap());
        assert!(store.acquire_lease("other", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.acquire_lease("notifier", "b", ttl).await.unwrap());
        assert!(!store.acquire_lease("notifier", "a", ttl).await.unwrap());

        // only the holder can release
        store.release_lease("notifier", "a").await.unwrap();
        assert!(!store.acquire_lease("notifier", "a", ttl).await.unwrap());
        store.release_lease("notifier", "b").await.unwrap();
        assert!(store.acquire_lease("notifier", "a", ttl).await.unwrap());
    }
}
