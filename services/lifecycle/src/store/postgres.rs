use super::{CreateOutcome, MergeOutcome, MissingRecordPolicy, RecordStore};
use crate::config::DatabaseConfig;
use crate::error::{PipelineError, Result};
use crate::messages::{ChangeKind, ChangeRecord, ChangeSequence, SequencedChange};
use crate::model::{Attributes, PhotoRecord};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Record store backed by PostgreSQL.
///
/// Records live in `photo_records` as a JSONB attribute map keyed by
/// `(store, id)`. Every effective write appends to `record_changes` inside
/// the same transaction. Writers of one store serialize on a transaction
/// advisory lock so that change sequences commit in order and a feed reader
/// never skips a sequence that commits late.
pub struct PgRecordStore {
    pool: PgPool,
    name: String,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    async fn begin_locked(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.name)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn append_change(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        change: &ChangeRecord,
    ) -> Result<ChangeSequence> {
        let sequence: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO record_changes (store, record_id, kind, old_image, new_image)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING seq
            "#,
        )
        .bind(&self.name)
        .bind(&change.key)
        .bind(change.kind.as_str())
        .bind(change.old_image.as_ref().map(Json))
        .bind(change.new_image.as_ref().map(Json))
        .fetch_one(&mut **tx)
        .await?;

        Ok(sequence.0)
    }

    async fn insert_record(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        record: &PhotoRecord,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO photo_records (store, id, attributes)
            VALUES ($1, $2, $3)
            ON CONFLICT (store, id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&self.name)
        .bind(&record.id)
        .bind(Json(&record.attributes))
        .fetch_optional(&mut **tx)
        .await?;

        Ok(inserted.is_some())
    }
}

/// Create a connection pool with the configured limits
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| PipelineError::Database(sqlx::Error::Configuration(
            "database.url is not set".into(),
        )))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(Some(config.idle_timeout()))
        .connect(url)
        .await?;

    info!("Connected to PostgreSQL database");

    Ok(pool)
}

/// Run database migrations for records, change feed and queues
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| PipelineError::Database(e.into()))?;

    info!("Database migrations completed");
    Ok(())
}

fn change_from_row(row: &PgRow) -> Result<SequencedChange> {
    let kind: String = row.try_get("kind")?;
    let kind = ChangeKind::parse(&kind).ok_or_else(|| {
        PipelineError::Database(sqlx::Error::Decode(
            format!("unknown change kind {kind:?}").into(),
        ))
    })?;
    let old_image: Option<Json<PhotoRecord>> = row.try_get("old_image")?;
    let new_image: Option<Json<PhotoRecord>> = row.try_get("new_image")?;

    Ok(SequencedChange {
        sequence: row.try_get("seq")?,
        change: ChangeRecord {
            kind,
            key: row.try_get("record_id")?,
            old_image: old_image.map(|j| j.0),
            new_image: new_image.map(|j| j.0),
        },
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, initial), fields(store = %self.name))]
    async fn create_if_absent(&self, id: &str, initial: Attributes) -> Result<CreateOutcome> {
        let record = PhotoRecord::with_attributes(id, initial);
        let mut tx = self.begin_locked().await?;

        if !self.insert_record(&mut tx, &record).await? {
            tx.rollback().await?;
            debug!(id = %id, "Record already exists");
            return Ok(CreateOutcome::AlreadyExists);
        }

        let change = ChangeRecord {
            kind: ChangeKind::Insert,
            key: record.id.clone(),
            old_image: None,
            new_image: Some(record),
        };
        self.append_change(&mut tx, &change).await?;
        tx.commit().await?;

        Ok(CreateOutcome::Created)
    }

    #[instrument(skip(self, partial), fields(store = %self.name))]
    async fn merge_attributes(
        &self,
        id: &str,
        partial: Attributes,
        policy: MissingRecordPolicy,
    ) -> Result<MergeOutcome> {
        let mut tx = self.begin_locked().await?;

        let current: Option<(Json<Attributes>,)> = sqlx::query_as(
            r#"
            SELECT attributes FROM photo_records
            WHERE store = $1 AND id = $2
            FOR UPDATE
            "#,
        )
        .bind(&self.name)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((Json(attributes),)) = current else {
            if policy == MissingRecordPolicy::Skip {
                tx.rollback().await?;
                return Ok(MergeOutcome::MissingRecord);
            }

            let record = PhotoRecord::with_attributes(id, partial);
            self.insert_record(&mut tx, &record).await?;
            let change = ChangeRecord {
                kind: ChangeKind::Insert,
                key: record.id.clone(),
                old_image: None,
                new_image: Some(record),
            };
            self.append_change(&mut tx, &change).await?;
            tx.commit().await?;
            return Ok(MergeOutcome::Created);
        };

        let old = PhotoRecord {
            id: id.to_string(),
            attributes,
        };
        let mut new = old.clone();
        if !new.merge(partial) {
            tx.rollback().await?;
            return Ok(MergeOutcome::Unchanged);
        }

        sqlx::query(
            r#"
            UPDATE photo_records
            SET attributes = $3, updated_at = NOW()
            WHERE store = $1 AND id = $2
            "#,
        )
        .bind(&self.name)
        .bind(id)
        .bind(Json(&new.attributes))
        .execute(&mut *tx)
        .await?;

        let change = ChangeRecord {
            kind: ChangeKind::Modify,
            key: id.to_string(),
            old_image: Some(old),
            new_image: Some(new),
        };
        self.append_change(&mut tx, &change).await?;
        tx.commit().await?;

        Ok(MergeOutcome::Updated)
    }

    async fn get(&self, id: &str) -> Result<Option<PhotoRecord>> {
        let row: Option<(Json<Attributes>,)> = sqlx::query_as(
            "SELECT attributes FROM photo_records WHERE store = $1 AND id = $2",
        )
        .bind(&self.name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(attributes),)| PhotoRecord {
            id: id.to_string(),
            attributes,
        }))
    }

    async fn read_changes(
        &self,
        after: ChangeSequence,
        limit: usize,
    ) -> Result<Vec<SequencedChange>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, record_id, kind, old_image, new_image
            FROM record_changes
            WHERE store = $1 AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(&self.name)
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(change_from_row).collect()
    }

    async fn load_checkpoint(&self, consumer: &str) -> Result<ChangeSequence> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT last_seq FROM change_feed_checkpoints WHERE store = $1 AND consumer = $2",
        )
        .bind(&self.name)
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.0).unwrap_or(0))
    }

    async fn save_checkpoint(&self, consumer: &str, sequence: ChangeSequence) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO change_feed_checkpoints (store, consumer, last_seq, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (store, consumer) DO UPDATE
            SET last_seq = GREATEST(change_feed_checkpoints.last_seq, EXCLUDED.last_seq),
                updated_at = NOW()
            "#,
        )
        .bind(&self.name)
        .bind(consumer)
        .bind(sequence)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn acquire_lease(&self, consumer: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let acquired: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO change_feed_checkpoints
                (store, consumer, last_seq, lease_holder, lease_expires_at, updated_at)
            VALUES ($1, $2, 0, $3, NOW() + make_interval(secs => $4), NOW())
            ON CONFLICT (store, consumer) DO UPDATE
            SET lease_holder = EXCLUDED.lease_holder,
                lease_expires_at = EXCLUDED.lease_expires_at
            WHERE change_feed_checkpoints.lease_holder IS NULL
               OR change_feed_checkpoints.lease_holder = EXCLUDED.lease_holder
               OR change_feed_checkpoints.lease_expires_at < NOW()
            RETURNING lease_holder
            "#,
        )
        .bind(&self.name)
        .bind(consumer)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn release_lease(&self, consumer: &str, holder: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE change_feed_checkpoints
            SET lease_holder = NULL, lease_expires_at = NULL
            WHERE store = $1 AND consumer = $2 AND lease_holder = $3
            "#,
        )
        .bind(&self.name)
        .bind(consumer)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
