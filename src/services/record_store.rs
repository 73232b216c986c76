//! Record store: TTL-aware key/value records with conditional writes.
//!
//! `SqliteRecordStore` keeps every job family in the single `records` table.
//! A record whose `ttl` is at or before the clock's `now` is treated as gone
//! by every read and conditional write; the reaper deletes such rows later.

use crate::{
    models::record::{Fields, Precondition, RecordKey, RecordQuery, StoredRecord},
    services::clock::Clock,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("record `{key}` holds malformed fields: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("record fields could not be serialized: {0}")]
    Serialize(#[source] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Abstract record store consumed by the job managers.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Unconditional upsert (last write wins).
    async fn put(
        &self,
        key: &RecordKey,
        fields: &Fields,
        ttl: DateTime<Utc>,
    ) -> StoreResult<StoredRecord>;

    /// Upsert only if `precondition` holds. Returns whether the write happened.
    async fn put_conditional(
        &self,
        key: &RecordKey,
        fields: &Fields,
        ttl: DateTime<Utc>,
        precondition: Precondition,
    ) -> StoreResult<bool>;

    async fn get(&self, key: &RecordKey) -> StoreResult<Option<StoredRecord>>;

    /// Merge `patch` into a live record (a `null` value removes the field) and
    /// optionally replace its TTL. Returns `None` when no live record exists.
    async fn update(
        &self,
        key: &RecordKey,
        patch: &Fields,
        ttl: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<StoredRecord>>;

    /// Returns whether a row was removed.
    async fn delete(&self, key: &RecordKey) -> StoreResult<bool>;

    /// Live records of one partition, ordered by sort key.
    async fn query(&self, query: &RecordQuery) -> StoreResult<Vec<StoredRecord>>;

    /// Physically remove expired rows; returns how many were removed.
    async fn purge_expired(&self) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;
}

#[derive(FromRow)]
struct RecordRow {
    partition_key: String,
    sort_key: String,
    fields: String,
    ttl: i64,
    version: i64,
}

impl RecordRow {
    fn into_record(self) -> StoreResult<StoredRecord> {
        let key = RecordKey::new(self.partition_key, self.sort_key);
        let fields = serde_json::from_str::<Fields>(&self.fields).map_err(|source| {
            StoreError::Corrupt {
                key: key.to_string(),
                source,
            }
        })?;
        Ok(StoredRecord {
            key,
            fields,
            ttl: DateTime::from_timestamp(self.ttl, 0).unwrap_or_default(),
            version: self.version,
        })
    }
}

/// Record store backed by the shared SQLite pool.
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Arc<SqlitePool>,
    clock: Arc<dyn Clock>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<SqlitePool>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn now_secs(&self) -> i64 {
        self.clock.now().timestamp()
    }
}

fn to_json(fields: &Fields) -> StoreResult<String> {
    serde_json::to_string(fields).map_err(StoreError::Serialize)
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn put(
        &self,
        key: &RecordKey,
        fields: &Fields,
        ttl: DateTime<Utc>,
    ) -> StoreResult<StoredRecord> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO records (partition_key, sort_key, fields, ttl, version)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT(partition_key, sort_key) DO UPDATE SET
                fields = excluded.fields,
                ttl = excluded.ttl,
                version = records.version + 1
            RETURNING version
            "#,
        )
        .bind(&key.partition)
        .bind(&key.sort)
        .bind(to_json(fields)?)
        .bind(ttl.timestamp())
        .fetch_one(&*self.db)
        .await?;

        Ok(StoredRecord {
            key: key.clone(),
            fields: fields.clone(),
            ttl,
            version,
        })
    }

    async fn put_conditional(
        &self,
        key: &RecordKey,
        fields: &Fields,
        ttl: DateTime<Utc>,
        precondition: Precondition,
    ) -> StoreResult<bool> {
        let payload = to_json(fields)?;
        let now = self.now_secs();
        let result = match precondition {
            Precondition::Absent => {
                sqlx::query(
                    r#"
                    INSERT INTO records (partition_key, sort_key, fields, ttl, version)
                    VALUES (?, ?, ?, ?, 1)
                    ON CONFLICT(partition_key, sort_key) DO UPDATE SET
                        fields = excluded.fields,
                        ttl = excluded.ttl,
                        version = records.version + 1
                    WHERE records.ttl <= ?
                    "#,
                )
                .bind(&key.partition)
                .bind(&key.sort)
                .bind(payload)
                .bind(ttl.timestamp())
                .bind(now)
                .execute(&*self.db)
                .await?
            }
            Precondition::Version(expected) => {
                sqlx::query(
                    "UPDATE records SET fields = ?, ttl = ?, version = version + 1
                     WHERE partition_key = ? AND sort_key = ? AND version = ? AND ttl > ?",
                )
                .bind(payload)
                .bind(ttl.timestamp())
                .bind(&key.partition)
                .bind(&key.sort)
                .bind(expected)
                .bind(now)
                .execute(&*self.db)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &RecordKey) -> StoreResult<Option<StoredRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT partition_key, sort_key, fields, ttl, version
             FROM records
             WHERE partition_key = ? AND sort_key = ? AND ttl > ?",
        )
        .bind(&key.partition)
        .bind(&key.sort)
        .bind(self.now_secs())
        .fetch_optional(&*self.db)
        .await?;

        row.map(RecordRow::into_record).transpose()
    }

    async fn update(
        &self,
        key: &RecordKey,
        patch: &Fields,
        ttl: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<StoredRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            UPDATE records SET
                fields = json_patch(fields, ?),
                ttl = COALESCE(?, ttl),
                version = version + 1
            WHERE partition_key = ? AND sort_key = ? AND ttl > ?
            RETURNING partition_key, sort_key, fields, ttl, version
            "#,
        )
        .bind(to_json(patch)?)
        .bind(ttl.map(|t| t.timestamp()))
        .bind(&key.partition)
        .bind(&key.sort)
        .bind(self.now_secs())
        .fetch_optional(&*self.db)
        .await?;

        row.map(RecordRow::into_record).transpose()
    }

    async fn delete(&self, key: &RecordKey) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM records WHERE partition_key = ? AND sort_key = ?")
            .bind(&key.partition)
            .bind(&key.sort)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, query: &RecordQuery) -> StoreResult<Vec<StoredRecord>> {
        if let Some((_, values)) = &query.field_in {
            if values.is_empty() {
                return Ok(Vec::new());
            }
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT partition_key, sort_key, fields, ttl, version \
             FROM records WHERE partition_key = ",
        );
        builder.push_bind(&query.partition);
        builder.push(" AND ttl > ");
        builder.push_bind(self.now_secs());

        if let Some(prefix) = &query.sort_prefix {
            builder.push(" AND substr(sort_key, 1, length(");
            builder.push_bind(prefix);
            builder.push(")) = ");
            builder.push_bind(prefix);
        }

        if let Some(after) = &query.start_after {
            builder.push(" AND sort_key > ");
            builder.push_bind(after);
        }

        if let Some((field, values)) = &query.field_in {
            builder.push(" AND json_extract(fields, ");
            builder.push_bind(format!("$.{}", field));
            builder.push(") IN (");
            let mut separated = builder.separated(", ");
            for value in values {
                separated.push_bind(value);
            }
            separated.push_unseparated(")");
        }

        builder.push(" ORDER BY sort_key ASC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows: Vec<RecordRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM records WHERE ttl <= ?")
            .bind(self.now_secs())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}
