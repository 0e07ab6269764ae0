//! src/services/record_store.rs
//!
//! Transfer metadata in SQLite, one row per link id. Every operation is a
//! single statement or a short transaction, so the database is the only
//! synchronization point between concurrent requests.

use crate::{
    models::transfer::TransferRecord,
    services::events::{TransferEvent, TransferEventKind, TransferEvents},
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;

macro_rules! record_columns {
    () => {
        "link_id, owner_id, file_name, file_size_bytes, file_content_type, storage_path, \
         etag, credential_hash, delete_token_hash, created_at, expire_at, download_count"
    };
}

const SELECT_BY_LINK_ID: &str = concat!(
    "SELECT ",
    record_columns!(),
    " FROM transfers WHERE link_id = ?"
);
const SELECT_BY_OWNER: &str = concat!(
    "SELECT ",
    record_columns!(),
    " FROM transfers WHERE owner_id = ? ORDER BY created_at DESC"
);
const SELECT_EXPIRED: &str = concat!(
    "SELECT ",
    record_columns!(),
    " FROM transfers WHERE expire_at <= ? ORDER BY expire_at ASC LIMIT ?"
);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("link id `{0}` is already taken")]
    Conflict(String),
    #[error("transfer `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Why a record left the store. Only affects the published event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    OwnerDeleted,
    Expired,
}

#[derive(Clone)]
pub struct RecordStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    events: TransferEvents,
}

impl RecordStore {
    pub fn new(db: Arc<SqlitePool>, events: TransferEvents) -> Self {
        Self { db, events }
    }

    pub fn events(&self) -> &TransferEvents {
        &self.events
    }

    /// Create-if-absent. `Conflict` when the id is live or was ever retired.
    pub async fn insert(&self, record: &TransferRecord) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers (
                link_id, owner_id, file_name, file_size_bytes, file_content_type,
                storage_path, etag, credential_hash, delete_token_hash,
                created_at, expire_at, download_count
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0
            WHERE NOT EXISTS (SELECT 1 FROM retired_link_ids WHERE link_id = ?)
            "#,
        )
        .bind(&record.link_id)
        .bind(&record.owner_id)
        .bind(&record.file_name)
        .bind(record.file_size_bytes)
        .bind(&record.file_content_type)
        .bind(&record.storage_path)
        .bind(&record.etag)
        .bind(&record.credential_hash)
        .bind(&record.delete_token_hash)
        .bind(record.created_at)
        .bind(record.expire_at)
        .bind(&record.link_id)
        .execute(&*self.db)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                self.events.publish(TransferEvent {
                    kind: TransferEventKind::Created,
                    link_id: record.link_id.clone(),
                    owner_id: record.owner_id.clone(),
                    download_count: Some(0),
                });
                Ok(())
            }
            Ok(_) => Err(StoreError::Conflict(record.link_id.clone())),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::Conflict(record.link_id.clone()))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    /// Full record, including the fields that must not leave the service.
    pub async fn get(&self, link_id: &str) -> StoreResult<TransferRecord> {
        sqlx::query_as::<_, TransferRecord>(SELECT_BY_LINK_ID)
            .bind(link_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(link_id.to_string()))
    }

    /// Atomic `+1`, returning the new count.
    pub async fn increment_download_count(&self, link_id: &str) -> StoreResult<i64> {
        let row: Option<(i64, Option<String>)> = sqlx::query_as(
            "UPDATE transfers SET download_count = download_count + 1
             WHERE link_id = ?
             RETURNING download_count, owner_id",
        )
        .bind(link_id)
        .fetch_optional(&*self.db)
        .await?;

        let (count, owner_id) = row.ok_or_else(|| StoreError::NotFound(link_id.to_string()))?;
        self.events.publish(TransferEvent {
            kind: TransferEventKind::Downloaded,
            link_id: link_id.to_string(),
            owner_id,
            download_count: Some(count),
        });
        Ok(count)
    }

    /// Remove the row and retire its id in one transaction.
    ///
    /// Leaves the blob alone; callers delete it first.
    pub async fn delete(&self, link_id: &str, reason: RemovalReason) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        let removed: Option<(Option<String>,)> =
            sqlx::query_as("DELETE FROM transfers WHERE link_id = ? RETURNING owner_id")
                .bind(link_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((owner_id,)) = removed else {
            tx.rollback().await?;
            return Err(StoreError::NotFound(link_id.to_string()));
        };

        sqlx::query("INSERT OR IGNORE INTO retired_link_ids (link_id, retired_at) VALUES (?, ?)")
            .bind(link_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.events.publish(TransferEvent {
            kind: match reason {
                RemovalReason::OwnerDeleted => TransferEventKind::Deleted,
                RemovalReason::Expired => TransferEventKind::Expired,
            },
            link_id: link_id.to_string(),
            owner_id,
            download_count: None,
        });
        Ok(())
    }

    /// Newest-first transfers of one owner, fetched lazily.
    pub fn list_by_owner<'a>(
        &'a self,
        owner_id: &'a str,
    ) -> BoxStream<'a, StoreResult<TransferRecord>> {
        sqlx::query_as::<_, TransferRecord>(SELECT_BY_OWNER)
            .bind(owner_id)
            .fetch(&*self.db)
            .map(|row| row.map_err(StoreError::from))
            .boxed()
    }

    /// Records with `expire_at <= cutoff`, oldest first, at most `limit`.
    pub async fn list_expired(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<TransferRecord>> {
        let rows = sqlx::query_as::<_, TransferRecord>(SELECT_EXPIRED)
            .bind(cutoff)
            .bind(i64::from(limit))
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    pub async fn is_retired(&self, link_id: &str) -> StoreResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM retired_link_ids WHERE link_id = ?")
                .bind(link_id)
                .fetch_optional(&*self.db)
                .await?;
        Ok(found.is_some())
    }

    /// Readiness check.
    pub async fn ping(&self) -> StoreResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        debug_assert_eq!(one, 1);
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
