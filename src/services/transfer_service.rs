//! src/services/transfer_service.rs
//!
//! TransferService: the create / resolve / delete lifecycle of a share
//! link. Ties together the credential guard, link id source, blob store and
//! record store; holds no authoritative state of its own.

use crate::{
    models::transfer::{
        CreatedTransfer, FileDescriptor, OwnedTransfer, TransferMetadata, TransferRecord,
    },
    services::{
        blob_store::{BlobError, BlobReader, BlobStore, StagedBlob},
        clock::{Clock, SystemClock},
        credential_guard::{CredentialError, CredentialGuard},
        events::TransferEvent,
        expiry::is_expired,
        link_id::{self, LinkIdSource, RandomLinkIds},
        record_store::{RecordStore, RemovalReason, StoreError},
    },
};
use bytes::Bytes;
use chrono::Duration;
use futures::{Stream, StreamExt, stream::BoxStream};
use std::{fmt, io, sync::Arc};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Link id draws before giving up on a create.
pub const MAX_LINK_ID_ATTEMPTS: usize = 5;

const MAX_FILE_NAME_LEN: usize = 255;
const MAX_CONTENT_TYPE_LEN: usize = 255;
const MAX_PASSWORD_LEN: usize = 1024;
const MAX_OWNER_ID_LEN: usize = 128;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("upload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("transfer not found")]
    NotFound,
    #[error("transfer has expired")]
    Expired,
    #[error("password required")]
    PasswordRequired,
    #[error("incorrect password")]
    InvalidCredential,
    #[error("not allowed to manage this transfer")]
    Forbidden,
}

pub type TransferResult<T> = Result<T, TransferError>;

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => TransferError::NotFound,
            StoreError::Conflict(id) => {
                error!(link_id = %id, "unexpected link id conflict outside create");
                TransferError::ServiceUnavailable("metadata store conflict".into())
            }
            StoreError::Sqlx(err) => {
                error!("metadata store error: {}", err);
                TransferError::ServiceUnavailable("metadata store unavailable".into())
            }
        }
    }
}

impl From<BlobError> for TransferError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(_) => TransferError::NotFound,
            BlobError::TooLarge { limit } => TransferError::PayloadTooLarge { limit },
            other => {
                error!("blob store error: {}", other);
                TransferError::ServiceUnavailable("blob store unavailable".into())
            }
        }
    }
}

impl From<CredentialError> for TransferError {
    fn from(err: CredentialError) -> Self {
        error!("credential hashing error: {}", err);
        TransferError::ServiceUnavailable("credential hashing unavailable".into())
    }
}

/// Operator-tunable limits for new transfers.
#[derive(Clone, Debug)]
pub struct TransferPolicy {
    pub allowed_ttl_minutes: Vec<u32>,
    pub default_ttl_minutes: u32,
    pub max_upload_bytes: u64,
    pub public_base_url: String,
}

/// Everything about a create except the bytes.
#[derive(Clone, Debug)]
pub struct NewTransfer {
    pub file: FileDescriptor,
    pub password: Option<String>,
    pub ttl_minutes: Option<u32>,
    pub owner_id: Option<String>,
}

/// Who is asking to delete a transfer.
#[derive(Clone, Debug)]
pub enum Requester {
    /// Identity asserted by the upstream identity provider.
    Owner(String),
    /// Delete token returned to an anonymous uploader.
    Creator(String),
}

/// A successful resolve: safe metadata plus the open payload.
pub struct ResolvedTransfer {
    pub metadata: TransferMetadata,
    pub etag: String,
    pub reader: BlobReader,
}

impl fmt::Debug for ResolvedTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTransfer")
            .field("metadata", &self.metadata)
            .field("etag", &self.etag)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct TransferService {
    records: RecordStore,
    blobs: Arc<dyn BlobStore>,
    guard: CredentialGuard,
    link_ids: Arc<dyn LinkIdSource>,
    clock: Arc<dyn Clock>,
    policy: Arc<TransferPolicy>,
}

impl TransferService {
    pub fn new(
        records: RecordStore,
        blobs: Arc<dyn BlobStore>,
        guard: CredentialGuard,
        policy: TransferPolicy,
    ) -> Self {
        Self {
            records,
            blobs,
            guard,
            link_ids: Arc::new(RandomLinkIds),
            clock: Arc::new(SystemClock),
            policy: Arc::new(policy),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_link_ids(mut self, link_ids: Arc<dyn LinkIdSource>) -> Self {
        self.link_ids = link_ids;
        self
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    pub fn share_url(&self, link_id: &str) -> String {
        format!("{}/download/{}", self.policy.public_base_url, link_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.records.events().subscribe()
    }

    /// Store an upload and issue its link.
    ///
    /// The body is streamed to a staging blob once; link id collisions are
    /// retried against that staged copy and never reach the caller.
    pub async fn create<'a, S>(&self, request: NewTransfer, body: S) -> TransferResult<CreatedTransfer>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'a,
    {
        let ttl_minutes = self.validate_ttl(request.ttl_minutes)?;
        let file = normalize_descriptor(request.file)?;
        let owner_id = request.owner_id.map(validate_owner_id).transpose()?;
        let password = normalize_password(request.password)?;

        let credential_hash = match password {
            Some(plaintext) => Some(self.guard.hash_async(plaintext).await?),
            None => None,
        };
        let (delete_token, delete_token_hash) = if owner_id.is_none() {
            let token = link_id::new_delete_token();
            let hash = self.guard.hash_async(token.clone()).await?;
            (Some(token), Some(hash))
        } else {
            (None, None)
        };

        let staged = self
            .blobs
            .stage(body.boxed(), self.policy.max_upload_bytes)
            .await?;
        let size_bytes = i64::try_from(staged.size_bytes).map_err(|_| {
            TransferError::PayloadTooLarge {
                limit: self.policy.max_upload_bytes,
            }
        });
        let result = match size_bytes {
            Ok(size_bytes) => {
                let template = TransferRecord {
                    link_id: String::new(),
                    owner_id,
                    file_name: file.file_name,
                    file_size_bytes: size_bytes,
                    file_content_type: file.content_type,
                    storage_path: String::new(),
                    etag: staged.etag.clone(),
                    credential_hash,
                    delete_token_hash,
                    created_at: self.clock.now(),
                    expire_at: self.clock.now(),
                    download_count: 0,
                };
                self.publish_staged(&staged, template, ttl_minutes).await
            }
            Err(err) => Err(err),
        };
        self.blobs.discard(&staged).await;

        let record = result?;
        info!(
            link_id = %record.link_id,
            size_bytes = record.file_size_bytes,
            protected = record.is_protected(),
            ttl_minutes,
            "transfer created"
        );
        Ok(CreatedTransfer {
            share_url: self.share_url(&record.link_id),
            link_id: record.link_id,
            expire_at: record.expire_at,
            delete_token,
        })
    }

    /// Draw ids until one is free for both the blob path and the record.
    async fn publish_staged(
        &self,
        staged: &StagedBlob,
        mut record: TransferRecord,
        ttl_minutes: u32,
    ) -> TransferResult<TransferRecord> {
        for attempt in 1..=MAX_LINK_ID_ATTEMPTS {
            let link_id = self.link_ids.new_link_id();
            let storage_path = self.blobs.path_for(&link_id);

            match self.blobs.commit(staged, &storage_path).await {
                Ok(()) => {}
                Err(BlobError::AlreadyExists(_)) => {
                    warn!(attempt, "link id collided with an existing blob, retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            record.created_at = self.clock.now();
            record.expire_at = record.created_at + Duration::minutes(i64::from(ttl_minutes));
            record.link_id = link_id;
            record.storage_path = storage_path;

            match self.records.insert(&record).await {
                Ok(()) => return Ok(record),
                Err(StoreError::Conflict(_)) => {
                    warn!(attempt, "link id collided with an existing record, retrying");
                    self.remove_committed(&record.storage_path).await;
                }
                Err(err) => {
                    self.remove_committed(&record.storage_path).await;
                    return Err(err.into());
                }
            }
        }

        error!(
            attempts = MAX_LINK_ID_ATTEMPTS,
            "could not allocate a unique link id"
        );
        Err(TransferError::ServiceUnavailable(
            "could not allocate a unique link id".into(),
        ))
    }

    async fn remove_committed(&self, storage_path: &str) {
        if let Err(err) = self.blobs.delete(storage_path).await {
            warn!("failed to remove orphaned blob after aborted create: {}", err);
        }
    }

    /// Public metadata for a link. Refuses expired links without detail.
    pub async fn metadata(&self, link_id: &str) -> TransferResult<TransferMetadata> {
        let record = self.live_record(link_id).await?;
        Ok(TransferMetadata::from(&record))
    }

    /// Check expiry and password, then open the payload and count the
    /// download.
    ///
    /// The count moves only once the blob is open, so neither a refused
    /// password nor a storage failure inflates it.
    pub async fn resolve(
        &self,
        link_id: &str,
        password: Option<String>,
    ) -> TransferResult<ResolvedTransfer> {
        let record = self.live_record(link_id).await?;

        if let Some(hash) = record.credential_hash.clone() {
            let Some(plaintext) = password.filter(|p| !p.is_empty()) else {
                return Err(TransferError::PasswordRequired);
            };
            if !self.guard.verify_async(plaintext, hash).await? {
                info!(link_id = %record.link_id, "rejected download with incorrect password");
                return Err(TransferError::InvalidCredential);
            }
        }

        let reader = match self.blobs.open(&record.storage_path).await {
            Ok(reader) => reader,
            Err(BlobError::NotFound(_)) => {
                warn!(link_id = %record.link_id, "record has no blob");
                return Err(TransferError::NotFound);
            }
            Err(err) => return Err(err.into()),
        };

        let download_count = match self.records.increment_download_count(&record.link_id).await {
            Ok(count) => count,
            // Reclaimed after we opened the blob; finish serving it.
            Err(StoreError::NotFound(_)) => {
                debug!(link_id = %record.link_id, "record removed during download");
                record.download_count
            }
            Err(err) => return Err(err.into()),
        };

        info!(link_id = %record.link_id, download_count, "transfer resolved");
        let mut metadata = TransferMetadata::from(&record);
        metadata.download_count = download_count;
        Ok(ResolvedTransfer {
            metadata,
            etag: record.etag,
            reader,
        })
    }

    /// Delete a transfer on behalf of its owner or anonymous creator.
    ///
    /// Blob first; if that fails the record stays so the delete can be
    /// retried.
    pub async fn delete_owned(&self, link_id: &str, requester: Requester) -> TransferResult<()> {
        if !link_id::is_well_formed(link_id) {
            return Err(TransferError::NotFound);
        }
        let record = self.records.get(link_id).await?;

        let allowed = match (&record.owner_id, requester) {
            (Some(owner), Requester::Owner(caller)) => *owner == caller,
            (None, Requester::Creator(token)) => match record.delete_token_hash.clone() {
                Some(hash) => self.guard.verify_async(token, hash).await?,
                None => false,
            },
            _ => false,
        };
        if !allowed {
            info!(link_id = %record.link_id, "refused delete from non-owner");
            return Err(TransferError::Forbidden);
        }

        self.blobs.delete(&record.storage_path).await?;
        self.records
            .delete(&record.link_id, RemovalReason::OwnerDeleted)
            .await?;
        info!(link_id = %record.link_id, "transfer deleted");
        Ok(())
    }

    /// Dashboard rows for one owner, newest first, without storage details.
    pub fn owned_transfers<'a>(
        &'a self,
        owner_id: &'a str,
    ) -> BoxStream<'a, TransferResult<OwnedTransfer>> {
        let now = self.clock.now();
        self.records
            .list_by_owner(owner_id)
            .map(move |row| {
                row.map(|record| OwnedTransfer {
                    share_url: self.share_url(&record.link_id),
                    expired: is_expired(&record, now),
                    password_protected: record.is_protected(),
                    link_id: record.link_id,
                    file_name: record.file_name,
                    file_size_bytes: record.file_size_bytes,
                    content_type: record.file_content_type,
                    created_at: record.created_at,
                    expire_at: record.expire_at,
                    download_count: record.download_count,
                })
                .map_err(TransferError::from)
            })
            .boxed()
    }

    /// Fetch a record that exists and has not expired.
    async fn live_record(&self, link_id: &str) -> TransferResult<TransferRecord> {
        if !link_id::is_well_formed(link_id) {
            return Err(TransferError::NotFound);
        }
        let record = self.records.get(link_id).await?;
        if is_expired(&record, self.clock.now()) {
            return Err(TransferError::Expired);
        }
        Ok(record)
    }

    fn validate_ttl(&self, requested: Option<u32>) -> TransferResult<u32> {
        let ttl = requested.unwrap_or(self.policy.default_ttl_minutes);
        if self.policy.allowed_ttl_minutes.contains(&ttl) {
            Ok(ttl)
        } else {
            Err(TransferError::InvalidInput(format!(
                "ttl_minutes must be one of {:?}",
                self.policy.allowed_ttl_minutes
            )))
        }
    }
}

fn normalize_descriptor(file: FileDescriptor) -> TransferResult<FileDescriptor> {
    // Browsers occasionally send a full client-side path.
    let file_name = file
        .file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if file_name.is_empty() {
        return Err(TransferError::InvalidInput("missing file name".into()));
    }
    if file_name.len() > MAX_FILE_NAME_LEN {
        return Err(TransferError::InvalidInput("file name too long".into()));
    }
    if file_name.chars().any(char::is_control) {
        return Err(TransferError::InvalidInput(
            "file name contains control characters".into(),
        ));
    }

    let content_type = file.content_type.trim();
    let content_type = if content_type.is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else if content_type.len() > MAX_CONTENT_TYPE_LEN
        || !content_type.bytes().all(|b| b.is_ascii_graphic() || b == b' ')
    {
        return Err(TransferError::InvalidInput("invalid content type".into()));
    } else {
        content_type.to_string()
    };

    Ok(FileDescriptor {
        file_name,
        content_type,
    })
}

fn normalize_password(password: Option<String>) -> TransferResult<Option<String>> {
    match password {
        Some(p) if p.is_empty() => Ok(None),
        Some(p) if p.len() > MAX_PASSWORD_LEN => {
            Err(TransferError::InvalidInput("password too long".into()))
        }
        other => Ok(other),
    }
}

fn validate_owner_id(owner_id: String) -> TransferResult<String> {
    let trimmed = owner_id.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_OWNER_ID_LEN
        || trimmed.chars().any(char::is_control)
    {
        return Err(TransferError::InvalidInput("invalid owner identity".into()));
    }
    Ok(trimmed.to_string())
}
