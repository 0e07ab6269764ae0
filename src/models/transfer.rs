//! Represents one uploaded file and the link that hands it out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A stored transfer, exactly as persisted.
///
/// Carries `storage_path` and `credential_hash`, so it must never be
/// serialized back to an untrusted caller. Use [`TransferMetadata`] or
/// [`OwnedTransfer`] for responses.
#[derive(Clone, FromRow, Debug, PartialEq)]
pub struct TransferRecord {
    /// Opaque external handle, primary key.
    pub link_id: String,

    /// Identity that uploaded the file, absent for anonymous uploads.
    pub owner_id: Option<String>,

    /// Original filename as supplied by the uploader.
    pub file_name: String,

    /// Size in bytes.
    pub file_size_bytes: i64,

    /// Content type (MIME type).
    pub file_content_type: String,

    /// Locator inside the blob store, derived from `link_id` only.
    pub storage_path: String,

    /// MD5 of the payload, hex encoded.
    pub etag: String,

    /// Argon2 PHC string of the access password.
    pub credential_hash: Option<String>,

    /// Argon2 PHC string of the creator's delete token (anonymous uploads).
    pub delete_token_hash: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Fixed at creation as `created_at + ttl`.
    pub expire_at: DateTime<Utc>,

    pub download_count: i64,
}

impl TransferRecord {
    pub fn is_protected(&self) -> bool {
        self.credential_hash.is_some()
    }
}

/// Descriptive metadata of an uploaded file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDescriptor {
    pub file_name: String,
    pub content_type: String,
}

/// Public view of a transfer, safe to return before any password check.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub link_id: String,
    pub file_name: String,
    pub file_size_bytes: i64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub password_required: bool,
    pub download_count: i64,
}

impl From<&TransferRecord> for TransferMetadata {
    fn from(record: &TransferRecord) -> Self {
        Self {
            link_id: record.link_id.clone(),
            file_name: record.file_name.clone(),
            file_size_bytes: record.file_size_bytes,
            content_type: record.file_content_type.clone(),
            created_at: record.created_at,
            expire_at: record.expire_at,
            password_required: record.is_protected(),
            download_count: record.download_count,
        }
    }
}

/// Result of a successful create.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTransfer {
    pub link_id: String,
    pub share_url: String,
    pub expire_at: DateTime<Utc>,

    /// Returned once for anonymous uploads; proves creator context on delete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_token: Option<String>,
}

/// Dashboard row for a transfer owned by the caller.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OwnedTransfer {
    pub link_id: String,
    pub share_url: String,
    pub file_name: String,
    pub file_size_bytes: i64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub password_protected: bool,
    pub download_count: i64,
    pub expired: bool,
}
