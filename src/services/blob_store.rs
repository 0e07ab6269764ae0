//! src/services/blob_store.rs
//!
//! Byte storage for uploaded files. The service only needs durable
//! put/get/delete by an internal path; `LocalBlobStore` provides that on local
//! disk, sharded beneath `root/{shard}/{shard}/{link_id}`.
//!
//! Uploads are written once into a staging file and then committed under
//! their final path with create-if-absent semantics, so a link id collision
//! can never overwrite another transfer's payload and a retry with a new id
//! does not need the upload stream again.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("blob `{0}` already exists")]
    AlreadyExists(String),
    #[error("upload exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("invalid blob path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// A fully received upload that has not been given a final path yet.
#[derive(Debug)]
pub struct StagedBlob {
    pub staging_key: String,
    pub size_bytes: u64,
    pub etag: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Internal path for a link id. Never depends on the uploaded filename.
    fn path_for(&self, link_id: &str) -> String;

    /// Receive an upload, failing with `TooLarge` once `limit` is exceeded.
    async fn stage(
        &self,
        stream: BoxStream<'_, io::Result<Bytes>>,
        limit: u64,
    ) -> BlobResult<StagedBlob>;

    /// Publish a staged upload at `path`. `AlreadyExists` if taken.
    async fn commit(&self, staged: &StagedBlob, path: &str) -> BlobResult<()>;

    /// Drop the staging copy. Committed paths are unaffected.
    async fn discard(&self, staged: &StagedBlob);

    async fn open(&self, path: &str) -> BlobResult<BlobReader>;

    /// Remove a blob. Removing a missing blob succeeds.
    async fn delete(&self, path: &str) -> BlobResult<()>;

    /// Write/read/delete round trip used by the readiness probe.
    async fn probe(&self) -> BlobResult<()>;
}

#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    /// Base directory on disk where payloads are stored.
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Two-level shard for a link id: the first two bytes of MD5(link_id)
    /// as lowercase hex. Keeps directory fan-out bounded.
    fn shards(link_id: &str) -> (String, String) {
        let digest = md5::compute(link_id.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Map a stored path onto disk, rejecting anything that could escape
    /// the root.
    fn resolve(&self, path: &str) -> BlobResult<PathBuf> {
        if path.is_empty() || path.starts_with('/') || path.contains("..") {
            return Err(BlobError::InvalidPath);
        }
        if path
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BlobError::InvalidPath);
        }
        if path.starts_with(STAGING_DIR) {
            return Err(BlobError::InvalidPath);
        }
        Ok(self.root.join(path))
    }

    fn staging_path(&self, staging_key: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(staging_key)
    }

    /// Recursively remove empty directories up to the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn path_for(&self, link_id: &str) -> String {
        let (shard_a, shard_b) = Self::shards(link_id);
        format!("{}/{}/{}", shard_a, shard_b, link_id)
    }

    async fn stage(
        &self,
        mut stream: BoxStream<'_, io::Result<Bytes>>,
        limit: u64,
    ) -> BlobResult<StagedBlob> {
        let staging_key = Uuid::new_v4().to_string();
        let tmp_path = self.staging_path(&staging_key);
        if let Some(parent) = tmp_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BlobError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            if size_bytes > limit {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::TooLarge { limit });
            }
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }

        Ok(StagedBlob {
            staging_key,
            size_bytes,
            etag: format!("{:x}", digest.compute()),
        })
    }

    async fn commit(&self, staged: &StagedBlob, path: &str) -> BlobResult<()> {
        let final_path = self.resolve(path)?;
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BlobError::Io(io::Error::other("blob path missing parent directory")))?;
        let staging = self.staging_path(&staged.staging_key);

        // A concurrent delete may prune the shard directory between
        // create_dir_all and the link, so try twice.
        let mut last_err = None;
        for _ in 0..2 {
            fs::create_dir_all(&parent).await?;
            // hard_link refuses an existing destination, unlike rename.
            match fs::hard_link(&staging, &final_path).await {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    return Err(BlobError::AlreadyExists(path.to_string()));
                }
                Err(err) if err.kind() == ErrorKind::NotFound && parent.exists() => {
                    return Err(BlobError::Io(err));
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(BlobError::Io(last_err.unwrap_or_else(|| {
            io::Error::other("failed to commit staged blob")
        })))
    }

    async fn discard(&self, staged: &StagedBlob) {
        let tmp_path = self.staging_path(&staged.staging_key);
        if let Err(err) = fs::remove_file(&tmp_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!("failed to remove staging file {}: {}", tmp_path.display(), err);
            }
        }
    }

    async fn open(&self, path: &str) -> BlobResult<BlobReader> {
        let file_path = self.resolve(path)?;
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BlobError::NotFound(path.to_string())
            } else {
                BlobError::Io(err)
            }
        })?;
        Ok(Box::new(file))
    }

    async fn delete(&self, path: &str) -> BlobResult<()> {
        let file_path = self.resolve(path)?;
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", file_path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn probe(&self) -> BlobResult<()> {
        fs::create_dir_all(&self.root).await?;
        let tmp_path = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(BlobError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "file content mismatch",
            )));
        }
        Ok(())
    }
}
