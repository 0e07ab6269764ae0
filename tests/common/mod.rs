#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use chrono::Duration;
use futures::{Stream, stream::BoxStream};
use gb_transfer::{
    build_app,
    config::DEFAULT_ALLOWED_TTL_MINUTES,
    db,
    models::transfer::FileDescriptor,
    services::{
        blob_store::{BlobError, BlobReader, BlobResult, BlobStore, LocalBlobStore, StagedBlob},
        clock::ManualClock,
        credential_guard::{CredentialGuard, HashCost},
        events::TransferEvents,
        expiry::{ExpiryReaper, SweepReport},
        link_id::{LinkIdSource, RandomLinkIds},
        record_store::RecordStore,
        transfer_service::{NewTransfer, TransferPolicy, TransferService},
    },
};
use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

pub const MAX_UPLOAD_BYTES: u64 = 1024;

pub fn test_policy() -> TransferPolicy {
    TransferPolicy {
        allowed_ttl_minutes: DEFAULT_ALLOWED_TTL_MINUTES.to_vec(),
        default_ttl_minutes: 15,
        max_upload_bytes: MAX_UPLOAD_BYTES,
        public_base_url: "https://gb.example".into(),
    }
}

/// Work to run inside the next `open`, after the service has already
/// passed its expiry and password checks.
pub struct SweepOnOpen {
    pub clock: Arc<ManualClock>,
    pub advance: Duration,
    pub reaper: ExpiryReaper,
}

/// Local disk blobs with hooks for counting reads and injecting failures.
pub struct TestBlobs {
    pub inner: LocalBlobStore,
    pub opens: AtomicUsize,
    pub fail_opens: AtomicBool,
    pub fail_deletes: AtomicBool,
    pub sweep_on_open: Mutex<Option<SweepOnOpen>>,
    pub last_sweep: Mutex<Option<SweepReport>>,
}

impl TestBlobs {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.inner.root().join(path).exists()
    }
}

#[async_trait]
impl BlobStore for TestBlobs {
    fn path_for(&self, link_id: &str) -> String {
        self.inner.path_for(link_id)
    }

    async fn stage(
        &self,
        stream: BoxStream<'_, io::Result<Bytes>>,
        limit: u64,
    ) -> BlobResult<StagedBlob> {
        self.inner.stage(stream, limit).await
    }

    async fn commit(&self, staged: &StagedBlob, path: &str) -> BlobResult<()> {
        self.inner.commit(staged, path).await
    }

    async fn discard(&self, staged: &StagedBlob) {
        self.inner.discard(staged).await
    }

    async fn open(&self, path: &str) -> BlobResult<BlobReader> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let hook = self.sweep_on_open.lock().unwrap().take();
        if let Some(hook) = hook {
            hook.clock.advance(hook.advance);
            let report = hook.reaper.sweep_once().await.unwrap();
            *self.last_sweep.lock().unwrap() = Some(report);
        }
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(BlobError::Io(io::Error::other("simulated read outage")));
        }
        self.inner.open(path).await
    }

    async fn delete(&self, path: &str) -> BlobResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError::Io(io::Error::other("simulated outage")));
        }
        self.inner.delete(path).await
    }

    async fn probe(&self) -> BlobResult<()> {
        self.inner.probe().await
    }
}

/// Hands out scripted ids first, then random ones.
pub struct ScriptedLinkIds {
    queue: Mutex<VecDeque<String>>,
}

impl ScriptedLinkIds {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            queue: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
        }
    }
}

impl LinkIdSource for ScriptedLinkIds {
    fn new_link_id(&self) -> String {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| RandomLinkIds.new_link_id())
    }
}

/// Always the same id.
pub struct StuckLinkIds(pub &'static str);

impl LinkIdSource for StuckLinkIds {
    fn new_link_id(&self) -> String {
        self.0.to_string()
    }
}

pub struct TestContext {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub blobs: Arc<TestBlobs>,
    pub records: RecordStore,
    pub service: TransferService,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_policy(test_policy()).await
    }

    pub async fn with_policy(policy: TransferPolicy) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let pool = db::connect(&url, 8).await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        let records = RecordStore::new(Arc::new(pool), TransferEvents::default());
        let blobs = Arc::new(TestBlobs {
            inner: LocalBlobStore::new(dir.path().join("blobs")),
            opens: AtomicUsize::new(0),
            fail_opens: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            sweep_on_open: Mutex::new(None),
            last_sweep: Mutex::new(None),
        });
        let clock = Arc::new(ManualClock::default());
        let guard = CredentialGuard::new(HashCost::minimal()).unwrap();
        let service = TransferService::new(records.clone(), blobs.clone(), guard, policy)
            .with_clock(clock.clone());

        Self {
            dir,
            clock,
            blobs,
            records,
            service,
        }
    }

    pub fn with_link_ids(mut self, ids: Arc<dyn LinkIdSource>) -> Self {
        self.service = self.service.clone().with_link_ids(ids);
        self
    }

    /// Reaper that reclaims as soon as a transfer expires.
    pub fn reaper(&self) -> ExpiryReaper {
        self.reaper_with_grace(Duration::zero())
    }

    pub fn reaper_with_grace(&self, grace: Duration) -> ExpiryReaper {
        ExpiryReaper::new(
            self.records.clone(),
            self.blobs.clone(),
            self.clock.clone(),
            100,
            grace,
        )
    }

    pub fn app(&self) -> Router {
        build_app(self.service.clone())
    }
}

pub fn body(bytes: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    // Two chunks, so staging sees a real stream.
    let (head, tail) = bytes.split_at(bytes.len() / 2);
    futures::stream::iter(vec![
        Ok(Bytes::from_static(head)),
        Ok(Bytes::from_static(tail)),
    ])
}

pub fn new_transfer(
    password: Option<&str>,
    ttl_minutes: Option<u32>,
    owner: Option<&str>,
) -> NewTransfer {
    NewTransfer {
        file: FileDescriptor {
            file_name: "holiday.png".into(),
            content_type: "image/png".into(),
        },
        password: password.map(str::to_string),
        ttl_minutes,
        owner_id: owner.map(str::to_string),
    }
}

pub async fn read_all(mut reader: BlobReader) -> Vec<u8> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    buf
}
