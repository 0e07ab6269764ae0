mod common;

use chrono::Duration;
use common::{
    MAX_UPLOAD_BYTES, ScriptedLinkIds, StuckLinkIds, SweepOnOpen, TestContext, body,
    new_transfer, read_all,
};
use futures::TryStreamExt;
use gb_transfer::{
    config::DEFAULT_REAP_GRACE_SECS,
    services::{
        events::TransferEventKind,
        expiry::SweepReport,
        record_store::StoreError,
        transfer_service::{MAX_LINK_ID_ATTEMPTS, Requester, TransferError},
    },
};
use std::{collections::HashSet, sync::Arc, sync::atomic::Ordering};

const PAYLOAD: &[u8] = b"the quick brown fox jumps over the lazy dog";
static OVERSIZED: [u8; 2 * MAX_UPLOAD_BYTES as usize] = [7u8; 2 * MAX_UPLOAD_BYTES as usize];

#[tokio::test]
async fn create_then_resolve_returns_the_uploaded_bytes() {
    let ctx = TestContext::new().await;

    let created = ctx
        .service
        .create(new_transfer(None, Some(60), None), body(PAYLOAD))
        .await
        .unwrap();
    assert_eq!(created.link_id.len(), 22);
    assert_eq!(
        created.share_url,
        format!("https://gb.example/download/{}", created.link_id)
    );
    assert!(created.delete_token.is_some());

    let resolved = ctx.service.resolve(&created.link_id, None).await.unwrap();
    assert_eq!(resolved.metadata.file_name, "holiday.png");
    assert_eq!(resolved.metadata.content_type, "image/png");
    assert_eq!(resolved.metadata.file_size_bytes, PAYLOAD.len() as i64);
    assert_eq!(resolved.metadata.download_count, 1);
    assert!(!resolved.metadata.password_required);
    assert_eq!(resolved.etag, format!("{:x}", md5::compute(PAYLOAD)));
    assert_eq!(read_all(resolved.reader).await, PAYLOAD);
}

#[tokio::test]
async fn ttl_defaults_and_must_be_allowed() {
    let ctx = TestContext::new().await;

    let created = ctx
        .service
        .create(new_transfer(None, None, Some("alice")), body(PAYLOAD))
        .await
        .unwrap();
    let record = ctx.records.get(&created.link_id).await.unwrap();
    assert_eq!(record.expire_at - record.created_at, Duration::minutes(15));
    assert_eq!(created.expire_at, record.expire_at);
    assert!(created.delete_token.is_none());

    for ttl in [0, 7, 1441] {
        let err = ctx
            .service
            .create(new_transfer(None, Some(ttl), None), body(PAYLOAD))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(_)), "ttl {}", ttl);
    }
}

#[tokio::test]
async fn oversized_upload_is_refused_without_a_record() {
    let ctx = TestContext::new().await;

    let err = ctx
        .service
        .create(new_transfer(None, Some(5), Some("alice")), body(&OVERSIZED))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::PayloadTooLarge {
            limit: MAX_UPLOAD_BYTES
        }
    ));

    let owned: Vec<_> = ctx
        .service
        .owned_transfers("alice")
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert!(owned.is_empty());
}

#[tokio::test]
async fn password_gates_the_download_and_the_counter() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(Some("hunter2"), Some(60), None), body(PAYLOAD))
        .await
        .unwrap();

    let meta = ctx.service.metadata(&created.link_id).await.unwrap();
    assert!(meta.password_required);

    let err = ctx.service.resolve(&created.link_id, None).await.unwrap_err();
    assert!(matches!(err, TransferError::PasswordRequired));
    let err = ctx
        .service
        .resolve(&created.link_id, Some(String::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::PasswordRequired));
    let err = ctx
        .service
        .resolve(&created.link_id, Some("hunter3".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidCredential));

    assert_eq!(ctx.blobs.opens(), 0);
    let record = ctx.records.get(&created.link_id).await.unwrap();
    assert_eq!(record.download_count, 0);
    assert_ne!(record.credential_hash.as_deref(), Some("hunter2"));

    let resolved = ctx
        .service
        .resolve(&created.link_id, Some("hunter2".into()))
        .await
        .unwrap();
    assert_eq!(resolved.metadata.download_count, 1);
    assert_eq!(read_all(resolved.reader).await, PAYLOAD);
}

#[tokio::test]
async fn empty_password_creates_an_open_link() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(Some(""), Some(5), None), body(PAYLOAD))
        .await
        .unwrap();

    let record = ctx.records.get(&created.link_id).await.unwrap();
    assert!(record.credential_hash.is_none());
    let resolved = ctx
        .service
        .resolve(&created.link_id, Some("anything".into()))
        .await
        .unwrap();
    assert_eq!(resolved.metadata.download_count, 1);
}

#[tokio::test]
async fn expired_links_are_refused_before_touching_the_blob() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(Some("pw"), Some(1), None), body(PAYLOAD))
        .await
        .unwrap();

    ctx.clock.advance(Duration::seconds(59));
    assert!(ctx.service.metadata(&created.link_id).await.is_ok());

    ctx.clock.advance(Duration::seconds(2));
    let err = ctx
        .service
        .resolve(&created.link_id, Some("pw".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Expired));
    let err = ctx.service.metadata(&created.link_id).await.unwrap_err();
    assert!(matches!(err, TransferError::Expired));

    assert_eq!(ctx.blobs.opens(), 0);
    assert_eq!(
        ctx.records
            .get(&created.link_id)
            .await
            .unwrap()
            .download_count,
        0
    );
}

#[tokio::test]
async fn unknown_and_malformed_links_are_not_found() {
    let ctx = TestContext::new().await;
    for link_id in ["doesNotExist0000000000", "", "../../etc/passwd", "a b"] {
        let err = ctx.service.resolve(link_id, None).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound), "{:?}", link_id);
        let err = ctx.service.metadata(link_id).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound), "{:?}", link_id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_downloads_are_each_counted_once() {
    const DOWNLOADS: usize = 24;
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(None, Some(60), None), body(PAYLOAD))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..DOWNLOADS {
        let service = ctx.service.clone();
        let link_id = created.link_id.clone();
        handles.push(tokio::spawn(async move {
            let resolved = service.resolve(&link_id, None).await.unwrap();
            let bytes = read_all(resolved.reader).await;
            (resolved.metadata.download_count, bytes)
        }));
    }

    let mut counts = Vec::new();
    for handle in handles {
        let (count, bytes) = handle.await.unwrap();
        assert_eq!(bytes, PAYLOAD);
        counts.push(count);
    }
    counts.sort_unstable();
    assert_eq!(counts, (1..=DOWNLOADS as i64).collect::<Vec<_>>());

    let record = ctx.records.get(&created.link_id).await.unwrap();
    assert_eq!(record.download_count, DOWNLOADS as i64);
}

#[tokio::test]
async fn only_the_owner_can_delete() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(None, Some(60), Some("alice")), body(PAYLOAD))
        .await
        .unwrap();
    let storage_path = ctx.records.get(&created.link_id).await.unwrap().storage_path;

    for requester in [
        Requester::Owner("mallory".into()),
        Requester::Creator("guessed-token".into()),
    ] {
        let err = ctx
            .service
            .delete_owned(&created.link_id, requester)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Forbidden));
    }
    assert!(ctx.service.resolve(&created.link_id, None).await.is_ok());

    ctx.service
        .delete_owned(&created.link_id, Requester::Owner("alice".into()))
        .await
        .unwrap();
    assert!(!ctx.blobs.exists(&storage_path).await);
    let err = ctx.service.resolve(&created.link_id, None).await.unwrap_err();
    assert!(matches!(err, TransferError::NotFound));
    assert!(ctx.records.is_retired(&created.link_id).await.unwrap());

    let err = ctx
        .service
        .delete_owned(&created.link_id, Requester::Owner("alice".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::NotFound));
}

#[tokio::test]
async fn anonymous_creator_deletes_with_the_token() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(None, Some(60), None), body(PAYLOAD))
        .await
        .unwrap();
    let token = created.delete_token.clone().unwrap();

    // No owner on the record, so no identity is enough.
    let err = ctx
        .service
        .delete_owned(&created.link_id, Requester::Owner("alice".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Forbidden));

    let record = ctx.records.get(&created.link_id).await.unwrap();
    assert_ne!(record.delete_token_hash.as_deref(), Some(token.as_str()));

    ctx.service
        .delete_owned(&created.link_id, Requester::Creator(token))
        .await
        .unwrap();
    let err = ctx.service.metadata(&created.link_id).await.unwrap_err();
    assert!(matches!(err, TransferError::NotFound));
}

#[tokio::test]
async fn storage_failure_on_open_is_unavailable_and_not_counted() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(Some("pw"), Some(60), None), body(PAYLOAD))
        .await
        .unwrap();

    ctx.blobs.fail_opens.store(true, Ordering::SeqCst);
    let err = ctx
        .service
        .resolve(&created.link_id, Some("pw".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::ServiceUnavailable(_)));
    assert_eq!(ctx.blobs.opens(), 1);
    assert_eq!(
        ctx.records
            .get(&created.link_id)
            .await
            .unwrap()
            .download_count,
        0
    );

    ctx.blobs.fail_opens.store(false, Ordering::SeqCst);
    let resolved = ctx
        .service
        .resolve(&created.link_id, Some("pw".into()))
        .await
        .unwrap();
    assert_eq!(resolved.metadata.download_count, 1);
    assert_eq!(read_all(resolved.reader).await, PAYLOAD);
}

#[tokio::test]
async fn failed_blob_removal_keeps_the_record() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(None, Some(60), Some("alice")), body(PAYLOAD))
        .await
        .unwrap();

    ctx.blobs.fail_deletes.store(true, Ordering::SeqCst);
    let err = ctx
        .service
        .delete_owned(&created.link_id, Requester::Owner("alice".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::ServiceUnavailable(_)));
    let resolved = ctx.service.resolve(&created.link_id, None).await.unwrap();
    assert_eq!(read_all(resolved.reader).await, PAYLOAD);

    ctx.blobs.fail_deletes.store(false, Ordering::SeqCst);
    ctx.service
        .delete_owned(&created.link_id, Requester::Owner("alice".into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn link_id_collisions_are_retried_without_overwriting() {
    let ids = Arc::new(ScriptedLinkIds::new(&["taken-id", "taken-id", "fresh-id"]));
    let ctx = TestContext::new().await.with_link_ids(ids);

    let first = ctx
        .service
        .create(new_transfer(None, Some(60), None), body(PAYLOAD))
        .await
        .unwrap();
    assert_eq!(first.link_id, "taken-id");

    let second = ctx
        .service
        .create(new_transfer(None, Some(60), None), body(b"another payload"))
        .await
        .unwrap();
    assert_eq!(second.link_id, "fresh-id");

    let resolved = ctx.service.resolve("taken-id", None).await.unwrap();
    assert_eq!(read_all(resolved.reader).await, PAYLOAD);
    let resolved = ctx.service.resolve("fresh-id", None).await.unwrap();
    assert_eq!(read_all(resolved.reader).await, b"another payload");
}

#[tokio::test]
async fn exhausted_link_ids_are_unavailable() {
    let ctx = TestContext::new()
        .await
        .with_link_ids(Arc::new(StuckLinkIds("stuck-id")));

    ctx.service
        .create(new_transfer(None, Some(60), None), body(PAYLOAD))
        .await
        .unwrap();
    let err = ctx
        .service
        .create(new_transfer(None, Some(60), None), body(b"second"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::ServiceUnavailable(_)));
    assert_eq!(MAX_LINK_ID_ATTEMPTS, 5);

    let resolved = ctx.service.resolve("stuck-id", None).await.unwrap();
    assert_eq!(read_all(resolved.reader).await, PAYLOAD);
}

#[tokio::test]
async fn retired_link_ids_are_never_reissued() {
    let ids = Arc::new(ScriptedLinkIds::new(&["reused-id", "reused-id", "other-id"]));
    let ctx = TestContext::new().await.with_link_ids(ids);

    let first = ctx
        .service
        .create(new_transfer(None, Some(60), Some("alice")), body(PAYLOAD))
        .await
        .unwrap();
    ctx.service
        .delete_owned(&first.link_id, Requester::Owner("alice".into()))
        .await
        .unwrap();

    let second = ctx
        .service
        .create(new_transfer(None, Some(60), Some("alice")), body(PAYLOAD))
        .await
        .unwrap();
    assert_eq!(second.link_id, "other-id");
    let err = ctx.service.resolve("reused-id", None).await.unwrap_err();
    assert!(matches!(err, TransferError::NotFound));
}

async fn assert_distinct_links(creates: usize) {
    let ctx = TestContext::new().await;
    let mut seen = HashSet::with_capacity(creates);
    for _ in 0..creates {
        let created = ctx
            .service
            .create(new_transfer(None, Some(5), Some("bulk")), body(b"x"))
            .await
            .unwrap();
        assert!(seen.insert(created.link_id));
    }
}

#[tokio::test]
async fn many_creates_yield_distinct_links() {
    assert_distinct_links(1_000).await;
}

#[tokio::test]
#[ignore = "ten thousand uploads with an fsync each; run with --ignored"]
async fn ten_thousand_creates_yield_distinct_links() {
    assert_distinct_links(10_000).await;
}

#[tokio::test]
async fn owner_listing_is_scoped_and_newest_first() {
    let ctx = TestContext::new().await;
    let older = ctx
        .service
        .create(new_transfer(Some("pw"), Some(1), Some("alice")), body(PAYLOAD))
        .await
        .unwrap();
    ctx.clock.advance(Duration::seconds(1));
    let newer = ctx
        .service
        .create(new_transfer(None, Some(60), Some("alice")), body(PAYLOAD))
        .await
        .unwrap();
    ctx.service
        .create(new_transfer(None, Some(60), Some("bob")), body(PAYLOAD))
        .await
        .unwrap();
    ctx.service
        .create(new_transfer(None, Some(60), None), body(PAYLOAD))
        .await
        .unwrap();

    ctx.clock.advance(Duration::minutes(2));
    let rows = ctx
        .service
        .owned_transfers("alice")
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.link_id.as_str()).collect();
    assert_eq!(ids, [newer.link_id.as_str(), older.link_id.as_str()]);
    assert!(!rows[0].expired);
    assert!(!rows[0].password_protected);
    assert!(rows[1].expired);
    assert!(rows[1].password_protected);
    assert_eq!(rows[0].share_url, ctx.service.share_url(&newer.link_id));

    let none = ctx
        .service
        .owned_transfers("carol")
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn reaper_reclaims_only_expired_transfers() {
    let ctx = TestContext::new().await;
    let short = ctx
        .service
        .create(new_transfer(None, Some(1), None), body(PAYLOAD))
        .await
        .unwrap();
    let long = ctx
        .service
        .create(new_transfer(None, Some(60), None), body(PAYLOAD))
        .await
        .unwrap();
    let short_path = ctx.records.get(&short.link_id).await.unwrap().storage_path;

    let report = ctx.reaper().sweep_once().await.unwrap();
    assert_eq!(report.reclaimed, 0);

    ctx.clock.advance(Duration::minutes(2));
    let report = ctx.reaper().sweep_once().await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.failed, 0);

    assert!(!ctx.blobs.exists(&short_path).await);
    assert!(matches!(
        ctx.records.get(&short.link_id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(ctx.records.is_retired(&short.link_id).await.unwrap());
    assert!(ctx.service.resolve(&long.link_id, None).await.is_ok());
}

#[tokio::test]
async fn reaper_keeps_records_whose_blob_cannot_be_removed() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(None, Some(1), None), body(PAYLOAD))
        .await
        .unwrap();
    ctx.clock.advance(Duration::minutes(2));

    ctx.blobs.fail_deletes.store(true, Ordering::SeqCst);
    let report = ctx.reaper().sweep_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(ctx.records.get(&created.link_id).await.is_ok());

    ctx.blobs.fail_deletes.store(false, Ordering::SeqCst);
    let report = ctx.reaper().sweep_once().await.unwrap();
    assert_eq!(report.reclaimed, 1);
}

#[tokio::test]
async fn reaper_waits_out_the_grace_period() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(None, Some(1), None), body(PAYLOAD))
        .await
        .unwrap();
    let reaper = ctx.reaper_with_grace(Duration::minutes(5));

    ctx.clock.advance(Duration::minutes(3));
    assert_eq!(reaper.sweep_once().await.unwrap().reclaimed, 0);
    assert!(ctx.records.get(&created.link_id).await.is_ok());

    ctx.clock.advance(Duration::minutes(3));
    assert_eq!(reaper.sweep_once().await.unwrap().reclaimed, 1);
    assert!(ctx.records.is_retired(&created.link_id).await.unwrap());
}

#[tokio::test]
async fn sweep_between_expiry_check_and_open_keeps_the_download() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(Some("pw"), Some(1), None), body(PAYLOAD))
        .await
        .unwrap();

    // Still valid when the resolve starts; expired by the time it opens.
    ctx.clock.advance(Duration::seconds(59));
    *ctx.blobs.sweep_on_open.lock().unwrap() = Some(SweepOnOpen {
        clock: ctx.clock.clone(),
        advance: Duration::seconds(2),
        reaper: ctx.reaper_with_grace(Duration::seconds(DEFAULT_REAP_GRACE_SECS as i64)),
    });

    let resolved = ctx
        .service
        .resolve(&created.link_id, Some("pw".into()))
        .await
        .unwrap();
    assert_eq!(
        *ctx.blobs.last_sweep.lock().unwrap(),
        Some(SweepReport::default())
    );
    assert_eq!(resolved.metadata.download_count, 1);
    assert_eq!(read_all(resolved.reader).await, PAYLOAD);

    // The next request sees the expiry.
    let err = ctx
        .service
        .resolve(&created.link_id, Some("pw".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Expired));
}

#[cfg(unix)]
#[tokio::test]
async fn download_in_flight_survives_reclamation() {
    let ctx = TestContext::new().await;
    let created = ctx
        .service
        .create(new_transfer(None, Some(1), None), body(PAYLOAD))
        .await
        .unwrap();
    let resolved = ctx.service.resolve(&created.link_id, None).await.unwrap();

    ctx.clock.advance(Duration::minutes(2));
    assert_eq!(ctx.reaper().sweep_once().await.unwrap().reclaimed, 1);
    assert_eq!(read_all(resolved.reader).await, PAYLOAD);
}

#[tokio::test]
async fn lifecycle_events_reach_subscribers() {
    let ctx = TestContext::new().await;
    let mut rx = ctx.service.subscribe();

    let created = ctx
        .service
        .create(new_transfer(None, Some(60), Some("alice")), body(PAYLOAD))
        .await
        .unwrap();
    ctx.service.resolve(&created.link_id, None).await.unwrap();
    ctx.service
        .delete_owned(&created.link_id, Requester::Owner("alice".into()))
        .await
        .unwrap();

    let kinds: Vec<_> = [
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
    ]
    .into_iter()
    .map(|event| {
        assert_eq!(event.link_id, created.link_id);
        assert_eq!(event.owner_id.as_deref(), Some("alice"));
        (event.kind, event.download_count)
    })
    .collect();
    assert_eq!(
        kinds,
        [
            (TransferEventKind::Created, Some(0)),
            (TransferEventKind::Downloaded, Some(1)),
            (TransferEventKind::Deleted, None),
        ]
    );
}
