use super::*;

#[tokio::test]
async fn test_transport_starts_follow_request_order() {
    let ctx = create_test_downloader().await;
    for id in ["Berlin", "Luxembourg", "Belgium_East"] {
        ctx.downloader
            .request_download(ctx.idx(id), PackageOptions::MapOnly)
            .unwrap();
    }
    assert_eq!(ctx.transport.started_ids(), vec!["Berlin"]);

    ctx.transport.complete("Berlin");
    assert_eq!(ctx.transport.started_ids(), vec!["Berlin", "Luxembourg"]);
    assert_eq!(
        ctx.downloader.status(ctx.idx("Luxembourg")),
        Status::Downloading
    );

    ctx.transport.complete("Luxembourg");
    assert_eq!(
        ctx.transport.started_ids(),
        vec!["Berlin", "Luxembourg", "Belgium_East"]
    );
}

#[tokio::test]
async fn test_failure_advances_the_queue() {
    let ctx = create_test_downloader().await;
    ctx.downloader
        .request_download(ctx.idx("Berlin"), PackageOptions::MapOnly)
        .unwrap();
    ctx.downloader
        .request_download(ctx.idx("Luxembourg"), PackageOptions::MapOnly)
        .unwrap();

    ctx.transport
        .fail("Berlin", TransportError::Network("connection reset".into()));

    assert_eq!(
        ctx.downloader.status(ctx.idx("Berlin")),
        Status::DownloadFailed
    );
    assert_eq!(
        ctx.downloader.status(ctx.idx("Luxembourg")),
        Status::Downloading
    );
    assert_eq!(ctx.transport.started_ids(), vec!["Berlin", "Luxembourg"]);
}

#[tokio::test]
async fn test_cancelling_queued_request_never_touches_transport() {
    let ctx = create_test_downloader().await;
    ctx.downloader
        .request_download(ctx.idx("Berlin"), PackageOptions::MapOnly)
        .unwrap();
    ctx.downloader
        .request_download(ctx.idx("Luxembourg"), PackageOptions::MapOnly)
        .unwrap();

    ctx.downloader.request_cancel(ctx.idx("Luxembourg")).unwrap();

    assert!(ctx.transport.aborted().is_empty());
    assert_eq!(
        ctx.downloader.status(ctx.idx("Luxembourg")),
        Status::NotDownloaded
    );

    ctx.transport.complete("Berlin");
    assert_eq!(ctx.transport.started_ids(), vec!["Berlin"]);
    assert!(!ctx.downloader.is_download_in_progress());
}

#[tokio::test]
async fn test_cancelling_active_request_aborts_and_promotes_next() {
    let ctx = create_test_downloader().await;
    ctx.downloader
        .request_download(ctx.idx("Berlin"), PackageOptions::MapOnly)
        .unwrap();
    ctx.downloader
        .request_download(ctx.idx("Luxembourg"), PackageOptions::MapOnly)
        .unwrap();
    let berlin_handle = ctx.transport.handle_of("Berlin");

    ctx.downloader.request_cancel(ctx.idx("Berlin")).unwrap();

    assert_eq!(
        ctx.downloader.status(ctx.idx("Berlin")),
        Status::NotDownloaded
    );
    assert_eq!(ctx.transport.aborted(), vec![berlin_handle]);
    assert_eq!(
        ctx.downloader.status(ctx.idx("Luxembourg")),
        Status::Downloading
    );
}

#[tokio::test]
async fn test_cancel_discards_partial_files() {
    let ctx = create_test_downloader().await;
    ctx.downloader
        .request_download(ctx.idx("Berlin"), PackageOptions::MapOnly)
        .unwrap();
    let request = ctx.transport.started_request("Berlin");
    let partial = request.files[0].destination.clone();
    std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
    std::fs::write(&partial, b"half").unwrap();

    ctx.downloader.request_cancel(ctx.idx("Berlin")).unwrap();

    assert!(!partial.exists());
}

#[tokio::test]
async fn test_queue_is_persisted_on_every_change() {
    let ctx = create_test_downloader().await;
    let store = ctx.downloader.store.clone();
    ctx.downloader
        .request_download(ctx.idx("Berlin"), PackageOptions::MapOnly)
        .unwrap();
    ctx.downloader
        .request_download(ctx.idx("Belgium_East"), PackageOptions::MapWithRouting)
        .unwrap();

    let saved: Vec<String> = store
        .load_queue()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(saved, vec!["Berlin", "Belgium_East"]);

    ctx.transport.complete("Berlin");
    let saved = store.load_queue().await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].options, PackageOptions::MapWithRouting);
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let ctx = create_test_downloader().await;
    ctx.downloader
        .request_download(ctx.idx("Berlin"), PackageOptions::MapOnly)
        .unwrap();
    ctx.downloader
        .request_download(ctx.idx("Luxembourg"), PackageOptions::MapOnly)
        .unwrap();

    let ctx = ctx.restart().await;

    let queued: Vec<RegionIndex> = ctx
        .downloader
        .queued_requests()
        .iter()
        .map(|r| r.index)
        .collect();
    assert_eq!(queued, vec![ctx.idx("Berlin"), ctx.idx("Luxembourg")]);
    assert_eq!(ctx.transport.started_ids(), vec!["Berlin"]);
    assert_eq!(ctx.downloader.status(ctx.idx("Berlin")), Status::Downloading);
    assert_eq!(ctx.downloader.status(ctx.idx("Luxembourg")), Status::InQueue);
}

#[tokio::test]
async fn test_restore_skips_unknown_and_illegal_entries() {
    let dir = tempfile::TempDir::new().unwrap();
    write_package(&dir, TEST_VERSION, "Berlin", PackageOptions::MapOnly);
    std::fs::write(
        dir.path().join("maps").join("download_queue.json"),
        r#"{"format": 1, "entries": [
            {"id": "Atlantis", "options": "map_only"},
            {"id": "Berlin", "options": "map_only"},
            {"id": "Luxembourg", "options": "map_only"}
        ]}"#,
    )
    .unwrap();

    let ctx = create_test_downloader_in(dir, ManualTransport::new()).await;

    assert_eq!(ctx.transport.started_ids(), vec!["Luxembourg"]);
    assert_eq!(ctx.downloader.status(ctx.idx("Berlin")), Status::OnDisk);
}
