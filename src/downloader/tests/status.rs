use super::*;

async fn installed_context() -> TestContext {
    let dir = tempfile::TempDir::new().unwrap();
    write_package(&dir, TEST_VERSION, "Luxembourg", PackageOptions::MapOnly);
    write_package(&dir, TEST_VERSION, "Bavaria_North", PackageOptions::MapWithRouting);
    write_package(&dir, 1, "Berlin", PackageOptions::MapOnly);
    create_test_downloader_in(dir, ManualTransport::new()).await
}

#[tokio::test]
async fn test_initial_status_comes_from_disk() {
    let ctx = installed_context().await;

    assert_eq!(ctx.downloader.status(ctx.idx("Luxembourg")), Status::OnDisk);
    assert_eq!(
        ctx.downloader.status(ctx.idx("Berlin")),
        Status::OnDiskOutOfDate
    );
    assert_eq!(
        ctx.downloader.status(ctx.idx("Belgium_East")),
        Status::NotDownloaded
    );
    assert_eq!(ctx.downloader.outdated_regions(), vec![ctx.idx("Berlin")]);
}

#[tokio::test]
async fn test_group_status_is_derived() {
    let ctx = installed_context().await;

    // North on disk, South absent
    assert_eq!(
        ctx.downloader.status(ctx.idx("Bavaria")),
        Status::NotDownloaded
    );
    // Berlin is stale
    assert_eq!(
        ctx.downloader.status(ctx.idx("Germany")),
        Status::OnDiskOutOfDate
    );
    assert_eq!(
        ctx.downloader.status(ctx.idx("Belgium")),
        Status::NotDownloaded
    );
}

#[tokio::test]
async fn test_region_info_summarises_subtree() {
    let ctx = installed_context().await;

    let germany = ctx.downloader.region_info(ctx.idx("Germany")).unwrap();
    assert_eq!(germany.leaf_count, 3);
    assert_eq!(germany.leaves_on_disk, 2);
    assert_eq!(germany.remote_sizes.map, 770);
    assert_eq!(germany.local_size, 3 * b"map data".len() as u64);
    assert!(germany.error.is_none());

    let west = ctx.downloader.region_info(ctx.idx("Belgium_West")).unwrap();
    assert_eq!(west.name, "West Flanders");
    assert_eq!(west.remote_sizes.total(PackageOptions::MapWithRouting), 220);
    assert_eq!(west.leaf_count, 1);
}

#[tokio::test]
async fn test_children_in_groups_splits_by_activity() {
    let ctx = installed_context().await;
    let root = ctx.downloader.catalog().root();

    let (downloaded, available) = ctx.downloader.children_in_groups(root);
    assert_eq!(downloaded, vec![ctx.idx("Luxembourg"), ctx.idx("Germany")]);
    assert_eq!(available, vec![ctx.idx("Belgium")]);

    ctx.downloader
        .request_download(ctx.idx("Belgium_East"), PackageOptions::MapOnly)
        .unwrap();
    let (downloaded, available) = ctx.downloader.children_in_groups(root);
    assert_eq!(downloaded.len(), 3);
    assert!(available.is_empty());
}

#[tokio::test]
async fn test_active_groups_project_leaf_statuses() {
    let ctx = installed_context().await;

    assert_eq!(
        ctx.downloader.group_members(ActiveGroup::UpToDate),
        vec![ctx.idx("Luxembourg"), ctx.idx("Bavaria_North")]
    );
    assert_eq!(
        ctx.downloader.group_members(ActiveGroup::OutOfDate),
        vec![ctx.idx("Berlin")]
    );
    assert_eq!(
        ctx.downloader.active_group_position(ctx.idx("Bavaria_North")),
        Some(GroupPosition {
            group: ActiveGroup::UpToDate,
            position: 1
        })
    );
    assert!(
        ctx.downloader
            .active_group_position(ctx.idx("Belgium_East"))
            .is_none()
    );
}

#[tokio::test]
async fn test_overall_progress_counts_each_leaf_once() {
    let ctx = create_test_downloader().await;
    ctx.downloader
        .download_node(ctx.idx("Germany"), PackageOptions::MapOnly)
        .unwrap();
    ctx.transport.progress("Bavaria_North", 100, 300);

    let germany = ctx.idx("Germany");
    let bavaria = ctx.idx("Bavaria");
    assert_eq!(
        ctx.downloader.overall_progress(&[germany, bavaria]),
        Progress::new(100, 770)
    );
    assert_eq!(
        ctx.downloader.overall_progress(&[ctx.idx("Berlin")]),
        Progress::new(0, 70)
    );
    assert_eq!(
        ctx.downloader.overall_progress(&[ctx.idx("Belgium")]),
        Progress::default()
    );
    assert_eq!(
        ctx.downloader.region_info(bavaria).unwrap().progress,
        Some(Progress::new(100, 700))
    );
}

#[tokio::test]
async fn test_download_in_progress_tracks_queue() {
    let ctx = create_test_downloader().await;
    assert!(!ctx.downloader.is_download_in_progress());

    ctx.downloader
        .request_download(ctx.idx("Berlin"), PackageOptions::MapOnly)
        .unwrap();
    assert!(ctx.downloader.is_download_in_progress());

    ctx.transport.complete("Berlin");
    assert!(!ctx.downloader.is_download_in_progress());
}

#[tokio::test]
async fn test_children_lists_direct_children() {
    let ctx = create_test_downloader().await;
    assert_eq!(
        ctx.downloader.children(ctx.idx("Germany")),
        vec![ctx.idx("Bavaria"), ctx.idx("Berlin")]
    );
    assert!(ctx.downloader.children(ctx.idx("Berlin")).is_empty());
}
