//! Shared test helpers for creating RegionDownloader instances in tests.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::catalog::RegionCatalog;
use crate::config::Config;
use crate::downloader::RegionDownloader;
use crate::error::TransportError;
use crate::fanout::RegionListener;
use crate::storage::FixedSpaceProbe;
use crate::transport::{DownloadTransport, TransportCallbacks, TransportHandle, TransportRequest};
use crate::types::{
    Event, GroupChange, PackageComponent, PackageOptions, Progress, RegionIndex, Status,
};

/// Catalog used by engine tests
///
/// ```text
/// Countries
/// ├── Belgium       ── Belgium_East (100/10), Belgium_West (200/20)
/// ├── Luxembourg    (50)
/// └── Germany
///     ├── Bavaria   ── Bavaria_North (300), Bavaria_South (400)
///     └── Berlin    (70)
/// ```
pub(crate) const TEST_CATALOG: &str = r#"{
    "v": 250101,
    "id": "Countries",
    "g": [
        { "id": "Belgium", "g": [
            { "id": "Belgium_East", "s": 100, "rs": 10 },
            { "id": "Belgium_West", "n": "West Flanders", "s": 200, "rs": 20 }
        ]},
        { "id": "Luxembourg", "s": 50 },
        { "id": "Germany", "g": [
            { "id": "Bavaria", "g": [
                { "id": "Bavaria_North", "s": 300 },
                { "id": "Bavaria_South", "s": 400 }
            ]},
            { "id": "Berlin", "s": 70 }
        ]}
    ]
}"#;

pub(crate) const TEST_VERSION: i64 = 250101;
pub(crate) const SAFETY_MARGIN: u64 = 10;

struct Started {
    handle: TransportHandle,
    request: TransportRequest,
    callbacks: Arc<dyn TransportCallbacks>,
}

#[derive(Default)]
struct ManualState {
    started: Vec<Started>,
    aborted: Vec<TransportHandle>,
    next_handle: u64,
}

/// Transport driven by the test: records starts and aborts, and lets the test
/// fire progress and completion for any started request
#[derive(Default)]
pub(crate) struct ManualTransport {
    state: Mutex<ManualState>,
    complete_inside_start: bool,
}

impl ManualTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport that finishes every request from inside `start`
    pub(crate) fn completing_synchronously() -> Arc<Self> {
        Arc::new(Self {
            complete_inside_start: true,
            ..Self::default()
        })
    }

    /// Region ids in start order
    pub(crate) fn started_ids(&self) -> Vec<String> {
        self.lock()
            .started
            .iter()
            .map(|s| s.request.region_id.clone())
            .collect()
    }

    pub(crate) fn started_request(&self, region_id: &str) -> TransportRequest {
        self.find(region_id).1
    }

    pub(crate) fn aborted(&self) -> Vec<TransportHandle> {
        self.lock().aborted.clone()
    }

    pub(crate) fn handle_of(&self, region_id: &str) -> TransportHandle {
        self.find(region_id).0
    }

    /// Report progress for the latest transfer of `region_id`
    pub(crate) fn progress(&self, region_id: &str, bytes_done: u64, bytes_total: u64) {
        let (_, request, callbacks) = self.find(region_id);
        callbacks.on_progress(request.ticket, Progress::new(bytes_done, bytes_total));
    }

    /// Write the files of the latest transfer of `region_id` and report success
    pub(crate) fn complete(&self, region_id: &str) {
        let (_, request, callbacks) = self.find(region_id);
        write_partials(&request);
        callbacks.on_complete(request.ticket, Ok(()));
    }

    /// Report a failure for the latest transfer of `region_id`
    pub(crate) fn fail(&self, region_id: &str, error: TransportError) {
        let (_, request, callbacks) = self.find(region_id);
        callbacks.on_complete(request.ticket, Err(error));
    }

    fn find(
        &self,
        region_id: &str,
    ) -> (TransportHandle, TransportRequest, Arc<dyn TransportCallbacks>) {
        let state = self.lock();
        let started = state
            .started
            .iter()
            .rev()
            .find(|s| s.request.region_id == region_id)
            .unwrap_or_else(|| panic!("no transfer started for {region_id}"));
        (
            started.handle,
            started.request.clone(),
            Arc::clone(&started.callbacks),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap()
    }
}

impl DownloadTransport for ManualTransport {
    fn start(
        &self,
        request: TransportRequest,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> TransportHandle {
        let handle = {
            let mut state = self.lock();
            state.next_handle += 1;
            let handle = TransportHandle(state.next_handle);
            state.started.push(Started {
                handle,
                request: request.clone(),
                callbacks: Arc::clone(&callbacks),
            });
            handle
        };

        if self.complete_inside_start {
            write_partials(&request);
            callbacks.on_progress(
                request.ticket,
                Progress::new(request.total_bytes(), request.total_bytes()),
            );
            callbacks.on_complete(request.ticket, Ok(()));
        }
        handle
    }

    fn abort(&self, handle: TransportHandle) {
        self.lock().aborted.push(handle);
    }
}

fn write_partials(request: &TransportRequest) {
    for file in &request.files {
        std::fs::create_dir_all(file.destination.parent().unwrap()).unwrap();
        std::fs::write(&file.destination, vec![0u8; file.expected_size as usize]).unwrap();
    }
}

/// Listener that records everything it is told
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Status changes reported for one node, in order
    pub(crate) fn statuses_of(&self, index: RegionIndex) -> Vec<Status> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::StatusChanged { index: i, status } if i == index => Some(status),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn progress_of(&self, index: RegionIndex) -> Vec<Progress> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Progress { index: i, progress } if i == index => Some(progress),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn group_changes(&self) -> Vec<GroupChange> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::GroupChanged(change) => Some(change),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl RegionListener for RecordingListener {
    fn on_status_changed(&self, index: RegionIndex, status: Status) {
        self.events
            .lock()
            .unwrap()
            .push(Event::StatusChanged { index, status });
    }

    fn on_progress(&self, index: RegionIndex, progress: Progress) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Progress { index, progress });
    }

    fn on_group_changed(&self, change: &GroupChange) {
        self.events
            .lock()
            .unwrap()
            .push(Event::GroupChanged(*change));
    }
}

/// A downloader over [`TEST_CATALOG`] with its controllable collaborators
pub(crate) struct TestContext {
    pub(crate) downloader: RegionDownloader,
    pub(crate) transport: Arc<ManualTransport>,
    pub(crate) probe: Arc<FixedSpaceProbe>,
    pub(crate) dir: TempDir,
}

impl TestContext {
    pub(crate) fn idx(&self, id: &str) -> RegionIndex {
        self.downloader
            .catalog()
            .find_by_id(id)
            .unwrap_or_else(|| panic!("{id} not in test catalog"))
    }

    pub(crate) fn data_dir(&self) -> PathBuf {
        data_dir(&self.dir)
    }

    pub(crate) fn package_path(&self, version: i64, id: &str, component: PackageComponent) -> PathBuf {
        self.downloader
            .store
            .package_path(version, id, component)
    }

    /// Subscribe a fresh recording listener
    pub(crate) fn record(&self) -> Arc<RecordingListener> {
        let listener = RecordingListener::new();
        self.downloader.subscribe(listener.clone());
        listener
    }

    /// Shut down and start again over the same data directory
    pub(crate) async fn restart(self) -> TestContext {
        self.downloader.shutdown().await.unwrap();
        create_test_downloader_in(self.dir, ManualTransport::new()).await
    }
}

fn data_dir(dir: &TempDir) -> PathBuf {
    dir.path().join("maps")
}

pub(crate) fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = data_dir(dir);
    config.storage.catalog_path = dir.path().join("countries.txt");
    config.storage.safety_margin_bytes = SAFETY_MARGIN;
    config
}

/// Put a package on disk the way a finished download leaves it
pub(crate) fn write_package(dir: &TempDir, version: i64, id: &str, options: PackageOptions) {
    let version_dir = data_dir(dir).join(version.to_string());
    std::fs::create_dir_all(&version_dir).unwrap();
    for component in options.components() {
        std::fs::write(version_dir.join(component.file_name(id)), b"map data").unwrap();
    }
}

/// Helper to create a test RegionDownloader with plenty of free space.
/// Returns the context, whose tempdir must be kept alive.
pub(crate) async fn create_test_downloader() -> TestContext {
    create_test_downloader_in(TempDir::new().unwrap(), ManualTransport::new()).await
}

/// Helper to create a test RegionDownloader over an existing directory
pub(crate) async fn create_test_downloader_in(
    dir: TempDir,
    transport: Arc<ManualTransport>,
) -> TestContext {
    let probe = Arc::new(FixedSpaceProbe::new(1_000_000));
    let catalog = RegionCatalog::from_json_str(TEST_CATALOG).unwrap();
    let downloader = RegionDownloader::with_catalog(
        test_config(&dir),
        catalog,
        transport.clone(),
        probe.clone(),
    )
    .await
    .unwrap();

    TestContext {
        downloader,
        transport,
        probe,
        dir,
    }
}
