//! Core types for region-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of a node in the region catalog
///
/// Indices are positions in the catalog arena and stay valid for the lifetime of
/// the catalog they were issued by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionIndex(pub u32);

impl RegionIndex {
    /// Create a new RegionIndex
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the inner u32 value
    pub fn get(&self) -> u32 {
        self.0
    }

    pub(crate) fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for RegionIndex {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

impl From<RegionIndex> for u32 {
    fn from(index: RegionIndex) -> Self {
        index.0
    }
}

impl std::fmt::Display for RegionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RegionIndex {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Status of a region
///
/// Leaves carry one of the stored statuses. Groups report a status derived from
/// their leaves, so a group never reports [`Status::Group`] through
/// [`crate::RegionDownloader::status`]; `Group` marks a node whose status cannot be
/// derived because it has no leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Internal node without any leaf below it
    Group,
    /// No package on disk and no pending request
    NotDownloaded,
    /// Waiting in the download queue
    InQueue,
    /// Transport is fetching the package
    Downloading,
    /// Package on disk and matches the catalog version
    OnDisk,
    /// Package on disk but older than the catalog version
    OnDiskOutOfDate,
    /// Last download attempt failed
    DownloadFailed,
    /// Index does not name a catalog node
    Unknown,
}

impl Status {
    /// Whether `action` is a legal request for a leaf in this status
    ///
    /// This table is the only place that decides transition legality.
    pub fn allows(&self, action: Action) -> bool {
        matches!(
            (self, action),
            (Status::NotDownloaded, Action::Download)
                | (Status::OnDiskOutOfDate, Action::Download)
                | (Status::OnDiskOutOfDate, Action::Update)
                | (Status::OnDisk, Action::Delete)
                | (Status::OnDiskOutOfDate, Action::Delete)
                | (Status::InQueue, Action::Cancel)
                | (Status::Downloading, Action::Cancel)
                | (Status::DownloadFailed, Action::Retry)
                | (Status::DownloadFailed, Action::Cancel)
        )
    }

    /// True for statuses with pending or running transport work
    pub fn is_active(&self) -> bool {
        matches!(self, Status::InQueue | Status::Downloading)
    }

    /// True when a package is present on disk
    pub fn is_on_disk(&self) -> bool {
        matches!(self, Status::OnDisk | Status::OnDiskOutOfDate)
    }

    /// The active-tree group a leaf in this status belongs to, if any
    pub fn active_group(&self) -> Option<ActiveGroup> {
        match self {
            Status::InQueue | Status::Downloading | Status::DownloadFailed => {
                Some(ActiveGroup::NewDownloads)
            }
            Status::OnDiskOutOfDate => Some(ActiveGroup::OutOfDate),
            Status::OnDisk => Some(ActiveGroup::UpToDate),
            Status::Group | Status::NotDownloaded | Status::Unknown => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Group => "group",
            Status::NotDownloaded => "not downloaded",
            Status::InQueue => "in queue",
            Status::Downloading => "downloading",
            Status::OnDisk => "on disk",
            Status::OnDiskOutOfDate => "on disk (out of date)",
            Status::DownloadFailed => "download failed",
            Status::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A user request against a region
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Fetch a package that is absent or stale
    Download,
    /// Replace a stale package with the current version
    Update,
    /// Remove the package from disk
    Delete,
    /// Drop a queued, running or failed request
    Cancel,
    /// Re-request after a failure
    Retry,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Download => "download",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Cancel => "cancel",
            Action::Retry => "retry",
        };
        f.write_str(name)
    }
}

/// Which files of a region package to fetch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageOptions {
    /// Map data only
    #[default]
    MapOnly,
    /// Map data plus the routing index
    MapWithRouting,
}

impl PackageOptions {
    /// Components fetched for these options, map first
    pub fn components(&self) -> &'static [PackageComponent] {
        match self {
            PackageOptions::MapOnly => &[PackageComponent::Map],
            PackageOptions::MapWithRouting => &[PackageComponent::Map, PackageComponent::Routing],
        }
    }
}

/// One file of a region package
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageComponent {
    /// Map data file
    Map,
    /// Routing index file
    Routing,
}

impl PackageComponent {
    /// File extension, including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            PackageComponent::Map => ".mwm",
            PackageComponent::Routing => ".mwm.routing",
        }
    }

    /// File name of this component for a region id
    pub fn file_name(&self, region_id: &str) -> String {
        format!("{region_id}{}", self.extension())
    }
}

/// Remote byte sizes of a region's package components
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSizes {
    /// Size of the map file in bytes
    pub map: u64,
    /// Size of the routing file in bytes (0 when not published)
    pub routing: u64,
}

impl PackageSizes {
    /// Size of a single component
    pub fn component(&self, component: PackageComponent) -> u64 {
        match component {
            PackageComponent::Map => self.map,
            PackageComponent::Routing => self.routing,
        }
    }

    /// Total bytes fetched for the given options
    pub fn total(&self, options: PackageOptions) -> u64 {
        options
            .components()
            .iter()
            .fold(0u64, |acc, c| acc.saturating_add(self.component(*c)))
    }
}

/// Identity of one enqueued download request
///
/// Issued by the queue when a request is enqueued and carried by every transport
/// callback for it. Generations are never reused, so a handle from a cancelled or
/// finished request can be recognised as stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueHandle {
    /// Leaf the request is for
    pub index: RegionIndex,
    /// Monotonic request generation
    pub generation: u64,
}

impl std::fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// A pending request for transport work on one leaf
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Leaf being fetched
    pub index: RegionIndex,
    /// Files to fetch
    pub options: PackageOptions,
    /// When the request entered the queue
    pub enqueued_at: DateTime<Utc>,
    /// Whether a stale package is being replaced
    #[serde(default)]
    pub is_update: bool,
}

impl DownloadRequest {
    /// Create a request stamped with the current time
    pub fn new(index: RegionIndex, options: PackageOptions, is_update: bool) -> Self {
        Self {
            index,
            options,
            enqueued_at: Utc::now(),
            is_update,
        }
    }
}

/// Byte progress of a download
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes received so far
    pub bytes_done: u64,
    /// Bytes expected in total
    pub bytes_total: u64,
}

impl Progress {
    /// Create a progress value
    pub fn new(bytes_done: u64, bytes_total: u64) -> Self {
        Self {
            bytes_done,
            bytes_total,
        }
    }

    /// Completion percentage (0.0 to 100.0); 0.0 when the total is unknown
    pub fn percent(&self) -> f32 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_done.min(self.bytes_total) as f64 / self.bytes_total as f64 * 100.0) as f32
    }

    pub(crate) fn merge(self, other: Progress) -> Progress {
        Progress {
            bytes_done: self.bytes_done.saturating_add(other.bytes_done),
            bytes_total: self.bytes_total.saturating_add(other.bytes_total),
        }
    }
}

/// Groups of the "active" region list shown to users who already fetched something
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveGroup {
    /// Queued, downloading or failed
    NewDownloads,
    /// On disk, needs an update
    OutOfDate,
    /// On disk and current
    UpToDate,
}

/// Position of a leaf in an active group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPosition {
    /// The group
    pub group: ActiveGroup,
    /// Zero-based rank within the group, ordered by region index
    pub position: usize,
}

/// A leaf moved into, out of, or between active groups
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChange {
    /// The leaf that moved
    pub index: RegionIndex,
    /// Where it was before the change
    pub old: Option<GroupPosition>,
    /// Where it is after the change
    pub new: Option<GroupPosition>,
}

/// Attributes of a catalog node combined with its current state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionInfo {
    /// Node index
    pub index: RegionIndex,
    /// Catalog id (file name stem for leaves)
    pub id: String,
    /// Display name
    pub name: String,
    /// Current (derived for groups) status
    pub status: Status,
    /// Remote bytes of the whole subtree, per component
    pub remote_sizes: PackageSizes,
    /// Bytes currently on disk for the subtree
    pub local_size: u64,
    /// Number of leaves in the subtree
    pub leaf_count: usize,
    /// Number of those leaves with a package on disk
    pub leaves_on_disk: usize,
    /// Progress of active downloads in the subtree
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    /// Last transport error (leaves in [`Status::DownloadFailed`] only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event emitted by the download engine
///
/// Events are delivered synchronously to [`crate::RegionListener`]s and broadcast
/// to async subscribers of [`crate::RegionDownloader::subscribe_events`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Status of a node changed (leaves and their non-root ancestors)
    StatusChanged {
        /// Node whose status changed
        index: RegionIndex,
        /// Status after the change
        status: Status,
    },

    /// Download progress (leaves and aggregated for their non-root ancestors)
    Progress {
        /// Node the progress belongs to
        index: RegionIndex,
        /// Bytes done and total
        progress: Progress,
    },

    /// A leaf's membership in the active groups changed
    GroupChanged(GroupChange),

    /// The engine is shutting down
    Shutdown,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const ALL_STATUSES: [Status; 8] = [
        Status::Group,
        Status::NotDownloaded,
        Status::InQueue,
        Status::Downloading,
        Status::OnDisk,
        Status::OnDiskOutOfDate,
        Status::DownloadFailed,
        Status::Unknown,
    ];

    #[test]
    fn region_index_parses_and_displays() {
        let index = RegionIndex::from_str("42").unwrap();
        assert_eq!(index, RegionIndex(42));
        assert_eq!(index.to_string(), "42");
        assert!(RegionIndex::from_str("-1").is_err());
    }

    #[test]
    fn delete_is_only_allowed_for_packages_on_disk() {
        for status in ALL_STATUSES {
            assert_eq!(
                status.allows(Action::Delete),
                status.is_on_disk(),
                "delete legality for {status:?}"
            );
        }
    }

    #[test]
    fn cancel_is_allowed_for_active_and_failed_leaves() {
        let allowed: Vec<Status> = ALL_STATUSES
            .into_iter()
            .filter(|s| s.allows(Action::Cancel))
            .collect();
        assert_eq!(
            allowed,
            vec![Status::InQueue, Status::Downloading, Status::DownloadFailed]
        );
    }

    #[test]
    fn retry_is_only_allowed_after_failure() {
        for status in ALL_STATUSES {
            assert_eq!(
                status.allows(Action::Retry),
                status == Status::DownloadFailed,
                "retry legality for {status:?}"
            );
        }
    }

    #[test]
    fn download_is_allowed_from_absent_and_stale() {
        let allowed: Vec<Status> = ALL_STATUSES
            .into_iter()
            .filter(|s| s.allows(Action::Download))
            .collect();
        assert_eq!(allowed, vec![Status::NotDownloaded, Status::OnDiskOutOfDate]);
    }

    #[test]
    fn group_and_unknown_allow_nothing() {
        for action in [
            Action::Download,
            Action::Update,
            Action::Delete,
            Action::Cancel,
            Action::Retry,
        ] {
            assert!(!Status::Group.allows(action));
            assert!(!Status::Unknown.allows(action));
        }
    }

    #[test]
    fn active_group_projection() {
        assert_eq!(
            Status::Downloading.active_group(),
            Some(ActiveGroup::NewDownloads)
        );
        assert_eq!(
            Status::DownloadFailed.active_group(),
            Some(ActiveGroup::NewDownloads)
        );
        assert_eq!(
            Status::OnDiskOutOfDate.active_group(),
            Some(ActiveGroup::OutOfDate)
        );
        assert_eq!(Status::OnDisk.active_group(), Some(ActiveGroup::UpToDate));
        assert_eq!(Status::NotDownloaded.active_group(), None);
    }

    #[test]
    fn package_sizes_total_follows_options() {
        let sizes = PackageSizes {
            map: 1_000,
            routing: 250,
        };
        assert_eq!(sizes.total(PackageOptions::MapOnly), 1_000);
        assert_eq!(sizes.total(PackageOptions::MapWithRouting), 1_250);
    }

    #[test]
    fn component_file_names() {
        assert_eq!(PackageComponent::Map.file_name("Belgium"), "Belgium.mwm");
        assert_eq!(
            PackageComponent::Routing.file_name("Belgium"),
            "Belgium.mwm.routing"
        );
    }

    #[test]
    fn progress_percent_handles_zero_total() {
        assert_eq!(Progress::new(10, 0).percent(), 0.0);
        assert_eq!(Progress::new(50, 200).percent(), 25.0);
        assert_eq!(Progress::new(300, 200).percent(), 100.0);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::StatusChanged {
            index: RegionIndex(3),
            status: Status::OnDiskOutOfDate,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["index"], 3);
        assert_eq!(json["status"], "on_disk_out_of_date");
    }
}
