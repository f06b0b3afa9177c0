//! Status derivation and read-only queries
//!
//! Queries take the state read lock only. They are safe to call from inside a
//! listener callback.

use tokio::sync::broadcast;

use crate::catalog::RegionCatalog;
use crate::fanout::RegionListener;
use crate::listeners::Slot;
use crate::types::{
    ActiveGroup, DownloadRequest, Event, GroupPosition, Progress, RegionIndex, RegionInfo, Status,
};

use super::{EngineState, RegionDownloader};

/// Status of a group from the statuses of its leaves
///
/// Priority: any `Downloading`, then any `InQueue`, then any `DownloadFailed`,
/// then any `OnDiskOutOfDate`; all `OnDisk` gives `OnDisk`; anything else
/// (including no leaves at all) is `NotDownloaded`. The result does not depend
/// on iteration order.
pub fn derive_group_status(leaves: impl IntoIterator<Item = Status>) -> Status {
    let mut any = false;
    let mut downloading = false;
    let mut in_queue = false;
    let mut failed = false;
    let mut out_of_date = false;
    let mut all_on_disk = true;

    for status in leaves {
        any = true;
        match status {
            Status::Downloading => downloading = true,
            Status::InQueue => in_queue = true,
            Status::DownloadFailed => failed = true,
            Status::OnDiskOutOfDate => out_of_date = true,
            _ => {}
        }
        if status != Status::OnDisk {
            all_on_disk = false;
        }
    }

    if downloading {
        Status::Downloading
    } else if in_queue {
        Status::InQueue
    } else if failed {
        Status::DownloadFailed
    } else if out_of_date {
        Status::OnDiskOutOfDate
    } else if any && all_on_disk {
        Status::OnDisk
    } else {
        Status::NotDownloaded
    }
}

pub(crate) fn node_status(catalog: &RegionCatalog, state: &EngineState, index: RegionIndex) -> Status {
    let Some(node) = catalog.get(index) else {
        return Status::Unknown;
    };
    if node.is_leaf() {
        return state.node(index).map_or(Status::Unknown, |leaf| leaf.status);
    }

    let mut leaves = catalog.leaves(index).peekable();
    if leaves.peek().is_none() {
        return Status::Group;
    }
    derive_group_status(leaves.filter_map(|leaf| state.node(leaf).map(|s| s.status)))
}

/// Progress of one leaf; queued leaves count as zero of their full size
pub(crate) fn leaf_progress(
    catalog: &RegionCatalog,
    state: &EngineState,
    request: &DownloadRequest,
) -> Progress {
    let total = catalog
        .get(request.index)
        .map_or(0, |node| node.sizes.total(request.options));
    match state.queue.active() {
        Some(active) if active.request.index == request.index => {
            if active.progress.bytes_total > 0 {
                active.progress
            } else {
                Progress::new(active.progress.bytes_done, total)
            }
        }
        _ => Progress::new(0, total),
    }
}

/// Aggregated progress of every queued or running leaf in a subtree
pub(crate) fn subtree_progress(
    catalog: &RegionCatalog,
    state: &EngineState,
    index: RegionIndex,
) -> Option<Progress> {
    state
        .queue
        .snapshot()
        .iter()
        .filter(|request| catalog.is_in_subtree(index, request.index))
        .map(|request| leaf_progress(catalog, state, request))
        .reduce(Progress::merge)
}

impl RegionDownloader {
    /// Current status of a node; groups report the status derived from their leaves
    ///
    /// Never fails: an index outside the catalog gives [`Status::Unknown`].
    pub fn status(&self, index: RegionIndex) -> Status {
        node_status(&self.catalog, &self.read(), index)
    }

    /// Attributes and state of a node, `None` for an unknown index
    pub fn region_info(&self, index: RegionIndex) -> Option<RegionInfo> {
        let node = self.catalog.get(index)?;
        let state = self.read();

        let mut local_size: u64 = 0;
        let mut leaf_count = 0;
        let mut leaves_on_disk = 0;
        for leaf in self.catalog.leaves(index) {
            leaf_count += 1;
            if let Some(package) = state.node(leaf).and_then(|s| s.local) {
                leaves_on_disk += 1;
                local_size = local_size.saturating_add(package.size_bytes);
            }
        }

        let error = if node.is_leaf() {
            state.node(index).and_then(|s| s.error.clone())
        } else {
            None
        };

        Some(RegionInfo {
            index,
            id: node.id.clone(),
            name: node.name.clone(),
            status: node_status(&self.catalog, &state, index),
            remote_sizes: node.sizes,
            local_size,
            leaf_count,
            leaves_on_disk,
            progress: subtree_progress(&self.catalog, &state, index),
            error,
        })
    }

    /// Region catalog this engine was built from
    pub fn catalog(&self) -> &RegionCatalog {
        &self.catalog
    }

    /// Data version packages must have to count as current
    pub fn data_version(&self) -> i64 {
        self.read().version
    }

    /// Direct children of a node, in catalog order
    pub fn children(&self, index: RegionIndex) -> Vec<RegionIndex> {
        self.catalog.children(index).to_vec()
    }

    /// Split the children of a node into (downloaded, available)
    ///
    /// A child counts as downloaded when anything below it is on disk, queued,
    /// running or failed.
    pub fn children_in_groups(&self, index: RegionIndex) -> (Vec<RegionIndex>, Vec<RegionIndex>) {
        let state = self.read();
        self.catalog
            .children(index)
            .iter()
            .copied()
            .partition(|child| node_status(&self.catalog, &state, *child) != Status::NotDownloaded)
    }

    /// Leaves whose package is older than the current data version
    pub fn outdated_regions(&self) -> Vec<RegionIndex> {
        let state = self.read();
        self.catalog
            .iter()
            .filter(|node| node.is_leaf())
            .map(|node| node.index)
            .filter(|index| {
                state
                    .node(*index)
                    .is_some_and(|s| s.status == Status::OnDiskOutOfDate)
            })
            .collect()
    }

    /// Combined progress of the queued and running leaves under `indices`
    ///
    /// Overlapping subtrees are only counted once.
    pub fn overall_progress(&self, indices: &[RegionIndex]) -> Progress {
        let state = self.read();
        state
            .queue
            .snapshot()
            .iter()
            .filter(|request| {
                indices
                    .iter()
                    .any(|root| self.catalog.is_in_subtree(*root, request.index))
            })
            .map(|request| leaf_progress(&self.catalog, &state, request))
            .fold(Progress::default(), Progress::merge)
    }

    /// Whether any request is queued or running
    pub fn is_download_in_progress(&self) -> bool {
        !self.read().queue.is_empty()
    }

    /// Queued and running requests, running first
    pub fn queued_requests(&self) -> Vec<DownloadRequest> {
        self.read().queue.snapshot()
    }

    /// Where a leaf is listed in the active groups
    pub fn active_group_position(&self, index: RegionIndex) -> Option<GroupPosition> {
        self.read().groups.position(index)
    }

    /// Members of an active group in index order
    pub fn group_members(&self, group: ActiveGroup) -> Vec<RegionIndex> {
        self.read().groups.list(group)
    }

    /// Register a synchronous listener
    pub fn subscribe(&self, listener: std::sync::Arc<dyn RegionListener>) -> Slot {
        self.fanout.subscribe(listener)
    }

    /// Remove a listener; safe from inside its own callback
    pub fn unsubscribe(&self, slot: Slot) -> bool {
        self.fanout.unsubscribe(slot)
    }

    /// Receiver of every event for async consumers
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.fanout.subscribe_events()
    }
}
