//! Region status engine split into focused submodules.
//!
//! The `RegionDownloader` struct and its methods are organized by domain:
//! - [`status`] - Status derivation and read-only queries
//! - [`control`] - User requests (download, update, delete, cancel, retry)
//! - [`callbacks`] - Transport progress and completion reports
//! - [`lifecycle`] - Startup scan, queue restore and shutdown
//! - [`queue`] - Sequential download queue
//! - [`groups`] - Active-group membership
//!
//! Every mutation is one transaction: validate under the read lock, do any file
//! work, mutate under the write lock while collecting events and transport
//! effects, persist the queue, deliver the events, and only then run the
//! effects. The serialization mutex is held from validation through delivery.
//! Effects run even when a listener panics; the panic resumes afterwards.

mod callbacks;
mod control;
mod groups;
mod lifecycle;
pub(crate) mod queue;
mod status;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use status::derive_group_status;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::catalog::RegionCatalog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fanout::EventFanout;
use crate::storage::{LocalPackage, PackageStore, QueueEntry, StorageGuard};
use crate::transport::{DownloadTransport, TransportFile, TransportHandle, TransportRequest};
use crate::types::{
    DownloadRequest, Event, PackageComponent, PackageOptions, QueueHandle, RegionIndex, Status,
};

use groups::ActiveGroups;
use queue::DownloadQueueCoordinator;

/// Mutable record of one catalog node
#[derive(Clone, Debug)]
pub(crate) struct LeafState {
    pub(crate) status: Status,
    /// Package found on disk, possibly older than the current data version
    pub(crate) local: Option<LocalPackage>,
    /// Message of the last transport failure
    pub(crate) error: Option<String>,
    /// Options and update flag of the last request, reused by retry
    pub(crate) last_request: Option<(PackageOptions, bool)>,
    /// Data version of the running transfer
    pub(crate) fetch_version: Option<i64>,
}

impl LeafState {
    fn new(status: Status) -> Self {
        Self {
            status,
            local: None,
            error: None,
            last_request: None,
            fetch_version: None,
        }
    }
}

/// Everything guarded by the engine's state lock
#[derive(Debug)]
pub(crate) struct EngineState {
    /// One entry per catalog node; group entries stay at [`Status::Group`]
    pub(crate) nodes: Vec<LeafState>,
    pub(crate) queue: DownloadQueueCoordinator,
    pub(crate) groups: ActiveGroups,
    /// Data version packages must match to count as current
    pub(crate) version: i64,
    /// Cleared by shutdown; no new requests or transfers afterwards
    pub(crate) accepting: bool,
}

impl EngineState {
    fn new(catalog: &RegionCatalog) -> Self {
        let nodes = catalog
            .iter()
            .map(|node| {
                LeafState::new(if node.is_leaf() {
                    Status::NotDownloaded
                } else {
                    Status::Group
                })
            })
            .collect();
        Self {
            nodes,
            queue: DownloadQueueCoordinator::new(),
            groups: ActiveGroups::default(),
            version: catalog.version(),
            accepting: true,
        }
    }

    pub(crate) fn node(&self, index: RegionIndex) -> Option<&LeafState> {
        self.nodes.get(index.as_usize())
    }

    /// Status a package of this version warrants
    pub(crate) fn on_disk_status(&self, package: &LocalPackage) -> Status {
        if package.version < self.version {
            Status::OnDiskOutOfDate
        } else {
            Status::OnDisk
        }
    }
}

/// Transport work to run once the transaction has committed
#[derive(Debug)]
pub(crate) enum Effect {
    Start(TransportRequest),
    Abort {
        transport: Option<TransportHandle>,
        region_id: String,
        version: i64,
        generation: u64,
    },
}

/// Mutation context handed to a transaction body
pub(crate) struct Txn<'a> {
    pub(crate) catalog: &'a RegionCatalog,
    pub(crate) store: &'a PackageStore,
    pub(crate) state: &'a mut EngineState,
    events: Vec<Event>,
    effects: Vec<Effect>,
    queue_changed: bool,
}

impl Txn<'_> {
    pub(crate) fn leaf_mut(&mut self, index: RegionIndex) -> &mut LeafState {
        &mut self.state.nodes[index.as_usize()]
    }

    pub(crate) fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub(crate) fn push_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub(crate) fn mark_queue_changed(&mut self) {
        self.queue_changed = true;
    }

    /// Set a leaf's status and queue the resulting notifications
    pub(crate) fn set_status(&mut self, index: RegionIndex, status: Status) {
        let leaf = self.leaf_mut(index);
        if leaf.status == status {
            return;
        }
        leaf.status = status;
        if status != Status::DownloadFailed {
            leaf.error = None;
        }

        self.events.push(Event::StatusChanged { index, status });
        let root = self.catalog.root();
        for ancestor in self.catalog.ancestors(index).filter(|a| *a != root) {
            let derived = status::node_status(self.catalog, self.state, ancestor);
            self.events.push(Event::StatusChanged {
                index: ancestor,
                status: derived,
            });
        }

        if let Some(change) = self.state.groups.assign(index, status.active_group()) {
            self.events.push(Event::GroupChanged(change));
        }
    }

    /// Put a leaf in the queue and start it if the queue was idle
    pub(crate) fn enqueue(&mut self, index: RegionIndex, options: PackageOptions, is_update: bool) {
        let handle = self
            .state
            .queue
            .enqueue(DownloadRequest::new(index, options, is_update));
        tracing::debug!(index = index.0, ticket = %handle, is_update, "region enqueued");

        let leaf = self.leaf_mut(index);
        leaf.last_request = Some((options, is_update));
        leaf.error = None;
        self.set_status(index, Status::InQueue);
        self.queue_changed = true;
        self.advance();
    }

    /// Promote the head of the queue when nothing is running
    pub(crate) fn advance(&mut self) {
        if !self.state.accepting {
            return;
        }
        let Some((ticket, request)) = self.state.queue.promote_next() else {
            return;
        };

        let version = self.state.version;
        self.leaf_mut(request.index).fetch_version = Some(version);
        self.set_status(request.index, Status::Downloading);

        match self.transport_request(ticket, &request, version) {
            Some(transport_request) => self.effects.push(Effect::Start(transport_request)),
            None => {
                tracing::error!(ticket = %ticket, "queued region vanished from the catalog");
            }
        }
    }

    fn transport_request(
        &self,
        ticket: QueueHandle,
        request: &DownloadRequest,
        version: i64,
    ) -> Option<TransportRequest> {
        let node = self.catalog.get(request.index)?;
        let files = request
            .options
            .components()
            .iter()
            .map(|component| TransportFile {
                component: *component,
                remote_path: format!("{version}/{}", component.file_name(&node.id)),
                destination: self.store.partial_path(
                    version,
                    &node.id,
                    *component,
                    ticket.generation,
                ),
                expected_size: node.sizes.component(*component),
                sha256: match component {
                    PackageComponent::Map => node.sha256.clone(),
                    PackageComponent::Routing => None,
                },
            })
            .collect();
        Some(TransportRequest {
            ticket,
            region_id: node.id.clone(),
            version,
            files,
        })
    }
}

/// Main engine instance (cloneable - all fields are Arc-wrapped)
///
/// Holds the status of every catalog region, the download queue and the
/// listener registry. Queries take a read lock only; requests are synchronous
/// and return as soon as the state change is committed, while transfers run on
/// the transport.
#[derive(Clone)]
pub struct RegionDownloader {
    /// Region hierarchy (read-only after construction)
    pub(crate) catalog: Arc<RegionCatalog>,
    /// Per-node status, queue and active groups
    pub(crate) state: Arc<RwLock<EngineState>>,
    /// Held for the whole of each transaction, so events keep transition order
    pub(crate) serial: Arc<Mutex<()>>,
    /// Listener registry and broadcast channel
    pub(crate) fanout: Arc<EventFanout>,
    /// Free-space checks for new downloads
    pub(crate) guard: StorageGuard,
    /// On-disk package layout
    pub(crate) store: PackageStore,
    /// Fetches packages
    pub(crate) transport: Arc<dyn DownloadTransport>,
    /// Configuration (wrapped in Arc for sharing)
    pub(crate) config: Arc<Config>,
}

impl std::fmt::Debug for RegionDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionDownloader")
            .field("regions", &self.catalog.len())
            .field("data_dir", &self.store.data_dir())
            .field("fanout", &self.fanout)
            .finish()
    }
}

impl RegionDownloader {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the serialization lock for a transaction
    ///
    /// # Panics
    ///
    /// Panics when called from inside a listener callback: the pass in progress
    /// holds the lock, so waiting would deadlock.
    pub(crate) fn lock_serial(&self) -> MutexGuard<'_, ()> {
        if EventFanout::is_delivering() {
            panic!(
                "region state mutated from inside a listener callback; \
                 listeners must only query the downloader"
            );
        }
        self.serial.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialization lock for a user request; fails once shutdown has begun
    pub(crate) fn begin_request(&self) -> Result<MutexGuard<'_, ()>> {
        let serial = self.lock_serial();
        if !self.read().accepting {
            return Err(Error::ShuttingDown);
        }
        Ok(serial)
    }

    /// Apply `body` under the write lock, then deliver, persist and run effects
    pub(crate) fn commit<R>(
        &self,
        serial: MutexGuard<'_, ()>,
        body: impl FnOnce(&mut Txn<'_>) -> R,
    ) -> R {
        let (result, events, effects, queue) = {
            let mut state = self.write();
            let mut txn = Txn {
                catalog: &self.catalog,
                store: &self.store,
                state: &mut *state,
                events: Vec::new(),
                effects: Vec::new(),
                queue_changed: false,
            };
            let result = body(&mut txn);
            let Txn {
                events,
                effects,
                queue_changed,
                ..
            } = txn;

            let queue = (queue_changed && state.accepting && self.config.storage.persist_queue)
                .then(|| queue_entries(&self.catalog, &state.queue));
            (result, events, effects, queue)
        };

        if let Some(entries) = queue {
            if let Err(e) = self.store.save_queue(&entries) {
                tracing::warn!(error = %e, "failed to persist download queue");
            }
        }
        self.deliver_then_run(serial, events, effects);
        result
    }

    /// Deliver committed events, release the lock and run the effects
    ///
    /// The state is already committed, so a panicking listener must not strand
    /// the transport effects: the panic is resumed once they have run.
    fn deliver_then_run(
        &self,
        serial: MutexGuard<'_, ()>,
        events: Vec<Event>,
        effects: Vec<Effect>,
    ) {
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| self.fanout.deliver_all(events)));
        drop(serial);

        self.run_effects(effects);
        if let Err(payload) = delivered {
            panic::resume_unwind(payload);
        }
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Start(request) => {
                    let ticket = request.ticket;
                    tracing::info!(
                        region = %request.region_id,
                        ticket = %ticket,
                        version = request.version,
                        bytes = request.total_bytes(),
                        "starting region download"
                    );
                    let handle = self.transport.start(request, Arc::new(self.clone()));
                    // The request may have been cancelled or finished while start ran
                    if !self.write().queue.attach_transport(ticket, handle) {
                        tracing::debug!(ticket = %ticket, "request gone before transfer attached, aborting");
                        self.transport.abort(handle);
                    }
                }
                Effect::Abort {
                    transport,
                    region_id,
                    version,
                    generation,
                } => {
                    if let Some(handle) = transport {
                        self.transport.abort(handle);
                    }
                    self.store.discard_partials(version, &region_id, generation);
                }
            }
        }
    }
}

/// Queue contents in the persisted form, active request first
pub(crate) fn queue_entries(
    catalog: &RegionCatalog,
    queue: &DownloadQueueCoordinator,
) -> Vec<QueueEntry> {
    queue
        .snapshot()
        .into_iter()
        .filter_map(|request| {
            catalog.get(request.index).map(|node| QueueEntry {
                id: node.id.clone(),
                options: request.options,
                is_update: request.is_update,
            })
        })
        .collect()
}
