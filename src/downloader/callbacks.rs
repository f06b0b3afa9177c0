//! Transport reports
//!
//! Progress and completion enter through the same transaction path as user
//! requests. Reports carrying a handle that is no longer active (cancelled,
//! already finished, or from before a shutdown) are dropped.

use crate::error::TransportError;
use crate::storage::LocalPackage;
use crate::transport::TransportCallbacks;
use crate::types::{Event, Progress, QueueHandle, Status};

use super::{RegionDownloader, status};

impl TransportCallbacks for RegionDownloader {
    fn on_progress(&self, ticket: QueueHandle, progress: Progress) {
        let serial = self.lock_serial();
        self.commit(serial, |txn| {
            if !txn.state.queue.on_transport_progress(ticket, progress) {
                tracing::trace!(ticket = %ticket, "dropping stale progress");
                return;
            }

            let index = ticket.index;
            if let Some(request) = txn.state.queue.active().map(|a| a.request.clone()) {
                let leaf = status::leaf_progress(txn.catalog, txn.state, &request);
                txn.emit(Event::Progress {
                    index,
                    progress: leaf,
                });
            }

            let root = txn.catalog.root();
            let ancestors: Vec<_> = txn
                .catalog
                .ancestors(index)
                .filter(|a| *a != root)
                .collect();
            for ancestor in ancestors {
                if let Some(progress) = status::subtree_progress(txn.catalog, txn.state, ancestor)
                {
                    txn.emit(Event::Progress {
                        index: ancestor,
                        progress,
                    });
                }
            }
        });
    }

    fn on_complete(&self, ticket: QueueHandle, result: Result<(), TransportError>) {
        let serial = self.lock_serial();

        let (region_id, version, request, previous) = {
            let state = self.read();
            let Some(active) = state.queue.active().filter(|a| a.handle == ticket) else {
                tracing::debug!(ticket = %ticket, "dropping stale completion");
                return;
            };
            let Some(node) = self.catalog.get(ticket.index) else {
                return;
            };
            let leaf = state.node(ticket.index);
            (
                node.id.clone(),
                leaf.and_then(|s| s.fetch_version).unwrap_or(state.version),
                active.request.clone(),
                leaf.and_then(|s| s.local),
            )
        };

        // File work happens before the state changes, still under the serial lock
        let outcome: Result<LocalPackage, String> = match result {
            Ok(()) => match self
                .store
                .promote(version, &region_id, request.options, ticket.generation)
            {
                Ok(package) => {
                    if let Some(old) = previous.filter(|old| old.version != version) {
                        if let Err(e) = self.store.delete_package(&region_id, &old) {
                            tracing::warn!(region = %region_id, version = old.version, error = %e, "failed to remove replaced package");
                        }
                    }
                    Ok(package)
                }
                Err(e) => {
                    self.store
                        .discard_partials(version, &region_id, ticket.generation);
                    Err(format!("failed to move package into place: {e}"))
                }
            },
            Err(e) => {
                self.store
                    .discard_partials(version, &region_id, ticket.generation);
                Err(e.to_string())
            }
        };

        self.commit(serial, |txn| {
            if txn.state.queue.on_transport_complete(ticket).is_none() {
                return;
            }
            let index = ticket.index;
            txn.leaf_mut(index).fetch_version = None;

            match outcome {
                Ok(package) => {
                    tracing::info!(region = %region_id, version, bytes = package.size_bytes, "region downloaded");
                    let status = txn.state.on_disk_status(&package);
                    let leaf = txn.leaf_mut(index);
                    leaf.local = Some(package);
                    leaf.last_request = None;
                    txn.set_status(index, status);
                }
                Err(message) => {
                    tracing::error!(region = %region_id, error = %message, "region download failed");
                    txn.leaf_mut(index).error = Some(message);
                    txn.set_status(index, Status::DownloadFailed);
                }
            }

            txn.mark_queue_changed();
            txn.advance();
        });
    }
}
