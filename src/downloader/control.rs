//! User requests: download, update, delete, cancel, retry and version bump.
//!
//! Requests are synchronous. A rejected request (unknown region, illegal action,
//! not enough space) leaves no state change behind.

use std::sync::MutexGuard;

use crate::error::{DownloadError, Result};
use crate::types::{Action, PackageOptions, RegionIndex, Status};

use super::queue::CancelOutcome;
use super::{EngineState, Effect, RegionDownloader, Txn, status};

/// A leaf picked for a request, with what it needs
struct Selected {
    index: RegionIndex,
    options: PackageOptions,
    is_update: bool,
    bytes: u64,
}

impl RegionDownloader {
    /// Queue a leaf for download
    ///
    /// Legal from `NotDownloaded` and, as an update, from `OnDiskOutOfDate`.
    /// The package size plus the safety margin must be free on the data volume.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::RegionUnknown`] for an index outside the catalog
    /// - [`DownloadError::InvalidTransition`] for groups and illegal statuses
    /// - [`DownloadError::InsufficientSpace`] when the package does not fit
    /// - [`crate::Error::ShuttingDown`] after shutdown
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use region_dl::*;
    /// # fn example(downloader: RegionDownloader, index: RegionIndex) -> Result<()> {
    /// downloader.request_download(index, PackageOptions::MapWithRouting)?;
    /// assert!(matches!(
    ///     downloader.status(index),
    ///     Status::InQueue | Status::Downloading
    /// ));
    /// # Ok(())
    /// # }
    /// ```
    pub fn request_download(&self, index: RegionIndex, options: PackageOptions) -> Result<()> {
        let serial = self.begin_request()?;
        let status = self.check_leaf(index, Action::Download)?;
        let selected = Selected {
            index,
            options,
            is_update: status == Status::OnDiskOutOfDate,
            bytes: self.package_bytes(index, options),
        };
        self.enqueue_selected(serial, vec![selected])?;
        tracing::info!(index = index.0, ?options, "download requested");
        Ok(())
    }

    /// Replace an out-of-date package with the current version
    ///
    /// Fetches the same components the stale package has.
    pub fn request_update(&self, index: RegionIndex) -> Result<()> {
        let serial = self.begin_request()?;
        self.check_leaf(index, Action::Update)?;
        let selected = self.update_selection(&self.read(), index);
        self.enqueue_selected(serial, vec![selected])?;
        tracing::info!(index = index.0, "update requested");
        Ok(())
    }

    /// Re-request a failed download with its previous options
    ///
    /// The space check runs again.
    pub fn request_retry(&self, index: RegionIndex) -> Result<()> {
        let serial = self.begin_request()?;
        self.check_leaf(index, Action::Retry)?;
        let selected = self.retry_selection(&self.read(), index);
        self.enqueue_selected(serial, vec![selected])?;
        tracing::info!(index = index.0, "retry requested");
        Ok(())
    }

    /// Remove a package from disk
    ///
    /// Map and routing files are removed together; files already missing are
    /// not an error.
    pub fn request_delete(&self, index: RegionIndex) -> Result<()> {
        let serial = self.begin_request()?;
        self.check_leaf(index, Action::Delete)?;
        self.delete_leaves(serial, vec![index], true)?;
        tracing::info!(index = index.0, "package deleted");
        Ok(())
    }

    /// Drop a queued, running or failed request
    ///
    /// The status is `NotDownloaded` as soon as this returns; a running
    /// transfer is aborted afterwards and any late report from it is ignored.
    /// Cancelling an update also removes the stale package.
    pub fn request_cancel(&self, index: RegionIndex) -> Result<()> {
        let serial = self.begin_request()?;
        self.check_leaf(index, Action::Cancel)?;
        self.cancel_leaves(serial, vec![index]);
        tracing::info!(index = index.0, "download cancelled");
        Ok(())
    }

    /// Queue every `NotDownloaded` leaf under `index`; returns how many were queued
    ///
    /// Space is checked once for the sum of the selected packages.
    pub fn download_node(&self, index: RegionIndex, options: PackageOptions) -> Result<usize> {
        let serial = self.begin_request()?;
        self.check_known(index)?;
        let selected: Vec<Selected> = self
            .leaves_in(index, Status::NotDownloaded)
            .into_iter()
            .map(|leaf| Selected {
                index: leaf,
                options,
                is_update: false,
                bytes: self.package_bytes(leaf, options),
            })
            .collect();
        let count = self.enqueue_selected(serial, selected)?;
        tracing::info!(index = index.0, count, "subtree download requested");
        Ok(count)
    }

    /// Queue updates for every out-of-date leaf under `index`
    pub fn update_node(&self, index: RegionIndex) -> Result<usize> {
        let serial = self.begin_request()?;
        self.check_known(index)?;
        let selected: Vec<Selected> = {
            let state = self.read();
            self.leaves_in(index, Status::OnDiskOutOfDate)
                .into_iter()
                .map(|leaf| self.update_selection(&state, leaf))
                .collect()
        };
        let count = self.enqueue_selected(serial, selected)?;
        tracing::info!(index = index.0, count, "subtree update requested");
        Ok(count)
    }

    /// Retry every failed leaf under `index`
    pub fn retry_node(&self, index: RegionIndex) -> Result<usize> {
        let serial = self.begin_request()?;
        self.check_known(index)?;
        let selected: Vec<Selected> = {
            let state = self.read();
            self.leaves_in(index, Status::DownloadFailed)
                .into_iter()
                .map(|leaf| self.retry_selection(&state, leaf))
                .collect()
        };
        let count = self.enqueue_selected(serial, selected)?;
        tracing::info!(index = index.0, count, "subtree retry requested");
        Ok(count)
    }

    /// Cancel every queued, running or failed leaf under `index`
    pub fn cancel_node(&self, index: RegionIndex) -> Result<usize> {
        let serial = self.begin_request()?;
        self.check_known(index)?;
        let leaves: Vec<RegionIndex> = {
            let state = self.read();
            self.catalog
                .leaves(index)
                .filter(|leaf| {
                    state
                        .node(*leaf)
                        .is_some_and(|s| s.status.allows(Action::Cancel))
                })
                .collect()
        };
        let count = self.cancel_leaves(serial, leaves);
        tracing::info!(index = index.0, count, "subtree cancelled");
        Ok(count)
    }

    /// Delete every package under `index`
    pub fn delete_node(&self, index: RegionIndex) -> Result<usize> {
        let serial = self.begin_request()?;
        self.check_known(index)?;
        let leaves: Vec<RegionIndex> = {
            let state = self.read();
            self.catalog
                .leaves(index)
                .filter(|leaf| {
                    state
                        .node(*leaf)
                        .is_some_and(|s| s.status.allows(Action::Delete))
                })
                .collect()
        };
        let count = self.delete_leaves(serial, leaves, false)?;
        tracing::info!(index = index.0, count, "subtree deleted");
        Ok(count)
    }

    /// Switch to a new data version; returns how many leaves changed status
    ///
    /// Packages older than `version` become `OnDiskOutOfDate`.
    pub fn apply_catalog_version(&self, version: i64) -> Result<usize> {
        let serial = self.begin_request()?;
        let count = self.commit(serial, |txn| {
            txn.state.version = version;
            let on_disk: Vec<(RegionIndex, Status)> = txn
                .state
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, s)| s.status.is_on_disk())
                .filter_map(|(i, s)| {
                    let index = RegionIndex(i as u32);
                    s.local.map(|p| (index, txn.state.on_disk_status(&p)))
                })
                .filter(|(index, status)| txn.state.nodes[index.as_usize()].status != *status)
                .collect();
            for (index, status) in &on_disk {
                txn.set_status(*index, *status);
            }
            on_disk.len()
        });
        tracing::info!(version, outdated = count, "data version applied");
        Ok(count)
    }

    fn check_known(&self, index: RegionIndex) -> Result<()> {
        if !self.catalog.contains(index) {
            return Err(DownloadError::RegionUnknown { index }.into());
        }
        Ok(())
    }

    /// Status of a leaf, if `action` is legal for it
    fn check_leaf(&self, index: RegionIndex, action: Action) -> Result<Status> {
        let node = self
            .catalog
            .get(index)
            .ok_or(DownloadError::RegionUnknown { index })?;
        let status = status::node_status(&self.catalog, &self.read(), index);
        if !node.is_leaf() || !status.allows(action) {
            return Err(DownloadError::InvalidTransition {
                index,
                action,
                status,
            }
            .into());
        }
        Ok(status)
    }

    fn leaves_in(&self, index: RegionIndex, status: Status) -> Vec<RegionIndex> {
        let state = self.read();
        self.catalog
            .leaves(index)
            .filter(|leaf| state.node(*leaf).is_some_and(|s| s.status == status))
            .collect()
    }

    fn package_bytes(&self, index: RegionIndex, options: PackageOptions) -> u64 {
        self.catalog
            .get(index)
            .map_or(0, |node| node.sizes.total(options))
    }

    fn update_selection(&self, state: &EngineState, index: RegionIndex) -> Selected {
        let options = state
            .node(index)
            .and_then(|s| s.local)
            .map(|p| p.options)
            .unwrap_or_default();
        Selected {
            index,
            options,
            is_update: true,
            bytes: self.package_bytes(index, options),
        }
    }

    fn retry_selection(&self, state: &EngineState, index: RegionIndex) -> Selected {
        let leaf = state.node(index);
        let (options, was_update) = leaf.and_then(|s| s.last_request).unwrap_or_default();
        // A failed update still has its stale package on disk
        let is_update = was_update && leaf.is_some_and(|s| s.local.is_some());
        Selected {
            index,
            options,
            is_update,
            bytes: self.package_bytes(index, options),
        }
    }

    fn enqueue_selected(&self, serial: MutexGuard<'_, ()>, selected: Vec<Selected>) -> Result<usize> {
        if selected.is_empty() {
            return Ok(0);
        }
        let total = selected
            .iter()
            .fold(0u64, |sum, s| sum.saturating_add(s.bytes));
        self.guard.check(total)?;

        let count = selected.len();
        self.commit(serial, |txn| {
            for s in selected {
                txn.enqueue(s.index, s.options, s.is_update);
            }
        });
        Ok(count)
    }

    /// Remove packages, then mark the leaves `NotDownloaded`
    ///
    /// With `strict` the first file error aborts the request; otherwise the
    /// failing leaf is skipped and logged.
    fn delete_leaves(
        &self,
        serial: MutexGuard<'_, ()>,
        leaves: Vec<RegionIndex>,
        strict: bool,
    ) -> Result<usize> {
        let mut deleted = Vec::with_capacity(leaves.len());
        for index in leaves {
            match self.remove_local_package(index) {
                Ok(()) => deleted.push(index),
                Err(e) if strict => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(index = index.0, error = %e, "failed to delete package, skipping")
                }
            }
        }

        let count = deleted.len();
        if count > 0 {
            self.commit(serial, |txn| {
                for index in deleted {
                    txn.leaf_mut(index).local = None;
                    txn.set_status(index, Status::NotDownloaded);
                }
            });
        }
        Ok(count)
    }

    /// Drop requests and stale packages, then mark the leaves `NotDownloaded`
    ///
    /// Cancel always takes effect. A stale package that cannot be removed is
    /// left behind and shows up as out of date on the next scan.
    fn cancel_leaves(&self, serial: MutexGuard<'_, ()>, leaves: Vec<RegionIndex>) -> usize {
        for index in &leaves {
            // Whatever is on disk for an active or failed leaf is a stale update target
            if let Err(e) = self.remove_local_package(*index) {
                tracing::warn!(index = index.0, error = %e, "failed to remove stale package");
            }
        }

        let count = leaves.len();
        if count > 0 {
            self.commit(serial, |txn| {
                for index in &leaves {
                    cancel_in(txn, *index);
                }
                txn.advance();
            });
        }
        count
    }

    fn remove_local_package(&self, index: RegionIndex) -> std::io::Result<()> {
        let Some(node) = self.catalog.get(index) else {
            return Ok(());
        };
        let local = self.read().node(index).and_then(|s| s.local);
        match local {
            Some(package) => self.store.delete_package(&node.id, &package),
            None => Ok(()),
        }
    }
}

fn cancel_in(txn: &mut Txn<'_>, index: RegionIndex) {
    let region_id = txn
        .catalog
        .get(index)
        .map(|n| n.id.clone())
        .unwrap_or_default();
    let fetch_version = txn.leaf_mut(index).fetch_version.take();

    match txn.state.queue.cancel(index) {
        CancelOutcome::Active(active) => {
            let version = fetch_version.unwrap_or(txn.state.version);
            txn.push_effect(Effect::Abort {
                transport: active.transport,
                region_id,
                version,
                generation: active.handle.generation,
            });
            txn.mark_queue_changed();
        }
        CancelOutcome::Queued(handle, _) => {
            tracing::debug!(ticket = %handle, "queued request removed");
            txn.mark_queue_changed();
        }
        CancelOutcome::NotFound => {}
    }

    let leaf = txn.leaf_mut(index);
    leaf.local = None;
    leaf.last_request = None;
    txn.set_status(index, Status::NotDownloaded);
}
