//! Startup and shutdown coordination.

use std::sync::{Arc, Mutex, RwLock};

use crate::catalog::RegionCatalog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fanout::EventFanout;
use crate::storage::{DiskSpaceProbe, FreeSpaceProbe, PackageStore, StorageGuard};
use crate::transport::{DownloadTransport, HttpTransport};
use crate::types::Event;

use super::{EngineState, Effect, RegionDownloader, queue_entries};

impl RegionDownloader {
    /// Create a new RegionDownloader instance
    ///
    /// This initializes all core components:
    /// - Validates the configuration and loads the region catalog
    /// - Creates the data directory and scans it for installed packages
    /// - Sets up the listener registry and event broadcast channel
    /// - Restores the persisted download queue (each entry is re-checked)
    pub async fn new(config: Config, transport: Arc<dyn DownloadTransport>) -> Result<Self> {
        Self::with_probe(config, transport, Arc::new(DiskSpaceProbe)).await
    }

    /// Create an instance that fetches packages over HTTP from the configured mirrors
    ///
    /// Must be called from inside a Tokio runtime.
    pub async fn with_http_transport(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(&config.transport, &config.retry)?;
        Self::new(config, Arc::new(transport)).await
    }

    /// Like [`RegionDownloader::new`] with a custom free-space probe
    pub async fn with_probe(
        config: Config,
        transport: Arc<dyn DownloadTransport>,
        probe: Arc<dyn FreeSpaceProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let catalog = RegionCatalog::load(&config.storage.catalog_path).await?;
        Self::with_catalog(config, catalog, transport, probe).await
    }

    /// Build an instance around an already loaded catalog
    pub async fn with_catalog(
        config: Config,
        catalog: RegionCatalog,
        transport: Arc<dyn DownloadTransport>,
        probe: Arc<dyn FreeSpaceProbe>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage.data_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create data directory '{}': {}",
                        config.storage.data_dir.display(),
                        e
                    ),
                ))
            })?;

        let store = PackageStore::new(&config.storage.data_dir);
        let installed = store.scan(&catalog).await?;

        // Initial statuses come from what is on disk; no listeners exist yet
        let mut state = EngineState::new(&catalog);
        for (index, package) in installed {
            let status = state.on_disk_status(&package);
            let leaf = &mut state.nodes[index.as_usize()];
            leaf.local = Some(package);
            leaf.status = status;
            state.groups.assign(index, status.active_group());
        }

        let downloader = Self {
            catalog: Arc::new(catalog),
            state: Arc::new(RwLock::new(state)),
            serial: Arc::new(Mutex::new(())),
            fanout: Arc::new(EventFanout::new(config.events.channel_capacity)),
            guard: StorageGuard::new(&config.storage, probe),
            store,
            transport,
            config: Arc::new(config),
        };

        if downloader.config.storage.persist_queue {
            downloader.restore_queue().await;
        }

        tracing::info!(
            regions = downloader.catalog.len(),
            version = downloader.catalog.version(),
            outdated = downloader.outdated_regions().len(),
            queued = downloader.read().queue.len(),
            "region downloader ready"
        );
        Ok(downloader)
    }

    /// Re-request every entry of the persisted queue, in order
    async fn restore_queue(&self) {
        let entries = match self.store.load_queue().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted download queue, starting empty");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }

        tracing::info!(entries = entries.len(), "restoring download queue");
        for entry in entries {
            let Some(index) = self.catalog.find_by_id(&entry.id) else {
                tracing::warn!(region = %entry.id, "queued region no longer in catalog, skipping");
                continue;
            };
            // An out-of-date package makes this an update again
            if let Err(e) = self.request_download(index, entry.options) {
                tracing::warn!(region = %entry.id, error = %e, "skipping restored queue entry");
            }
        }
    }

    /// Gracefully shut down the downloader
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting requests (they fail with [`Error::ShuttingDown`])
    /// 2. Persists the queue, running request first, so the next start resumes it
    /// 3. Emits [`Event::Shutdown`]
    /// 4. Aborts the running transfer; its late report is ignored
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        let serial = self.lock_serial();
        let (entries, active) = {
            let mut state = self.write();
            if !state.accepting {
                return Ok(());
            }
            state.accepting = false;
            let entries = queue_entries(&self.catalog, &state.queue);
            let active = state.queue.take_active();
            let version = active
                .as_ref()
                .and_then(|a| state.node(a.request.index))
                .and_then(|s| s.fetch_version)
                .unwrap_or(state.version);
            (entries, active.map(|a| (a, version)))
        };
        tracing::info!("Stopped accepting new requests");

        if self.config.storage.persist_queue {
            // Continue with shutdown even if persistence fails
            match self.store.save_queue(&entries) {
                Ok(()) => tracing::info!(entries = entries.len(), "download queue persisted"),
                Err(e) => tracing::error!(error = %e, "Failed to persist download queue during shutdown"),
            }
        }

        let mut effects = Vec::new();
        if let Some((active, version)) = active {
            let region_id = self
                .catalog
                .get(active.request.index)
                .map(|n| n.id.clone())
                .unwrap_or_default();
            tracing::info!(region = %region_id, "aborting running transfer");
            effects.push(Effect::Abort {
                transport: active.transport,
                region_id,
                version,
                generation: active.handle.generation,
            });
        }
        self.deliver_then_run(serial, vec![Event::Shutdown], effects);

        // Let aborted transfer tasks observe their cancellation
        tokio::task::yield_now().await;

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
