//! # region-dl
//!
//! Offline map region download manager.
//!
//! Keeps track of which regions of a hierarchical map catalog are installed,
//! queued, downloading, failed or out of date, and drives their downloads one
//! at a time through a pluggable transport.
//!
//! ## Design Philosophy
//!
//! region-dl is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Synchronous requests** - Requests validate and commit at once; transfers run on the transport
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Files are the truth** - A region is on disk iff its package files are
//!
//! ## Quick Start
//!
//! ```no_run
//! use region_dl::{Config, PackageOptions, RegionDownloader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.transport.servers = vec!["https://maps.example.com/".parse()?];
//!
//!     let downloader = RegionDownloader::with_http_transport(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe_events();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     if let Some(index) = downloader.catalog().find_by_id("Luxembourg") {
//!         downloader.request_download(index, PackageOptions::MapWithRouting)?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Region catalog
pub mod catalog;
/// Configuration types
pub mod config;
/// Region status engine (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Event delivery to listeners
pub mod fanout;
/// Slot registry safe to mutate during iteration
pub mod listeners;
/// Retry logic with exponential backoff
pub mod retry;
/// Free-space checks and package files
pub mod storage;
/// Package transports
pub mod transport;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use catalog::{RegionCatalog, RegionNode};
pub use config::{Config, EventConfig, RetryConfig, StorageConfig, TransportConfig};
pub use downloader::{RegionDownloader, derive_group_status};
pub use error::{CatalogError, DownloadError, Error, Result, TransportError};
pub use fanout::{EventFanout, RegionListener};
pub use listeners::{Listeners, Slot};
pub use storage::{DiskSpaceProbe, FreeSpaceProbe, LocalPackage, StorageGuard};
pub use transport::{
    DownloadTransport, HttpTransport, TransportCallbacks, TransportFile, TransportHandle,
    TransportRequest,
};
pub use types::{
    Action, ActiveGroup, DownloadRequest, Event, GroupChange, GroupPosition, PackageComponent,
    PackageOptions, PackageSizes, Progress, QueueHandle, RegionIndex, RegionInfo, Status,
};

/// Helper function to run the downloader with graceful signal handling.
///
/// Waits for a termination signal and then calls the downloader's `shutdown()` method,
/// which persists the download queue so the next start resumes it.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use region_dl::{Config, RegionDownloader, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::from_json_file("region-dl.json")?;
///     let downloader = RegionDownloader::with_http_transport(config).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(downloader).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(downloader: RegionDownloader) -> Result<()> {
    wait_for_signal().await;
    downloader.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
