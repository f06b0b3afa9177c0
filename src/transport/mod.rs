//! Transport boundary
//!
//! The engine hands a [`TransportRequest`] to a [`DownloadTransport`] and learns
//! about the outcome through [`TransportCallbacks`]. A transport reports progress
//! zero or more times and then exactly one completion per started request.
//! Callbacks may arrive on any thread, including synchronously from inside
//! [`DownloadTransport::start`].

mod http;

use std::path::PathBuf;
use std::sync::Arc;

pub use http::HttpTransport;

use crate::error::TransportError;
use crate::types::{PackageComponent, Progress, QueueHandle};

/// Opaque id of one running transfer, issued by the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u64);

/// One file to fetch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportFile {
    /// Which package component this is
    pub component: PackageComponent,
    /// Path relative to a mirror root, `"<version>/<file name>"`
    pub remote_path: String,
    /// Where to write the bytes
    pub destination: PathBuf,
    /// Size published in the catalog
    pub expected_size: u64,
    /// Expected SHA-256 in lowercase hex, if the catalog publishes one
    pub sha256: Option<String>,
}

/// Everything a transport needs to fetch one region package
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportRequest {
    /// Queue handle to report back with
    pub ticket: QueueHandle,
    /// Catalog id of the region
    pub region_id: String,
    /// Data version being fetched
    pub version: i64,
    /// Files in fetch order
    pub files: Vec<TransportFile>,
}

impl TransportRequest {
    /// Sum of the expected sizes of all files
    pub fn total_bytes(&self) -> u64 {
        self.files
            .iter()
            .fold(0u64, |acc, f| acc.saturating_add(f.expected_size))
    }
}

/// Receiver of transport reports
pub trait TransportCallbacks: Send + Sync {
    /// Cumulative progress over all files of the request
    fn on_progress(&self, ticket: QueueHandle, progress: Progress);

    /// Final outcome; called exactly once per started request
    fn on_complete(&self, ticket: QueueHandle, result: Result<(), TransportError>);
}

/// Fetches region packages
///
/// Implementations must tolerate `abort` for handles that already finished or
/// that they never issued.
pub trait DownloadTransport: Send + Sync {
    /// Begin fetching; must not block on network I/O
    fn start(
        &self,
        request: TransportRequest,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> TransportHandle;

    /// Stop a transfer; cooperative, may complete after returning
    fn abort(&self, handle: TransportHandle);
}
