//! Error types for region-dl
//!
//! This module provides the error hierarchy for the library:
//! - [`Error`], the top-level type returned by fallible public operations
//! - [`DownloadError`], synchronous rejections of region requests
//! - [`CatalogError`], problems with the region catalog file
//! - [`TransportError`], asynchronous failures reported by a transport

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{Action, RegionIndex, Status};

/// Result type alias for region-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for region-dl
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "storage.data_dir")
        key: Option<String>,
    },

    /// Region catalog could not be loaded
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// A region request was rejected
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Transport failure surfaced outside the engine (e.g. building a transport)
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown in progress - not accepting new requests
    #[error("shutdown in progress: not accepting new requests")]
    ShuttingDown,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to check disk space
    #[error("failed to check disk space: {0}")]
    DiskSpaceCheckFailed(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Synchronous rejections of region requests
///
/// None of these leave a state change behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    /// Index does not name a catalog node
    #[error("region {index} is not in the catalog")]
    RegionUnknown {
        /// The index that was requested
        index: RegionIndex,
    },

    /// Requested action is not legal in the current status
    #[error("cannot {action} region {index} in status {status}")]
    InvalidTransition {
        /// The region the action was requested for
        index: RegionIndex,
        /// The action that was attempted
        action: Action,
        /// The status that prevents the action
        status: Status,
    },

    /// Not enough free space for the package plus the safety margin
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required, safety margin included
        required: u64,
        /// Number of bytes currently available on the volume
        available: u64,
    },
}

/// Errors loading the region catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Catalog file could not be read
    #[error("failed to read catalog {path}: {source}")]
    Read {
        /// Path of the catalog file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Catalog JSON is malformed
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    /// Two nodes share the same id
    #[error("duplicate region id {id}")]
    DuplicateId {
        /// The repeated id
        id: String,
    },

    /// A leaf has no map size
    #[error("region {id} has no children and no size")]
    MissingSize {
        /// The leaf id
        id: String,
    },

    /// The root has no children
    #[error("catalog contains no regions")]
    Empty,
}

/// Failures reported by a [`crate::DownloadTransport`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Server answered with a non-success status
    #[error("HTTP {status} for {url}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Connection, timeout or body stream failure
    #[error("network failure: {0}")]
    Network(String),

    /// Writing the package to disk failed
    #[error("I/O failure: {0}")]
    Io(String),

    /// Received bytes do not match the catalog checksum or size
    #[error("integrity check failed for {file}: {reason}")]
    IntegrityMismatch {
        /// File that failed the check
        file: String,
        /// What did not match
        reason: String,
    },

    /// No download servers are configured
    #[error("no download servers configured")]
    NoServers,

    /// Operation was aborted before completion
    #[error("transfer aborted")]
    Aborted,

    /// Other transport failure
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => TransportError::Http {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => TransportError::Network(e.to_string()),
        }
    }
}
