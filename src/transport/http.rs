//! HTTP transport built on reqwest
//!
//! Each started request runs as one tokio task that fetches its files in order
//! from the configured mirrors. Transient failures are retried with backoff on the
//! same mirror, then the next mirror is tried. Callbacks into the engine take
//! locks and touch the filesystem, so they run on the blocking pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{DownloadTransport, TransportCallbacks, TransportFile, TransportHandle, TransportRequest};
use crate::config::{RetryConfig, TransportConfig};
use crate::error::{Error, Result, TransportError};
use crate::retry::download_with_retry;
use crate::types::{Progress, QueueHandle};

/// [`DownloadTransport`] that fetches packages over HTTP(S)
pub struct HttpTransport {
    inner: Arc<Inner>,
    runtime: tokio::runtime::Handle,
}

struct Inner {
    client: reqwest::Client,
    servers: Vec<Url>,
    retry: RetryConfig,
    progress_interval: Duration,
    transfers: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    /// Build a transport; must be called from within a tokio runtime
    pub fn new(transport: &TransportConfig, retry: &RetryConfig) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("HttpTransport requires a tokio runtime: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(transport.request_timeout)
            .user_agent(transport.user_agent.clone())
            .build()?;

        let servers = transport.servers.iter().map(with_trailing_slash).collect();

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                servers,
                retry: retry.clone(),
                progress_interval: transport.progress_interval,
                transfers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            runtime,
        })
    }

    /// Number of transfers currently running
    pub fn active_transfers(&self) -> usize {
        self.inner.transfers().len()
    }
}

impl DownloadTransport for HttpTransport {
    fn start(
        &self,
        request: TransportRequest,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> TransportHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.inner.transfers().insert(id, token.clone());

        tracing::debug!(
            transfer = id,
            region = %request.region_id,
            ticket = %request.ticket,
            bytes = request.total_bytes(),
            "starting package transfer"
        );

        let inner = self.inner.clone();
        self.runtime.spawn(async move {
            let ticket = request.ticket;
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(TransportError::Aborted),
                result = inner.fetch_all(&request, &callbacks) => result,
            };

            if result.is_err() {
                for file in &request.files {
                    tokio::fs::remove_file(&file.destination).await.ok();
                }
            }
            inner.transfers().remove(&id);

            match &result {
                Ok(()) => tracing::info!(transfer = id, region = %request.region_id, "package transfer finished"),
                Err(TransportError::Aborted) => {
                    tracing::debug!(transfer = id, region = %request.region_id, "package transfer aborted")
                }
                Err(e) => {
                    tracing::warn!(transfer = id, region = %request.region_id, error = %e, "package transfer failed")
                }
            }
            let region_id = request.region_id.clone();
            let report = tokio::task::spawn_blocking(move || callbacks.on_complete(ticket, result));
            if let Err(e) = report.await {
                tracing::error!(transfer = id, region = %region_id, error = %e, "completion callback panicked");
            }
        });

        TransportHandle(id)
    }

    fn abort(&self, handle: TransportHandle) {
        if let Some(token) = self.inner.transfers().get(&handle.0) {
            token.cancel();
        }
    }
}

impl Inner {
    fn transfers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.transfers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_all(
        &self,
        request: &TransportRequest,
        callbacks: &Arc<dyn TransportCallbacks>,
    ) -> std::result::Result<(), TransportError> {
        if self.servers.is_empty() {
            return Err(TransportError::NoServers);
        }

        let total = request.total_bytes();
        let mut done_before = 0u64;
        for file in &request.files {
            if let Some(parent) = file.destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let progress = ProgressSink {
                ticket: request.ticket,
                callbacks,
                done_before,
                total,
            };
            self.fetch_file(file, &progress).await?;
            done_before = done_before.saturating_add(file.expected_size);
        }

        report_progress(callbacks, request.ticket, Progress::new(total, total)).await;
        Ok(())
    }

    async fn fetch_file(
        &self,
        file: &TransportFile,
        progress: &ProgressSink<'_>,
    ) -> std::result::Result<(), TransportError> {
        let mut last_error = TransportError::NoServers;

        for server in &self.servers {
            let url = server
                .join(&file.remote_path)
                .map_err(|e| TransportError::Other(format!("invalid package URL: {e}")))?;

            match download_with_retry(&self.retry, || self.fetch_once(&url, file, progress)).await {
                Ok(()) => return Ok(()),
                // A local write failure will not get better on another mirror
                Err(e @ TransportError::Io(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "mirror failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn fetch_once(
        &self,
        url: &Url,
        file: &TransportFile,
        progress: &ProgressSink<'_>,
    ) -> std::result::Result<(), TransportError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let mut out = tokio::fs::File::create(&file.destination).await?;
        let mut hasher = file.sha256.as_ref().map(|_| Sha256::new());
        let mut received = 0u64;
        let mut last_report = Instant::now();

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::Network(e.to_string()))?;
            out.write_all(&chunk).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            received += chunk.len() as u64;

            if last_report.elapsed() >= self.progress_interval {
                progress.report(received.min(file.expected_size)).await;
                last_report = Instant::now();
            }
        }
        out.flush().await?;

        let file_name = file
            .remote_path
            .rsplit('/')
            .next()
            .unwrap_or(&file.remote_path)
            .to_string();
        if file.expected_size != 0 && received != file.expected_size {
            return Err(TransportError::IntegrityMismatch {
                file: file_name,
                reason: format!("expected {} bytes, received {received}", file.expected_size),
            });
        }
        if let (Some(expected), Some(hasher)) = (&file.sha256, hasher) {
            let actual = format!("{:x}", hasher.finalize());
            if actual != *expected {
                return Err(TransportError::IntegrityMismatch {
                    file: file_name,
                    reason: format!("sha256 {actual} does not match {expected}"),
                });
            }
        }
        Ok(())
    }
}

struct ProgressSink<'a> {
    ticket: QueueHandle,
    callbacks: &'a Arc<dyn TransportCallbacks>,
    done_before: u64,
    total: u64,
}

impl ProgressSink<'_> {
    async fn report(&self, file_bytes: u64) {
        let progress = Progress::new(self.done_before + file_bytes, self.total);
        report_progress(self.callbacks, self.ticket, progress).await;
    }
}

/// Deliver a progress report on the blocking pool; awaited so reports stay ordered
async fn report_progress(
    callbacks: &Arc<dyn TransportCallbacks>,
    ticket: QueueHandle,
    progress: Progress,
) {
    let callbacks = callbacks.clone();
    if let Err(e) =
        tokio::task::spawn_blocking(move || callbacks.on_progress(ticket, progress)).await
    {
        tracing::error!(ticket = %ticket, error = %e, "progress callback panicked");
    }
}

fn with_trailing_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        return url.clone();
    }
    let mut url = url.clone();
    let path = format!("{}/", url.path());
    url.set_path(&path);
    url
}
