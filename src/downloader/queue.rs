//! Download queue coordination
//!
//! [`DownloadQueueCoordinator`] is a pure synchronous state machine: it performs
//! no I/O and has no locking. The engine owns it inside its state lock and turns
//! its answers into transport calls after the lock is released.
//!
//! At most one request is active at a time; the rest wait in FIFO order. Every
//! request gets a [`QueueHandle`] at enqueue time. A report carrying a handle
//! that is not the active one is stale and must be dropped.

use std::collections::VecDeque;

use crate::transport::TransportHandle;
use crate::types::{DownloadRequest, Progress, QueueHandle, RegionIndex};

/// The request the transport is working on
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ActiveRequest {
    pub(crate) handle: QueueHandle,
    pub(crate) request: DownloadRequest,
    pub(crate) transport: Option<TransportHandle>,
    pub(crate) progress: Progress,
}

/// Result of [`DownloadQueueCoordinator::cancel`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// Removed from the waiting list; no transport call needed
    Queued(QueueHandle, DownloadRequest),
    /// Was active; the transport (if already attached) must be aborted
    Active(ActiveRequest),
    /// Index had no request
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Waiting {
    handle: QueueHandle,
    request: DownloadRequest,
}

/// Sequential download queue for one storage volume
#[derive(Debug, Default)]
pub(crate) struct DownloadQueueCoordinator {
    pending: VecDeque<Waiting>,
    active: Option<ActiveRequest>,
    next_generation: u64,
}

impl DownloadQueueCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a request; the caller guarantees the index is not already queued
    pub(crate) fn enqueue(&mut self, request: DownloadRequest) -> QueueHandle {
        debug_assert!(!self.contains(request.index), "region queued twice");
        self.next_generation += 1;
        let handle = QueueHandle {
            index: request.index,
            generation: self.next_generation,
        };
        self.pending.push_back(Waiting { handle, request });
        handle
    }

    /// Make the head of the queue active when nothing is running
    pub(crate) fn promote_next(&mut self) -> Option<(QueueHandle, DownloadRequest)> {
        if self.active.is_some() {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.active = Some(ActiveRequest {
            handle: next.handle,
            request: next.request.clone(),
            transport: None,
            progress: Progress::new(0, 0),
        });
        Some((next.handle, next.request))
    }

    /// Remove the request for `index`, wherever it is
    pub(crate) fn cancel(&mut self, index: RegionIndex) -> CancelOutcome {
        if self.active.as_ref().is_some_and(|a| a.request.index == index) {
            if let Some(active) = self.active.take() {
                return CancelOutcome::Active(active);
            }
        }
        match self.pending.iter().position(|w| w.request.index == index) {
            Some(pos) => match self.pending.remove(pos) {
                Some(waiting) => CancelOutcome::Queued(waiting.handle, waiting.request),
                None => CancelOutcome::NotFound,
            },
            None => CancelOutcome::NotFound,
        }
    }

    /// Record the transport handle of the active request
    ///
    /// Returns false when `handle` is no longer active; the caller must then
    /// abort the transfer it just started.
    pub(crate) fn attach_transport(
        &mut self,
        handle: QueueHandle,
        transport: TransportHandle,
    ) -> bool {
        match self.active.as_mut() {
            Some(active) if active.handle == handle => {
                active.transport = Some(transport);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_current(&self, handle: QueueHandle) -> bool {
        self.active.as_ref().is_some_and(|a| a.handle == handle)
    }

    /// Accept progress for the active request; stale reports return false
    pub(crate) fn on_transport_progress(&mut self, handle: QueueHandle, progress: Progress) -> bool {
        match self.active.as_mut() {
            Some(active) if active.handle == handle => {
                active.progress = progress;
                true
            }
            _ => false,
        }
    }

    /// Finish the active request; stale reports return `None`
    pub(crate) fn on_transport_complete(&mut self, handle: QueueHandle) -> Option<ActiveRequest> {
        if !self.is_current(handle) {
            return None;
        }
        self.active.take()
    }

    /// Remove the active request without promoting another (shutdown)
    pub(crate) fn take_active(&mut self) -> Option<ActiveRequest> {
        self.active.take()
    }

    pub(crate) fn active(&self) -> Option<&ActiveRequest> {
        self.active.as_ref()
    }

    pub(crate) fn is_active(&self, index: RegionIndex) -> bool {
        self.active.as_ref().is_some_and(|a| a.request.index == index)
    }

    pub(crate) fn is_queued(&self, index: RegionIndex) -> bool {
        self.pending.iter().any(|w| w.request.index == index)
    }

    pub(crate) fn contains(&self, index: RegionIndex) -> bool {
        self.is_active(index) || self.is_queued(index)
    }

    /// Position in the queue, 0 for the active request
    pub(crate) fn position(&self, index: RegionIndex) -> Option<usize> {
        if self.is_active(index) {
            return Some(0);
        }
        let offset = usize::from(self.active.is_some());
        self.pending
            .iter()
            .position(|w| w.request.index == index)
            .map(|p| p + offset)
    }

    /// Active plus waiting requests
    pub(crate) fn len(&self) -> usize {
        self.pending.len() + usize::from(self.active.is_some())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All requests in service order, active first
    pub(crate) fn snapshot(&self) -> Vec<DownloadRequest> {
        self.active
            .iter()
            .map(|a| a.request.clone())
            .chain(self.pending.iter().map(|w| w.request.clone()))
            .collect()
    }
}
