//! Event fan-out to region listeners
//!
//! Every event is one delivery pass over a frozen snapshot of the registered
//! [`RegionListener`]s. Listeners may subscribe or unsubscribe (themselves or
//! others) from inside a callback; the change takes effect when the pass ends.
//! A callback that synchronously mutates engine state would start a second pass
//! on the same thread while the first is still running, which panics.

use std::cell::Cell;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::listeners::{Listeners, Slot};
use crate::types::{Event, GroupChange, Progress, RegionIndex, Status};

thread_local! {
    static DELIVERING: Cell<bool> = const { Cell::new(false) };
}

/// Synchronous observer of region events
///
/// All methods default to no-ops so implementors only override what they need.
/// Callbacks run on the thread that caused the event, while the engine's
/// serialization lock is held: they must not call mutating engine methods.
/// Read-only queries such as `status` are fine.
pub trait RegionListener: Send + Sync {
    /// A node's status changed
    fn on_status_changed(&self, index: RegionIndex, status: Status) {
        let _ = (index, status);
    }

    /// Download progress for a node
    fn on_progress(&self, index: RegionIndex, progress: Progress) {
        let _ = (index, progress);
    }

    /// A leaf moved between active groups
    fn on_group_changed(&self, change: &GroupChange) {
        let _ = change;
    }
}

/// Multi-subscriber event delivery
pub struct EventFanout {
    listeners: Mutex<Listeners<Arc<dyn RegionListener>>>,
    event_tx: broadcast::Sender<Event>,
}

impl std::fmt::Debug for EventFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFanout")
            .field("listeners", &self.len())
            .field("event_receivers", &self.event_tx.receiver_count())
            .finish()
    }
}

impl EventFanout {
    /// Create a fan-out whose async channel buffers `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Mutex::new(Listeners::new()),
            event_tx,
        }
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn RegionListener>) -> Slot {
        let slot = self.lock().subscribe(listener);
        tracing::debug!(slot = slot.get(), "region listener subscribed");
        slot
    }

    /// Remove a listener; returns whether the slot was registered
    pub fn unsubscribe(&self, slot: Slot) -> bool {
        let removed = self.lock().unsubscribe(slot);
        if removed {
            tracing::debug!(slot = slot.get(), "region listener unsubscribed");
        }
        removed
    }

    /// Effective number of registered listeners
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver for async consumers; slow receivers may observe `Lagged`
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Whether the current thread is inside a delivery pass
    pub fn is_delivering() -> bool {
        DELIVERING.with(|d| d.get())
    }

    /// Deliver events in order, one pass per event
    pub(crate) fn deliver_all(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.deliver(&event);
        }
    }

    /// Deliver one event to every listener in the current membership
    ///
    /// # Panics
    ///
    /// Panics when called from inside a listener callback.
    pub(crate) fn deliver(&self, event: &Event) {
        if Self::is_delivering() {
            panic!(
                "re-entrant region event delivery: a listener callback mutated download state \
                 while handling {event:?}"
            );
        }

        let snapshot = match self.lock().begin_snapshot() {
            Ok(snapshot) => snapshot,
            Err(_) => panic!("region listener registry is already in a delivery pass"),
        };
        DELIVERING.with(|d| d.set(true));
        let _pass = PassGuard { fanout: self };

        for (_slot, listener) in &snapshot {
            match event {
                Event::StatusChanged { index, status } => {
                    listener.on_status_changed(*index, *status)
                }
                Event::Progress { index, progress } => listener.on_progress(*index, *progress),
                Event::GroupChanged(change) => listener.on_group_changed(change),
                Event::Shutdown => {}
            }
        }

        // A send error just means there are no async subscribers
        self.event_tx.send(event.clone()).ok();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Listeners<Arc<dyn RegionListener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Ends the pass even when a listener panics, so the registry stays usable.
struct PassGuard<'a> {
    fanout: &'a EventFanout,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(false));
        self.fanout.lock().end_iteration();
    }
}
