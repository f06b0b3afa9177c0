//! Double-buffered subscriber registry
//!
//! [`Listeners`] keeps a live membership map plus pending additions and removals.
//! Between [`Listeners::begin_iteration`] and [`Listeners::end_iteration`] the live
//! map is frozen: subscribe and unsubscribe calls are buffered and merged when the
//! pass ends. Slots come from a monotonic counter and are never reused, so a slot
//! released during a pass can never alias a listener that joins later.

use std::collections::{BTreeMap, BTreeSet};

/// Opaque handle returned by [`Listeners::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(u64);

impl Slot {
    /// Raw slot number, for logging
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned by [`Listeners::begin_iteration`] when a pass is already running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyIterating;

/// Subscriber registry that tolerates membership changes during iteration
#[derive(Debug)]
pub struct Listeners<T> {
    live: BTreeMap<Slot, T>,
    pending_add: BTreeMap<Slot, T>,
    pending_remove: BTreeSet<Slot>,
    next_slot: u64,
    iterating: bool,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Listeners<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            live: BTreeMap::new(),
            pending_add: BTreeMap::new(),
            pending_remove: BTreeSet::new(),
            next_slot: 1,
            iterating: false,
        }
    }

    /// Register a subscriber
    ///
    /// During a pass the subscriber is parked and joins at `end_iteration`; it
    /// does not see the event currently being delivered.
    pub fn subscribe(&mut self, value: T) -> Slot {
        let slot = Slot(self.next_slot);
        self.next_slot += 1;
        if self.iterating {
            self.pending_add.insert(slot, value);
        } else {
            self.live.insert(slot, value);
        }
        slot
    }

    /// Remove a subscriber; unknown or already removed slots are ignored
    ///
    /// Returns whether the slot named a current member.
    pub fn unsubscribe(&mut self, slot: Slot) -> bool {
        if self.pending_add.remove(&slot).is_some() {
            return true;
        }
        if !self.live.contains_key(&slot) {
            return false;
        }
        if self.iterating {
            self.pending_remove.insert(slot)
        } else {
            self.live.remove(&slot);
            true
        }
    }

    /// Start a delivery pass and expose the frozen membership
    pub fn begin_iteration(&mut self) -> Result<impl Iterator<Item = (Slot, &T)>, AlreadyIterating> {
        if self.iterating {
            return Err(AlreadyIterating);
        }
        self.iterating = true;
        Ok(self.live.iter().map(|(slot, value)| (*slot, value)))
    }

    /// Finish a delivery pass and merge buffered changes
    pub fn end_iteration(&mut self) {
        if !self.iterating {
            return;
        }
        self.iterating = false;
        for slot in std::mem::take(&mut self.pending_remove) {
            self.live.remove(&slot);
        }
        self.live.append(&mut self.pending_add);
    }

    /// Whether a pass is running
    pub fn is_iterating(&self) -> bool {
        self.iterating
    }

    /// Effective membership count, buffered changes included
    pub fn len(&self) -> usize {
        self.live.len() + self.pending_add.len() - self.pending_remove.len()
    }

    /// True when the effective membership is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the slot is an effective member
    pub fn contains(&self, slot: Slot) -> bool {
        self.pending_add.contains_key(&slot)
            || (self.live.contains_key(&slot) && !self.pending_remove.contains(&slot))
    }
}

impl<T: Clone> Listeners<T> {
    /// Clone the frozen membership of a pass that was just started
    ///
    /// Convenience for callers that must release the registry's lock while the
    /// pass runs.
    pub fn begin_snapshot(&mut self) -> Result<Vec<(Slot, T)>, AlreadyIterating> {
        let snapshot = self
            .begin_iteration()?
            .map(|(slot, value)| (slot, value.clone()))
            .collect();
        Ok(snapshot)
    }
}
