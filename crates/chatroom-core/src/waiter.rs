//! Single-assignment completion slots and the map of pending ones.
//!
//! A [`PendingMap`] owns one slot per outstanding operation, keyed by id. The
//! event-draining side calls [`PendingMap::complete`]; the caller side holds the
//! matching [`Waiter`] and suspends on it, either as a task
//! ([`Waiter::wait`]) or as a thread ([`Waiter::wait_blocking`]). Both
//! flavours read the same slot, so correlation logic is written once.
//!
//! Invariants:
//! - a slot is filled at most once; later completions are discarded
//! - completion removes the entry from the map under the map's lock
//! - expiry removes the entry under the same lock, so a late reply finds nothing
//! - dropping a waiter removes its entry

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

/// Why a wait ended without a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The deadline passed first.
    #[error("timed out")]
    Timeout,
    /// The entry was cancelled.
    #[error("cancelled")]
    Cancelled,
}

enum SlotState<T> {
    Empty,
    Ready(T),
    Taken,
    Cancelled,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    cond: Condvar,
    notify: Notify,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            cond: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn settle(&self, next: SlotState<T>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, SlotState::Empty) {
            return false;
        }
        *state = next;
        drop(state);
        self.cond.notify_all();
        // notify_one stores a permit when nobody is parked yet.
        self.notify.notify_one();
        true
    }

    fn try_take(&self) -> Option<Result<T, WaitError>> {
        take(&mut self.state.lock())
    }
}

fn take<T>(state: &mut SlotState<T>) -> Option<Result<T, WaitError>> {
    match std::mem::replace(state, SlotState::Taken) {
        SlotState::Ready(value) => Some(Ok(value)),
        SlotState::Empty => {
            *state = SlotState::Empty;
            None
        }
        SlotState::Cancelled => {
            *state = SlotState::Cancelled;
            Some(Err(WaitError::Cancelled))
        }
        SlotState::Taken => Some(Err(WaitError::Cancelled)),
    }
}

type Entries<T> = Mutex<HashMap<String, Arc<Slot<T>>>>;

/// Pending operations keyed by id.
pub struct PendingMap<T> {
    entries: Arc<Entries<T>>,
}

impl<T> PendingMap<T> {
    /// An empty map.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a slot for `key`.
    ///
    /// Returns `None` if `key` is already pending; ids must not be reused
    /// while their entry is live.
    pub fn register(&self, key: impl Into<String>) -> Option<Waiter<T>> {
        let key = key.into();
        let slot = Arc::new(Slot::new());
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return None;
        }
        entries.insert(key.clone(), Arc::clone(&slot));
        Some(Waiter {
            key,
            slot,
            entries: Arc::downgrade(&self.entries),
        })
    }

    /// Fulfil the slot for `key` and remove it.
    ///
    /// Returns `false` if nothing is pending under `key` (already completed,
    /// expired, or never registered).
    pub fn complete(&self, key: &str, value: T) -> bool {
        let mut entries = self.entries.lock();
        match entries.remove(key) {
            Some(slot) => slot.settle(SlotState::Ready(value)),
            None => false,
        }
    }

    /// Cancel the slot for `key`; its waiter observes [`WaitError::Cancelled`].
    pub fn cancel(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.remove(key) {
            Some(slot) => slot.settle(SlotState::Cancelled),
            None => false,
        }
    }

    /// Cancel every pending slot. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut entries = self.entries.lock();
        entries
            .drain()
            .filter(|(_, slot)| slot.settle(SlotState::Cancelled))
            .count()
    }

    /// Whether `key` is pending.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for PendingMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The caller's half of a pending entry. Read exactly once.
pub struct Waiter<T> {
    key: String,
    slot: Arc<Slot<T>>,
    entries: Weak<Entries<T>>,
}

impl<T> Waiter<T> {
    /// Key this waiter was registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Suspend the current task until the slot is filled or `timeout` elapses.
    pub async fn wait(self, timeout: Duration) -> Result<T, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.slot.try_take() {
                return outcome;
            }
            if tokio::time::timeout_at(deadline, self.slot.notify.notified())
                .await
                .is_err()
            {
                return self.expire();
            }
        }
    }

    /// Block the current thread until the slot is filled or `timeout` elapses.
    ///
    /// Must not be called from inside an async task.
    pub fn wait_blocking(self, timeout: Duration) -> Result<T, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        loop {
            if let Some(outcome) = take(&mut state) {
                return outcome;
            }
            if self.slot.cond.wait_until(&mut state, deadline).timed_out() {
                if let Some(outcome) = take(&mut state) {
                    return outcome;
                }
                drop(state);
                return self.expire();
            }
        }
    }

    // Remove our entry. If it is already gone, a completion won the race and
    // its value is in the slot.
    fn expire(&self) -> Result<T, WaitError> {
        if !self.remove_entry() {
            if let Some(outcome) = self.slot.try_take() {
                return outcome;
            }
        }
        Err(WaitError::Timeout)
    }

    fn remove_entry(&self) -> bool {
        let Some(entries) = self.entries.upgrade() else {
            return false;
        };
        let mut entries = entries.lock();
        match entries.get(&self.key) {
            Some(slot) if Arc::ptr_eq(slot, &self.slot) => entries.remove(&self.key).is_some(),
            _ => false,
        }
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        self.remove_entry();
    }
}
