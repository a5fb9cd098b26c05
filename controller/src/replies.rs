//! Correlates replies arriving on a transport's mailbox with the request that
//! is waiting for them, keyed by transmission id.

use std::{collections::HashMap, sync::Mutex};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("all transmission ids are in use")]
    Exhausted,
    #[error("transmission id {0} is already waiting for a reply")]
    InUse(u8),
    #[error("transmission id 0 is reserved for fire-and-forget messages")]
    Reserved,
}

struct Slots<T> {
    waiters: HashMap<u8, T>,
    cursor: u8,
}

/// `T` is whatever hands the reply to the waiter: a oneshot sender on the host,
/// a bounded std channel on the device.
pub struct PendingReplies<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Default for PendingReplies<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Slots {
                waiters: HashMap::new(),
                cursor: 0,
            }),
        }
    }
}

impl<T> PendingReplies<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the next free id in `1..=255`, round robin.
    pub fn allocate(&self, waiter: T) -> Result<u8, PendingError> {
        let mut slots = self.lock();
        for _ in 0..u8::MAX {
            slots.cursor = if slots.cursor == u8::MAX { 1 } else { slots.cursor + 1 };
            let candidate = slots.cursor;
            if !slots.waiters.contains_key(&candidate) {
                slots.waiters.insert(candidate, waiter);
                return Ok(candidate);
            }
        }
        Err(PendingError::Exhausted)
    }

    /// Claims a caller-chosen id.
    pub fn register(&self, transmission_id: u8, waiter: T) -> Result<(), PendingError> {
        if transmission_id == 0 {
            return Err(PendingError::Reserved);
        }
        let mut slots = self.lock();
        if slots.waiters.contains_key(&transmission_id) {
            return Err(PendingError::InUse(transmission_id));
        }
        slots.waiters.insert(transmission_id, waiter);
        Ok(())
    }

    /// Removes and returns the waiter for `transmission_id`, if still waiting.
    pub fn take(&self, transmission_id: u8) -> Option<T> {
        self.lock().waiters.remove(&transmission_id)
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.lock().waiters.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots<T>> {
        // Poisoning is ignored: every critical section is a single map operation.
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_skips_zero_and_ids_in_use() {
        let pending = PendingReplies::new();
        assert_eq!(pending.allocate("a"), Ok(1));
        assert_eq!(pending.allocate("b"), Ok(2));
        assert_eq!(pending.take(1), Some("a"));
        assert_eq!(pending.take(1), None);
        assert_eq!(pending.allocate("c"), Ok(3));
        assert_eq!(pending.in_flight(), 2);
    }

    #[test]
    fn allocation_wraps_and_exhausts() {
        let pending = PendingReplies::new();
        for expected in 1..=u8::MAX {
            assert_eq!(pending.allocate(()), Ok(expected));
        }
        assert_eq!(pending.allocate(()), Err(PendingError::Exhausted));

        pending.take(7);
        assert_eq!(pending.allocate(()), Ok(7));
    }

    #[test]
    fn explicit_ids_must_be_free_and_nonzero() {
        let pending = PendingReplies::new();
        assert_eq!(pending.register(0, ()), Err(PendingError::Reserved));
        assert_eq!(pending.register(42, ()), Ok(()));
        assert_eq!(pending.register(42, ()), Err(PendingError::InUse(42)));
    }
}
