//! Address table mapping logical task ids to their mailboxes.
//!
//! Built once at startup, then shared read-only by every task. Lookups are a
//! linear scan; the table never holds more entries than there are subsystems.

use std::sync::mpsc::{SyncSender, TrySendError};

use thiserror::Error;

use crate::{
    envelope::Envelope,
    task::{RouteFlags, TaskId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("mailbox full")]
    Full,
    #[error("mailbox closed")]
    Closed,
}

/// Bounded, single-consumer queue that accepts whole envelopes.
///
/// `try_deliver` must never block: it is called from the router and from timer
/// expiry callbacks.
pub trait Mailbox {
    fn try_deliver(&self, envelope: Envelope) -> Result<(), DeliveryError>;

    /// Whether the receiving side still exists. Queues that cannot tell report
    /// `true`, and a dead receiver then shows up as `DeliveryError::Closed`.
    fn is_open(&self) -> bool {
        true
    }
}

// `SyncSender` has no way to ask whether its receiver was dropped without
// sending, so it keeps the default `is_open`.
impl Mailbox for SyncSender<Envelope> {
    fn try_deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Disconnected(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("failed to reserve {0} address slots")]
    Allocation(usize),
    #[error("slot {slot} is outside the table capacity {capacity}")]
    SlotOutOfRange { slot: usize, capacity: usize },
    #[error("logical id {0} is not a valid task id")]
    InvalidId(u8),
    #[error("mailbox for task {0} is closed")]
    InvalidMailbox(TaskId),
    #[error("no task with logical id {0}")]
    NotFound(u8),
}

#[derive(Debug, Clone)]
pub struct AddressEntry<M> {
    pub id: TaskId,
    pub flags: RouteFlags,
    pub mailbox: M,
}

#[derive(Debug)]
pub struct AddressTable<M> {
    slots: Vec<Option<AddressEntry<M>>>,
}

impl<M: Mailbox> AddressTable<M> {
    pub fn with_capacity(capacity: usize) -> Result<Self, AddressError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| AddressError::Allocation(capacity))?;
        slots.resize_with(capacity, || None);
        Ok(Self { slots })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Overwrites `slot` unconditionally. Duplicate ids are not detected; the
    /// first matching slot wins on lookup.
    pub fn insert(
        &mut self,
        slot: usize,
        id: u8,
        mailbox: M,
        flags: RouteFlags,
    ) -> Result<(), AddressError> {
        let capacity = self.slots.len();
        if slot >= capacity {
            return Err(AddressError::SlotOutOfRange { slot, capacity });
        }
        let id = TaskId::from_raw(id).ok_or(AddressError::InvalidId(id))?;
        if !mailbox.is_open() {
            return Err(AddressError::InvalidMailbox(id));
        }

        self.slots[slot] = Some(AddressEntry { id, flags, mailbox });
        Ok(())
    }

    pub fn lookup(&self, id: u8) -> Result<(&M, RouteFlags), AddressError> {
        let task = TaskId::from_raw(id).ok_or(AddressError::NotFound(id))?;
        self.slots
            .iter()
            .flatten()
            .find(|entry| entry.id == task)
            .map(|entry| (&entry.mailbox, entry.flags))
            .ok_or(AddressError::NotFound(id))
    }

    /// Drops every mailbox and the backing storage. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        self.slots.clear();
        self.slots.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{sync_channel, Receiver};

    use pretty_assertions::assert_eq;

    use super::*;

    fn mailbox(depth: usize) -> (SyncSender<Envelope>, Receiver<Envelope>) {
        sync_channel(depth)
    }

    #[test]
    fn lookup_finds_inserted_entry_with_flags() {
        let mut table = AddressTable::with_capacity(2).unwrap();
        let (led_tx, _led_rx) = mailbox(1);
        let (alarm_tx, _alarm_rx) = mailbox(1);

        table.insert(0, 4, led_tx, RouteFlags::NONE).unwrap();
        table.insert(1, 2, alarm_tx, RouteFlags::NO_REPLY).unwrap();

        let (_, flags) = table.lookup(2).unwrap();
        assert_eq!(flags, RouteFlags::NO_REPLY);
        assert_eq!(table.lookup(4).unwrap().1, RouteFlags::NONE);
    }

    #[test]
    fn insert_validates_slot_and_id() {
        let mut table = AddressTable::with_capacity(1).unwrap();
        let (tx, _rx) = mailbox(1);

        assert_eq!(
            table.insert(1, 4, tx.clone(), RouteFlags::NONE),
            Err(AddressError::SlotOutOfRange {
                slot: 1,
                capacity: 1
            })
        );
        assert_eq!(
            table.insert(0, 0, tx, RouteFlags::NONE),
            Err(AddressError::InvalidId(0))
        );
    }

    #[test]
    fn zero_and_unknown_ids_never_match() {
        let mut table = AddressTable::with_capacity(1).unwrap();
        let (tx, _rx) = mailbox(1);
        table.insert(0, 1, tx, RouteFlags::ONLY_REPLY).unwrap();

        assert_eq!(table.lookup(0).unwrap_err(), AddressError::NotFound(0));
        assert_eq!(table.lookup(3).unwrap_err(), AddressError::NotFound(3));
    }

    #[test]
    fn reinserting_a_slot_overwrites_it() {
        let mut table = AddressTable::with_capacity(1).unwrap();
        let (first, _first_rx) = mailbox(1);
        let (second, _second_rx) = mailbox(1);

        table.insert(0, 4, first, RouteFlags::NONE).unwrap();
        table.insert(0, 2, second, RouteFlags::NO_REPLY).unwrap();

        assert!(table.lookup(4).is_err());
        assert_eq!(table.lookup(2).unwrap().1, RouteFlags::NO_REPLY);
    }

    #[test]
    fn teardown_closes_mailboxes_and_is_idempotent() {
        let mut table = AddressTable::with_capacity(1).unwrap();
        let (tx, rx) = mailbox(1);
        table.insert(0, 4, tx, RouteFlags::NONE).unwrap();

        table.teardown();
        table.teardown();

        assert_eq!(table.capacity(), 0);
        assert!(table.lookup(4).is_err());
        // Every sender was dropped with the table.
        assert!(rx.recv().is_err());
    }

    struct Hangup;

    impl Mailbox for Hangup {
        fn try_deliver(&self, _envelope: Envelope) -> Result<(), DeliveryError> {
            Err(DeliveryError::Closed)
        }

        fn is_open(&self) -> bool {
            false
        }
    }

    #[test]
    fn insert_rejects_closed_mailboxes() {
        let mut table = AddressTable::with_capacity(1).unwrap();

        assert_eq!(
            table.insert(0, 2, Hangup, RouteFlags::NO_REPLY),
            Err(AddressError::InvalidMailbox(TaskId::Alarm))
        );
        assert!(table.lookup(2).is_err());
    }
}
