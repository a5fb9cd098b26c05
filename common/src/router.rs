//! Relay, reply and status-reply primitives shared by every task.
//!
//! All delivery is a single non-blocking attempt; a full mailbox is reported to
//! the caller and never retried here.

use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::{
    address::{AddressError, AddressTable, DeliveryError, Mailbox},
    envelope::{Envelope, Operation},
    task::{RouteFlags, TaskId},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no such destination {0}")]
    NoSuchDestination(u8),
    #[error("destination {0} is reply-only")]
    ReplyOnly(u8),
    #[error("mailbox of {dest} is {reason}")]
    Undeliverable { dest: u8, reason: DeliveryError },
}

impl RouteError {
    /// Short text suitable for an ERROR envelope body.
    pub fn status_text(&self) -> &'static str {
        match self {
            Self::NoSuchDestination(_) => "no such destination",
            Self::ReplyOnly(_) => "destination is reply-only",
            Self::Undeliverable {
                reason: DeliveryError::Full,
                ..
            } => "destination mailbox full",
            Self::Undeliverable {
                reason: DeliveryError::Closed,
                ..
            } => "destination unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The recipient asked not to receive replies; nothing was enqueued.
    Suppressed,
}

/// Routing handle owned by one task. Cloning is cheap; the table is shared.
#[derive(Debug)]
pub struct Router<M> {
    table: Arc<AddressTable<M>>,
    id: TaskId,
}

impl<M> Clone for Router<M> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            id: self.id,
        }
    }
}

impl<M: Mailbox> Router<M> {
    pub fn new(table: Arc<AddressTable<M>>, id: TaskId) -> Self {
        Self { table, id }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Same table, acting on behalf of another task.
    pub fn for_task(&self, id: TaskId) -> Self {
        Self {
            table: Arc::clone(&self.table),
            id,
        }
    }

    /// Forwards `command` to `command.dest`, stamping `from` and
    /// `transmission_id`. `dest` is left untouched.
    pub fn relay(&self, mut command: Envelope, transmission_id: u8) -> Result<(), RouteError> {
        let dest = command.dest;
        let (mailbox, flags) = self.resolve(dest)?;
        if flags.contains(RouteFlags::ONLY_REPLY) {
            return Err(RouteError::ReplyOnly(dest));
        }

        command.from = self.id.raw();
        command.transmission_id = transmission_id;
        mailbox
            .try_deliver(command)
            .map_err(|reason| RouteError::Undeliverable { dest, reason })
    }

    /// Sends `response` back to the sender of `original` as a RESPONSE carrying
    /// the original command id.
    pub fn reply(&self, original: &Envelope, response: Envelope) -> Result<Delivery, RouteError> {
        self.send_reply(original, response, Operation::Response)
    }

    /// Builds a minimal reply whose body is `text`.
    pub fn status_reply(
        &self,
        original: &Envelope,
        op: Operation,
        text: &str,
    ) -> Result<Delivery, RouteError> {
        let mut response = Envelope::default();
        response.write_str(text);
        self.send_reply(original, response, op)
    }

    fn send_reply(
        &self,
        original: &Envelope,
        mut response: Envelope,
        op: Operation,
    ) -> Result<Delivery, RouteError> {
        let dest = original.from;
        let (mailbox, flags) = self.resolve(dest)?;
        if flags.contains(RouteFlags::NO_REPLY) {
            debug!(
                "{} skipping {} reply to {dest}: replies suppressed",
                self.id,
                op.as_str()
            );
            return Ok(Delivery::Suppressed);
        }

        response.from = self.id.raw();
        response.dest = dest;
        response.header = original.header.with_op(op);
        response.transmission_id = original.transmission_id;
        mailbox
            .try_deliver(response)
            .map(|()| Delivery::Delivered)
            .map_err(|reason| RouteError::Undeliverable { dest, reason })
    }

    fn resolve(&self, dest: u8) -> Result<(&M, RouteFlags), RouteError> {
        self.table.lookup(dest).map_err(|err| match err {
            AddressError::NotFound(id) => RouteError::NoSuchDestination(id),
            _ => RouteError::NoSuchDestination(dest),
        })
    }
}
