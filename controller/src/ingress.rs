//! Relay-and-wait path shared by the TCP, cloud and HTTP transports.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use homelink_common::{Envelope, RouteError, Router};

use crate::{mailbox::TaskMailbox, replies::PendingReplies};

pub type Waiters = PendingReplies<oneshot::Sender<Envelope>>;

#[derive(Clone)]
pub struct Ingress {
    router: Router<TaskMailbox>,
    pending: Arc<Waiters>,
    timeout: Duration,
}

impl Ingress {
    pub fn new(router: Router<TaskMailbox>, timeout: Duration) -> Self {
        Self {
            router,
            pending: Arc::new(Waiters::new()),
            timeout,
        }
    }

    pub fn pending(&self) -> Arc<Waiters> {
        Arc::clone(&self.pending)
    }

    /// Relays `command` and waits for its reply. Always yields exactly one
    /// envelope: the destination's reply or a locally built ERROR.
    pub async fn request(&self, command: Envelope) -> Envelope {
        self.request_with_id(command, None).await
    }

    /// Same as `request`, but correlates on a caller-chosen transmission id.
    pub async fn request_with_id(&self, mut command: Envelope, transmission_id: Option<u8>) -> Envelope {
        command.from = self.router.id().raw();
        if !command.op().is_request() {
            return command.error_reply("invalid request type");
        }

        let (tx, rx) = oneshot::channel();
        let allocated = match transmission_id {
            Some(id) => self.pending.register(id, tx).map(|()| id),
            None => self.pending.allocate(tx),
        };
        let transmission_id = match allocated {
            Ok(id) => id,
            Err(err) => {
                warn!("{}: cannot correlate request: {err}", self.router.id());
                return command.error_reply("too many requests in flight");
            }
        };
        command.transmission_id = transmission_id;

        if let Err(err) = self.router.relay(command.clone(), transmission_id) {
            self.pending.take(transmission_id);
            debug!("{}: relay to {} failed: {err}", self.router.id(), command.dest);
            return command.error_reply(err.status_text());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => command.error_reply("reply dropped"),
            Err(_) => {
                self.pending.take(transmission_id);
                debug!(
                    "{}: no reply from {} for transmission {transmission_id}",
                    self.router.id(),
                    command.dest
                );
                command.error_reply("reply timeout")
            }
        }
    }

    /// Fire-and-forget relay with transmission id 0; any reply is discarded.
    pub fn post(&self, command: Envelope) -> Result<(), RouteError> {
        self.router.relay(command, 0)
    }
}

/// Drains a transport's mailbox and hands each reply to its waiter.
pub fn spawn_egress(name: &'static str, pending: Arc<Waiters>, mut rx: mpsc::Receiver<Envelope>) {
    tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            match pending.take(reply.transmission_id) {
                Some(waiter) => {
                    if waiter.send(reply).is_err() {
                        debug!("{name}: waiter gone before reply arrived");
                    }
                }
                None => debug!(
                    "{name}: discarding late or unsolicited reply {:?}",
                    reply
                ),
            }
        }
        debug!("{name}: egress mailbox closed");
    });
}
