use homelink_common::{DeliveryError, Envelope, Mailbox};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Bounded tokio channel registered in the address table.
#[derive(Debug, Clone)]
pub struct TaskMailbox(mpsc::Sender<Envelope>);

impl TaskMailbox {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self(tx), rx)
    }
}

impl Mailbox for TaskMailbox {
    fn try_deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.0.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn is_open(&self) -> bool {
        !self.0.is_closed()
    }
}
