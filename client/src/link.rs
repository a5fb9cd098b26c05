use std::time::Duration;

use anyhow::Context;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use homelink_common::{Envelope, ENVELOPE_SIZE};

/// One TCP connection to the controller's command listener.
pub struct Link {
    stream: TcpStream,
    timeout: Duration,
}

impl Link {
    pub async fn connect(addr: &str, timeout_after: Duration) -> anyhow::Result<Self> {
        let stream = timeout(timeout_after, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to {addr}"))?
            .with_context(|| format!("failed to connect to {addr}"))?;
        debug!("connected to {addr}");
        Ok(Self {
            stream,
            timeout: timeout_after,
        })
    }

    /// Sends one envelope and waits for the single reply it produces.
    pub async fn exchange(&mut self, command: &Envelope) -> anyhow::Result<Envelope> {
        debug!("-> {:?}", command);
        self.stream
            .write_all(&command.to_bytes())
            .await
            .context("failed to send command")?;

        let mut frame = [0_u8; ENVELOPE_SIZE];
        timeout(self.timeout, self.stream.read_exact(&mut frame))
            .await
            .context("timed out waiting for reply")?
            .context("connection closed before a full reply arrived")?;
        let reply = Envelope::from_bytes(&frame)?;
        debug!("<- {:?}", reply);
        Ok(reply)
    }
}
