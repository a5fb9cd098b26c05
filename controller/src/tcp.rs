use std::net::SocketAddr;

use anyhow::Context;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

use homelink_common::{Envelope, ENVELOPE_SIZE};

use crate::ingress::Ingress;

pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind command listener at {addr}"))
}

/// Accepts connections forever; each one exchanges whole envelopes.
pub async fn serve(listener: TcpListener, ingress: Ingress) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("command listener on tcp://{addr}");
    }
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("command listener accept failed")?;
        let ingress = ingress.clone();
        tokio::spawn(async move {
            debug!("tcp: {peer} connected");
            match handle_connection(stream, &ingress).await {
                Ok(()) => debug!("tcp: {peer} closed"),
                Err(err) => warn!("tcp: {peer} dropped: {err:#}"),
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, ingress: &Ingress) -> anyhow::Result<()> {
    let mut frame = [0_u8; ENVELOPE_SIZE];
    loop {
        match stream.read_exact(&mut frame).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let command = Envelope::from_bytes(&frame)?;
        let reply = ingress.request(command).await;
        stream
            .write_all(&reply.to_bytes())
            .await
            .context("failed to write reply")?;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use homelink_common::{AddressTable, LedService, Operation, Router, TaskId};

    use super::*;
    use crate::{ingress::spawn_egress, mailbox::TaskMailbox};

    async fn start_controller() -> SocketAddr {
        let mut table = AddressTable::with_capacity(2).unwrap();
        let (tcp, tcp_rx) = TaskMailbox::channel(4);
        let (led, mut led_rx) = TaskMailbox::channel(4);
        table
            .insert(0, TaskId::Tcp.raw(), tcp, TaskId::Tcp.route_flags())
            .unwrap();
        table
            .insert(1, TaskId::Led.raw(), led, TaskId::Led.route_flags())
            .unwrap();
        let table = Arc::new(table);

        let mut led_service = LedService::new(Router::new(Arc::clone(&table), TaskId::Led));
        tokio::spawn(async move {
            while let Some(command) = led_rx.recv().await {
                led_service.handle(&command, 0);
            }
        });

        let ingress = Ingress::new(Router::new(table, TaskId::Tcp), Duration::from_millis(500));
        spawn_egress("tcp", ingress.pending(), tcp_rx);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, ingress));
        addr
    }

    async fn exchange(stream: &mut TcpStream, command: &Envelope) -> Envelope {
        stream.write_all(&command.to_bytes()).await.unwrap();
        let mut frame = [0_u8; ENVELOPE_SIZE];
        stream.read_exact(&mut frame).await.unwrap();
        Envelope::from_bytes(&frame).unwrap()
    }

    #[tokio::test]
    async fn one_reply_per_request_on_a_connection() {
        let addr = start_controller().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut set = Envelope::request(TaskId::Led.raw(), Operation::Set, 1).unwrap();
        set.write_bytes(0, &[10, 20, 30]).unwrap();
        let reply = exchange(&mut stream, &set).await;
        assert_eq!(reply.op(), Operation::Response);
        assert_eq!(reply.from, TaskId::Led.raw());
        assert_eq!(reply.dest, TaskId::Tcp.raw());

        let get = Envelope::request(TaskId::Led.raw(), Operation::Get, 1).unwrap();
        let reply = exchange(&mut stream, &get).await;
        assert_eq!(&reply.body[..4], &[10, 20, 30, 1]);
    }

    #[tokio::test]
    async fn reply_type_requests_are_refused() {
        let addr = start_controller().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let bogus = Envelope::request(TaskId::Led.raw(), Operation::Error, 1).unwrap();
        let reply = exchange(&mut stream, &bogus).await;

        assert_eq!(reply.op(), Operation::Error);
        assert_eq!(reply.body_str(), "invalid request type");
    }

    #[tokio::test]
    async fn partial_frame_then_close_produces_no_reply() {
        let addr = start_controller().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(&[0_u8; 10]).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
