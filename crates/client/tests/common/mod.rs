//! Shared harness for the client integration tests.
//!
//! [`DuplexConnector`] hands the client one end of an in-memory duplex stream
//! per connection and passes the other end to the test, which plays the job
//! server through a [`FakeServer`].

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use client::{BoxedTransport, Connector, PacketCodec};
use futures::{SinkExt, StreamExt};
use protocol::{Packet, PacketType, ServerAddress};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// Upper bound on any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Connector whose connections land in the test instead of on a socket.
pub struct DuplexConnector {
    accepted: mpsc::UnboundedSender<(ServerAddress, DuplexStream)>,
}

impl DuplexConnector {
    pub fn new() -> (Arc<Self>, ServerEnds) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        (Arc::new(Self { accepted }), ServerEnds { incoming })
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, address: &ServerAddress) -> io::Result<BoxedTransport> {
        let (client_end, server_end) = tokio::io::duplex(DUPLEX_CAPACITY);
        self.accepted
            .send((address.clone(), server_end))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "test harness gone"))?;
        Ok(Box::new(client_end))
    }
}

/// Connector that refuses every connection.
pub struct RefusingConnector;

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(&self, _address: &ServerAddress) -> io::Result<BoxedTransport> {
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"))
    }
}

/// Server ends of the connections the client opened, in connect order.
pub struct ServerEnds {
    incoming: mpsc::UnboundedReceiver<(ServerAddress, DuplexStream)>,
}

impl ServerEnds {
    pub async fn accept(&mut self) -> FakeServer {
        let (address, stream) = timeout(WAIT, self.incoming.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped");
        FakeServer {
            address,
            framed: Framed::new(stream, PacketCodec::default()),
        }
    }

    /// Returns `true` if no connection is waiting to be accepted.
    pub fn is_idle(&mut self) -> bool {
        self.incoming.try_recv().is_err()
    }
}

/// The test's side of one connection.
pub struct FakeServer {
    pub address: ServerAddress,
    framed: Framed<DuplexStream, PacketCodec>,
}

impl FakeServer {
    /// Next packet written by the client.
    pub async fn next_request(&mut self) -> Packet {
        timeout(WAIT, self.framed.next())
            .await
            .expect("timed out waiting for a request")
            .expect("client closed the connection")
            .expect("client sent an invalid packet")
    }

    /// Waits for the client to close its end.
    pub async fn expect_closed(&mut self) {
        let next = timeout(WAIT, self.framed.next())
            .await
            .expect("timed out waiting for the client to disconnect");
        assert!(next.is_none(), "expected EOF, got {next:?}");
    }

    pub async fn reply(&mut self, kind: PacketType, args: &[&[u8]]) {
        let packet = Packet::response(kind, args.iter().map(|a| a.to_vec()).collect())
            .expect("valid response packet");
        self.framed.send(packet).await.expect("write response");
    }

    pub async fn job_created(&mut self, handle: &str) {
        self.reply(PacketType::JobCreated, &[handle.as_bytes()]).await;
    }

    /// Writes bytes that need not be a valid packet.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.expect("write raw bytes");
        stream.flush().await.expect("flush raw bytes");
    }
}
