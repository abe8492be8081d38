//! Transport port: how a session obtains a byte stream to a server.
//!
//! Sessions only need an ordered, bidirectional byte stream. Production code
//! uses [`TcpConnector`]; tests inject in-memory streams.

use std::io;

use async_trait::async_trait;
use protocol::ServerAddress;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// An ordered bidirectional byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports to job servers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new stream to `address`.
    ///
    /// # Errors
    ///
    /// Any I/O error from resolving or connecting.
    async fn connect(&self, address: &ServerAddress) -> io::Result<BoxedTransport>;
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &ServerAddress) -> io::Result<BoxedTransport> {
        let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        // Packets are small and latency-sensitive.
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
