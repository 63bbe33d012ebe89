//! Transport seam: how a client reaches the relay.
//!
//! The [`Connector`] trait abstracts dialing so tests can substitute an
//! in-memory or scripted transport; production code uses [`TcpConnector`].

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Opens the persistent bidirectional socket to the relay.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The stream type produced by a successful dial.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Dial the relay at `endpoint`.
    async fn connect(&self, endpoint: &str) -> io::Result<Self::Stream>;
}

/// Plain TCP transport (`host:port` endpoints).
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, endpoint: &str) -> io::Result<Self::Stream> {
        let stream = TcpStream::connect(endpoint).await?;
        // Frames are small and latency-sensitive.
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_dials_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = TcpConnector
            .connect(&addr.to_string())
            .await
            .expect("connect");
        assert!(stream.peer_addr().is_ok());
        accept.await.expect("join").expect("accept");
    }

    #[tokio::test]
    async fn test_tcp_connector_reports_refused() {
        // Port 1 on localhost is essentially never listening.
        let result = TcpConnector.connect("127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
