//! Underlay transport for mesh streams.
//!
//! Streams between nodes ride on plain TCP sockets; a node dialing one of its
//! own listeners gets an in-memory duplex pair instead.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

/// Buffer size of in-memory stream pairs
pub const MEMORY_STREAM_CAPACITY: usize = 64 * 1024;

/// Unified stream type carried by mesh connections
#[derive(Debug)]
pub enum MeshStream {
    /// Stream over the underlay TCP socket
    Tcp(TcpStream),
    /// Node-local stream
    Memory(DuplexStream),
}

impl AsyncRead for MeshStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MeshStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            MeshStream::Memory(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MeshStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            MeshStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            MeshStream::Memory(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            MeshStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            MeshStream::Memory(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            MeshStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            MeshStream::Memory(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl MeshStream {
    /// Create a connected pair of node-local streams
    pub fn memory_pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(MEMORY_STREAM_CAPACITY);
        (MeshStream::Memory(a), MeshStream::Memory(b))
    }

    /// Get the underlay peer address, if the stream has one
    pub fn underlay_peer(&self) -> Option<SocketAddr> {
        match self {
            MeshStream::Tcp(stream) => stream.peer_addr().ok(),
            MeshStream::Memory(_) => None,
        }
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: impl ToSocketAddrs) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_tcp(bound_addr).await.unwrap();
        let mesh_stream = MeshStream::Tcp(stream);
        assert_eq!(mesh_stream.underlay_peer(), Some(bound_addr));
    }

    #[tokio::test]
    async fn test_memory_pair_carries_bytes() {
        let (mut a, mut b) = MeshStream::memory_pair();
        assert!(a.underlay_peer().is_none());

        a.write_all(b"ping").await.unwrap();
        a.shutdown().await.unwrap();

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");
    }
}
