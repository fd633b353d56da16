//! Connection objects wrapping an engine stream.

use crate::cancel::CancelSignal;
use crate::engine::OpenedStream;
use crate::error::{MeshError, Result};
use crate::handle::Handle;
use mesh_session::MeshStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::Dispatch;

/// How a connection came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Delivered by `accept`
    Accepted,
    /// Opened by `dial`
    Dialed,
}

/// A connection owned by the connection registry
pub struct Connection {
    handle: Handle,
    server: Handle,
    origin: Origin,
    local_addr: String,
    remote_addr: String,
    cancel: CancelSignal,
    dispatch: Dispatch,
    reader: Mutex<Option<ReadHalf<MeshStream>>>,
    writer: Mutex<Option<WriteHalf<MeshStream>>>,
}

impl Connection {
    pub(crate) fn new(
        handle: Handle,
        server: Handle,
        origin: Origin,
        opened: OpenedStream,
        dispatch: Dispatch,
    ) -> Self {
        let (reader, writer) = tokio::io::split(opened.stream);
        Self {
            handle,
            server,
            origin,
            local_addr: opened.local_addr,
            remote_addr: opened.remote_addr,
            cancel: CancelSignal::new(),
            dispatch,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Handle of this connection
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Owning server
    pub fn server(&self) -> Handle {
        self.server
    }

    /// Whether accepted or dialed
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Mesh address of this end
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Mesh address of the other end
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub(crate) fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Read into `buf`; `Ok(0)` at end of stream
    pub(crate) async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.cancel
            .guard("read", async {
                let mut reader = self.reader.lock().await;
                let reader = reader.as_mut().ok_or_else(released)?;
                reader
                    .read(buf)
                    .await
                    .map_err(|e| MeshError::Network(format!("read {}: {}", self.remote_addr, e)))
            })
            .await
    }

    /// Write all of `buf`
    pub(crate) async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.cancel
            .guard("write", async {
                let mut writer = self.writer.lock().await;
                let writer = writer.as_mut().ok_or_else(released)?;
                let io = async {
                    writer.write_all(buf).await?;
                    writer.flush().await
                };
                io.await
                    .map_err(|e| MeshError::Network(format!("write {}: {}", self.remote_addr, e)))?;
                Ok(buf.len())
            })
            .await
    }

    /// Cancel pending I/O and drop the stream halves that are free
    ///
    /// Halves held by an in-flight call are dropped with the last reference.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

fn released() -> MeshError {
    MeshError::Cancelled("connection closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HandleKind, HandleTable};
    use std::sync::Arc;

    fn pair() -> (Connection, MeshStream) {
        let mut table = HandleTable::new(HandleKind::Connection);
        let handle = table.insert_with(|h| h);
        let (near, far) = MeshStream::memory_pair();
        let opened = OpenedStream {
            stream: near,
            local_addr: "100.64.0.1:49152".to_string(),
            remote_addr: "peer:80".to_string(),
        };
        (
            Connection::new(handle, Handle::INVALID, Origin::Dialed, opened, Dispatch::none()),
            far,
        )
    }

    #[tokio::test]
    async fn test_read_write_and_eof() {
        let (conn, mut far) = pair();
        assert_eq!(conn.write(b"ping").await.unwrap(), 4);

        let mut got = [0u8; 4];
        far.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        far.write_all(b"pong").await.unwrap();
        drop(far);

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_unblocks_read() {
        let (conn, _far) = pair();
        let conn = Arc::new(conn);
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                conn.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        conn.close();
        assert!(matches!(reader.await.unwrap(), Err(MeshError::Cancelled(_))));
        assert!(matches!(conn.write(b"late").await, Err(MeshError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_close_releases_stream_to_peer() {
        let (conn, mut far) = pair();
        conn.close();
        let mut buf = Vec::new();
        assert_eq!(far.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
