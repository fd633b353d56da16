//! Listener objects: a bound virtual port plus its queue of inbound streams.

use crate::cancel::CancelSignal;
use crate::engine::{EngineBinding, Network, OpenedStream};
use crate::error::{MeshError, Result};
use crate::handle::Handle;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::Dispatch;

/// A listener owned by the listener registry
pub struct Listener {
    handle: Handle,
    server: Handle,
    network: Network,
    requested_addr: String,
    local_addr: String,
    cancel: CancelSignal,
    dispatch: Dispatch,
    // Taken one receiver at a time, so each queued stream has one taker.
    queue: tokio::sync::Mutex<mpsc::Receiver<OpenedStream>>,
    binding: Mutex<Option<Box<dyn EngineBinding>>>,
}

impl Listener {
    pub(crate) fn new(
        handle: Handle,
        server: Handle,
        network: Network,
        requested_addr: &str,
        binding: Box<dyn EngineBinding>,
        queue: mpsc::Receiver<OpenedStream>,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            handle,
            server,
            network,
            requested_addr: requested_addr.to_string(),
            local_addr: binding.local_addr(),
            cancel: CancelSignal::new(),
            dispatch,
            queue: tokio::sync::Mutex::new(queue),
            binding: Mutex::new(Some(binding)),
        }
    }

    /// Handle of this listener
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Owning server
    pub fn server(&self) -> Handle {
        self.server
    }

    /// Network kind
    pub fn network(&self) -> Network {
        self.network
    }

    /// Address as passed to `listen`
    pub fn requested_addr(&self) -> &str {
        &self.requested_addr
    }

    /// Address actually bound
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub(crate) fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Whether the listener has been closed
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the next inbound stream, in arrival order
    pub(crate) async fn next(&self) -> Result<OpenedStream> {
        self.cancel
            .guard("accept", async {
                let mut queue = self.queue.lock().await;
                queue
                    .recv()
                    .await
                    .ok_or_else(|| MeshError::Cancelled("accept cancelled: listener released".to_string()))
            })
            .await
    }

    /// Fail pending accepts and release the virtual port
    pub(crate) fn close(&self) {
        self.cancel.cancel();
        self.binding.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HandleKind, HandleTable};
    use mesh_session::MeshStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeBinding(Arc<AtomicBool>);

    impl EngineBinding for FakeBinding {
        fn local_addr(&self) -> String {
            "100.64.0.1:8080".to_string()
        }
    }

    impl Drop for FakeBinding {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn listener(released: Arc<AtomicBool>) -> (Listener, mpsc::Sender<OpenedStream>) {
        let mut table = HandleTable::new(HandleKind::Listener);
        let handle = table.insert_with(|h| h);
        let (tx, rx) = mpsc::channel(4);
        let listener = Listener::new(
            handle,
            Handle::INVALID,
            Network::Tcp,
            ":8080",
            Box::new(FakeBinding(released)),
            rx,
            Dispatch::none(),
        );
        (listener, tx)
    }

    fn opened(remote: &str) -> OpenedStream {
        OpenedStream {
            stream: MeshStream::memory_pair().0,
            local_addr: "100.64.0.1:8080".to_string(),
            remote_addr: remote.to_string(),
        }
    }

    #[tokio::test]
    async fn test_streams_delivered_in_order() {
        let (listener, tx) = listener(Arc::new(AtomicBool::new(false)));
        assert_eq!(listener.local_addr(), "100.64.0.1:8080");
        tx.send(opened("a:1")).await.unwrap();
        tx.send(opened("b:2")).await.unwrap();

        assert_eq!(listener.next().await.unwrap().remote_addr, "a:1");
        assert_eq!(listener.next().await.unwrap().remote_addr, "b:2");
    }

    #[tokio::test]
    async fn test_close_cancels_and_releases_port() {
        let released = Arc::new(AtomicBool::new(false));
        let (listener, _tx) = listener(released.clone());
        let listener = Arc::new(listener);

        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.next().await })
        };
        tokio::task::yield_now().await;
        listener.close();

        assert!(matches!(waiter.await.unwrap(), Err(MeshError::Cancelled(_))));
        assert!(released.load(Ordering::SeqCst));
        assert!(listener.is_closed());
    }
}
