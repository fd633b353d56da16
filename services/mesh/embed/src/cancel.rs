//! Cancellation signal owned by every handle.

use crate::error::{MeshError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// One-shot signal raised when a handle is closed
#[derive(Clone, Debug)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Create a signal that has not been raised
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal, waking every waiter
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has been raised
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is raised
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Run `fut` unless the signal is raised first
    pub async fn guard<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;

            _ = self.cancelled() => Err(MeshError::Cancelled(format!("{} cancelled by close", what))),
            result = fut => result,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_guard_returns_cancelled_when_raised() {
        let signal = CancelSignal::new();
        let raiser = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            raiser.cancel();
        });

        let result: Result<()> = signal
            .guard("accept", std::future::pending::<Result<()>>())
            .await;
        assert!(matches!(result, Err(MeshError::Cancelled(_))));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_raised_wins_over_ready_future() {
        let signal = CancelSignal::new();
        signal.cancel();
        let result = signal.guard("read", async { Ok(5) }).await;
        assert!(matches!(result, Err(MeshError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_unraised_signal_passes_result_through() {
        let untouched = CancelSignal::new().guard("dial", async { Ok(1) }).await;
        assert_eq!(untouched, Ok(1));
    }
}
