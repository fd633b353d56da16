//! Last-error tracking per handle.

use crate::error::Result;
use crate::handle::Handle;
use dashmap::DashMap;
use parking_lot::Mutex;

/// Records the outcome of the most recent operation on each handle
///
/// Handles that no registry recognises share a single global slot.
#[derive(Default)]
pub struct ErrorReporter {
    slots: DashMap<Handle, String>,
    global: Mutex<String>,
}

impl ErrorReporter {
    /// Create an empty reporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of `op` on a live handle
    pub fn record<T>(&self, handle: Handle, op: &str, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.slots.remove(&handle);
            }
            Err(e) => {
                self.slots.insert(handle, format!("{}: {}", op, e));
            }
        }
    }

    /// Record the outcome of `op` in the global slot
    pub fn record_global<T>(&self, op: &str, result: &Result<T>) {
        let mut global = self.global.lock();
        match result {
            Ok(_) => global.clear(),
            Err(e) => *global = format!("{}: {}", op, e),
        }
    }

    /// Message for a handle; empty after a success
    pub fn message(&self, handle: Handle) -> String {
        self.slots
            .get(&handle)
            .map(|msg| msg.value().clone())
            .unwrap_or_default()
    }

    /// Message held in the global slot
    pub fn global_message(&self) -> String {
        self.global.lock().clone()
    }

    /// Drop the slot of a closed handle
    pub fn forget(&self, handle: Handle) {
        self.slots.remove(&handle);
    }

    /// Number of handles currently holding a message
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no handle holds a message
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use crate::handle::{HandleKind, HandleTable};

    #[test]
    fn test_latest_outcome_wins() {
        let mut table = HandleTable::new(HandleKind::Server);
        let handle = table.insert_with(|_| ());
        let reporter = ErrorReporter::new();

        let failed: Result<()> = Err(MeshError::State("server is not up".to_string()));
        reporter.record(handle, "listen", &failed);
        assert_eq!(reporter.message(handle), "listen: server is not up");

        let other: Result<()> = Err(MeshError::Network("connection refused".to_string()));
        reporter.record(handle, "dial", &other);
        assert_eq!(reporter.message(handle), "dial: connection refused");

        reporter.record(handle, "up", &Ok(()));
        assert_eq!(reporter.message(handle), "");
        assert!(reporter.is_empty());
    }

    #[test]
    fn test_global_slot_and_forget() {
        let reporter = ErrorReporter::new();
        let failed: Result<()> = Err(MeshError::Handle("unknown server handle".to_string()));
        reporter.record_global("start", &failed);
        assert_eq!(reporter.global_message(), "start: unknown server handle");
        reporter.record_global("start", &Ok(()));
        assert_eq!(reporter.global_message(), "");

        let handle = Handle::from_raw(1 << 62 | 1 << 32);
        reporter.record(handle, "accept", &failed);
        assert_eq!(reporter.len(), 1);
        reporter.forget(handle);
        assert_eq!(reporter.message(handle), "");
    }
}
