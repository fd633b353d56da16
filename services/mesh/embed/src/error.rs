//! Error taxonomy and status codes of the embedded runtime.

use thiserror::Error;

/// Errors reported by runtime operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Setter called after start, or a setter value that cannot be used
    #[error("{0}")]
    Config(String),

    /// Operation not valid in the handle's current lifecycle state
    #[error("{0}")]
    State(String),

    /// Engine-level join, auth or connect failure
    #[error("{0}")]
    Network(String),

    /// Unsupported network kind or unusable listen address
    #[error("{0}")]
    Listen(String),

    /// Unknown or already-closed handle
    #[error("{0}")]
    Handle(String),

    /// Blocking call interrupted by a concurrent close
    #[error("{0}")]
    Cancelled(String),
}

impl MeshError {
    /// Status code reported across the flat surface
    pub fn status(&self) -> Status {
        match self {
            MeshError::Config(_) => Status::ConfigError,
            MeshError::State(_) => Status::StateError,
            MeshError::Network(_) => Status::NetworkError,
            MeshError::Listen(_) => Status::ListenError,
            MeshError::Handle(_) => Status::HandleError,
            MeshError::Cancelled(_) => Status::Cancelled,
        }
    }
}

/// Result alias used throughout the runtime
pub type Result<T> = std::result::Result<T, MeshError>;

/// Status codes of the flat call surface
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Success
    Ok = 0,
    /// Configuration rejected
    ConfigError = 1,
    /// Invalid for the current state
    StateError = 2,
    /// Engine failure
    NetworkError = 3,
    /// Listen failure
    ListenError = 4,
    /// Bad handle
    HandleError = 5,
    /// Interrupted by close
    Cancelled = 6,
}

impl Status {
    /// Raw integer value
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether this is the success status
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl<T> From<&Result<T>> for Status {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(MeshError::Config(String::new()).status().code(), 1);
        assert_eq!(MeshError::State(String::new()).status().code(), 2);
        assert_eq!(MeshError::Network(String::new()).status().code(), 3);
        assert_eq!(MeshError::Listen(String::new()).status().code(), 4);
        assert_eq!(MeshError::Handle(String::new()).status().code(), 5);
        assert_eq!(MeshError::Cancelled(String::new()).status().code(), 6);
    }

    #[test]
    fn test_status_from_result() {
        let ok: Result<u8> = Ok(1);
        let failed: Result<u8> = Err(MeshError::Listen("address in use".to_string()));
        assert!(Status::from(&ok).is_ok());
        assert_eq!(Status::from(&failed), Status::ListenError);
    }
}
