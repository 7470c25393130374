use crate::address::Address;
use crate::models::SocketKind;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during bridge operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Bridge not initialized")]
    NotInitialized,
    #[error("Invalid address '{address}': {reason}")]
    AddressParse { address: String, reason: String },
    #[error("Failed to bind to address: {address} ({reason})")]
    BindFailed { address: String, reason: String },
    #[error("Failed to connect to address: {address} ({reason})")]
    ConnectFailed { address: String, reason: String },
    #[error("Invalid handle {handle}: {reason}")]
    InvalidHandle { handle: i64, reason: &'static str },
    #[error("Receive timed out")]
    Timeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Handle space exhausted")]
    HandlesExhausted,
}

impl BridgeError {
    pub fn address_parse(address: &str, reason: impl Into<String>) -> Self {
        BridgeError::AddressParse {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_handle(handle: impl Into<i64>, reason: &'static str) -> Self {
        BridgeError::InvalidHandle {
            handle: handle.into(),
            reason,
        }
    }

    /// Steady-state outcomes callers are expected to loop past.
    pub fn is_expected(&self) -> bool {
        matches!(self, BridgeError::Timeout | BridgeError::SendFailed(_))
    }
}

// ---------------------------------------------------------------------------
// Socket capability
// ---------------------------------------------------------------------------

/// What every bridge socket can do regardless of its role.
pub trait Closeable: Send + Sync {
    /// Which side of the bus this socket is.
    fn kind(&self) -> SocketKind;

    /// The address the socket was created with.
    fn address(&self) -> &Address;

    /// Release the OS resources. Safe to call more than once.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BridgeError::BindFailed {
            address: "tcp://*:5556".to_string(),
            reason: "address in use".to_string(),
        };
        assert!(err.to_string().starts_with("Failed to bind to address: tcp://*:5556"));

        let err = BridgeError::invalid_handle(4u32, "unknown or closed");
        assert_eq!(err.to_string(), "Invalid handle 4: unknown or closed");
    }

    #[test]
    fn test_expected_errors() {
        assert!(BridgeError::Timeout.is_expected());
        assert!(BridgeError::SendFailed("peer reset".into()).is_expected());
        assert!(!BridgeError::ConnectionClosed.is_expected());
        assert!(!BridgeError::NotInitialized.is_expected());
    }
}
