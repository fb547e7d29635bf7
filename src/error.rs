//! Error types for the synapse crate
//!
//! Every failure mode is recoverable at the call site; nothing in the crate
//! aborts on bad input. Queue exhaustion and handler/executor failures are
//! additionally tracked through counters on the owning component, so hosts
//! can observe loss without unwinding.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, SynapseError>;

/// Error conditions surfaced by the coordination core
#[derive(Debug, Error)]
pub enum SynapseError {
    /// A bounded queue cannot accept more records; the caller decides
    /// whether to drop, count, or escalate
    #[error("queue full")]
    QueueFull,

    /// Send targeted an agent id with no registration
    #[error("unknown recipient: {0:#010x}")]
    UnknownRecipient(u32),

    /// Message header or payload constraints violated
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Byte stream could not be decoded into records
    #[error("codec error: {0}")]
    Codec(String),

    /// Operation issued after `stop`
    #[error("component is shutting down")]
    ShuttingDown,
}

impl SynapseError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid message error
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(SynapseError::QueueFull.to_string(), "queue full");
        assert_eq!(
            SynapseError::UnknownRecipient(0xffff_ffff).to_string(),
            "unknown recipient: 0xffffffff"
        );
        assert_eq!(
            SynapseError::config("bad capacity").to_string(),
            "configuration error: bad capacity"
        );
    }
}
