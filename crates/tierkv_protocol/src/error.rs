//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or delivering messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Bytes could not be decoded into a message.
    #[error("decode error: {0}")]
    Decode(String),

    /// No endpoint is registered at the address.
    #[error("unknown address: {address}")]
    UnknownAddress {
        /// The address that was not found.
        address: String,
    },

    /// The endpoint at the address has shut down.
    #[error("endpoint at {address} has disconnected")]
    Disconnected {
        /// The address whose receiver is gone.
        address: String,
    },
}

impl ProtocolError {
    /// Returns true if the message may be delivered later, e.g. after the
    /// receiver restarts or registers.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UnknownAddress { .. } | Self::Disconnected { .. })
    }
}
