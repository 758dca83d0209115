//! Error types for the transaction client.

use thiserror::Error;
use tierkv_protocol::ProtocolError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur while issuing or awaiting requests.
///
/// Cluster-side outcomes (KEY_DNE, FAILED_OP, TIMEOUT, ...) are not errors
/// here; they arrive as the `error` of a response.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Encoding, decoding or delivery failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The client has no routing address to ask for key owners.
    #[error("no routing addresses configured")]
    NoRouting,

    /// The request id is neither outstanding nor answered.
    #[error("unknown request id: {0}")]
    UnknownRequest(String),

    /// The response inbox was closed.
    #[error("client inbox closed")]
    Disconnected,
}

impl ClientError {
    /// Returns true if repeating the call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Protocol(e) => e.is_retryable(),
            _ => false,
        }
    }
}
