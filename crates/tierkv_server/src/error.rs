//! Error types for tierkv workers.

use thiserror::Error;
use tierkv_core::CoreError;
use tierkv_protocol::{Channel, ProtocolError, Tier};

/// Result type for worker operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while starting or running a worker.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Encoding, decoding or delivery failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A store, registry or log operation failed.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A message arrived on a channel that does not carry it.
    #[error("unexpected message type {code} on {channel:?}")]
    UnexpectedMessage {
        /// Channel the envelope was delivered on.
        channel: Channel,
        /// Type code of the decoded message.
        code: u8,
    },

    /// A handler was invoked on a worker of the wrong tier.
    #[error("{tier} worker cannot serve {what}")]
    WrongTier {
        /// Tier of the worker.
        tier: Tier,
        /// What was requested.
        what: &'static str,
    },

    /// The cluster could not be started.
    #[error("cluster error: {0}")]
    Cluster(String),
}

impl ServerError {
    /// Creates a wrong-tier error.
    pub fn wrong_tier(tier: Tier, what: &'static str) -> Self {
        Self::WrongTier { tier, what }
    }

    /// Creates a cluster startup error.
    pub fn cluster(message: impl Into<String>) -> Self {
        Self::Cluster(message.into())
    }
}
