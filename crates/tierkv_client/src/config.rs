//! Configuration for the transaction client.

use std::time::Duration;
use tierkv_protocol::Address;

/// Port clients receive responses on, offset by the client thread id.
const CLIENT_RESPONSE_PORT: u32 = 6900;

/// Configuration for a [`TxnClient`](crate::TxnClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Address of the client host.
    pub ip: String,
    /// Client thread id; distinguishes clients sharing a host.
    pub tid: u32,
    /// Key-address request addresses of the ROUTING tier.
    pub routing: Vec<Address>,
    /// How long a request may go unanswered before it is retried.
    pub timeout: Duration,
    /// Retries after a timeout before the request is answered TIMEOUT.
    pub max_retries: u32,
}

impl ClientConfig {
    /// Creates a configuration for client `tid` on `ip`.
    pub fn new(ip: impl Into<String>, tid: u32) -> Self {
        Self {
            ip: ip.into(),
            tid,
            routing: Vec::new(),
            timeout: Duration::from_secs(10),
            max_retries: 1,
        }
    }

    /// Sets the routing addresses.
    #[must_use]
    pub fn with_routing(mut self, routing: Vec<Address>) -> Self {
        self.routing = routing;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how often a timed-out request is retried.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The address responses are delivered to.
    #[must_use]
    pub fn response_address(&self) -> Address {
        format!("tcp://{}:{}", self.ip, CLIENT_RESPONSE_PORT + self.tid)
    }

    /// Prefix of every request id this client issues.
    #[must_use]
    pub fn id_prefix(&self) -> String {
        format!("{}:{}", self.ip, self.tid)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 0)
    }
}
