//! Protocol messages.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{Address, ErrorCode, RequestType, Tier};
use serde::{Deserialize, Serialize};

/// Any message exchanged between clients and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Transaction request.
    TxnRequest(TxnRequest),
    /// Transaction response.
    TxnResponse(TxnResponse),
    /// Routing lookup request.
    KeyAddressRequest(KeyAddressRequest),
    /// Routing lookup response.
    KeyAddressResponse(KeyAddressResponse),
    /// Pushed replication factor changes.
    ReplicationFactorUpdate(ReplicationFactorUpdate),
    /// A node joined or departed.
    Membership(Membership),
}

impl Message {
    /// Returns the message type code.
    #[must_use]
    pub fn type_code(&self) -> u8 {
        match self {
            Message::TxnRequest(_) => 1,
            Message::TxnResponse(_) => 2,
            Message::KeyAddressRequest(_) => 3,
            Message::KeyAddressResponse(_) => 4,
            Message::ReplicationFactorUpdate(_) => 5,
            Message::Membership(_) => 6,
        }
    }

    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] if the bytes are not a message.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// One key addressed by a [`TxnRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxnRequestTuple {
    /// The key (the client id for START_TXN).
    pub key: String,
    /// Value for writes, empty otherwise.
    pub payload: String,
    /// Number of addresses the sender has cached for the key's owner.
    pub address_cache_size: u32,
}

/// A transaction request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRequest {
    /// Request kind.
    pub request_type: RequestType,
    /// Correlation id echoed as `response_id`. May be empty.
    pub request_id: String,
    /// Where to send the response. Empty means no response is wanted.
    pub response_address: Address,
    /// Transaction id, empty for START_TXN.
    pub txn_id: String,
    /// Keys addressed.
    pub tuples: Vec<TxnRequestTuple>,
}

impl TxnRequest {
    /// Creates a request with no tuples.
    pub fn new(request_type: RequestType, txn_id: impl Into<String>) -> Self {
        Self {
            request_type,
            request_id: String::new(),
            response_address: String::new(),
            txn_id: txn_id.into(),
            tuples: Vec::new(),
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Sets the response address.
    #[must_use]
    pub fn with_response_address(mut self, address: impl Into<Address>) -> Self {
        self.response_address = address.into();
        self
    }

    /// Appends a tuple.
    #[must_use]
    pub fn with_tuple(mut self, key: impl Into<String>, payload: impl Into<String>) -> Self {
        self.tuples.push(TxnRequestTuple {
            key: key.into(),
            payload: payload.into(),
            address_cache_size: 0,
        });
        self
    }
}

/// Outcome for one key of a [`TxnResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxnResponseTuple {
    /// The key.
    pub key: String,
    /// Value read, encoded replication record, or empty.
    pub payload: String,
    /// Per-key outcome.
    pub error: ErrorCode,
    /// Tells the client to drop its cached address for the key's owner.
    pub invalidate: bool,
}

impl TxnResponseTuple {
    /// Creates a tuple with no payload.
    pub fn new(key: impl Into<String>, error: ErrorCode) -> Self {
        Self {
            key: key.into(),
            payload: String::new(),
            error,
            invalidate: false,
        }
    }

    /// Creates a tuple carrying a payload.
    pub fn with_payload(key: impl Into<String>, payload: impl Into<String>, error: ErrorCode) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            error,
            invalidate: false,
        }
    }
}

/// A transaction response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnResponse {
    /// Kind of the request answered.
    pub request_type: RequestType,
    /// The answered request's `request_id`.
    pub response_id: String,
    /// Transaction id (the new id for START_TXN).
    pub txn_id: String,
    /// Tier of the responder.
    pub tier: Tier,
    /// Overall outcome.
    pub error: ErrorCode,
    /// Per-key outcomes.
    pub tuples: Vec<TxnResponseTuple>,
}

impl TxnResponse {
    /// Creates an empty response to `request` from a worker of `tier`.
    #[must_use]
    pub fn for_request(request: &TxnRequest, tier: Tier) -> Self {
        Self {
            request_type: request.request_type,
            response_id: request.request_id.clone(),
            txn_id: request.txn_id.clone(),
            tier,
            error: ErrorCode::NoError,
            tuples: Vec::new(),
        }
    }

    /// Returns the first tuple's error, or the overall error when there are
    /// no tuples.
    #[must_use]
    pub fn first_error(&self) -> ErrorCode {
        self.tuples.first().map_or(self.error, |t| t.error)
    }
}

/// Asks the routing tier which workers own `keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAddressRequest {
    /// Correlation id.
    pub request_id: String,
    /// Where to send the answer.
    pub response_address: Address,
    /// Keys to resolve.
    pub keys: Vec<String>,
    /// TXN for transaction routing; any storage tier for data keys.
    pub tier: Tier,
}

/// Request addresses of the workers owning one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAddress {
    /// The key.
    pub key: String,
    /// Request addresses, primary first.
    pub ips: Vec<Address>,
}

/// Answer to a [`KeyAddressRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAddressResponse {
    /// The request's `request_id`.
    pub response_id: String,
    /// Tier the addresses belong to.
    pub tier: Tier,
    /// NO_SERVERS when no worker has joined.
    pub error: ErrorCode,
    /// One entry per resolved key.
    pub addresses: Vec<KeyAddress>,
}

/// A per-tier replication count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationValue {
    /// The tier.
    pub tier: Tier,
    /// Number of replicas.
    pub value: u32,
}

/// The replication record of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationFactor {
    /// The data key.
    pub key: String,
    /// Node-level replication per tier.
    pub global: Vec<ReplicationValue>,
    /// Thread-level replication per tier.
    pub local: Vec<ReplicationValue>,
}

impl ReplicationFactor {
    /// Encodes the record as the payload of a metadata response.
    ///
    /// Payloads are strings, so the CBOR bytes are hex encoded.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn to_payload(&self) -> ProtocolResult<String> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Decodes a record produced by [`ReplicationFactor::to_payload`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for malformed payloads.
    pub fn from_payload(payload: &str) -> ProtocolResult<Self> {
        if payload.len() % 2 != 0 {
            return Err(ProtocolError::Decode("odd-length replication payload".into()));
        }
        let bytes = (0..payload.len())
            .step_by(2)
            .map(|i| {
                payload
                    .get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| ProtocolError::Decode("non-hex replication payload".into()))
            })
            .collect::<ProtocolResult<Vec<u8>>>()?;
        ciborium::from_reader(bytes.as_slice()).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// A batch of replication changes pushed to a tier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicationFactorUpdate {
    /// New records.
    pub updates: Vec<ReplicationFactor>,
}

/// Cluster membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    /// A node joined `tier`.
    NodeJoin {
        /// Tier joined.
        tier: Tier,
        /// Public address of the node.
        public_ip: String,
        /// Private address of the node.
        private_ip: String,
        /// How many times this node has joined before.
        join_count: u32,
    },
    /// A node left `tier`.
    NodeDepart {
        /// Tier left.
        tier: Tier,
        /// Public address of the node.
        public_ip: String,
        /// Private address of the node.
        private_ip: String,
        /// Join count the node was registered with.
        join_count: u32,
    },
}
