//! # tierkv protocol
//!
//! Everything that crosses a worker boundary:
//!
//! - tier, request-type and error-code enums
//! - transaction, key-address, replication and membership messages
//! - the metadata key scheme for replication records
//! - CBOR encoding via [`Message::encode`] / [`Message::decode`]
//! - the [`Transport`] seam plus an in-process [`ChannelNetwork`]

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod metadata;
mod operation;
mod transport;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    KeyAddress, KeyAddressRequest, KeyAddressResponse, Membership, Message, ReplicationFactor,
    ReplicationFactorUpdate, ReplicationValue, TxnRequest, TxnRequestTuple, TxnResponse,
    TxnResponseTuple,
};
pub use metadata::{is_metadata, key_from_metadata, replication_key, METADATA_PREFIX};
pub use operation::Operation;
pub use transport::{Channel, ChannelNetwork, Envelope, RecordingTransport, Transport};
pub use types::{Address, ErrorCode, RequestType, Tier};
