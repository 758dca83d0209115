//! Message delivery.
//!
//! Workers and clients only ever see the [`Transport`] trait. The
//! [`ChannelNetwork`] delivers CBOR-encoded messages over tokio channels
//! inside one process; [`RecordingTransport`] captures outgoing messages
//! for handler tests.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::Message;
use crate::types::Address;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

/// The logical socket a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Client requests at the TXN tier.
    TxnRequest,
    /// Requests at a storage tier.
    StorageRequest,
    /// Requests at the LOG tier.
    LogRequest,
    /// Downstream responses returning to a worker.
    RequestResponse,
    /// Answers to replication record lookups.
    ReplicationResponse,
    /// Pushed replication changes.
    ReplicationChange,
    /// Key-address lookups at the routing tier.
    KeyAddress,
    /// Membership notifications.
    Membership,
    /// Responses delivered to a client.
    ClientResponse,
}

/// An encoded message delivered to a registered address.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Channel the address was registered for.
    pub channel: Channel,
    /// Destination address.
    pub address: Address,
    /// CBOR bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] if the payload is not a message.
    pub fn message(&self) -> ProtocolResult<Message> {
        Message::decode(&self.payload)
    }
}

/// Fire-and-forget message delivery.
pub trait Transport: Send + Sync {
    /// Sends `message` to `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded or the address has
    /// no live receiver.
    fn send(&self, address: &str, message: &Message) -> ProtocolResult<()>;
}

/// In-process network of tokio channels keyed by address.
#[derive(Debug, Default)]
pub struct ChannelNetwork {
    routes: RwLock<HashMap<Address, (Channel, UnboundedSender<Envelope>)>>,
}

impl ChannelNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes messages for `address` into `sender`, tagged with `channel`.
    /// Replaces any previous registration.
    pub fn register(
        &self,
        address: impl Into<Address>,
        channel: Channel,
        sender: UnboundedSender<Envelope>,
    ) {
        self.routes.write().insert(address.into(), (channel, sender));
    }

    /// Removes the route for `address`.
    pub fn unregister(&self, address: &str) -> bool {
        self.routes.write().remove(address).is_some()
    }

    /// Returns whether `address` has a route.
    #[must_use]
    pub fn is_registered(&self, address: &str) -> bool {
        self.routes.read().contains_key(address)
    }
}

impl Transport for ChannelNetwork {
    fn send(&self, address: &str, message: &Message) -> ProtocolResult<()> {
        let payload = message.encode()?;
        let routes = self.routes.read();
        let (channel, sender) =
            routes
                .get(address)
                .ok_or_else(|| ProtocolError::UnknownAddress {
                    address: address.to_string(),
                })?;

        trace!(address, code = message.type_code(), "deliver");
        sender
            .send(Envelope {
                channel: *channel,
                address: address.to_string(),
                payload,
            })
            .map_err(|_| ProtocolError::Disconnected {
                address: address.to_string(),
            })
    }
}

/// A transport that records messages instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Address, Message)>>,
    refused: Mutex<HashSet<Address>>,
}

impl RecordingTransport {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(Address, Message)> {
        self.sent.lock().clone()
    }

    /// Drains and returns everything sent so far.
    pub fn take(&self) -> Vec<(Address, Message)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Makes later sends to `address` fail as if nothing listened there.
    pub fn refuse(&self, address: impl Into<Address>) {
        self.refused.lock().insert(address.into());
    }
}

impl Transport for RecordingTransport {
    fn send(&self, address: &str, message: &Message) -> ProtocolResult<()> {
        // Round-trip through the codec so tests catch unencodable messages.
        let decoded = Message::decode(&message.encode()?)?;
        if self.refused.lock().contains(address) {
            return Err(ProtocolError::UnknownAddress {
                address: address.to_string(),
            });
        }
        self.sent.lock().push((address.to_string(), decoded));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::TxnRequest;
    use crate::types::RequestType;
    use tokio::sync::mpsc;

    fn start(client: &str) -> Message {
        Message::TxnRequest(TxnRequest::new(RequestType::StartTxn, "").with_tuple(client, ""))
    }

    #[test]
    fn network_delivers_to_registered_address() {
        let network = ChannelNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.register("tcp://a:1", Channel::TxnRequest, tx);

        network.send("tcp://a:1", &start("c1")).unwrap();
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.channel, Channel::TxnRequest);
        assert_eq!(envelope.address, "tcp://a:1");
        assert_eq!(envelope.message().unwrap(), start("c1"));
    }

    #[test]
    fn unknown_and_closed_addresses_fail() {
        let network = ChannelNetwork::new();
        let err = network.send("tcp://nowhere:1", &start("c1")).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAddress { .. }));
        assert!(err.is_retryable());

        let (tx, rx) = mpsc::unbounded_channel();
        network.register("tcp://a:1", Channel::TxnRequest, tx);
        drop(rx);
        assert!(matches!(
            network.send("tcp://a:1", &start("c1")),
            Err(ProtocolError::Disconnected { .. })
        ));

        assert!(network.unregister("tcp://a:1"));
        assert!(!network.is_registered("tcp://a:1"));
    }

    #[test]
    fn recorder_keeps_send_order() {
        let recorder = RecordingTransport::new();
        recorder.send("x", &start("c1")).unwrap();
        recorder.send("y", &start("c2")).unwrap();

        let sent = recorder.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "x");
        assert_eq!(sent[1].1, start("c2"));
        assert!(recorder.sent().is_empty());
    }

    #[test]
    fn recorder_refuses_marked_addresses() {
        let recorder = RecordingTransport::new();
        recorder.refuse("x");
        assert!(matches!(
            recorder.send("x", &start("c1")),
            Err(ProtocolError::UnknownAddress { .. })
        ));
        recorder.send("y", &start("c2")).unwrap();
        assert_eq!(recorder.take().len(), 1);
    }
}
