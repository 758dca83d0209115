//! The transaction client.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tierkv_core::TxnId;
use tierkv_protocol::{
    Address, Channel, ChannelNetwork, Envelope, ErrorCode, KeyAddressRequest, KeyAddressResponse,
    Message, RequestType, Tier, Transport, TxnRequest, TxnResponse, TxnResponseTuple,
};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};
use tracing::{debug, trace, warn};

/// A request that has not been answered yet.
#[derive(Debug)]
struct Outstanding {
    request: TxnRequest,
    client_id: String,
    /// When the request was last sent, or parked waiting for an address.
    sent_at: Instant,
    retries: u32,
    /// TXN worker the request was sent to; `None` while waiting for an
    /// address.
    target: Option<Address>,
}

/// Issues transactions against a cluster.
///
/// Each operation returns the request id at once; responses are collected
/// with [`TxnClient::receive_async`] or awaited with [`TxnClient::wait_for`].
/// Requests go to the TXN worker owning the transaction's client id. Owner
/// addresses are looked up from the ROUTING tier and cached; a
/// WRONG_THREAD answer or an `invalidate` flag drops the cached address.
///
/// A request unanswered after [`ClientConfig::timeout`] is sent again (with
/// a fresh address lookup) up to [`ClientConfig::max_retries`] times, and
/// then answered locally with TIMEOUT.
///
/// # Example
///
/// ```rust,ignore
/// let mut client = TxnClient::connect(&network, config);
/// let id = client.start_txn("alice")?;
/// let txn = client.wait_for(&id).await?.txn_id;
/// ```
pub struct TxnClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    inbox: UnboundedReceiver<Envelope>,
    next_rid: u64,
    /// TXN worker addresses by client id.
    addresses: HashMap<String, Vec<Address>>,
    /// Client ids with an address lookup in flight.
    lookups: HashSet<String>,
    outstanding: HashMap<String, Outstanding>,
    ready: VecDeque<TxnResponse>,
}

impl fmt::Debug for TxnClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnClient")
            .field("config", &self.config)
            .field("cached", &self.addresses.len())
            .field("outstanding", &self.outstanding.len())
            .field("ready", &self.ready.len())
            .finish_non_exhaustive()
    }
}

impl TxnClient {
    /// Creates a client that sends through `transport` and receives on
    /// `inbox`. The inbox must be fed by messages sent to
    /// [`ClientConfig::response_address`].
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        inbox: UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            config,
            transport,
            inbox,
            next_rid: 0,
            addresses: HashMap::new(),
            lookups: HashSet::new(),
            outstanding: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// Registers the client's response address on `network` and creates the
    /// client.
    pub fn connect(network: &Arc<ChannelNetwork>, config: ClientConfig) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        network.register(config.response_address(), Channel::ClientResponse, sender);
        let transport: Arc<dyn Transport> = network.clone();
        Self::new(config, transport, inbox)
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of requests not yet answered.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Cached TXN worker addresses for `client_id`.
    #[must_use]
    pub fn cached_addresses(&self, client_id: &str) -> Option<&[Address]> {
        self.addresses.get(client_id).map(Vec::as_slice)
    }

    /// Starts a transaction for `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoRouting`] if the client must look up an
    /// address and has no routing address.
    pub fn start_txn(&mut self, client_id: &str) -> ClientResult<String> {
        let request = TxnRequest::new(RequestType::StartTxn, "").with_tuple(client_id, "");
        self.issue(request, client_id.to_string())
    }

    /// Reads `key` in `txn_id`.
    ///
    /// # Errors
    ///
    /// See [`TxnClient::start_txn`].
    pub fn txn_get(&mut self, txn_id: &str, key: &str) -> ClientResult<String> {
        let request = TxnRequest::new(RequestType::TxnGet, txn_id).with_tuple(key, "");
        self.issue(request, client_of(txn_id))
    }

    /// Writes `value` to `key` in `txn_id`.
    ///
    /// # Errors
    ///
    /// See [`TxnClient::start_txn`].
    pub fn txn_put(&mut self, txn_id: &str, key: &str, value: &str) -> ClientResult<String> {
        let request = TxnRequest::new(RequestType::TxnPut, txn_id).with_tuple(key, value);
        self.issue(request, client_of(txn_id))
    }

    /// Commits `txn_id`.
    ///
    /// # Errors
    ///
    /// See [`TxnClient::start_txn`].
    pub fn commit_txn(&mut self, txn_id: &str) -> ClientResult<String> {
        let client_id = client_of(txn_id);
        let request = TxnRequest::new(RequestType::CommitTxn, txn_id).with_tuple(&client_id, "");
        self.issue(request, client_id)
    }

    fn next_request_id(&mut self) -> String {
        self.next_rid += 1;
        format!("{}_{}", self.config.id_prefix(), self.next_rid)
    }

    fn issue(&mut self, request: TxnRequest, client_id: String) -> ClientResult<String> {
        let request_id = self.next_request_id();
        let request = request
            .with_request_id(request_id.clone())
            .with_response_address(self.config.response_address());
        self.outstanding.insert(
            request_id.clone(),
            Outstanding {
                request,
                client_id,
                sent_at: Instant::now(),
                retries: 0,
                target: None,
            },
        );
        if let Err(e) = self.dispatch(&request_id) {
            self.outstanding.remove(&request_id);
            return Err(e);
        }
        Ok(request_id)
    }

    /// Sends an outstanding request to its cached owner, or asks the
    /// routing tier for one.
    fn dispatch(&mut self, request_id: &str) -> ClientResult<()> {
        let Some(entry) = self.outstanding.get(request_id) else {
            return Ok(());
        };
        let client_id = entry.client_id.clone();
        let cached = self
            .addresses
            .get(&client_id)
            .and_then(|addresses| {
                addresses
                    .choose(&mut rand::thread_rng())
                    .map(|address| (address.clone(), addresses.len()))
            });

        let Some((address, cache_size)) = cached else {
            if let Some(entry) = self.outstanding.get_mut(request_id) {
                entry.target = None;
                entry.sent_at = Instant::now();
            }
            return self.query_address(&client_id);
        };

        let Some(entry) = self.outstanding.get_mut(request_id) else {
            return Ok(());
        };
        for tuple in &mut entry.request.tuples {
            tuple.address_cache_size = cache_size as u32;
        }
        entry.target = Some(address.clone());
        entry.sent_at = Instant::now();
        trace!(request_id, address, "sending");
        self.transport
            .send(&address, &Message::TxnRequest(entry.request.clone()))?;
        Ok(())
    }

    fn query_address(&mut self, client_id: &str) -> ClientResult<()> {
        if self.lookups.contains(client_id) {
            return Ok(());
        }
        let Some(routing) = self.config.routing.choose(&mut rand::thread_rng()).cloned() else {
            return Err(ClientError::NoRouting);
        };
        let request = KeyAddressRequest {
            request_id: self.next_request_id(),
            response_address: self.config.response_address(),
            keys: vec![client_id.to_string()],
            tier: Tier::Txn,
        };
        debug!(client_id, routing, "looking up transaction owner");
        self.transport
            .send(&routing, &Message::KeyAddressRequest(request))?;
        self.lookups.insert(client_id.to_string());
        Ok(())
    }

    fn forget_address(&mut self, client_id: &str) {
        if self.addresses.remove(client_id).is_some() {
            debug!(client_id, "dropping cached address");
        }
    }

    /// Processes everything already delivered, handles expired requests and
    /// returns the responses that completed. Never blocks.
    pub fn receive_async(&mut self) -> Vec<TxnResponse> {
        loop {
            match self.inbox.try_recv() {
                Ok(envelope) => self.process(&envelope),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        self.check_timeouts(Instant::now());
        self.ready.drain(..).collect()
    }

    /// Waits for the response to `request_id`. Other responses that arrive
    /// meanwhile stay queued for [`TxnClient::receive_async`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownRequest`] if `request_id` was never
    /// issued (or was already returned) and [`ClientError::Disconnected`]
    /// if the inbox closes first.
    pub async fn wait_for(&mut self, request_id: &str) -> ClientResult<TxnResponse> {
        loop {
            if let Some(position) = self
                .ready
                .iter()
                .position(|response| response.response_id == request_id)
            {
                if let Some(response) = self.ready.remove(position) {
                    return Ok(response);
                }
            }
            if !self.outstanding.contains_key(request_id) {
                return Err(ClientError::UnknownRequest(request_id.to_string()));
            }
            let Some(deadline) = self.next_deadline() else {
                return Err(ClientError::UnknownRequest(request_id.to_string()));
            };

            match tokio::time::timeout_at(deadline.into(), self.inbox.recv()).await {
                Ok(Some(envelope)) => self.process(&envelope),
                Ok(None) => return Err(ClientError::Disconnected),
                Err(_) => self.check_timeouts(Instant::now()),
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.outstanding
            .values()
            .map(|entry| entry.sent_at + self.config.timeout)
            .min()
    }

    fn process(&mut self, envelope: &Envelope) {
        match envelope.message() {
            Ok(Message::TxnResponse(response)) => self.on_response(response),
            Ok(Message::KeyAddressResponse(response)) => self.on_addresses(response),
            Ok(other) => warn!(code = other.type_code(), "unexpected message"),
            Err(e) => warn!(error = %e, "undecodable response"),
        }
    }

    fn on_addresses(&mut self, response: KeyAddressResponse) {
        for address in response.addresses {
            self.lookups.remove(&address.key);
            if !response.error.is_ok() || address.ips.is_empty() {
                // Parked requests re-query when they time out.
                debug!(client_id = address.key, error = %response.error, "no owner yet");
                continue;
            }
            self.addresses.insert(address.key.clone(), address.ips);

            let waiting: Vec<String> = self
                .outstanding
                .iter()
                .filter(|(_, entry)| entry.client_id == address.key && entry.target.is_none())
                .map(|(id, _)| id.clone())
                .collect();
            for request_id in waiting {
                if let Err(e) = self.dispatch(&request_id) {
                    warn!(request_id, error = %e, "send failed");
                }
            }
        }
    }

    fn on_response(&mut self, response: TxnResponse) {
        let Some(entry) = self.outstanding.remove(&response.response_id) else {
            debug!(response_id = %response.response_id, "late or unknown response");
            return;
        };

        let wrong_thread = response
            .tuples
            .iter()
            .any(|tuple| tuple.error == ErrorCode::WrongThread)
            || response.error == ErrorCode::WrongThread;
        let invalidate = response.tuples.iter().any(|tuple| tuple.invalidate);

        if wrong_thread || invalidate {
            self.forget_address(&entry.client_id);
        }
        if wrong_thread && entry.retries < self.config.max_retries {
            let request_id = response.response_id.clone();
            self.outstanding.insert(
                request_id.clone(),
                Outstanding {
                    retries: entry.retries + 1,
                    ..entry
                },
            );
            debug!(request_id, "wrong thread, retrying");
            if let Err(e) = self.dispatch(&request_id) {
                warn!(request_id, error = %e, "retry failed");
            }
            return;
        }
        self.ready.push_back(response);
    }

    fn check_timeouts(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .outstanding
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.sent_at) >= self.config.timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for request_id in expired {
            let Some(entry) = self.outstanding.get_mut(&request_id) else {
                continue;
            };
            if entry.retries < self.config.max_retries {
                entry.retries += 1;
                let client_id = entry.client_id.clone();
                let lookup_lost = entry.target.is_none();
                debug!(request_id, retries = entry.retries, "request timed out, retrying");
                self.forget_address(&client_id);
                if lookup_lost {
                    self.lookups.remove(&client_id);
                }
                if let Err(e) = self.dispatch(&request_id) {
                    warn!(request_id, error = %e, "retry failed");
                }
                continue;
            }

            if let Some(entry) = self.outstanding.remove(&request_id) {
                warn!(request_id, "request timed out");
                self.lookups.remove(&entry.client_id);
                self.ready.push_back(timeout_response(&entry.request));
            }
        }
    }
}

/// The client id a transaction is routed by.
fn client_of(txn_id: &str) -> String {
    TxnId::from(txn_id).client_id().to_string()
}

fn timeout_response(request: &TxnRequest) -> TxnResponse {
    let mut response = TxnResponse::for_request(request, Tier::Txn);
    response.error = ErrorCode::Timeout;
    response.tuples = request
        .tuples
        .iter()
        .map(|tuple| TxnResponseTuple::new(tuple.key.clone(), ErrorCode::Timeout))
        .collect();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tierkv_protocol::KeyAddress;

    const ROUTING: &str = "tcp://10.0.5.1:6700";
    const WORKER: &str = "tcp://10.0.1.1:6100";

    struct Harness {
        network: Arc<ChannelNetwork>,
        routing: UnboundedReceiver<Envelope>,
        worker: UnboundedReceiver<Envelope>,
    }

    impl Harness {
        fn new() -> Self {
            let network = Arc::new(ChannelNetwork::new());
            let (routing_tx, routing) = mpsc::unbounded_channel();
            let (worker_tx, worker) = mpsc::unbounded_channel();
            network.register(ROUTING, Channel::KeyAddress, routing_tx);
            network.register(WORKER, Channel::TxnRequest, worker_tx);
            Self {
                network,
                routing,
                worker,
            }
        }

        fn client(&self, timeout: Duration) -> TxnClient {
            let config = ClientConfig::new("34.0.9.1", 0)
                .with_routing(vec![ROUTING.into()])
                .with_timeout(timeout)
                .with_max_retries(1);
            TxnClient::connect(&self.network, config)
        }

        fn lookup(&mut self) -> KeyAddressRequest {
            match self.routing.try_recv().unwrap().message().unwrap() {
                Message::KeyAddressRequest(request) => request,
                other => panic!("unexpected {other:?}"),
            }
        }

        fn request(&mut self) -> TxnRequest {
            match self.worker.try_recv().unwrap().message().unwrap() {
                Message::TxnRequest(request) => request,
                other => panic!("unexpected {other:?}"),
            }
        }

        fn answer_lookup(&self, lookup: &KeyAddressRequest, ips: Vec<Address>) {
            let response = KeyAddressResponse {
                response_id: lookup.request_id.clone(),
                tier: Tier::Txn,
                error: ErrorCode::NoError,
                addresses: vec![KeyAddress {
                    key: lookup.keys[0].clone(),
                    ips,
                }],
            };
            self.network
                .send(&lookup.response_address, &Message::KeyAddressResponse(response))
                .unwrap();
        }

        fn answer(&self, request: &TxnRequest, error: ErrorCode, invalidate: bool) {
            let mut response = TxnResponse::for_request(request, Tier::Txn);
            let mut tuple = TxnResponseTuple::new(request.tuples[0].key.clone(), error);
            tuple.invalidate = invalidate;
            response.tuples.push(tuple);
            self.network
                .send(&request.response_address, &Message::TxnResponse(response))
                .unwrap();
        }
    }

    #[test]
    fn miss_parks_request_until_address_arrives() {
        let mut harness = Harness::new();
        let mut client = harness.client(Duration::from_secs(10));

        let id = client.start_txn("alice").unwrap();
        assert_eq!(id, "34.0.9.1:0_1");
        let lookup = harness.lookup();
        assert_eq!(lookup.keys, vec!["alice"]);
        assert_eq!(lookup.tier, Tier::Txn);
        assert!(harness.worker.try_recv().is_err());

        harness.answer_lookup(&lookup, vec![WORKER.into()]);
        assert!(client.receive_async().is_empty());
        let request = harness.request();
        assert_eq!(request.request_id, id);
        assert_eq!(request.tuples[0].address_cache_size, 1);

        harness.answer(&request, ErrorCode::NoError, false);
        let responses = client.receive_async();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].response_id, id);
        assert_eq!(client.outstanding(), 0);
    }

    #[test]
    fn one_lookup_per_client_id() {
        let mut harness = Harness::new();
        let mut client = harness.client(Duration::from_secs(10));
        client.start_txn("alice").unwrap();
        client.txn_get("alice-1:1", "k").unwrap();
        harness.lookup();
        assert!(harness.routing.try_recv().is_err());
        assert_eq!(client.outstanding(), 2);
    }

    #[test]
    fn wrong_thread_evicts_and_retries() {
        let mut harness = Harness::new();
        let mut client = harness.client(Duration::from_secs(10));
        let id = client.txn_put("alice-1:1", "k", "v").unwrap();
        let lookup = harness.lookup();
        harness.answer_lookup(&lookup, vec![WORKER.into()]);
        client.receive_async();
        let request = harness.request();

        harness.answer(&request, ErrorCode::WrongThread, false);
        assert!(client.receive_async().is_empty());
        assert!(client.cached_addresses("alice").is_none());
        let again = harness.lookup();
        assert_eq!(again.keys, vec!["alice"]);

        harness.answer_lookup(&again, vec![WORKER.into()]);
        client.receive_async();
        let retried = harness.request();
        assert_eq!(retried.request_id, id);
    }

    #[test]
    fn invalidate_evicts_but_delivers() {
        let mut harness = Harness::new();
        let mut client = harness.client(Duration::from_secs(10));
        client.start_txn("alice").unwrap();
        let lookup = harness.lookup();
        harness.answer_lookup(&lookup, vec![WORKER.into()]);
        client.receive_async();
        let request = harness.request();

        harness.answer(&request, ErrorCode::NoError, true);
        assert_eq!(client.receive_async().len(), 1);
        assert!(client.cached_addresses("alice").is_none());
    }

    #[test]
    fn missing_routing_is_an_error() {
        let network = Arc::new(ChannelNetwork::new());
        let mut client = TxnClient::connect(&network, ClientConfig::default());
        assert!(matches!(
            client.start_txn("alice"),
            Err(ClientError::NoRouting)
        ));
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let mut harness = Harness::new();
        let mut client = harness.client(Duration::from_millis(30));
        let id = client.start_txn("alice").unwrap();

        let response = client.wait_for(&id).await.unwrap();
        assert_eq!(response.error, ErrorCode::Timeout);
        assert_eq!(response.tuples[0].error, ErrorCode::Timeout);
        assert_eq!(response.request_type, RequestType::StartTxn);
        // The first lookup and its retry.
        harness.lookup();
        harness.lookup();
        assert!(harness.routing.try_recv().is_err());
        assert!(matches!(
            client.wait_for(&id).await,
            Err(ClientError::UnknownRequest(_))
        ));
    }
}
