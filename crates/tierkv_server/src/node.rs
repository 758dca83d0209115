//! State owned by one worker thread.

use crate::error::{ServerError, ServerResult};
use crate::pending::{InFlight, Parked, PendingTable};
use crate::routing::{self, Resolution, Router};
use crate::session::SessionTable;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tierkv_core::{
    open_store, ClusterConfig, ConcurrencyStore, CoreError, HashRings, LogStore, ServerThread,
    TxnRegistry,
};
use tierkv_protocol::{
    Channel, Envelope, ErrorCode, Message, ReplicationFactor, Tier, Transport, TxnRequest,
    TxnResponse, TxnResponseTuple,
};
use tierkv_storage::FileBackend;
use tracing::{debug, info, warn};

/// The tier-specific state of a worker.
pub enum TierState {
    /// Open transactions of a TXN worker.
    Txn(TxnRegistry),
    /// Concurrency-control store of a MEMORY or DISK worker.
    Storage(Box<dyn ConcurrencyStore>),
    /// Write-ahead log of a LOG worker.
    Log(LogStore),
    /// ROUTING workers keep no data.
    Routing,
}

impl fmt::Debug for TierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierState::Txn(registry) => f.debug_tuple("Txn").field(&registry.len()).finish(),
            TierState::Storage(store) => f
                .debug_struct("Storage")
                .field("protocol", &store.protocol())
                .field("keys", &store.len())
                .finish(),
            TierState::Log(log) => f.debug_tuple("Log").field(log).finish(),
            TierState::Routing => f.write_str("Routing"),
        }
    }
}

/// One worker: its identity, ring view, pending tables and tier state.
///
/// Every handler runs to completion on `&mut Node`; waiting for another
/// worker is expressed by parking state in one of the pending tables.
pub struct Node {
    pub(crate) config: Arc<ClusterConfig>,
    pub(crate) tier: Tier,
    pub(crate) thread: ServerThread,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) router: Router,
    /// Requests waiting for a replication record.
    pub(crate) parked: PendingTable<Parked>,
    /// Requests waiting for a downstream reply, by downstream request id.
    pub(crate) in_flight: PendingTable<InFlight>,
    pub(crate) sessions: SessionTable,
    pub(crate) state: TierState,
    /// Replication records this thread serves as metadata owner.
    pub(crate) metadata: HashMap<String, ReplicationFactor>,
    next_request: u64,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("tier", &self.tier)
            .field("thread", &self.thread)
            .field("parked", &self.parked.len())
            .field("in_flight", &self.in_flight.len())
            .field("sessions", &self.sessions.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Creates the worker `thread` of `tier`.
    ///
    /// Storage workers open their store under `<disk_root>/<private_ip>`;
    /// LOG workers journal to `<log_dir>/<private_ip>/<tid>.log` when a log
    /// directory is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the log journal cannot be opened.
    pub fn new(
        config: Arc<ClusterConfig>,
        tier: Tier,
        thread: ServerThread,
        rings: HashRings,
        transport: Arc<dyn Transport>,
    ) -> ServerResult<Self> {
        let state = match tier {
            Tier::Txn => TierState::Txn(TxnRegistry::new()),
            Tier::Memory | Tier::Disk => {
                let root = config.disk_root.join(thread.private_ip());
                TierState::Storage(open_store(config.protocol_for(tier), &root, thread.tid())?)
            }
            Tier::Log => match &config.log_dir {
                Some(dir) => {
                    let path = dir
                        .join(thread.private_ip())
                        .join(format!("{}.log", thread.tid()));
                    let backend = FileBackend::open(&path).map_err(CoreError::from)?;
                    TierState::Log(LogStore::open(Box::new(backend))?)
                }
                None => TierState::Log(LogStore::new()),
            },
            Tier::Routing => TierState::Routing,
        };
        info!(%tier, thread = %thread, "worker state ready");

        let router = Router::new(rings, &config, rand::random());
        Ok(Self {
            config,
            tier,
            thread,
            transport,
            router,
            parked: PendingTable::new(),
            in_flight: PendingTable::new(),
            sessions: SessionTable::new(),
            state,
            metadata: HashMap::new(),
            next_request: 0,
        })
    }

    /// Decodes `envelope` and runs the handler of its channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not decode, the message does not
    /// belong on the channel, or the handler is not served by this tier.
    pub fn handle(&mut self, envelope: &Envelope) -> ServerResult<()> {
        match (envelope.channel, envelope.message()?) {
            (Channel::TxnRequest, Message::TxnRequest(request)) => {
                self.user_txn_request_handler(request)
            }
            (Channel::StorageRequest, Message::TxnRequest(request)) => {
                self.storage_request_handler(request)
            }
            (Channel::LogRequest, Message::TxnRequest(request)) => self.log_request_handler(request),
            (Channel::RequestResponse, Message::TxnResponse(response)) => {
                self.request_response_handler(response)
            }
            (Channel::ReplicationResponse, Message::TxnResponse(response)) => {
                self.replication_response_handler(response)
            }
            (Channel::ReplicationChange, Message::ReplicationFactorUpdate(update)) => {
                self.replication_change_handler(update)
            }
            (Channel::KeyAddress, Message::KeyAddressRequest(request)) => {
                self.address_handler(request)
            }
            (Channel::Membership, Message::Membership(change)) => self.membership_handler(change),
            (channel, message) => Err(ServerError::UnexpectedMessage {
                channel,
                code: message.type_code(),
            }),
        }
    }

    /// Tier of this worker.
    #[must_use]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Identity of this worker.
    #[must_use]
    pub fn thread(&self) -> &ServerThread {
        &self.thread
    }

    /// Ring view and replication cache.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Tier state.
    #[must_use]
    pub fn state(&self) -> &TierState {
        &self.state
    }

    /// Open commit sessions.
    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Number of requests waiting for replication records.
    #[must_use]
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Number of requests waiting for downstream replies.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Replication records served by this thread.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, ReplicationFactor> {
        &self.metadata
    }

    pub(crate) fn next_request_id(&mut self) -> String {
        self.next_request += 1;
        format!("{}_{}", self.thread, self.next_request)
    }

    pub(crate) fn send(&self, address: &str, message: &Message) -> bool {
        routing::send(self.transport.as_ref(), address, message)
    }

    /// Owners of `key` across `tiers`, looking the replication record up
    /// when needed.
    pub(crate) fn resolve(&mut self, key: &str, tiers: &[Tier]) -> Resolution {
        let address = self.thread.replication_response_address();
        self.router
            .get_responsible_threads(self.transport.as_ref(), &address, key, tiers)
    }

    /// Sends a replication lookup for `key` in this worker's tier.
    pub(crate) fn reissue_lookup(&mut self, key: &str) -> bool {
        let address = self.thread.replication_response_address();
        self.router.issue_replication_factor_request(
            self.transport.as_ref(),
            &address,
            key,
            self.tier,
        )
    }

    /// Checks that this thread owns `routing_key` in its own tier.
    ///
    /// Returns false when the request was parked for a replication lookup
    /// or answered WRONG_THREAD. A first ownership miss re-issues the lookup
    /// and parks the request; a miss on a re-driven request is final.
    pub(crate) fn ensure_owner(
        &mut self,
        request: &TxnRequest,
        routing_key: &str,
        redriven: bool,
    ) -> bool {
        match self.resolve(routing_key, &[self.tier]) {
            Resolution::Resolved(threads) if threads.contains(&self.thread) => true,
            Resolution::Pending => {
                self.park_inbound(routing_key, request, redriven);
                false
            }
            Resolution::Resolved(_) => {
                if !redriven && self.reissue_lookup(routing_key) {
                    debug!(key = routing_key, "not responsible, refreshing replication");
                    self.park_inbound(routing_key, request, true);
                } else {
                    self.reply_error(request, ErrorCode::WrongThread);
                }
                false
            }
        }
    }

    fn park_inbound(&mut self, key: &str, request: &TxnRequest, redriven: bool) {
        self.parked.insert(
            key,
            Parked::Inbound {
                request: request.clone(),
                redriven,
            },
        );
    }

    /// Sends `response` to the requester, unless no reply was asked for.
    pub(crate) fn reply(&self, request: &TxnRequest, response: TxnResponse) {
        if request.response_address.is_empty() {
            return;
        }
        self.send(&request.response_address, &Message::TxnResponse(response));
    }

    /// Answers every tuple of `request` with `error`.
    pub(crate) fn reply_error(&self, request: &TxnRequest, error: ErrorCode) {
        let mut response = TxnResponse::for_request(request, self.tier);
        response.tuples = request
            .tuples
            .iter()
            .map(|tuple| TxnResponseTuple::new(tuple.key.clone(), error))
            .collect();
        self.reply(request, response);
    }

    /// Answers a metadata-key request from the metadata store.
    pub(crate) fn serve_metadata(&self, request: &TxnRequest, key: &str) {
        let owners = self.router.rings().metadata_threads(self.tier, key);
        let tuple = if !owners.contains(&self.thread) {
            TxnResponseTuple::new(key, ErrorCode::WrongThread)
        } else {
            match self.metadata.get(key).map(ReplicationFactor::to_payload) {
                Some(Ok(payload)) => TxnResponseTuple::with_payload(key, payload, ErrorCode::NoError),
                Some(Err(e)) => {
                    warn!(key, error = %e, "cannot encode replication record");
                    TxnResponseTuple::new(key, ErrorCode::FailedOp)
                }
                None => TxnResponseTuple::new(key, ErrorCode::KeyDne),
            }
        };
        let mut response = TxnResponse::for_request(request, self.tier);
        response.tuples.push(tuple);
        self.reply(request, response);
    }
}

/// Splits a multi-tuple request into one request per tuple, so each tuple
/// is owned, parked and answered on its own.
pub(crate) fn split_tuples(request: TxnRequest) -> Vec<TxnRequest> {
    if request.tuples.len() <= 1 {
        return vec![request];
    }
    request
        .tuples
        .iter()
        .map(|tuple| TxnRequest {
            tuples: vec![tuple.clone()],
            ..request.clone()
        })
        .collect()
}

/// Key of the single tuple of `request`, empty if it has none.
pub(crate) fn first_key(request: &TxnRequest) -> String {
    request
        .tuples
        .first()
        .map(|tuple| tuple.key.clone())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tierkv_protocol::{RecordingTransport, RequestType};

    /// A cluster view with one single-thread node per server tier.
    pub(crate) fn rings() -> HashRings {
        let mut rings = HashRings::new();
        rings.insert_node(Tier::Txn, "34.0.1.1", "10.0.1.1", 0, 1);
        rings.insert_node(Tier::Memory, "34.0.2.1", "10.0.2.1", 0, 1);
        rings.insert_node(Tier::Log, "34.0.4.1", "10.0.4.1", 0, 1);
        rings
    }

    pub(crate) fn thread_of(tier: Tier) -> ServerThread {
        match tier {
            Tier::Txn => ServerThread::new("34.0.1.1", "10.0.1.1", 0),
            Tier::Memory => ServerThread::new("34.0.2.1", "10.0.2.1", 0),
            Tier::Disk => ServerThread::new("34.0.3.1", "10.0.3.1", 0),
            Tier::Log => ServerThread::new("34.0.4.1", "10.0.4.1", 0),
            Tier::Routing => ServerThread::new("34.0.5.1", "10.0.5.1", 0),
        }
    }

    pub(crate) fn node(tier: Tier, transport: Arc<RecordingTransport>) -> Node {
        Node::new(
            Arc::new(ClusterConfig::default()),
            tier,
            thread_of(tier),
            rings(),
            transport,
        )
        .unwrap()
    }

    /// Responses sent by a handler, in order.
    pub(crate) fn responses(transport: &RecordingTransport) -> Vec<(String, TxnResponse)> {
        transport
            .take()
            .into_iter()
            .filter_map(|(address, message)| match message {
                Message::TxnResponse(response) => Some((address, response)),
                _ => None,
            })
            .collect()
    }

    /// Requests sent by a handler, in order.
    pub(crate) fn requests(transport: &RecordingTransport) -> Vec<(String, TxnRequest)> {
        transport
            .take()
            .into_iter()
            .filter_map(|(address, message)| match message {
                Message::TxnRequest(request) => Some((address, request)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn split_keeps_request_fields() {
        let request = TxnRequest::new(RequestType::TxnGet, "c1-1:1")
            .with_request_id("r")
            .with_tuple("a", "")
            .with_tuple("b", "");
        let parts = split_tuples(request);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].request_id, "r");
        assert_eq!(first_key(&parts[1]), "b");
        assert_eq!(first_key(&TxnRequest::new(RequestType::CommitTxn, "t")), "");
    }

    #[test]
    fn mismatched_channel_is_rejected() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = node(Tier::Memory, transport);
        let envelope = Envelope {
            channel: Channel::Membership,
            address: String::new(),
            payload: Message::TxnRequest(TxnRequest::new(RequestType::TxnGet, ""))
                .encode()
                .unwrap(),
        };
        assert!(matches!(
            node.handle(&envelope),
            Err(ServerError::UnexpectedMessage { code: 1, .. })
        ));
    }

    #[test]
    fn metadata_requests_answer_from_the_store() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = node(Tier::Memory, transport.clone());
        let key = tierkv_protocol::replication_key("k");
        let request = TxnRequest::new(RequestType::TxnGet, "")
            .with_response_address("back")
            .with_tuple(key.clone(), "");

        node.serve_metadata(&request, &key);
        let sent = responses(&transport);
        assert_eq!(sent[0].0, "back");
        assert_eq!(sent[0].1.tuples[0].error, ErrorCode::KeyDne);
        assert_eq!(sent[0].1.tier, Tier::Memory);

        let factor = ReplicationFactor {
            key: "k".into(),
            global: vec![],
            local: vec![],
        };
        node.metadata.insert(key.clone(), factor.clone());
        node.serve_metadata(&request, &key);
        let sent = responses(&transport);
        assert_eq!(sent[0].1.tuples[0].error, ErrorCode::NoError);
        assert_eq!(
            ReplicationFactor::from_payload(&sent[0].1.tuples[0].payload).unwrap(),
            factor
        );
    }
}
