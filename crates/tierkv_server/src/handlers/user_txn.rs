use crate::error::{ServerError, ServerResult};
use crate::node::{first_key, split_tuples, Node, TierState};
use crate::pending::{InFlight, Parked};
use crate::routing::{issue_abort_request, issue_storage_request, Resolution};
use crate::session::CommitSession;
use tierkv_core::{ServerThread, TxnId};
use tierkv_protocol::{
    is_metadata, ErrorCode, RequestType, Tier, TxnRequest, TxnResponse, TxnResponseTuple,
};
use tracing::{debug, info, warn};

impl Node {
    /// Handles client transaction requests at the TXN tier.
    ///
    /// START_TXN opens a transaction, TXN_GET and TXN_PUT record the
    /// operation and forward it to the key's storage owner, and COMMIT_TXN
    /// starts the prepare fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::WrongTier`] on a non-TXN worker.
    pub fn user_txn_request_handler(&mut self, request: TxnRequest) -> ServerResult<()> {
        if !matches!(self.state, TierState::Txn(_)) {
            return Err(ServerError::wrong_tier(self.tier, "transaction requests"));
        }
        for request in split_tuples(request) {
            self.process_txn_request(request, false);
        }
        Ok(())
    }

    pub(crate) fn process_txn_request(&mut self, request: TxnRequest, redriven: bool) {
        let key = first_key(&request);
        if is_metadata(&key) {
            self.serve_metadata(&request, &key);
            return;
        }

        let routing_key = routing_key(&request, &key);
        if !self.ensure_owner(&request, &routing_key, redriven) {
            return;
        }

        match request.request_type {
            RequestType::StartTxn => self.start_txn(&request, &key),
            RequestType::TxnGet | RequestType::TxnPut => self.record_op(request, &key),
            RequestType::CommitTxn => self.begin_commit(request),
            other => {
                warn!(request_type = %other, "not a client request");
                self.reply_error(&request, ErrorCode::FailedOp);
            }
        }
    }

    pub(crate) fn registry(&mut self) -> Option<&mut tierkv_core::TxnRegistry> {
        match &mut self.state {
            TierState::Txn(registry) => Some(registry),
            _ => None,
        }
    }

    fn start_txn(&mut self, request: &TxnRequest, client_id: &str) {
        let Some(registry) = self.registry() else {
            return;
        };
        let txn = registry.create_txn(client_id);
        self.router.init_tier(txn.as_str(), Tier::Txn);

        let mut response = TxnResponse::for_request(request, Tier::Txn);
        response.txn_id = txn.to_string();
        let mut tuple = TxnResponseTuple::with_payload(client_id, txn.as_str(), ErrorCode::NoError);
        tuple.invalidate = self.stale_cache(request, client_id);
        response.tuples.push(tuple);
        self.reply(request, response);
    }

    fn record_op(&mut self, request: TxnRequest, key: &str) {
        let txn = TxnId::from(request.txn_id.as_str());
        if self.sessions.contains(&txn) {
            debug!(%txn, "operation on a committing transaction");
            self.reply_error(&request, ErrorCode::FailedOp);
            return;
        }
        let payload = request
            .tuples
            .first()
            .map(|tuple| tuple.payload.clone())
            .unwrap_or_default();
        let Some(registry) = self.registry() else {
            return;
        };
        if let Err(e) = registry.put_op(&txn, key, &payload) {
            self.reply_error(&request, e.code());
            return;
        }
        self.forward_to_storage(request);
    }

    /// Sends a recorded GET or PUT to the storage owner of its key.
    pub(crate) fn forward_to_storage(&mut self, request: TxnRequest) {
        let key = first_key(&request);
        match self.resolve(&key, &Tier::STORAGE_TIERS) {
            Resolution::Pending => {
                self.parked.insert(
                    key,
                    Parked::ForwardToStorage { request },
                );
            }
            Resolution::Resolved(threads) => {
                let Some(target) = threads.first() else {
                    self.reply_error(&request, ErrorCode::NoServers);
                    return;
                };
                let id = self.next_request_id();
                let downstream = TxnRequest {
                    request_id: id.clone(),
                    response_address: self.thread.request_response_address(),
                    ..request.clone()
                };
                if issue_storage_request(self.transport.as_ref(), target, downstream) {
                    self.in_flight.insert(
                        id,
                        InFlight::Client { request },
                    );
                } else {
                    self.reply_error(&request, ErrorCode::FailedOp);
                }
            }
        }
    }

    fn begin_commit(&mut self, request: TxnRequest) {
        let txn = TxnId::from(request.txn_id.as_str());
        if self.sessions.contains(&txn) {
            self.reply_error(&request, ErrorCode::FailedOp);
            return;
        }
        let Some(registry) = self.registry() else {
            return;
        };
        let keys = match registry.touched_keys(&txn) {
            Ok(keys) => keys,
            Err(e) => {
                self.reply_error(&request, e.code());
                return;
            }
        };
        let doomed = registry.has_failed(&txn);
        if keys.is_empty() {
            let session = CommitSession::new(txn.clone(), request, keys);
            self.finish_txn(session, ErrorCode::NoError);
            return;
        }
        if doomed {
            self.sessions.open(CommitSession::new(txn.clone(), request, keys));
            self.abort_txn(&txn, ErrorCode::FailedOp);
            return;
        }

        info!(%txn, keys = keys.len(), "preparing");
        self.sessions
            .open(CommitSession::new(txn.clone(), request, keys.clone()));
        for key in keys {
            let target = match self.resolve(&key, &Tier::STORAGE_TIERS) {
                Resolution::Resolved(threads) => threads.into_iter().next(),
                Resolution::Pending => None,
            };
            let Some(target) = target else {
                warn!(%txn, key, "cannot resolve key for prepare");
                self.abort_txn(&txn, ErrorCode::FailedOp);
                return;
            };
            if !self.send_phase_request(&txn, RequestType::PrepareTxn, key.clone(), target) {
                self.abort_txn(&txn, ErrorCode::FailedOp);
                return;
            }
        }
    }

    /// Sends a PREPARE_TXN or COMMIT_TXN for `key` and registers it with
    /// the commit session.
    pub(crate) fn send_phase_request(
        &mut self,
        txn: &TxnId,
        request_type: RequestType,
        key: String,
        target: ServerThread,
    ) -> bool {
        let id = self.next_request_id();
        let request = TxnRequest::new(request_type, txn.as_str())
            .with_request_id(id.clone())
            .with_response_address(self.thread.request_response_address())
            .with_tuple(key.clone(), "");
        if !issue_storage_request(self.transport.as_ref(), &target, request) {
            return false;
        }
        self.sessions.expect(txn, id, key, target);
        true
    }

    /// Sends COMMIT_TXN to every prepared key. A key that cannot be sent
    /// fails the session; it finishes at once if nothing is outstanding.
    pub(crate) fn begin_commit_phase(&mut self, txn: &TxnId) {
        let Some(session) = self.sessions.get(txn) else {
            return;
        };
        let targets = session.prepared_targets();
        info!(%txn, keys = targets.len(), "committing");
        self.sessions.begin_commit(txn);

        for (key, target) in targets {
            if !self.send_phase_request(txn, RequestType::CommitTxn, key.clone(), target) {
                warn!(%txn, key, "commit not sent");
                self.sessions.fail(txn, ErrorCode::FailedOp);
            }
        }
        if self.sessions.get(txn).is_some_and(|s| s.outstanding() == 0) {
            if let Some(session) = self.sessions.close(txn) {
                let error = session.error();
                self.finish_txn(session, error);
            }
        }
    }

    /// Aborts `txn`: ABORT_TXN goes to every touched key that resolves and
    /// the client is told `error`.
    pub(crate) fn abort_txn(&mut self, txn: &TxnId, error: ErrorCode) {
        let Some(session) = self.sessions.close(txn) else {
            return;
        };
        warn!(%txn, %error, "aborting");
        for key in session.keys() {
            let target = match session.target(key) {
                Some(target) => Some(target.clone()),
                None => match self.resolve(key, &Tier::STORAGE_TIERS) {
                    Resolution::Resolved(threads) => threads.into_iter().next(),
                    Resolution::Pending => None,
                },
            };
            if let Some(target) = target {
                issue_abort_request(self.transport.as_ref(), &target, txn.as_str(), key);
            }
        }
        self.finish_txn(session, error);
    }

    /// Drops the transaction and answers the client's COMMIT_TXN.
    pub(crate) fn finish_txn(&mut self, session: CommitSession, error: ErrorCode) {
        let txn = session.txn().clone();
        if let Some(registry) = self.registry() {
            if let Err(e) = registry.commit_txn(&txn) {
                warn!(%txn, error = %e, "transaction already closed");
            }
        }
        self.router.replication_mut().remove(txn.as_str());
        if error.is_ok() {
            info!(%txn, "committed");
        }

        let request = session.client_request();
        let mut response = TxnResponse::for_request(request, Tier::Txn);
        response.error = error;
        let key = first_key(request);
        let mut tuple = TxnResponseTuple::new(key.clone(), error);
        tuple.invalidate = self.stale_cache(request, &key);
        response.tuples.push(tuple);
        self.reply(request, response);
    }

    /// Whether the client's cached owner count for `request` differs from
    /// the current one.
    pub(crate) fn stale_cache(&self, request: &TxnRequest, key: &str) -> bool {
        let Some(cached) = request.tuples.first().map(|t| t.address_cache_size) else {
            return false;
        };
        if cached == 0 {
            return false;
        }
        let routing_key = routing_key(request, key);
        let owners = self
            .router
            .replication()
            .get(&routing_key)
            .map(|replication| {
                self.router
                    .rings()
                    .responsible_threads(Tier::Txn, &routing_key, replication)
                    .len()
            })
            .unwrap_or(0);
        cached as usize != owners
    }
}

/// Key deciding which TXN thread serves `request`: the client id.
fn routing_key(request: &TxnRequest, key: &str) -> String {
    match request.request_type {
        RequestType::StartTxn => key.to_string(),
        _ => TxnId::from(request.txn_id.as_str()).client_id().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{node, requests, responses, thread_of};
    use crate::session::Phase;
    use std::sync::Arc;
    use tierkv_protocol::{replication_key, Message, RecordingTransport};

    const CLIENT: &str = "tcp://client:9000";

    fn ready_txn_node(transport: &Arc<RecordingTransport>) -> Node {
        let mut node = node(Tier::Txn, transport.clone());
        node.router.init_tier("c1", Tier::Txn);
        node.router.init_tier("k", Tier::Memory);
        node.router.init_tier("j", Tier::Memory);
        node
    }

    fn start(node: &mut Node, transport: &RecordingTransport) -> String {
        let request = TxnRequest::new(RequestType::StartTxn, "")
            .with_request_id("r0")
            .with_response_address(CLIENT)
            .with_tuple("c1", "");
        node.user_txn_request_handler(request).unwrap();
        let sent = responses(transport);
        assert_eq!(sent.len(), 1);
        sent[0].1.txn_id.clone()
    }

    fn ack(node: &mut Node, request: &TxnRequest, error: ErrorCode) {
        let mut response = TxnResponse::for_request(request, Tier::Memory);
        response
            .tuples
            .push(TxnResponseTuple::new(request.tuples[0].key.clone(), error));
        node.request_response_handler(response).unwrap();
    }

    #[test]
    fn start_txn_embeds_client_id() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = ready_txn_node(&transport);
        let txn = start(&mut node, &transport);
        assert!(txn.starts_with("c1-"));
        assert!(node.router.replication().contains(&txn));
    }

    #[test]
    fn unknown_client_is_parked_until_replication_known() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = node(Tier::Txn, transport.clone());
        let request = TxnRequest::new(RequestType::StartTxn, "")
            .with_response_address(CLIENT)
            .with_tuple("c9", "");
        node.user_txn_request_handler(request).unwrap();

        assert_eq!(node.parked_len(), 1);
        let lookups = requests(&transport);
        assert_eq!(lookups.len(), 1);
        assert_eq!(lookups[0].1.tuples[0].key, replication_key("c9"));
        assert_eq!(lookups[0].0, thread_of(Tier::Txn).txn_request_address());
    }

    #[test]
    fn get_and_put_forward_to_storage_and_relay_reply() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = ready_txn_node(&transport);
        let txn = start(&mut node, &transport);

        let put = TxnRequest::new(RequestType::TxnPut, txn.clone())
            .with_request_id("r1")
            .with_response_address(CLIENT)
            .with_tuple("k", "v");
        node.user_txn_request_handler(put).unwrap();

        let forwarded = requests(&transport);
        assert_eq!(forwarded.len(), 1);
        let (address, downstream) = &forwarded[0];
        assert_eq!(address, &thread_of(Tier::Memory).storage_request_address());
        assert_eq!(downstream.tuples[0].payload, "v");
        assert_eq!(
            downstream.response_address,
            thread_of(Tier::Txn).request_response_address()
        );
        assert_eq!(node.in_flight_len(), 1);

        ack(&mut node, downstream, ErrorCode::NoError);
        let replies = responses(&transport);
        assert_eq!(replies[0].0, CLIENT);
        assert_eq!(replies[0].1.response_id, "r1");
        assert_eq!(replies[0].1.tier, Tier::Txn);
        assert_eq!(node.in_flight_len(), 0);
    }

    #[test]
    fn unknown_txn_is_txn_dne() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = ready_txn_node(&transport);
        let get = TxnRequest::new(RequestType::TxnGet, "c1-5:10")
            .with_response_address(CLIENT)
            .with_tuple("k", "");
        node.user_txn_request_handler(get).unwrap();
        let commit = TxnRequest::new(RequestType::CommitTxn, "c1-5:10")
            .with_response_address(CLIENT)
            .with_tuple("c1", "");
        node.user_txn_request_handler(commit).unwrap();

        let replies = responses(&transport);
        assert_eq!(replies.len(), 2);
        assert!(replies
            .iter()
            .all(|(_, r)| r.tuples[0].error == ErrorCode::TxnDne));
    }

    #[test]
    fn commit_prepares_then_commits_every_key() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = ready_txn_node(&transport);
        let txn = start(&mut node, &transport);
        for key in ["k", "j", "k"] {
            let put = TxnRequest::new(RequestType::TxnPut, txn.clone())
                .with_response_address(CLIENT)
                .with_tuple(key, "v");
            node.user_txn_request_handler(put).unwrap();
        }
        transport.take();

        let commit = TxnRequest::new(RequestType::CommitTxn, txn.clone())
            .with_request_id("rc")
            .with_response_address(CLIENT)
            .with_tuple("c1", "");
        node.user_txn_request_handler(commit).unwrap();

        let prepares = requests(&transport);
        let keys: Vec<_> = prepares.iter().map(|(_, r)| r.tuples[0].key.as_str()).collect();
        assert_eq!(keys, vec!["k", "j"]);
        assert!(prepares
            .iter()
            .all(|(_, r)| r.request_type == RequestType::PrepareTxn));

        for (_, prepare) in &prepares {
            ack(&mut node, prepare, ErrorCode::NoError);
        }
        let session = node.sessions().get(&TxnId::from(txn.as_str())).unwrap();
        assert_eq!(session.phase(), Phase::Commit);

        let commits = requests(&transport);
        assert_eq!(commits.len(), 2);
        ack(&mut node, &commits[0].1, ErrorCode::NoError);
        assert!(responses(&transport).is_empty());
        ack(&mut node, &commits[1].1, ErrorCode::NoError);

        let replies = responses(&transport);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1.response_id, "rc");
        assert_eq!(replies[0].1.tuples[0].error, ErrorCode::NoError);
        assert!(node.sessions().is_empty());
        assert!(!node.router.replication().contains(&txn));
        let TierState::Txn(registry) = node.state() else {
            panic!("txn state expected");
        };
        assert!(registry.is_empty());
    }

    #[test]
    fn prepare_failure_aborts_every_key() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = ready_txn_node(&transport);
        let txn = start(&mut node, &transport);
        for key in ["k", "j"] {
            let put = TxnRequest::new(RequestType::TxnPut, txn.clone())
                .with_response_address(CLIENT)
                .with_tuple(key, "v");
            node.user_txn_request_handler(put).unwrap();
        }
        transport.take();

        let commit = TxnRequest::new(RequestType::CommitTxn, txn.clone())
            .with_response_address(CLIENT)
            .with_tuple("c1", "");
        node.user_txn_request_handler(commit).unwrap();
        let prepares = requests(&transport);

        ack(&mut node, &prepares[1].1, ErrorCode::FailedOp);
        let sent = transport.take();
        let aborts: Vec<_> = sent
            .iter()
            .filter_map(|(_, m)| match m {
                Message::TxnRequest(r) if r.request_type == RequestType::AbortTxn => {
                    Some(r.tuples[0].key.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(aborts, vec!["k".to_string(), "j".to_string()]);
        let failure = sent
            .iter()
            .find_map(|(_, m)| match m {
                Message::TxnResponse(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(failure.error, ErrorCode::FailedOp);

        // A late prepare ack for the aborted transaction is ignored.
        ack(&mut node, &prepares[0].1, ErrorCode::NoError);
        assert!(transport.take().is_empty());
        assert!(node.sessions().is_empty());
    }

    fn aborted_keys(sent: &[(String, Message)]) -> Vec<String> {
        sent.iter()
            .filter_map(|(_, m)| match m {
                Message::TxnRequest(r) if r.request_type == RequestType::AbortTxn => {
                    Some(r.tuples[0].key.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn refused_put_aborts_commit_without_preparing() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = ready_txn_node(&transport);
        let txn = start(&mut node, &transport);
        for (key, error) in [("j", ErrorCode::NoError), ("k", ErrorCode::FailedOp)] {
            let put = TxnRequest::new(RequestType::TxnPut, txn.clone())
                .with_response_address(CLIENT)
                .with_tuple(key, "1");
            node.user_txn_request_handler(put).unwrap();
            let forwarded = requests(&transport);
            ack(&mut node, &forwarded[0].1, error);
            assert_eq!(responses(&transport)[0].1.tuples[0].error, error);
        }

        let commit = TxnRequest::new(RequestType::CommitTxn, txn.clone())
            .with_request_id("rc")
            .with_response_address(CLIENT)
            .with_tuple("c1", "");
        node.user_txn_request_handler(commit).unwrap();

        let sent = transport.take();
        assert!(!sent.iter().any(|(_, m)| matches!(
            m,
            Message::TxnRequest(r) if r.request_type == RequestType::PrepareTxn
        )));
        assert_eq!(aborted_keys(&sent), vec!["j".to_string(), "k".to_string()]);
        let reply = sent
            .iter()
            .find_map(|(_, m)| match m {
                Message::TxnResponse(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(reply.response_id, "rc");
        assert_eq!(reply.error, ErrorCode::FailedOp);
        assert!(node.sessions().is_empty());
    }

    #[test]
    fn wrong_thread_put_does_not_doom_the_transaction() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = ready_txn_node(&transport);
        let txn = start(&mut node, &transport);
        let put = TxnRequest::new(RequestType::TxnPut, txn.clone())
            .with_response_address(CLIENT)
            .with_tuple("k", "1");
        node.user_txn_request_handler(put).unwrap();
        ack(&mut node, &requests(&transport)[0].1, ErrorCode::WrongThread);
        transport.take();

        let TierState::Txn(registry) = node.state() else {
            panic!("txn state expected");
        };
        assert!(!registry.has_failed(&TxnId::from(txn.as_str())));
    }

    #[test]
    fn unsent_commit_fails_the_transaction_once_others_ack() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = ready_txn_node(&transport);
        let txn = start(&mut node, &transport);
        let id = TxnId::from(txn.as_str());
        let unreachable = ServerThread::new("34.0.9.9", "10.0.9.9", 0);
        transport.refuse(unreachable.storage_request_address());

        let commit = TxnRequest::new(RequestType::CommitTxn, txn.clone())
            .with_request_id("rc")
            .with_response_address(CLIENT)
            .with_tuple("c1", "");
        let keys = vec!["k".to_string(), "j".to_string()];
        node.sessions.open(CommitSession::new(id.clone(), commit, keys));
        node.sessions
            .expect(&id, "p1".into(), "k".into(), thread_of(Tier::Memory));
        node.sessions
            .expect(&id, "p2".into(), "j".into(), unreachable);

        for (request_id, key) in [("p1", "k"), ("p2", "j")] {
            let prepare = TxnRequest::new(RequestType::PrepareTxn, txn.clone())
                .with_request_id(request_id)
                .with_tuple(key, "");
            ack(&mut node, &prepare, ErrorCode::NoError);
        }

        let commits = requests(&transport);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].1.tuples[0].key, "k");
        assert!(responses(&transport).is_empty());

        ack(&mut node, &commits[0].1, ErrorCode::NoError);
        let replies = responses(&transport);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1.response_id, "rc");
        assert_eq!(replies[0].1.error, ErrorCode::FailedOp);
        assert!(node.sessions().is_empty());
    }

    #[test]
    fn empty_transaction_commits_at_once() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = ready_txn_node(&transport);
        let txn = start(&mut node, &transport);
        let commit = TxnRequest::new(RequestType::CommitTxn, txn.clone())
            .with_response_address(CLIENT)
            .with_tuple("c1", "");
        node.user_txn_request_handler(commit.clone()).unwrap();
        assert_eq!(responses(&transport)[0].1.error, ErrorCode::NoError);

        node.user_txn_request_handler(commit).unwrap();
        assert_eq!(
            responses(&transport)[0].1.tuples[0].error,
            ErrorCode::TxnDne
        );
    }

    #[test]
    fn storage_worker_rejects_client_requests() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = node(Tier::Memory, transport);
        let request = TxnRequest::new(RequestType::StartTxn, "").with_tuple("c1", "");
        assert!(matches!(
            node.user_txn_request_handler(request),
            Err(ServerError::WrongTier { .. })
        ));
    }
}
