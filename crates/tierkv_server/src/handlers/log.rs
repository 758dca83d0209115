use crate::error::{ServerError, ServerResult};
use crate::node::{first_key, split_tuples, Node, TierState};
use tierkv_protocol::{
    is_metadata, ErrorCode, Operation, RequestType, TxnRequest, TxnResponse, TxnResponseTuple,
};
use tracing::{trace, warn};

impl Node {
    /// Appends prepare and commit records at a LOG worker and acknowledges
    /// them with their log position.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::WrongTier`] on a non-LOG worker.
    pub fn log_request_handler(&mut self, request: TxnRequest) -> ServerResult<()> {
        if !matches!(self.state, TierState::Log(_)) {
            return Err(ServerError::wrong_tier(self.tier, "log requests"));
        }
        for request in split_tuples(request) {
            self.process_log_request(request, false);
        }
        Ok(())
    }

    pub(crate) fn process_log_request(&mut self, request: TxnRequest, redriven: bool) {
        let key = first_key(&request);
        if is_metadata(&key) {
            self.serve_metadata(&request, &key);
            return;
        }
        if !self.ensure_owner(&request, &key, redriven) {
            return;
        }
        let TierState::Log(log) = &mut self.state else {
            return;
        };

        let tuple = match request.request_type {
            RequestType::PrepareTxn | RequestType::CommitTxn => {
                let payload = request
                    .tuples
                    .first()
                    .map(|tuple| tuple.payload.clone())
                    .unwrap_or_default();
                match log.append(Operation::new(request.txn_id.clone(), key.clone(), payload)) {
                    Ok(position) => {
                        trace!(txn = %request.txn_id, key, position, "logged");
                        TxnResponseTuple::with_payload(&key, position.to_string(), ErrorCode::NoError)
                    }
                    Err(e) => {
                        warn!(key, error = %e, "log append failed");
                        TxnResponseTuple::new(&key, e.code())
                    }
                }
            }
            other => {
                warn!(request_type = %other, "not a log record");
                TxnResponseTuple::new(&key, ErrorCode::FailedOp)
            }
        };

        let mut response = TxnResponse::for_request(&request, self.tier);
        response.tuples.push(tuple);
        self.reply(&request, response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{node, responses};
    use std::sync::Arc;
    use tierkv_core::ClusterConfig;
    use tierkv_protocol::{RecordingTransport, Tier};

    fn record(kind: RequestType, key: &str, value: &str) -> TxnRequest {
        TxnRequest::new(kind, "c1-1:10")
            .with_request_id("r")
            .with_response_address("tcp://storage:6400")
            .with_tuple(key, value)
    }

    #[test]
    fn records_are_appended_in_order() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = node(Tier::Log, transport.clone());
        node.router.init_tier("k", Tier::Log);

        node.log_request_handler(record(RequestType::PrepareTxn, "k", "v"))
            .unwrap();
        node.log_request_handler(record(RequestType::CommitTxn, "k", "v"))
            .unwrap();

        let acks = responses(&transport);
        let positions: Vec<_> = acks.iter().map(|(_, r)| r.tuples[0].payload.clone()).collect();
        assert_eq!(positions, vec!["0", "1"]);
        assert!(acks.iter().all(|(_, r)| r.tier == Tier::Log));

        let TierState::Log(log) = node.state() else {
            panic!("log state expected");
        };
        assert_eq!(log.len(), 2);
        assert_eq!(log.read(1).unwrap().value, "v");
    }

    #[test]
    fn reads_are_not_log_records() {
        let transport = Arc::new(RecordingTransport::new());
        let mut node = node(Tier::Log, transport.clone());
        node.router.init_tier("k", Tier::Log);
        node.log_request_handler(record(RequestType::TxnGet, "k", ""))
            .unwrap();
        assert_eq!(
            responses(&transport)[0].1.tuples[0].error,
            ErrorCode::FailedOp
        );
    }

    #[test]
    fn journaled_log_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ClusterConfig::default().log_dir(dir.path()));
        let thread = crate::node::tests::thread_of(Tier::Log);

        for _ in 0..2 {
            let transport = Arc::new(RecordingTransport::new());
            let mut node = Node::new(
                config.clone(),
                Tier::Log,
                thread.clone(),
                crate::node::tests::rings(),
                transport,
            )
            .unwrap();
            node.router.init_tier("k", Tier::Log);
            node.log_request_handler(record(RequestType::PrepareTxn, "k", "v"))
                .unwrap();
        }

        let reopened = Node::new(
            config,
            Tier::Log,
            thread,
            crate::node::tests::rings(),
            Arc::new(RecordingTransport::new()),
        )
        .unwrap();
        let TierState::Log(log) = reopened.state() else {
            panic!("log state expected");
        };
        assert_eq!(log.next_position(), 2);
        assert!(log.is_durable());
    }
}
