use crate::error::{ServerError, ServerResult};
use crate::node::{first_key, split_tuples, Node, TierState};
use crate::pending::{InFlight, Parked};
use crate::routing::{issue_log_request, Resolution};
use tierkv_core::TxnId;
use tierkv_protocol::{
    is_metadata, ErrorCode, RequestType, Tier, TxnRequest, TxnResponse, TxnResponseTuple,
};
use tracing::{debug, warn};

impl Node {
    /// Handles key operations at a MEMORY or DISK worker.
    ///
    /// Reads and writes are answered at once. Prepare and commit are applied
    /// to the store, then logged; their reply is held until the LOG tier
    /// acknowledges. ABORT_TXN releases the transaction's locks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::WrongTier`] on a non-storage worker.
    pub fn storage_request_handler(&mut self, request: TxnRequest) -> ServerResult<()> {
        if !matches!(self.state, TierState::Storage(_)) {
            return Err(ServerError::wrong_tier(self.tier, "storage requests"));
        }
        for request in split_tuples(request) {
            self.process_storage_request(request, false);
        }
        Ok(())
    }

    pub(crate) fn process_storage_request(&mut self, request: TxnRequest, redriven: bool) {
        let key = first_key(&request);
        if is_metadata(&key) {
            self.serve_metadata(&request, &key);
            return;
        }
        if !self.ensure_owner(&request, &key, redriven) {
            return;
        }

        let txn = TxnId::from(request.txn_id.as_str());
        let payload = request
            .tuples
            .first()
            .map(|tuple| tuple.payload.clone())
            .unwrap_or_default();
        let is_primary = self.router.is_primary_replica(&key, self.tier, &self.thread);
        let TierState::Storage(store) = &mut self.state else {
            return;
        };

        let mut response = TxnResponse::for_request(&request, self.tier);
        match request.request_type {
            RequestType::TxnGet => {
                let tuple = match store.get(&txn, &key) {
                    Ok(value) => TxnResponseTuple::with_payload(&key, value, ErrorCode::NoError),
                    Err(e) => {
                        debug!(%txn, key, error = %e, "get failed");
                        TxnResponseTuple::new(&key, e.code())
                    }
                };
                response.tuples.push(tuple);
                self.reply(&request, response);
            }
            RequestType::TxnPut => {
                let error = match store.put(&txn, &key, &payload, is_primary) {
                    Ok(()) => ErrorCode::NoError,
                    Err(e) => {
                        debug!(%txn, key, error = %e, "put failed");
                        e.code()
                    }
                };
                response.tuples.push(TxnResponseTuple::new(&key, error));
                self.reply(&request, response);
            }
            RequestType::PrepareTxn | RequestType::CommitTxn => {
                let (applied, record) = if request.request_type == RequestType::PrepareTxn {
                    (store.prepare(&txn, &key), store.shadow_value(&key))
                } else {
                    (store.commit(&txn, &key), store.committed_value(&key))
                };
                match applied {
                    Ok(()) => {
                        response.tuples.push(TxnResponseTuple::with_payload(
                            &key,
                            record.unwrap_or_default(),
                            ErrorCode::NoError,
                        ));
                        self.log_durably(request, response);
                    }
                    Err(e) => {
                        warn!(%txn, key, request_type = %request.request_type, error = %e, "phase failed");
                        response.tuples.push(TxnResponseTuple::new(&key, e.code()));
                        self.reply(&request, response);
                    }
                }
            }
            RequestType::AbortTxn => {
                if let Err(e) = store.abort(&txn, &key) {
                    debug!(%txn, key, error = %e, "nothing to abort");
                }
                response.tuples.push(TxnResponseTuple::new(&key, ErrorCode::NoError));
                self.reply(&request, response);
            }
            RequestType::StartTxn => {
                self.reply_error(&request, ErrorCode::FailedOp);
            }
        }
    }

    /// Sends the record carried by `response` to the LOG owner of its key
    /// and holds `response` until the log acknowledges.
    pub(crate) fn log_durably(&mut self, request: TxnRequest, mut response: TxnResponse) {
        let key = first_key(&request);
        match self.resolve(&key, &[Tier::Log]) {
            Resolution::Pending => {
                self.parked.insert(
                    key,
                    Parked::LogDurability { request, response },
                );
            }
            Resolution::Resolved(threads) => {
                let Some(target) = threads.first() else {
                    for tuple in &mut response.tuples {
                        tuple.error = ErrorCode::NoServers;
                    }
                    self.reply(&request, response);
                    return;
                };
                let record = response
                    .tuples
                    .first()
                    .map(|tuple| tuple.payload.clone())
                    .unwrap_or_default();
                let id = self.next_request_id();
                let log_request = TxnRequest::new(request.request_type, request.txn_id.clone())
                    .with_request_id(id.clone())
                    .with_response_address(self.thread.request_response_address())
                    .with_tuple(key, record);

                if issue_log_request(self.transport.as_ref(), target, log_request) {
                    self.in_flight.insert(
                        id,
                        InFlight::Durability {
                            response_address: request.response_address,
                            response,
                        },
                    );
                } else {
                    self.reply_error(&request, ErrorCode::FailedOp);
                }
            }
        }
    }
}
