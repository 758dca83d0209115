use crate::error::ServerResult;
use crate::node::{Node, TierState};
use crate::pending::{Parked, PendingEntry};
use tierkv_protocol::{
    key_from_metadata, ErrorCode, KeyAddress, KeyAddressResponse, Message, ReplicationFactor,
    TxnResponse,
};
use tracing::{debug, warn};

impl Node {
    /// Installs replication records returned by metadata lookups and
    /// re-drives the requests parked on them.
    ///
    /// A stored record is applied as is; KEY_DNE (or TXN_DNE) installs the
    /// defaults of the responding tier. WRONG_THREAD re-sends the lookup
    /// until the retry budget runs out, after which every request parked on
    /// the key is answered FAILED_OP.
    ///
    /// # Errors
    ///
    /// This handler does not fail; malformed tuples are logged and skipped.
    pub fn replication_response_handler(&mut self, response: TxnResponse) -> ServerResult<()> {
        for tuple in &response.tuples {
            let Some(key) = key_from_metadata(&tuple.key) else {
                warn!(key = %tuple.key, "replication response for a non-metadata key");
                continue;
            };

            match tuple.error {
                ErrorCode::NoError => match ReplicationFactor::from_payload(&tuple.payload) {
                    Ok(factor) => self.router.replication_mut().install(&factor),
                    Err(e) => {
                        warn!(key, error = %e, "undecodable replication record");
                        self.router.init_tier(key, response.tier);
                    }
                },
                ErrorCode::KeyDne | ErrorCode::TxnDne => {
                    debug!(key, tier = %response.tier, "no replication record, using defaults");
                    self.router.init_tier(key, response.tier);
                }
                ErrorCode::WrongThread => {
                    let address = self.thread.replication_response_address();
                    if !self.router.retry_lookup(
                        self.transport.as_ref(),
                        &address,
                        key,
                        response.tier,
                    ) {
                        self.fail_parked(key);
                    }
                    continue;
                }
                other => {
                    warn!(key, error = %other, "replication lookup failed");
                    self.router.complete_lookup(key);
                    self.fail_parked(key);
                    continue;
                }
            }

            self.router.complete_lookup(key);
            self.redrive(key);
        }
        Ok(())
    }

    /// Resumes every request parked on `key`.
    pub(crate) fn redrive(&mut self, key: &str) {
        for entry in self.parked.take_key(key) {
            match entry.value {
                Parked::Inbound { request, redriven } => match self.state {
                    TierState::Txn(_) => self.process_txn_request(request, redriven),
                    TierState::Storage(_) => self.process_storage_request(request, redriven),
                    TierState::Log(_) => self.process_log_request(request, redriven),
                    TierState::Routing => {}
                },
                Parked::ForwardToStorage { request } => self.forward_to_storage(request),
                Parked::LogDurability { request, response } => {
                    self.log_durably(request, response);
                }
                Parked::Address {
                    request_id,
                    response_address,
                    tier,
                } => self.answer_address(&entry.key, request_id, response_address, tier),
            }
        }
    }

    /// Answers every request parked on `key` with FAILED_OP.
    pub(crate) fn fail_parked(&mut self, key: &str) {
        let entries: Vec<PendingEntry<Parked>> = self.parked.take_key(key);
        if !entries.is_empty() {
            warn!(key, count = entries.len(), "failing parked requests");
        }
        for entry in entries {
            match entry.value {
                Parked::Inbound { request, .. } | Parked::ForwardToStorage { request } => {
                    self.reply_error(&request, ErrorCode::FailedOp);
                }
                Parked::LogDurability { request, .. } => {
                    self.reply_error(&request, ErrorCode::FailedOp);
                }
                Parked::Address {
                    request_id,
                    response_address,
                    tier,
                } => {
                    let response = KeyAddressResponse {
                        response_id: request_id,
                        tier,
                        error: ErrorCode::FailedOp,
                        addresses: vec![KeyAddress {
                            key: entry.key,
                            ips: Vec::new(),
                        }],
                    };
                    self.send(&response_address, &Message::KeyAddressResponse(response));
                }
            }
        }
    }
}
