use crate::error::{ServerError, ServerResult};
use crate::node::{Node, TierState};
use crate::pending::Parked;
use crate::routing::Resolution;
use tierkv_core::ServerThread;
use tierkv_protocol::{ErrorCode, KeyAddress, KeyAddressRequest, KeyAddressResponse, Message, Tier};
use tracing::{debug, trace};

/// Tiers searched for owners of a key looked up for `tier`.
fn search_tiers(tier: Tier) -> &'static [Tier] {
    if tier == Tier::Txn {
        &[Tier::Txn]
    } else {
        &Tier::STORAGE_TIERS
    }
}

fn request_address(tier: Tier, thread: &ServerThread) -> String {
    if tier == Tier::Txn {
        thread.txn_request_address()
    } else {
        thread.storage_request_address()
    }
}

impl Node {
    /// Answers which workers own a set of keys.
    ///
    /// Keys with a known replication record are answered in one response.
    /// Each unknown key is parked behind its lookup and answered on its own
    /// once the record arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::WrongTier`] on a non-ROUTING worker.
    pub fn address_handler(&mut self, request: KeyAddressRequest) -> ServerResult<()> {
        if !matches!(self.state, TierState::Routing) {
            return Err(ServerError::wrong_tier(self.tier, "key address requests"));
        }

        let mut response = KeyAddressResponse {
            response_id: request.request_id.clone(),
            tier: request.tier,
            error: ErrorCode::NoError,
            addresses: Vec::new(),
        };

        if self.router.rings().server_count() == 0 {
            debug!("address request with no servers");
            response.error = ErrorCode::NoServers;
            response.addresses = request
                .keys
                .into_iter()
                .map(|key| KeyAddress { key, ips: Vec::new() })
                .collect();
            self.send(&request.response_address, &Message::KeyAddressResponse(response));
            return Ok(());
        }

        let mut parked = 0;
        for key in request.keys {
            if key.is_empty() {
                response.addresses.push(KeyAddress { key, ips: Vec::new() });
                continue;
            }
            match self.resolve(&key, search_tiers(request.tier)) {
                Resolution::Resolved(threads) => {
                    let ips = threads
                        .iter()
                        .map(|thread| request_address(request.tier, thread))
                        .collect();
                    response.addresses.push(KeyAddress { key, ips });
                }
                Resolution::Pending => {
                    trace!(key, "address lookup parked");
                    parked += 1;
                    self.parked.insert(
                        key,
                        Parked::Address {
                            request_id: request.request_id.clone(),
                            response_address: request.response_address.clone(),
                            tier: request.tier,
                        },
                    );
                }
            }
        }

        if response.addresses.is_empty() && parked > 0 {
            return Ok(());
        }
        if !response.addresses.is_empty()
            && response.addresses.iter().all(|address| address.ips.is_empty())
        {
            response.error = ErrorCode::NoServers;
        }
        self.send(&request.response_address, &Message::KeyAddressResponse(response));
        Ok(())
    }

    /// Answers a parked address lookup of `key`.
    pub(crate) fn answer_address(
        &mut self,
        key: &str,
        request_id: String,
        response_address: String,
        tier: Tier,
    ) {
        match self.resolve(key, search_tiers(tier)) {
            Resolution::Pending => {
                self.parked.insert(
                    key,
                    Parked::Address {
                        request_id,
                        response_address,
                        tier,
                    },
                );
            }
            Resolution::Resolved(threads) => {
                let ips: Vec<String> = threads
                    .iter()
                    .map(|thread| request_address(tier, thread))
                    .collect();
                let error = if ips.is_empty() {
                    ErrorCode::NoServers
                } else {
                    ErrorCode::NoError
                };
                let response = KeyAddressResponse {
                    response_id: request_id,
                    tier,
                    error,
                    addresses: vec![KeyAddress {
                        key: key.to_string(),
                        ips,
                    }],
                };
                self.send(&response_address, &Message::KeyAddressResponse(response));
            }
        }
    }
}
