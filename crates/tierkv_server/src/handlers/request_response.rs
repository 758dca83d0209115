use crate::error::ServerResult;
use crate::node::Node;
use crate::pending::InFlight;
use crate::session::{Phase, Progress};
use tierkv_core::TxnId;
use tierkv_protocol::{ErrorCode, Message, RequestType, Tier, TxnResponse};
use tracing::debug;

impl Node {
    /// Handles replies from the next tier down.
    ///
    /// At the TXN tier a reply either completes a forwarded GET or PUT or
    /// acknowledges one key of a commit session; the last acknowledgement of
    /// a phase moves the session on. At a storage tier a LOG acknowledgement
    /// releases the held prepare or commit reply.
    ///
    /// # Errors
    ///
    /// This handler does not fail; unmatched replies are dropped.
    pub fn request_response_handler(&mut self, response: TxnResponse) -> ServerResult<()> {
        let error = response.first_error();

        if let Some(entry) = self.in_flight.take_key(&response.response_id).into_iter().next() {
            match entry.value {
                InFlight::Client { request } => {
                    if request.request_type == RequestType::TxnPut
                        && !error.is_ok()
                        && error != ErrorCode::WrongThread
                    {
                        let txn = TxnId::from(request.txn_id.as_str());
                        if let Some(registry) = self.registry() {
                            registry.mark_failed(&txn);
                        }
                    }
                    let mut reply = TxnResponse::for_request(&request, Tier::Txn);
                    reply.error = response.error;
                    reply.tuples = response.tuples;
                    self.reply(&request, reply);
                }
                InFlight::Durability {
                    response_address,
                    mut response,
                } => {
                    if !error.is_ok() {
                        for tuple in &mut response.tuples {
                            tuple.error = error;
                        }
                    }
                    if !response_address.is_empty() {
                        self.send(&response_address, &Message::TxnResponse(response));
                    }
                }
            }
            return Ok(());
        }

        let Some((txn, progress)) = self.sessions.ack(&response.response_id, error) else {
            debug!(response_id = %response.response_id, "unmatched response");
            return Ok(());
        };
        match progress {
            Progress::Waiting => {}
            Progress::Failed { key, error } => {
                debug!(%txn, key, %error, "prepare failed");
                self.abort_txn(&txn, ErrorCode::FailedOp);
            }
            Progress::Complete {
                phase: Phase::Prepare,
                ..
            } => self.begin_commit_phase(&txn),
            Progress::Complete {
                phase: Phase::Commit,
                error,
            } => {
                if let Some(session) = self.sessions.close(&txn) {
                    self.finish_txn(session, error);
                }
            }
        }
        Ok(())
    }
}
