//! Commit sessions of the TXN tier.
//!
//! A [`CommitSession`] follows one COMMIT_TXN through its prepare and
//! commit fan-outs. Every downstream request it sends is expected by id,
//! and the session completes a phase when the last expected id is
//! acknowledged.

use std::collections::HashMap;
use tierkv_core::{ServerThread, TxnId};
use tierkv_protocol::{ErrorCode, TxnRequest};

/// Phase of a commit session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// PREPARE_TXN sent to every touched key.
    Prepare,
    /// COMMIT_TXN sent to every touched key.
    Commit,
}

/// What an acknowledgement did to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// More acknowledgements are outstanding.
    Waiting,
    /// A prepare failed; the transaction must abort.
    Failed {
        /// Key whose prepare failed.
        key: String,
        /// The failure.
        error: ErrorCode,
    },
    /// Every request of the phase was acknowledged.
    Complete {
        /// The phase that completed.
        phase: Phase,
        /// First error among the acknowledgements, `NoError` if none.
        error: ErrorCode,
    },
}

/// One transaction's prepare/commit fan-out.
#[derive(Debug, Clone)]
pub struct CommitSession {
    txn: TxnId,
    client_request: TxnRequest,
    phase: Phase,
    keys: Vec<String>,
    targets: HashMap<String, ServerThread>,
    outstanding: HashMap<String, String>,
    error: ErrorCode,
}

impl CommitSession {
    /// Starts a session in the prepare phase for `keys`, in fan-out order.
    pub fn new(txn: TxnId, client_request: TxnRequest, keys: Vec<String>) -> Self {
        Self {
            txn,
            client_request,
            phase: Phase::Prepare,
            keys,
            targets: HashMap::new(),
            outstanding: HashMap::new(),
            error: ErrorCode::NoError,
        }
    }

    /// The transaction being committed.
    #[must_use]
    pub fn txn(&self) -> &TxnId {
        &self.txn
    }

    /// The client's COMMIT_TXN request.
    #[must_use]
    pub fn client_request(&self) -> &TxnRequest {
        &self.client_request
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Touched keys in fan-out order.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// The storage thread a key was prepared at.
    #[must_use]
    pub fn target(&self, key: &str) -> Option<&ServerThread> {
        self.targets.get(key)
    }

    /// Threads prepared so far, in fan-out order.
    #[must_use]
    pub fn prepared_targets(&self) -> Vec<(String, ServerThread)> {
        self.keys
            .iter()
            .filter_map(|key| self.targets.get(key).map(|t| (key.clone(), t.clone())))
            .collect()
    }

    /// First failure of the current phase, `NoError` if none.
    #[must_use]
    pub fn error(&self) -> ErrorCode {
        self.error
    }

    /// Number of unacknowledged requests.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn expect(&mut self, request_id: String, key: String, target: ServerThread) {
        self.targets.insert(key.clone(), target);
        self.outstanding.insert(request_id, key);
    }

    fn ack(&mut self, request_id: &str, error: ErrorCode) -> Progress {
        let Some(key) = self.outstanding.remove(request_id) else {
            return Progress::Waiting;
        };
        if !error.is_ok() {
            if self.phase == Phase::Prepare {
                return Progress::Failed { key, error };
            }
            if self.error.is_ok() {
                self.error = error;
            }
        }
        if self.outstanding.is_empty() {
            Progress::Complete {
                phase: self.phase,
                error: self.error,
            }
        } else {
            Progress::Waiting
        }
    }
}

/// Open commit sessions of one TXN worker.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<TxnId, CommitSession>,
    by_request: HashMap<String, TxnId>,
}

impl SessionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `session`. Returns false if its transaction already has one.
    pub fn open(&mut self, session: CommitSession) -> bool {
        if self.sessions.contains_key(&session.txn) {
            return false;
        }
        self.sessions.insert(session.txn.clone(), session);
        true
    }

    /// Records that `request_id` was sent to `target` for `key`.
    pub fn expect(&mut self, txn: &TxnId, request_id: String, key: String, target: ServerThread) {
        if let Some(session) = self.sessions.get_mut(txn) {
            self.by_request.insert(request_id.clone(), txn.clone());
            session.expect(request_id, key, target);
        }
    }

    /// Moves the session of `txn` to the commit phase.
    pub fn begin_commit(&mut self, txn: &TxnId) {
        if let Some(session) = self.sessions.get_mut(txn) {
            session.phase = Phase::Commit;
            session.error = ErrorCode::NoError;
        }
    }

    /// Records `error` against the session of `txn` unless an earlier
    /// failure is already recorded. Used when a request could not be sent.
    pub fn fail(&mut self, txn: &TxnId, error: ErrorCode) {
        if let Some(session) = self.sessions.get_mut(txn) {
            if session.error.is_ok() {
                session.error = error;
            }
        }
    }

    /// Applies the acknowledgement of `request_id`. Returns `None` when no
    /// open session expects it.
    pub fn ack(&mut self, request_id: &str, error: ErrorCode) -> Option<(TxnId, Progress)> {
        let txn = self.by_request.remove(request_id)?;
        let session = self.sessions.get_mut(&txn)?;
        let progress = session.ack(request_id, error);
        Some((txn, progress))
    }

    /// Returns the session of `txn`.
    #[must_use]
    pub fn get(&self, txn: &TxnId) -> Option<&CommitSession> {
        self.sessions.get(txn)
    }

    /// Returns whether `txn` has an open session.
    #[must_use]
    pub fn contains(&self, txn: &TxnId) -> bool {
        self.sessions.contains_key(txn)
    }

    /// Closes the session of `txn`; later acknowledgements are ignored.
    pub fn close(&mut self, txn: &TxnId) -> Option<CommitSession> {
        let session = self.sessions.remove(txn)?;
        for request_id in session.outstanding.keys() {
            self.by_request.remove(request_id);
        }
        Some(session)
    }

    /// Number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
