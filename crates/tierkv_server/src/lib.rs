//! # tierkv server
//!
//! Workers of the tierkv tiers and an in-process cluster to run them.
//!
//! A [`Node`] is the state of one worker thread: its ring view, its
//! replication cache and the state of its tier (open transactions, a
//! concurrency-control store, or a write-ahead log). Handlers run to
//! completion on `&mut Node`; anything that has to wait for another worker
//! is parked in a pending table and resumed by a later message.
//!
//! # Request flow
//!
//! ```text
//! client ──START/GET/PUT/COMMIT──▶ TXN ──GET/PUT/PREPARE/COMMIT──▶ MEMORY|DISK ──record──▶ LOG
//!    ▲                              │  ◀───────────── reply ──────────── │ ◀──── position ──┘
//!    └──────────── reply ───────────┘
//! ```
//!
//! Commit runs two phases from the TXN worker: every touched key is
//! prepared, and only once all prepares succeed is every key committed.
//! A failed prepare aborts the transaction on every key it touched.
//!
//! # Running a cluster
//!
//! ```rust,ignore
//! use tierkv_core::ClusterConfig;
//! use tierkv_server::LocalCluster;
//!
//! let cluster = LocalCluster::start(ClusterConfig::default())?;
//! let network = cluster.network();
//! let routing = cluster.routing_addresses();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod cluster;
mod error;
mod handlers;
mod node;
mod pending;
mod routing;
mod session;
mod worker;

pub use cluster::LocalCluster;
pub use error::{ServerError, ServerResult};
pub use node::{Node, TierState};
pub use pending::{InFlight, Parked, PendingEntry, PendingId, PendingTable};
pub use routing::{
    issue_abort_request, issue_log_request, issue_storage_request, Resolution, Router,
};
pub use session::{CommitSession, Phase, Progress, SessionTable};
pub use worker::Worker;
