//! # tierkv client
//!
//! Client library for tierkv transactions.
//!
//! [`TxnClient`] issues the four transaction commands (START_TXN, TXN_GET,
//! TXN_PUT, COMMIT_TXN) to the TXN tier. It looks up which TXN worker owns
//! a client id through the ROUTING tier, caches the answer, and retries
//! requests that go unanswered or land on the wrong worker.
//!
//! ```rust,ignore
//! use tierkv_client::{ClientConfig, TxnClient};
//!
//! let config = ClientConfig::new("34.0.9.1", 0).with_routing(cluster.routing_addresses());
//! let mut client = TxnClient::connect(&cluster.network(), config);
//!
//! let id = client.start_txn("alice")?;
//! let txn = client.wait_for(&id).await?.txn_id;
//! let id = client.txn_put(&txn, "k", "v")?;
//! client.wait_for(&id).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;

pub use client::TxnClient;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
