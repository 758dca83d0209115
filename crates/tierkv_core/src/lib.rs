//! # tierkv core
//!
//! Per-worker building blocks of the tierkv transaction tiers:
//!
//! - [`ring`]: consistent hash rings and key ownership
//! - [`replication`]: cached replication factors per key
//! - [`store`]: concurrency-control stores (single lock, 2PL, disk 2PL, MVCC)
//! - [`registry`]: open transactions and their operations
//! - [`log`]: the write-ahead log store with optional journaling
//!
//! Everything here is owned by exactly one worker and is not thread-safe by
//! itself; cross-worker coordination lives in `tierkv_server`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
pub mod log;
pub mod registry;
pub mod replication;
pub mod ring;
pub mod store;
mod types;

pub use config::{ClusterConfig, ReplicationDefaults, TierCounts};
pub use error::{CoreError, CoreResult};
pub use log::LogStore;
pub use registry::TxnRegistry;
pub use replication::{KeyReplication, ReplicationMap};
pub use ring::{GlobalHashRing, HashRings, LocalHashRing, ServerThread};
pub use store::{open_store, ConcurrencyProtocol, ConcurrencyStore};
pub use types::TxnId;
