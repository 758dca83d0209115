//! Message handlers.
//!
//! Each module adds one handler to [`Node`](crate::Node):
//!
//! | handler | tier | input |
//! |---|---|---|
//! | `user_txn_request_handler` | TXN | client transaction requests |
//! | `storage_request_handler` | MEMORY, DISK | key operations and metadata lookups |
//! | `log_request_handler` | LOG | prepare and commit records |
//! | `request_response_handler` | TXN, MEMORY, DISK | downstream replies |
//! | `replication_response_handler` | all | metadata lookup replies |
//! | `replication_change_handler` | all | replication factor updates |
//! | `address_handler` | ROUTING | key address lookups |
//! | `membership_handler` | all | node joins and departures |

mod address;
mod log;
mod membership;
mod replication_change;
mod replication_response;
mod request_response;
mod storage;
mod user_txn;
