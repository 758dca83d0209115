//! Consistent hashing.
//!
//! Each tier has a global ring of nodes and a local ring of thread ids. A
//! key is owned by the first `global` distinct nodes clockwise from its
//! position, and on each of those nodes by the first `local` distinct
//! threads clockwise on the local ring.

mod hash;
mod rings;
mod thread;

pub use hash::{ring_position, GlobalHashRing, LocalHashRing, VIRTUAL_THREAD_COUNT};
pub use rings::{HashRings, METADATA_REPLICATION};
pub use thread::ServerThread;
