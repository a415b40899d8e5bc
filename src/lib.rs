//! Persistent versioned object store with an asynchronous event queue.
//!
//! The storage half keeps objects as nested ordered trees (object id,
//! distribution key, attribute key, record extents) with every record
//! tagged by a monotonic epoch and an originator cookie. Reads resolve
//! against a query epoch, writes are transactional against a
//! persistent-memory pool, and a zero-copy staging surface exposes record
//! addresses to transfer engines directly.
//!
//! The event half is the concurrency primitive the client stack drives
//! operations with: queues of dispatched and completed events, one level of
//! parent/child composition, abort, and waited polling over a transport
//! context.

pub mod config;
pub mod error;
pub mod event;
pub mod hhash;
pub mod ilist;
pub mod iov;
pub mod pal;
pub mod tree;
pub mod vos;

pub use config::StoreConfig;
pub use error::{Error, Result};

/// Install the environment logger once; later calls are no-ops.
#[cfg(feature = "init_env_logger")]
pub fn init_logger() {
    let _ = env_logger::Builder::from_default_env().try_init();
}
