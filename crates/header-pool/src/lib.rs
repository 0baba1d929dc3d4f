//! Fixed-capacity shared memory mailbox for block header announcements.
//!
//! Many [`Writer`]s append `(hash, header)` pairs, rejecting duplicates and
//! refusing once the pool is full. A single [`Harvester`] periodically takes
//! the whole batch and empties the pool. Everything lives in one buffer of
//! 8, 16, 32 or 64 KiB whose first 16 bytes are atomic control words (see
//! [`layout`]), so writers may sit in other processes mapping the same file.
//!
//! Coordination is best effort: a drain waits a bounded time for in-flight
//! writers, and writers wait a bounded time for a drain to end. Neither
//! ever blocks forever on a peer that died.
//!
//! # Example
//!
//! ```
//! # #[cfg(not(feature = "loom"))]
//! # fn main() -> Result<(), header_pool::PoolError> {
//! use header_pool::{Harvester, PoolConfig, WriteResult};
//!
//! let harvester = Harvester::create(PoolConfig::default())?;
//! let writer = harvester.writer();
//!
//! assert_eq!(writer.write(&[1; 32], b"header one"), WriteResult::Ok);
//! assert_eq!(writer.write(&[1; 32], b"header one"), WriteResult::Duplicate);
//!
//! let drained = harvester.drain();
//! assert_eq!(drained.len(), 1);
//! assert_eq!(&drained.get(0).unwrap()[..10], b"header one");
//! assert_eq!(harvester.header_count(), 0);
//! # Ok(())
//! # }
//! # #[cfg(feature = "loom")]
//! # fn main() {}
//! ```
//!
//! # Loom
//!
//! With the `loom` feature the control words use loom's atomics, which
//! cannot be overlaid on raw buffer bytes. Only the layout, config and
//! [`ControlWords`] are built then, and the models construct control words
//! with [`ControlWords::new`]. The buffer, harvester, writer, wait and event
//! modules are left out.

mod config;
mod control;
mod error;
pub mod layout;

#[cfg(not(feature = "loom"))]
mod buffer;
#[cfg(not(feature = "loom"))]
mod events;
#[cfg(not(feature = "loom"))]
mod harvester;
#[cfg(not(feature = "loom"))]
pub mod wait;
#[cfg(not(feature = "loom"))]
mod writer;

pub use config::{DEFAULT_DESIRED_PEERS, DEFAULT_MAX_HEADER_SIZE, PoolConfig};
pub use control::{ControlWords, Word};
pub use error::PoolError;
pub use layout::{HASH_SIZE, PoolLayout, PoolSize, max_peers_for_size};

#[cfg(not(feature = "loom"))]
pub use buffer::PoolBuffer;
#[cfg(not(feature = "loom"))]
pub use events::{Callback, ListenerId, WATCH_SLICE};
#[cfg(not(feature = "loom"))]
pub use harvester::{DrainedHeaders, Harvester};
#[cfg(not(feature = "loom"))]
pub use wait::WaitOutcome;
#[cfg(not(feature = "loom"))]
pub use writer::{WriteResult, Writer};
