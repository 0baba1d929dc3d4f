//! Shared memory building blocks.
//!
//! This crate provides `no_std`-compatible pieces for protocols that live
//! inside a single shared memory region and coordinate through atomic words
//! embedded in that region.
//!
//! # Primitives
//!
//! - [`Region`]: a raw `(base, len)` view over shared bytes, with typed access
//!   at offsets.
//! - [`HeapRegion`]: an owned, zeroed, cache-line aligned allocation that hands
//!   out [`Region`]s.
//! - [`futex`]: block until an `AtomicU32` stops holding an expected value, or
//!   wake everyone blocked on it.
//!
//! # Loom Testing
//!
//! Enable the `loom` feature to swap the atomics for loom's model-checked ones.
//! The futex primitive degrades to a single yield under loom, which models a
//! wait that may time out at any point.
//!
//! ```text
//! cargo test -p shm-primitives --features loom --release loom
//! cargo test -p header-pool --features loom --release loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(feature = "std")]
pub mod futex;
pub mod region;
pub mod sync;


#[cfg(feature = "std")]
pub use futex::{FutexWait, futex_wait, futex_wake, futex_wake_all};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::{REGION_ALIGN, Region};
