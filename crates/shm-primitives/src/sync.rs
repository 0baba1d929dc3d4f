//! Atomics used by every protocol word, switched to loom's model-checked
//! versions under the `loom` feature.

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::Arc;
#[cfg(all(not(feature = "loom"), any(test, feature = "alloc")))]
pub use alloc::sync::Arc;

#[cfg(feature = "loom")]
pub use loom::thread;
#[cfg(all(not(feature = "loom"), any(test, feature = "std")))]
pub use std::thread;

/// Load a word with the ordering every reader of a control word uses.
#[inline]
pub fn load(word: &AtomicU32) -> u32 {
    word.load(Ordering::Acquire)
}
