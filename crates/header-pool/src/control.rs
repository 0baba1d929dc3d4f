//! The control word prefix shared by the harvester and every writer.

use shm_primitives::sync::{AtomicU32, Ordering};

use crate::layout::{DRAINING, NOT_DRAINING};
#[cfg(not(feature = "loom"))]
use crate::layout::{
    CONTROL_BYTES, DRAIN_FLAG_OFFSET, HEADER_COUNT_OFFSET, LIVE_WRITERS_OFFSET,
    TIP_BLOCK_NUMBER_OFFSET,
};

/// One of the four control words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Word {
    DrainFlag,
    LiveWriters,
    HeaderCount,
    TipBlockNumber,
}

/// Control words at offset 0 of every pool buffer (16 bytes).
///
/// Only these words are accessed atomically; the hash and header tables are
/// plain bytes whose exclusivity follows from slot reservation.
#[repr(C)]
pub struct ControlWords {
    /// [`DRAINING`] or [`NOT_DRAINING`].
    pub drain_flag: AtomicU32,
    /// Writers currently between `enter_writer` and `leave_writer`.
    pub live_writers: AtomicU32,
    /// Valid (hash, header) pairs, and the next free slot index.
    pub header_count: AtomicU32,
    /// Last externally announced block height.
    pub tip_block_number: AtomicU32,
}

#[cfg(not(feature = "loom"))]
mod assertions {
    use super::*;
    use core::mem::{offset_of, size_of};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<ControlWords>(), CONTROL_BYTES);
    const_assert_eq!(offset_of!(ControlWords, drain_flag), DRAIN_FLAG_OFFSET);
    const_assert_eq!(offset_of!(ControlWords, live_writers), LIVE_WRITERS_OFFSET);
    const_assert_eq!(offset_of!(ControlWords, header_count), HEADER_COUNT_OFFSET);
    const_assert_eq!(
        offset_of!(ControlWords, tip_block_number),
        TIP_BLOCK_NUMBER_OFFSET
    );
}

impl ControlWords {
    /// Fresh words for tests and model checks. Pools overlay the struct on
    /// their buffer instead, which is only built without the `loom` feature.
    pub fn new() -> Self {
        Self {
            drain_flag: AtomicU32::new(NOT_DRAINING),
            live_writers: AtomicU32::new(0),
            header_count: AtomicU32::new(0),
            tip_block_number: AtomicU32::new(0),
        }
    }

    /// Reset to the state a freshly created pool starts in.
    pub fn init(&self) {
        self.drain_flag.store(NOT_DRAINING, Ordering::SeqCst);
        self.live_writers.store(0, Ordering::SeqCst);
        self.header_count.store(0, Ordering::SeqCst);
        self.tip_block_number.store(0, Ordering::SeqCst);
    }

    #[inline]
    pub fn word(&self, word: Word) -> &AtomicU32 {
        match word {
            Word::DrainFlag => &self.drain_flag,
            Word::LiveWriters => &self.live_writers,
            Word::HeaderCount => &self.header_count,
            Word::TipBlockNumber => &self.tip_block_number,
        }
    }

    // -------------------------------------------------------------------------
    // Drain flag
    // -------------------------------------------------------------------------

    #[inline]
    pub fn begin_drain(&self) {
        self.drain_flag.store(DRAINING, Ordering::SeqCst);
    }

    #[inline]
    pub fn end_drain(&self) {
        self.drain_flag.store(NOT_DRAINING, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_draining(&self) -> bool {
        self.drain_flag.load(Ordering::SeqCst) == DRAINING
    }

    // -------------------------------------------------------------------------
    // Live writers
    // -------------------------------------------------------------------------

    #[inline]
    pub fn enter_writer(&self) {
        self.live_writers.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true when this was the last live writer, i.e. the caller should
    /// wake whoever waits for writers to finish.
    #[inline]
    pub fn leave_writer(&self) -> bool {
        let prev = self.live_writers.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "leave_writer without enter_writer");
        prev <= 1
    }

    #[inline]
    pub fn live_writers(&self) -> u32 {
        self.live_writers.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Header count
    // -------------------------------------------------------------------------

    #[inline]
    pub fn header_count(&self) -> u32 {
        self.header_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn reset_header_count(&self) {
        self.header_count.store(0, Ordering::SeqCst);
    }

    /// Reserve the next slot if one is left, returning its index.
    ///
    /// The capacity check and the increment are one compare-and-swap, so the
    /// count never passes `max_peers` no matter how many writers race here.
    pub fn try_reserve_slot(&self, max_peers: u32) -> Option<u32> {
        let mut current = self.header_count.load(Ordering::Acquire);
        loop {
            if current >= max_peers {
                return None;
            }
            match self.header_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Tip block number
    // -------------------------------------------------------------------------

    #[inline]
    pub fn tip_block_number(&self) -> u32 {
        self.tip_block_number.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_tip_block_number(&self, block_no: u32) {
        self.tip_block_number.store(block_no, Ordering::Release);
    }
}

impl Default for ControlWords {
    fn default() -> Self {
        Self::new()
    }
}
