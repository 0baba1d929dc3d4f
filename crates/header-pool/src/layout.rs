//! Header pool memory layout and sizing.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | CONTROL WORDS (16 bytes)                                          |
//! |   drain flag, live writers, header count, tip block number        |
//! +-------------------------------------------------------------------+
//! | HASH TABLE (max_peers * 32 bytes)                                 |
//! |   slot i: hash of the header in header slot i                     |
//! +-------------------------------------------------------------------+
//! | HEADER TABLE (max_peers * max_header_size bytes)                  |
//! |   slot i: raw header bytes, zero padded                           |
//! +-------------------------------------------------------------------+
//! | unused tail                                                       |
//! +-------------------------------------------------------------------+
//! ```
//!
//! The buffer is always one of four power-of-two sizes. `max_peers` is not
//! stored anywhere: every party recomputes it from the buffer size and the
//! header size with [`max_peers_for_size`], so that function must stay
//! bit-for-bit stable.

use crate::config::PoolConfig;
use crate::error::PoolError;

// =============================================================================
// Constants
// =============================================================================

/// Drain flag value while the harvester is draining.
pub const DRAINING: u32 = 0;
/// Drain flag value the rest of the time.
pub const NOT_DRAINING: u32 = 1;

/// Size of the control word prefix.
pub const CONTROL_BYTES: usize = 16;

/// Width of a header hash.
pub const HASH_SIZE: usize = 32;

pub const DRAIN_FLAG_OFFSET: usize = 0;
pub const LIVE_WRITERS_OFFSET: usize = 4;
pub const HEADER_COUNT_OFFSET: usize = 8;
pub const TIP_BLOCK_NUMBER_OFFSET: usize = 12;

// =============================================================================
// Pool sizes
// =============================================================================

/// The only buffer sizes a pool may have.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolSize {
    /// 8 KiB (15 slots at 512-byte headers).
    Kb8 = 8192,
    /// 16 KiB (30 slots at 512-byte headers).
    Kb16 = 16384,
    /// 32 KiB (60 slots at 512-byte headers).
    Kb32 = 32768,
    /// 64 KiB (120 slots at 512-byte headers).
    Kb64 = 65536,
}

impl PoolSize {
    pub const ALL: [PoolSize; 4] = [Self::Kb8, Self::Kb16, Self::Kb32, Self::Kb64];

    #[inline]
    pub const fn bytes(self) -> usize {
        self as u32 as usize
    }

    pub fn from_len(len: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|size| size.bytes() == len)
    }

    /// Smallest size whose byte count covers `desired_peers * max_header_size`,
    /// falling back to the largest.
    pub fn optimal(desired_peers: u32, max_header_size: u32) -> Self {
        let desired = desired_peers as u64 * max_header_size as u64;
        if desired > Self::Kb32 as u64 {
            Self::Kb64
        } else if desired > Self::Kb16 as u64 {
            Self::Kb32
        } else if desired > Self::Kb8 as u64 {
            Self::Kb16
        } else {
            Self::Kb8
        }
    }
}

impl std::fmt::Display for PoolSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} KiB", self.bytes() / 1024)
    }
}

// =============================================================================
// Layout Calculations
// =============================================================================

/// How many `max_header_size` headers fit in `allocated` bytes, ignoring hashes.
#[inline]
pub fn max_peers_allowed(allocated: usize, max_header_size: u32) -> u32 {
    if max_header_size == 0 {
        return 0;
    }
    (allocated / max_header_size as usize).min(u32::MAX as usize) as u32
}

/// Largest slot count `n` with `CONTROL_BYTES + n * (HASH_SIZE + max_header_size) <= size`.
///
/// Estimates from the header space alone, corrects for the hash table eating
/// into that space, then walks upward until the next slot would not fit.
pub fn max_peers_for_size(max_header_size: u32, size: PoolSize) -> u32 {
    let full = size.bytes();

    let upper = max_peers_allowed(full, max_header_size);
    let headers_space_on_upper = full.saturating_sub(CONTROL_BYTES + HASH_SIZE * upper as usize);
    let lower = max_peers_allowed(headers_space_on_upper, max_header_size);

    let per_peer = (HASH_SIZE as u64) + max_header_size as u64;
    let required = |n: u64| n * per_peer + CONTROL_BYTES as u64;

    let mut n = lower as u64;
    while required(n) <= full as u64 {
        n += 1;
    }
    n.saturating_sub(1) as u32
}

/// Resolved layout for one pool buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    pub desired_peers: u32,
    pub max_header_size: u32,
    pub size: PoolSize,
    pub max_peers: u32,
    /// Total bytes of the hash table.
    pub all_hashes_size: usize,
    /// Offset of hash slot 0.
    pub hashes_offset: usize,
    /// Offset of header slot 0.
    pub headers_offset: usize,
}

impl PoolLayout {
    pub fn resolve(config: &PoolConfig, size: PoolSize) -> Self {
        let max_peers = max_peers_for_size(config.max_header_size, size);
        let all_hashes_size = max_peers as usize * HASH_SIZE;
        let hashes_offset = CONTROL_BYTES;

        Self {
            desired_peers: config.desired_peers,
            max_header_size: config.max_header_size,
            size,
            max_peers,
            all_hashes_size,
            hashes_offset,
            headers_offset: hashes_offset + all_hashes_size,
        }
    }

    /// Resolve against a raw buffer length, rejecting unsupported sizes.
    pub fn for_len(config: &PoolConfig, len: usize) -> Result<Self, PoolError> {
        let size = PoolSize::from_len(len).ok_or(PoolError::UnsupportedSize(len))?;
        Ok(Self::resolve(config, size))
    }

    #[inline]
    pub fn hash_offset(&self, slot: u32) -> usize {
        debug_assert!(slot < self.max_peers);
        self.hashes_offset + slot as usize * HASH_SIZE
    }

    #[inline]
    pub fn header_offset(&self, slot: u32) -> usize {
        debug_assert!(slot < self.max_peers);
        self.headers_offset + slot as usize * self.max_header_size as usize
    }

    /// End of the header table; everything after is unused.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.headers_offset + self.max_peers as usize * self.max_header_size as usize
    }
}

// =============================================================================
// Tests
// =============================================================================
