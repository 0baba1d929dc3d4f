//! The appending side of a pool.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::buffer::PoolBuffer;
use crate::config::PoolConfig;
use crate::control::Word;
use crate::error::PoolError;
use crate::events::{ListenerId, WordWatcher, space_freed};
use crate::layout::{HASH_SIZE, PoolLayout, PoolSize};
use crate::wait::{
    WRITER_GATE_TIMEOUT, WaitOutcome, draining, notify_all, wait_while, wait_while_async,
};

/// Outcome of one [`Writer::write`]. None of these are errors.
#[repr(u8)]
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteResult {
    /// The pair was stored.
    Ok = 0,
    /// Hash is not 32 bytes or the header exceeds `max_header_size`.
    Invalid = 1,
    /// Every slot was taken when this writer looked.
    InsufficientSpace = 2,
    /// A stored entry already carries this hash.
    Duplicate = 3,
}

impl WriteResult {
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for WriteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Invalid => "invalid",
            Self::InsufficientSpace => "insufficient space",
            Self::Duplicate => "duplicate",
        };
        f.write_str(s)
    }
}

/// One of many concurrent appenders to a pool.
///
/// Writers never allocate or initialise the buffer; they attach to what the
/// harvester created.
pub struct Writer {
    buffer: PoolBuffer,
    layout: PoolLayout,
    free: WordWatcher,
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("buffer", &self.buffer)
            .field("max_peers", &self.layout.max_peers)
            .finish_non_exhaustive()
    }
}

impl Writer {
    /// Attach to a buffer the harvester handed out with its layout.
    pub fn attach(buffer: PoolBuffer, layout: PoolLayout) -> Result<Self, PoolError> {
        let len = buffer.len();
        PoolSize::from_len(len).ok_or(PoolError::UnsupportedSize(len))?;
        if len != layout.size.bytes() {
            return Err(PoolError::LayoutMismatch {
                expected: layout.size.bytes(),
                found: len,
            });
        }

        let config = PoolConfig {
            desired_peers: layout.desired_peers,
            max_header_size: layout.max_header_size,
        };
        config.validate_for(layout.size)?;
        if PoolLayout::resolve(&config, layout.size) != layout {
            return Err(PoolError::InconsistentLayout);
        }
        Ok(Self::from_parts(buffer, layout))
    }

    pub(crate) fn from_parts(buffer: PoolBuffer, layout: PoolLayout) -> Self {
        let free = WordWatcher::new("pool-free", buffer.clone(), Word::HeaderCount, space_freed);
        Self {
            buffer,
            layout,
            free,
        }
    }

    #[inline]
    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    pub fn tip_block_number(&self) -> u32 {
        self.buffer.control().tip_block_number()
    }

    pub fn header_count(&self) -> u32 {
        self.buffer.control().header_count()
    }

    /// Append `(hash, header)` unless it is malformed, already present, or
    /// the pool is full.
    ///
    /// While a drain is in progress this blocks for up to
    /// [`WRITER_GATE_TIMEOUT`], then proceeds regardless.
    pub fn write(&self, hash: &[u8], header: &[u8]) -> WriteResult {
        if let Err(rejected) = self.check_shape(hash, header) {
            return rejected;
        }

        let control = self.buffer.control();
        if control.is_draining() {
            let outcome = wait_while(
                control.word(Word::DrainFlag),
                draining,
                WRITER_GATE_TIMEOUT,
            );
            log_gate_timeout(outcome);
        }

        self.write_entered(hash, header)
    }

    /// [`Writer::write`] that yields to the executor instead of blocking
    /// while a drain is in progress.
    pub async fn write_async(&self, hash: &[u8], header: &[u8]) -> WriteResult {
        if let Err(rejected) = self.check_shape(hash, header) {
            return rejected;
        }

        let outcome = wait_while_async(
            self.buffer.clone(),
            Word::DrainFlag,
            draining,
            WRITER_GATE_TIMEOUT,
        )
        .await;
        log_gate_timeout(outcome);

        self.write_entered(hash, header)
    }

    fn check_shape(&self, hash: &[u8], header: &[u8]) -> Result<(), WriteResult> {
        if hash.len() != HASH_SIZE || header.len() > self.layout.max_header_size as usize {
            tracing::trace!(
                hash_len = hash.len(),
                header_len = header.len(),
                max_header_size = self.layout.max_header_size,
                "rejecting malformed write"
            );
            return Err(WriteResult::Invalid);
        }
        Ok(())
    }

    /// Everything after the drain gate, bracketed by the live-writer count.
    fn write_entered(&self, hash: &[u8], header: &[u8]) -> WriteResult {
        let control = self.buffer.control();
        control.enter_writer();
        let result = self.append(hash, header);
        if control.leave_writer() {
            notify_all(control.word(Word::LiveWriters));
        }
        result
    }

    fn append(&self, hash: &[u8], header: &[u8]) -> WriteResult {
        let control = self.buffer.control();
        let max_peers = self.layout.max_peers;

        let count = control.header_count();
        if count >= max_peers {
            tracing::trace!(count, max_peers, "pool full");
            return WriteResult::InsufficientSpace;
        }
        if self.contains_hash(hash, count) {
            tracing::trace!("duplicate header hash");
            return WriteResult::Duplicate;
        }

        // Another writer may have taken the last slot since the check above.
        let Some(slot) = control.try_reserve_slot(max_peers) else {
            tracing::trace!(max_peers, "pool filled while scanning");
            return WriteResult::InsufficientSpace;
        };

        let region = self.buffer.region();
        let header_offset = self.layout.header_offset(slot);
        let padding = self.layout.max_header_size as usize - header.len();
        // SAFETY: the reservation makes `slot` exclusively ours until the next
        // drain, and the drain waits for us to leave before reading it.
        unsafe {
            region.write_bytes(self.layout.hash_offset(slot), hash);
            region.write_bytes(header_offset, header);
            region.zero_bytes(header_offset + header.len(), padding);
        }

        notify_all(control.word(Word::HeaderCount));
        WriteResult::Ok
    }

    /// Linear scan of the first `count` hash slots.
    ///
    /// Slots reserved by writers still copying may hold stale bytes, so a
    /// concurrent duplicate can slip through.
    fn contains_hash(&self, hash: &[u8], count: u32) -> bool {
        let region = self.buffer.region();
        (0..count.min(self.layout.max_peers)).any(|slot| {
            let ptr = region.offset(self.layout.hash_offset(slot)) as *const [u8; HASH_SIZE];
            // SAFETY: in bounds by layout; a volatile copy never hands out a
            // reference into bytes another writer may be filling.
            let stored = unsafe { ptr.read_volatile() };
            stored[..] == *hash
        })
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Call `callback` whenever a drain frees slots.
    pub fn on_free(&self, callback: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.free.on(Arc::new(callback))
    }

    /// Call `callback` the next time a drain frees slots.
    pub fn once_free(&self, callback: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.free.once(Arc::new(callback))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.free.off(id)
    }

    /// Header count as of the last time space was freed.
    pub fn subscribe_free(&self) -> watch::Receiver<u32> {
        self.free.subscribe()
    }
}

fn log_gate_timeout(outcome: WaitOutcome) {
    if outcome == WaitOutcome::TimedOut {
        tracing::warn!(
            timeout_ms = WRITER_GATE_TIMEOUT.as_millis() as u64,
            "drain still in progress, writing anyway"
        );
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::Harvester;
    use std::thread;
    use std::time::{Duration, Instant};

    fn hash(n: u8) -> [u8; 32] {
        let mut h = [0u8; 32];
        h[0] = n;
        h[31] = n.wrapping_mul(7);
        h
    }

    #[test]
    fn discriminants_are_stable() {
        assert_eq!(WriteResult::Ok as u8, 0);
        assert_eq!(WriteResult::Invalid as u8, 1);
        assert_eq!(WriteResult::InsufficientSpace as u8, 2);
        assert_eq!(WriteResult::Duplicate as u8, 3);
        assert!(WriteResult::Ok.is_ok());
        assert_eq!(WriteResult::InsufficientSpace.to_string(), "insufficient space");
    }

    #[test]
    fn attach_checks_buffer_against_layout() {
        let harvester = Harvester::create(PoolConfig::default()).unwrap();
        let (buffer, layout) = harvester.writer_args();
        assert!(Writer::attach(buffer, layout).is_ok());

        let other = PoolBuffer::allocate(PoolSize::Kb64);
        let err = Writer::attach(other, layout).unwrap_err();
        assert!(matches!(
            err,
            PoolError::LayoutMismatch {
                expected: 16384,
                found: 65536
            }
        ));
    }

    #[test]
    fn attach_rejects_tampered_layout() {
        let harvester = Harvester::create(PoolConfig::default()).unwrap();
        let (buffer, layout) = harvester.writer_args();

        let mut more_slots = layout;
        more_slots.max_peers += 1;
        assert!(matches!(
            Writer::attach(buffer.clone(), more_slots),
            Err(PoolError::InconsistentLayout)
        ));

        let mut shifted = layout;
        shifted.headers_offset += HASH_SIZE;
        assert!(matches!(
            Writer::attach(buffer.clone(), shifted),
            Err(PoolError::InconsistentLayout)
        ));

        let mut no_width = layout;
        no_width.max_header_size = 0;
        assert!(matches!(
            Writer::attach(buffer, no_width),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_malformed_shapes() {
        let harvester = Harvester::create(PoolConfig::default()).unwrap();
        let writer = harvester.writer();

        assert_eq!(writer.write(&[1; 31], b"h"), WriteResult::Invalid);
        assert_eq!(writer.write(&[1; 33], b"h"), WriteResult::Invalid);
        assert_eq!(writer.write(&hash(1), &[0; 513]), WriteResult::Invalid);
        assert_eq!(harvester.header_count(), 0);
        assert_eq!(harvester.live_writers(), 0);

        assert_eq!(writer.write(&hash(1), &[9; 512]), WriteResult::Ok);
        assert_eq!(writer.write(&hash(2), b""), WriteResult::Ok);
    }

    #[test]
    fn duplicate_hash_is_rejected() {
        let harvester = Harvester::create(PoolConfig::default()).unwrap();
        let writer = harvester.writer();
        assert_eq!(writer.write(&hash(5), b"one"), WriteResult::Ok);
        assert_eq!(writer.write(&hash(5), b"two"), WriteResult::Duplicate);
        assert_eq!(harvester.header_count(), 1);

        // After a drain the same hash is new again.
        harvester.drain();
        assert_eq!(writer.write(&hash(5), b"three"), WriteResult::Ok);
    }

    #[test]
    fn full_pool_rejects_without_mutation() {
        let config = PoolConfig::default().with_desired_peers(1);
        let harvester = Harvester::create(config).unwrap();
        let writer = harvester.writer();
        let max = harvester.layout().max_peers;
        assert_eq!(max, 15);

        for n in 0..max {
            assert_eq!(writer.write(&hash(n as u8), b"x"), WriteResult::Ok);
        }
        let before = harvester.buffer().snapshot();
        assert_eq!(
            writer.write(&hash(200), b"y"),
            WriteResult::InsufficientSpace
        );
        assert_eq!(harvester.buffer().snapshot(), before);
    }

    #[test]
    fn slot_padding_is_cleared() {
        let harvester = Harvester::create(PoolConfig::default()).unwrap();
        let writer = harvester.writer();
        assert_eq!(writer.write(&hash(1), &[0xAA; 100]), WriteResult::Ok);
        harvester.drain();

        // Same slot, shorter header: nothing of the old one may show.
        assert_eq!(writer.write(&hash(2), &[0xBB; 10]), WriteResult::Ok);
        let drained = harvester.drain();
        let slot = drained.get(0).unwrap();
        assert!(slot[..10].iter().all(|&b| b == 0xBB));
        assert!(slot[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn gate_holds_writer_until_drain_ends() {
        let harvester = Harvester::create(PoolConfig::default()).unwrap();
        let writer = harvester.writer();
        let buffer = harvester.buffer().clone();
        buffer.control().begin_drain();

        let opener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            buffer.control().end_drain();
            notify_all(buffer.control().word(Word::DrainFlag));
        });

        let start = Instant::now();
        assert_eq!(writer.write(&hash(1), b"gated"), WriteResult::Ok);
        assert!(start.elapsed() >= Duration::from_millis(40));
        opener.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_async_fast_path() {
        let harvester = Harvester::create(PoolConfig::default()).unwrap();
        let writer = harvester.writer();
        assert_eq!(writer.write_async(&hash(1), b"a").await, WriteResult::Ok);
        assert_eq!(
            writer.write_async(&hash(1), b"a").await,
            WriteResult::Duplicate
        );
        assert_eq!(writer.write_async(&[0; 3], b"a").await, WriteResult::Invalid);
    }
}
