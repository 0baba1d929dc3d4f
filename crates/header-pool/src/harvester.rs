//! The reading side of a pool: owns the buffer and periodically drains it.

use std::sync::Arc;

use tokio::sync::watch;

use crate::buffer::PoolBuffer;
use crate::config::PoolConfig;
use crate::control::Word;
use crate::error::PoolError;
use crate::events::{ListenerId, WordWatcher, any_change, data_arrived};
use crate::layout::{HASH_SIZE, HEADER_COUNT_OFFSET, PoolLayout};
use crate::wait::{
    DRAIN_WAIT_TIMEOUT, WaitOutcome, notify_all, wait_while, wait_while_async, writers_active,
};
use crate::writer::Writer;

/// Single reader of a header pool.
///
/// There must be at most one harvester per buffer; two concurrent drains of
/// the same buffer are not coordinated.
pub struct Harvester {
    buffer: PoolBuffer,
    layout: PoolLayout,
    data: WordWatcher,
    tip: WordWatcher,
}

impl std::fmt::Debug for Harvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harvester")
            .field("buffer", &self.buffer)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Harvester {
    /// Allocate a fresh private buffer sized for `config`.
    pub fn create(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let size = config.optimal_size();
        let buffer = PoolBuffer::allocate(size);
        tracing::debug!(
            %size,
            desired_peers = config.desired_peers,
            max_header_size = config.max_header_size,
            "created header pool"
        );
        Self::attach(buffer, config)
    }

    /// Initialise an externally provided buffer (typically a file mapping)
    /// and take ownership of draining it.
    pub fn create_in(buffer: PoolBuffer, config: PoolConfig) -> Result<Self, PoolError> {
        let layout = PoolLayout::for_len(&config, buffer.len())?;
        config.validate_for(layout.size)?;
        buffer.initialize();
        Self::attach(buffer, config)
    }

    /// Take over an already initialised buffer as-is.
    pub fn attach(buffer: PoolBuffer, config: PoolConfig) -> Result<Self, PoolError> {
        let layout = PoolLayout::for_len(&config, buffer.len())?;
        config.validate_for(layout.size)?;

        let data = WordWatcher::new(
            "pool-data",
            buffer.clone(),
            Word::HeaderCount,
            data_arrived,
        );
        let tip = WordWatcher::new("pool-tip", buffer.clone(), Word::TipBlockNumber, any_change);

        Ok(Self {
            buffer,
            layout,
            data,
            tip,
        })
    }

    #[inline]
    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    #[inline]
    pub fn buffer(&self) -> &PoolBuffer {
        &self.buffer
    }

    /// What a writer needs to attach: a handle to the buffer and the layout.
    pub fn writer_args(&self) -> (PoolBuffer, PoolLayout) {
        (self.buffer.clone(), self.layout)
    }

    /// A writer on this pool in the same process.
    pub fn writer(&self) -> Writer {
        Writer::from_parts(self.buffer.clone(), self.layout)
    }

    /// Publish the chain tip and wake anyone watching it.
    pub fn record_tip_block_number(&self, block_no: u32) {
        let control = self.buffer.control();
        control.store_tip_block_number(block_no);
        notify_all(control.word(Word::TipBlockNumber));
    }

    pub fn tip_block_number(&self) -> u32 {
        self.buffer.control().tip_block_number()
    }

    pub fn header_count(&self) -> u32 {
        self.buffer.control().header_count()
    }

    pub fn live_writers(&self) -> u32 {
        self.buffer.control().live_writers()
    }

    pub fn is_draining(&self) -> bool {
        self.buffer.control().is_draining()
    }

    /// Wake everything parked on the header count. Returns how many woke.
    pub fn request_headers(&self) -> u32 {
        notify_all(self.buffer.control().word(Word::HeaderCount))
    }

    /// Take every header written since the last drain and empty the pool.
    ///
    /// Blocks for up to [`DRAIN_WAIT_TIMEOUT`] while writers finish. If they
    /// do not, the drain goes ahead anyway and a late writer may land in the
    /// emptied pool or be lost.
    pub fn drain(&self) -> DrainedHeaders {
        let control = self.buffer.control();
        control.begin_drain();
        let outcome = wait_while(
            control.word(Word::LiveWriters),
            writers_active,
            DRAIN_WAIT_TIMEOUT,
        );
        self.finish_drain(outcome)
    }

    /// [`Harvester::drain`] without blocking the executor while writers finish.
    pub async fn drain_async(&self) -> DrainedHeaders {
        self.buffer.control().begin_drain();
        let outcome = wait_while_async(
            self.buffer.clone(),
            Word::LiveWriters,
            writers_active,
            DRAIN_WAIT_TIMEOUT,
        )
        .await;
        self.finish_drain(outcome)
    }

    fn finish_drain(&self, outcome: WaitOutcome) -> DrainedHeaders {
        let control = self.buffer.control();
        if outcome == WaitOutcome::TimedOut {
            tracing::warn!(
                live_writers = control.live_writers(),
                timeout_ms = DRAIN_WAIT_TIMEOUT.as_millis() as u64,
                "drain proceeding with writers still live"
            );
        }

        let snapshot = self.buffer.snapshot();
        control.reset_header_count();
        control.end_drain();
        notify_all(control.word(Word::DrainFlag));
        self.request_headers();

        let drained = DrainedHeaders::from_snapshot(snapshot, self.layout);
        tracing::debug!(headers = drained.len(), "drained header pool");
        drained
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Call `callback` whenever headers become available.
    pub fn on_data(&self, callback: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.data.on(Arc::new(callback))
    }

    /// Call `callback` the next time headers become available.
    pub fn once_data(&self, callback: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.data.once(Arc::new(callback))
    }

    /// Remove a data or tip listener. Returns false if `id` was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.data.off(id) | self.tip.off(id)
    }

    /// Header count as of the last data event.
    pub fn subscribe_data(&self) -> watch::Receiver<u32> {
        self.data.subscribe()
    }

    /// Tip block number as of the last change.
    pub fn subscribe_tip(&self) -> watch::Receiver<u32> {
        self.tip.subscribe()
    }
}

/// Headers taken out of the pool by one drain, in slot order.
#[derive(Clone)]
pub struct DrainedHeaders {
    snapshot: Vec<u8>,
    layout: PoolLayout,
    count: u32,
}

impl std::fmt::Debug for DrainedHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainedHeaders")
            .field("count", &self.count)
            .field("max_header_size", &self.layout.max_header_size)
            .finish()
    }
}

impl DrainedHeaders {
    fn from_snapshot(snapshot: Vec<u8>, layout: PoolLayout) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&snapshot[HEADER_COUNT_OFFSET..HEADER_COUNT_OFFSET + 4]);
        let recorded = u32::from_ne_bytes(raw);

        let count = if recorded > layout.max_peers {
            tracing::warn!(
                recorded,
                max_peers = layout.max_peers,
                "header count past capacity, clamping"
            );
            layout.max_peers
        } else {
            recorded
        };

        Self {
            snapshot,
            layout,
            count,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Header slot `index`, `max_header_size` bytes including zero padding.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        if index >= self.len() {
            return None;
        }
        let start = self.layout.header_offset(index as u32);
        Some(&self.snapshot[start..start + self.layout.max_header_size as usize])
    }

    /// Hash written alongside header `index`.
    pub fn hash(&self, index: usize) -> Option<&[u8; HASH_SIZE]> {
        if index >= self.len() {
            return None;
        }
        let start = self.layout.hash_offset(index as u32);
        self.snapshot[start..start + HASH_SIZE].try_into().ok()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &[u8]> + '_ {
        let width = self.layout.max_header_size as usize;
        let start = self.layout.headers_offset;
        self.snapshot[start..start + self.len() * width].chunks_exact(width)
    }

    /// `(hash, header)` pairs in slot order.
    pub fn entries(&self) -> impl Iterator<Item = (&[u8; HASH_SIZE], &[u8])> + '_ {
        (0..self.len()).filter_map(|i| Some((self.hash(i)?, self.get(i)?)))
    }

    pub fn into_vec(self) -> Vec<Vec<u8>> {
        self.iter().map(<[u8]>::to_vec).collect()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::layout::PoolSize;
    use crate::writer::WriteResult;
    use std::thread;
    use std::time::{Duration, Instant};

    fn harvester() -> Harvester {
        Harvester::create(PoolConfig::default()).unwrap()
    }

    #[test]
    fn create_picks_optimal_size() {
        let h = harvester();
        assert_eq!(h.layout().size, PoolSize::Kb16);
        assert_eq!(h.layout().max_peers, 30);
        assert_eq!(h.buffer().len(), 16384);
        assert!(!h.is_draining());
        assert_eq!(h.header_count(), 0);
    }

    #[test]
    fn create_rejects_bad_config() {
        let err = Harvester::create(PoolConfig::default().with_max_header_size(0)).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[test]
    fn create_rejects_pool_without_a_slot() {
        let config = PoolConfig::default()
            .with_desired_peers(1)
            .with_max_header_size(8180);
        let err = Harvester::create(config).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));

        // The same headers fit once the buffer is big enough.
        let h = Harvester::attach(PoolBuffer::allocate(PoolSize::Kb16), config).unwrap();
        assert_eq!(h.layout().max_peers, 1);
        assert_eq!(h.writer().write(&[1; 32], &[7; 8180]), WriteResult::Ok);
    }

    #[test]
    fn create_in_reinitialises() {
        let buffer = PoolBuffer::allocate(PoolSize::Kb8);
        buffer.control().store_tip_block_number(9);
        buffer.control().begin_drain();

        let h = Harvester::create_in(buffer, PoolConfig::default()).unwrap();
        assert_eq!(h.tip_block_number(), 0);
        assert!(!h.is_draining());
    }

    #[test]
    fn attach_keeps_contents() {
        let buffer = PoolBuffer::allocate(PoolSize::Kb8);
        buffer.control().store_tip_block_number(9);
        let h = Harvester::attach(buffer, PoolConfig::default()).unwrap();
        assert_eq!(h.tip_block_number(), 9);
        assert_eq!(h.layout().max_peers, 15);
    }

    #[test]
    fn empty_drain() {
        let h = harvester();
        let drained = h.drain();
        assert!(drained.is_empty());
        assert_eq!(drained.iter().count(), 0);
        assert!(drained.get(0).is_none());
        assert!(!h.is_draining());
    }

    #[test]
    fn drain_returns_padded_slots_and_resets() {
        let h = harvester();
        let w = h.writer();
        assert_eq!(w.write(&[1; 32], b"first"), WriteResult::Ok);
        assert_eq!(w.write(&[2; 32], b"second"), WriteResult::Ok);

        let drained = h.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(h.header_count(), 0);

        let first = drained.get(0).unwrap();
        assert_eq!(first.len(), 512);
        assert_eq!(&first[..5], b"first");
        assert!(first[5..].iter().all(|&b| b == 0));
        assert_eq!(drained.hash(1), Some(&[2; 32]));

        let entries: Vec<_> = drained.entries().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, &[1; 32]);
    }

    #[test]
    fn drain_waits_for_live_writer() {
        let h = harvester();
        let control = h.buffer().clone();
        control.control().enter_writer();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            if control.control().leave_writer() {
                notify_all(control.control().word(Word::LiveWriters));
            }
        });

        let start = Instant::now();
        h.drain();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(40), "waited {waited:?}");
        assert!(waited < DRAIN_WAIT_TIMEOUT);
        releaser.join().unwrap();
    }

    #[test]
    fn drain_gives_up_on_stuck_writer() {
        let h = harvester();
        h.buffer().control().enter_writer();

        let start = Instant::now();
        h.drain();
        assert!(start.elapsed() >= DRAIN_WAIT_TIMEOUT);
        assert!(!h.is_draining());
    }

    #[test]
    fn clamps_corrupt_count() {
        let h = harvester();
        h.buffer()
            .control()
            .header_count
            .store(10_000, shm_primitives::sync::Ordering::SeqCst);
        let drained = h.drain();
        assert_eq!(drained.len(), 30);
    }

    #[test]
    fn tip_round_trip() {
        let h = harvester();
        h.record_tip_block_number(1234);
        assert_eq!(h.tip_block_number(), 1234);
        assert_eq!(h.writer().tip_block_number(), 1234);
    }

    #[test]
    fn into_vec_copies_headers() {
        let h = harvester();
        let w = h.writer();
        assert_eq!(w.write(&[7; 32], b"abc"), WriteResult::Ok);
        let headers = h.drain().into_vec();
        assert_eq!(headers.len(), 1);
        assert_eq!(&headers[0][..3], b"abc");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drain_async_matches_blocking_drain() {
        let h = harvester();
        assert_eq!(h.writer().write(&[3; 32], b"async"), WriteResult::Ok);
        let drained = h.drain_async().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(&drained.get(0).unwrap()[..5], b"async");
        assert_eq!(h.header_count(), 0);
    }
}
