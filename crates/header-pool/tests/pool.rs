//! End-to-end behaviour of a single harvester and its writers.

#![cfg(not(feature = "loom"))]

use header_pool::{
    Harvester, PoolBuffer, PoolConfig, PoolError, PoolSize, WriteResult, Writer,
    max_peers_for_size,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn hash(n: u32) -> [u8; 32] {
    let mut h = [0u8; 32];
    h[..4].copy_from_slice(&n.to_le_bytes());
    h[28..].copy_from_slice(&(!n).to_le_bytes());
    h
}

fn header(n: u32) -> Vec<u8> {
    format!("header #{n}").into_bytes()
}

#[test]
fn capacity_is_maximal_for_every_size() {
    for size in PoolSize::ALL {
        let v = max_peers_for_size(512, size) as usize;
        assert!(16 + v * 544 <= size.bytes());
        assert!(size.bytes() < 16 + (v + 1) * 544);
    }
    assert_eq!(max_peers_for_size(512, PoolSize::Kb64), 120);
    assert_eq!(max_peers_for_size(512, PoolSize::Kb32), 60);
}

#[test]
fn unique_write_lands_at_its_slot() {
    init_tracing();
    let harvester = Harvester::create(PoolConfig::default()).unwrap();
    let writer = harvester.writer();

    assert_eq!(writer.write(&hash(0), &header(0)), WriteResult::Ok);
    assert_eq!(writer.header_count(), 1);
    assert_eq!(writer.write(&hash(1), &header(1)), WriteResult::Ok);
    assert_eq!(writer.header_count(), 2);

    let drained = harvester.drain();
    assert_eq!(drained.len(), 2);
    assert_eq!(drained.hash(1), Some(&hash(1)));
    let slot = drained.get(1).unwrap();
    assert_eq!(&slot[..header(1).len()], header(1).as_slice());
}

#[test]
fn duplicate_counts_once() {
    init_tracing();
    let harvester = Harvester::create(PoolConfig::default()).unwrap();
    let writer = harvester.writer();

    assert_eq!(writer.write(&hash(9), &header(9)), WriteResult::Ok);
    assert_eq!(writer.write(&hash(9), &header(10)), WriteResult::Duplicate);
    assert_eq!(harvester.header_count(), 1);

    let drained = harvester.drain();
    assert_eq!(drained.len(), 1);
    assert_eq!(&drained.get(0).unwrap()[..header(9).len()], header(9).as_slice());
}

#[test]
fn full_pool_leaves_buffer_untouched() {
    init_tracing();
    let config = PoolConfig::default().with_desired_peers(60);
    let harvester = Harvester::create(config).unwrap();
    let writer = harvester.writer();
    let max = harvester.layout().max_peers;
    assert_eq!(harvester.layout().size, PoolSize::Kb32);
    assert_eq!(max, 60);

    for n in 0..max {
        assert_eq!(writer.write(&hash(n), &header(n)), WriteResult::Ok);
    }
    assert_eq!(
        writer.write(&hash(max), &header(max)),
        WriteResult::InsufficientSpace
    );
    assert_eq!(harvester.header_count(), max);

    let drained = harvester.drain();
    assert_eq!(drained.len(), max as usize);
    assert!(drained.hash(max as usize).is_none());
}

#[test]
fn malformed_writes_change_nothing() {
    init_tracing();
    let harvester = Harvester::create(PoolConfig::default()).unwrap();
    let writer = harvester.writer();

    assert_eq!(writer.write(&hash(0)[..16], &header(0)), WriteResult::Invalid);
    assert_eq!(writer.write(&hash(0), &vec![1u8; 600]), WriteResult::Invalid);
    assert_eq!(harvester.header_count(), 0);
    assert_eq!(harvester.live_writers(), 0);
    assert!(harvester.drain().is_empty());
}

#[test]
fn drain_returns_writes_in_order_and_empties() {
    init_tracing();
    let harvester = Harvester::create(PoolConfig::default()).unwrap();
    let writer = harvester.writer();

    for n in 0..10 {
        assert_eq!(writer.write(&hash(n), &header(n)), WriteResult::Ok);
    }

    let drained = harvester.drain();
    assert_eq!(harvester.header_count(), 0);
    assert_eq!(drained.len(), 10);
    for (n, slot) in drained.iter().enumerate() {
        assert_eq!(slot.len(), 512);
        let expected = header(n as u32);
        assert_eq!(&slot[..expected.len()], expected.as_slice());
    }
    let hashes: Vec<_> = drained.entries().map(|(h, _)| *h).collect();
    let expected: Vec<_> = (0..10).map(hash).collect();
    assert_eq!(hashes, expected);

    assert!(harvester.drain().is_empty());
}

#[test]
fn writer_attaches_with_harvester_args() {
    let harvester = Harvester::create(PoolConfig::default()).unwrap();
    let (buffer, layout) = harvester.writer_args();
    let writer = Writer::attach(buffer, layout).unwrap();

    assert_eq!(writer.write(&hash(1), b"via attach"), WriteResult::Ok);
    assert_eq!(harvester.header_count(), 1);
}

#[test]
fn harvester_rejects_unsupported_layouts() {
    let config = PoolConfig::default();
    let err = Harvester::create(config.with_max_header_size(100_000)).unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));

    let small = PoolBuffer::allocate(PoolSize::Kb8);
    let harvester = Harvester::attach(small, config).unwrap();
    assert_eq!(harvester.layout().max_peers, 15);
}

#[test]
fn tip_is_visible_to_writers() {
    let harvester = Harvester::create(PoolConfig::default()).unwrap();
    let writer = harvester.writer();
    assert_eq!(writer.tip_block_number(), 0);
    harvester.record_tip_block_number(812_004);
    assert_eq!(writer.tip_block_number(), 812_004);

    // Draining leaves the tip alone.
    harvester.drain();
    assert_eq!(writer.tip_block_number(), 812_004);
}

#[cfg(unix)]
#[test]
fn writer_on_separately_opened_mapping() {
    init_tracing();
    let path = std::env::temp_dir().join(format!(
        "header_pool_it_{}_{}.shm",
        std::process::id(),
        line!()
    ));
    let config = PoolConfig::default();

    let created = PoolBuffer::create_file(&path, config.optimal_size()).unwrap();
    let harvester = Harvester::create_in(created, config).unwrap();

    let opened = PoolBuffer::open_file(&path).unwrap();
    let writer = Writer::attach(opened, *harvester.layout()).unwrap();
    assert_eq!(writer.write(&hash(3), b"from another mapping"), WriteResult::Ok);
    assert_eq!(writer.write(&hash(3), b"again"), WriteResult::Duplicate);

    let drained = harvester.drain();
    assert_eq!(drained.len(), 1);
    assert_eq!(&drained.get(0).unwrap()[..20], b"from another mapping");

    drop(writer);
    drop(harvester);
    std::fs::remove_file(&path).ok();
}
