//! header-pool-demo: many writers announcing headers to one harvester.
//!
//! Writers run as tokio tasks, each announcing a stream of fake headers
//! (some of them repeats of another writer's, to exercise deduplication).
//! The harvester drains on a fixed interval and whenever a data event says
//! headers arrived.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=header_pool=debug,info cargo run -p header-pool-demo -- --writers 8
//! HEADER_POOL_PEERS=120 HEADER_POOL_MAX_HEADER=256 cargo run -p header-pool-demo
//! cargo run -p header-pool-demo -- --file /dev/shm/headers.pool
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use header_pool::{Harvester, PoolBuffer, PoolConfig, PoolError, WriteResult, Writer};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "header-pool-demo")]
#[command(about = "Drive a header pool with concurrent writers")]
struct Args {
    /// Peers the pool is sized for
    #[arg(long, env = "HEADER_POOL_PEERS", default_value_t = header_pool::DEFAULT_DESIRED_PEERS)]
    peers: u32,

    /// Maximum header size in bytes
    #[arg(long, env = "HEADER_POOL_MAX_HEADER", default_value_t = header_pool::DEFAULT_MAX_HEADER_SIZE)]
    max_header: u32,

    /// Number of concurrent writers
    #[arg(long, default_value_t = 4)]
    writers: u32,

    /// Headers each writer announces
    #[arg(long, default_value_t = 100)]
    headers: u32,

    /// Milliseconds between periodic drains
    #[arg(long, default_value_t = 50)]
    drain_interval_ms: u64,

    /// Back the pool with a shared file mapping instead of private memory
    #[arg(long)]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "demo failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), PoolError> {
    let config = PoolConfig::default()
        .with_desired_peers(args.peers)
        .with_max_header_size(args.max_header);
    config.validate()?;

    let harvester = match &args.file {
        Some(path) => {
            let buffer = PoolBuffer::create_file(path, config.optimal_size())?;
            Harvester::create_in(buffer, config)?
        }
        None => Harvester::create(config)?,
    };
    let layout = *harvester.layout();
    tracing::info!(
        size = %layout.size,
        max_peers = layout.max_peers,
        writers = args.writers,
        "pool ready"
    );

    let arrived = Arc::new(Notify::new());
    {
        let arrived = arrived.clone();
        harvester.on_data(move || arrived.notify_one());
    }

    let mut tasks = Vec::new();
    for id in 0..args.writers {
        let (buffer, layout) = match &args.file {
            Some(path) => (PoolBuffer::open_file(path)?, layout),
            None => harvester.writer_args(),
        };
        let writer = Writer::attach(buffer, layout)?;
        tasks.push(tokio::spawn(write_headers(
            writer,
            id,
            args.headers,
            args.max_header,
        )));
    }

    let mut unique = HashSet::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.drain_interval_ms));
    let mut block_no = 0u32;
    loop {
        let finished = tasks.iter().all(|t| t.is_finished());

        let drained = harvester.drain_async().await;
        for (hash, _) in drained.entries() {
            unique.insert(*hash);
        }
        if !drained.is_empty() {
            block_no += 1;
            harvester.record_tip_block_number(block_no);
            tracing::debug!(headers = drained.len(), block_no, "harvested");
        }

        if finished {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = arrived.notified() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    let mut stats = Stats::default();
    for task in tasks {
        match task.await {
            Ok(s) => stats.merge(s),
            Err(e) => tracing::warn!(error = %e, "writer task failed"),
        }
    }

    tracing::info!(
        harvested = unique.len(),
        ok = stats.ok,
        duplicate = stats.duplicate,
        full = stats.full,
        invalid = stats.invalid,
        tip = harvester.tip_block_number(),
        "done"
    );

    if let Some(path) = &args.file {
        drop(harvester);
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Stats {
    ok: u64,
    duplicate: u64,
    full: u64,
    invalid: u64,
}

impl Stats {
    fn record(&mut self, result: WriteResult) {
        match result {
            WriteResult::Ok => self.ok += 1,
            WriteResult::Duplicate => self.duplicate += 1,
            WriteResult::InsufficientSpace => self.full += 1,
            WriteResult::Invalid => self.invalid += 1,
        }
    }

    fn merge(&mut self, other: Stats) {
        self.ok += other.ok;
        self.duplicate += other.duplicate;
        self.full += other.full;
        self.invalid += other.invalid;
    }
}

/// Announce `count` fake headers. Neighbouring writers share every other
/// header, the way peers on the same chain announce the same blocks.
async fn write_headers(writer: Writer, id: u32, count: u32, max_header: u32) -> Stats {
    let mut stats = Stats::default();
    let mut space = writer.subscribe_free();

    for n in 0..count {
        let height = if n % 2 == 0 { n } else { id * count + n };
        let header = fake_header(height, max_header as usize);
        let hash = blake3::hash(&header);

        loop {
            let result = writer.write_async(hash.as_bytes(), &header).await;
            stats.record(result);
            if result != WriteResult::InsufficientSpace {
                break;
            }
            // Full: wait for the harvester to free space, with a fallback poll.
            let _ = tokio::time::timeout(Duration::from_millis(20), space.changed()).await;
        }
    }
    stats
}

fn fake_header(height: u32, max_len: usize) -> Vec<u8> {
    let mut header = format!("header height={height} parent={}", height.wrapping_sub(1)).into_bytes();
    header.truncate(max_len);
    header
}
