//! shard-soak - consistency soak run against the in-memory store
//!
//! Several graph nodes share one `MemoryStore`. Writers spread edges of one
//! edge path over the nodes, paced so the run spans at least one minimum
//! delta plus one cache TTL. Once writes stop, readers keep counting the
//! path while compaction settles into complete groups and fail the run on
//! any count other than the number written. Finally every edge is deleted
//! and the run waits for the path to collapse back onto its default shard.
//!
//! Usage:
//!   shard-soak [--nodes 2] [--writers 4] [--readers 2] [--edges 2000]
//!              [--shard-size 500] [--ttl-ms 1000] [--min-delta-ms 3000]
//!              [--timeout-secs 120]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use rayon::prelude::*;
use tracing::{error, info, warn};

use edgeshard::{
    stop_signal, Clock, ConfigHandle, Edge, EdgeMeta, GraphNode, MemoryStore, NodeId, Scope, SearchByEdgeType,
    ShardConfig, StopSignal, SystemClock,
};

const EDGE_TYPE: &str = "test";

#[derive(Debug, Clone)]
struct SoakArgs {
    nodes: usize,
    writers: usize,
    readers: usize,
    edges: u64,
    shard_size: u64,
    ttl_ms: u64,
    min_delta_ms: u64,
    timeout: Duration,
}

impl SoakArgs {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let flag = |name: &str, default: u64| -> anyhow::Result<u64> {
            match args.iter().position(|a| a == name).and_then(|i| args.get(i + 1)) {
                Some(value) => value
                    .parse()
                    .with_context(|| format!("{} expects a number, got '{}'", name, value)),
                None => Ok(default),
            }
        };
        let parsed = Self {
            nodes: flag("--nodes", 2)? as usize,
            writers: flag("--writers", 4)? as usize,
            readers: flag("--readers", 2)? as usize,
            edges: flag("--edges", 2_000)?,
            shard_size: flag("--shard-size", 500)?,
            ttl_ms: flag("--ttl-ms", 1_000)?,
            min_delta_ms: flag("--min-delta-ms", 3_000)?,
            timeout: Duration::from_secs(flag("--timeout-secs", 120)?),
        };
        if parsed.nodes == 0 || parsed.writers == 0 {
            bail!("--nodes and --writers must be at least 1");
        }
        Ok(parsed)
    }
}

fn print_help() {
    println!("shard-soak {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Concurrent write/read/compaction soak over the in-memory edge store");
    println!();
    println!("Usage: shard-soak [options]");
    println!();
    println!("Options:");
    println!("  --nodes          Graph nodes sharing the store (default: 2)");
    println!("  --writers        Parallel writers (default: 4)");
    println!("  --readers        Reader threads (default: 2)");
    println!("  --edges          Edges to write (default: 2000)");
    println!("  --shard-size     Edges per shard before a split (default: 500)");
    println!("  --ttl-ms         Shard cache TTL (default: 1000)");
    println!("  --min-delta-ms   Minimum age before compaction, >= 2.5 x TTL (default: 3000)");
    println!("  --timeout-secs   Give up waiting for convergence (default: 120)");
    println!("  -h, --help       Print this help message");
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }
    let soak = SoakArgs::parse(&args)?;

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let config = ShardConfig::new(
        soak.shard_size,
        Duration::from_millis(soak.ttl_ms),
        Duration::from_millis(soak.min_delta_ms),
    );
    let handle = ConfigHandle::new(config).context("invalid soak configuration")?;

    let (stop, signal) = stop_signal();
    let stop = Arc::new(stop);
    let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM])
        .context("failed to register signal handlers")?;
    let stop_on_signal = Arc::clone(&stop);
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            warn!(signal = sig, "received signal, stopping soak");
            stop_on_signal.stop();
        }
    });

    let store = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let nodes: Vec<GraphNode<MemoryStore>> = (0..soak.nodes)
        .map(|_| {
            GraphNode::builder(Arc::clone(&store))
                .config(handle.clone())
                .clock(Arc::clone(&clock))
                .build()
        })
        .collect();

    let scope = Scope::named("shard-soak");
    let source = NodeId::from_name("source", "soak");
    let meta = EdgeMeta::from_source_node(source.clone(), EDGE_TYPE);
    info!(?soak, %meta, "starting soak");

    // ── Write phase ────────────────────────────────────────────────

    // A cached write shard keeps taking writes for up to one TTL past the
    // threshold; spreading each shard's worth over several TTLs bounds the
    // overshoot to a fraction of a shard.
    let per_writer = soak.edges.div_ceil(soak.writers as u64);
    let write_window_ms = (soak.min_delta_ms + soak.ttl_ms).max(soak.edges / soak.shard_size * 4 * soak.ttl_ms);
    let pace = Duration::from_millis(write_window_ms) / per_writer.max(1) as u32;
    let all_edges = Mutex::new(Vec::with_capacity(soak.edges as usize));
    let started = Instant::now();

    (0..soak.writers).into_par_iter().try_for_each(|w| -> anyhow::Result<()> {
        let graph = nodes[w % nodes.len()].graph(scope.clone());
        let first = w as u64 * per_writer;
        let last = (first + per_writer).min(soak.edges);
        for i in first..last {
            if signal.is_stopped() {
                bail!("stopped during write phase");
            }
            let target = NodeId::from_name("target", &i.to_string());
            let edge = Edge::new(source.clone(), EDGE_TYPE, target, clock.now_ms());
            graph.write_edge(edge.clone())?;
            all_edges.lock().unwrap_or_else(|p| p.into_inner()).push(edge);
            thread::sleep(pace);
        }
        Ok(())
    })?;
    info!(
        written = soak.edges,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "write phase done"
    );

    // Caches may hide the newest shard for one TTL after the last write.
    thread::sleep(Duration::from_millis(soak.ttl_ms));

    // ── Readers during compaction ──────────────────────────────────

    let mismatches = Arc::new(AtomicU64::new(0));
    let (readers_stop, readers_signal) = stop_signal();
    let readers: Vec<_> = (0..soak.readers)
        .map(|r| {
            let graph = nodes[r % nodes.len()].graph(scope.clone());
            let search = SearchByEdgeType::new(source.clone(), EDGE_TYPE);
            let mismatches = Arc::clone(&mismatches);
            let signal = readers_signal.clone();
            let expected = soak.edges;
            thread::spawn(move || {
                let mut reads = 0u64;
                while !signal.is_stopped() {
                    match graph.load_edges_from_source(&search).and_then(|stream| stream.count_edges()) {
                        Ok(count) if count != expected => {
                            error!(reader = r, count, expected, "reader saw wrong edge count");
                            mismatches.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(_) => reads += 1,
                        Err(err) => warn!(reader = r, error = %err, "read failed"),
                    }
                    signal.wait_timeout(Duration::from_millis(50));
                }
                reads
            })
        })
        .collect();

    // ── Compaction convergence ─────────────────────────────────────

    let wanted = (soak.edges / soak.shard_size) as usize;
    let poll = Duration::from_millis(soak.ttl_ms.max(100));
    wait_until(&signal, poll, soak.timeout, "complete groups", || {
        let groups = nodes[0]
            .shard_cache()
            .get_read_shard_group(&scope, u64::MAX, &meta)?;
        let complete = groups.filter(|g| !g.is_compaction_pending()).count();
        info!(complete, wanted, "waiting for compaction");
        Ok(complete >= wanted)
    })?;

    readers_stop.stop();
    let mut reads = 0;
    for reader in readers {
        reads += reader.join().unwrap_or(0);
    }
    let mismatches = mismatches.load(Ordering::SeqCst);
    info!(reads, mismatches, "readers finished");
    if mismatches > 0 {
        bail!("{} reads returned a wrong edge count", mismatches);
    }

    let graph = nodes[0].graph(scope.clone());
    let count = graph
        .load_edges_from_source(&SearchByEdgeType::new(source.clone(), EDGE_TYPE))?
        .count_edges()?;
    if count != soak.edges {
        bail!("expected {} edges after compaction, found {}", soak.edges, count);
    }

    // ── Delete and collapse ────────────────────────────────────────

    let edges = std::mem::take(&mut *all_edges.lock().unwrap_or_else(|p| p.into_inner()));
    edges.par_iter().try_for_each(|edge| -> anyhow::Result<()> {
        graph.delete_edge(edge)?;
        Ok(())
    })?;
    info!(deleted = edges.len(), "delete phase done");

    wait_until(&signal, poll, soak.timeout, "default shard", || {
        nodes[0].shard_cache().get_read_shard_group(&scope, u64::MAX, &meta)?;
        let topology = nodes[0].shard_cache().fresh_topology(&scope, &meta)?;
        let collapsed = topology.shard_count() == 1
            && topology.writable_group().map(|g| g.min_shard().is_default()).unwrap_or(false);
        info!(shards = topology.shard_count(), collapsed, "waiting for collapse");
        Ok(collapsed)
    })?;

    info!(elapsed_ms = started.elapsed().as_millis() as u64, "soak passed");
    Ok(())
}

/// Poll `check` every `interval` until it holds, the run is stopped, or
/// `timeout` passes.
fn wait_until<F>(signal: &StopSignal, interval: Duration, timeout: Duration, what: &str, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> edgeshard::Result<bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match check() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) if err.is_retryable() => warn!(error = %err, "poll failed, retrying"),
            Err(err) => return Err(err).with_context(|| format!("waiting for {}", what)),
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for {}", what);
        }
        if signal.wait_timeout(interval) {
            bail!("stopped while waiting for {}", what);
        }
    }
}
