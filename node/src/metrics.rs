//! Prometheus metrics for the consensus core.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Blocks produced by the local leader, by outcome
    pub static ref BLOCK_PRODUCED_VEC: CounterVec = CounterVec::new(
        Opts::new("block_produced_total", "blocks built and proposed by this node"),
        &["result"]
    )
    .unwrap();

    /// Entries published from the raft log, by entry type
    pub static ref COMMIT_ENTRY_VEC: CounterVec = CounterVec::new(
        Opts::new("raft_commit_entries_total", "committed raft entries applied"),
        &["type"]
    )
    .unwrap();

    /// Time spent handing a committed block to the chain service
    pub static ref BLOCK_CONNECT_HISTOGRAM: HistogramVec = HistogramVec::new(
        HistogramOpts::new("block_connect_seconds", "block connect latency"),
        &["cached"]
    )
    .unwrap();

    /// Snapshots written to the wal store
    pub static ref SNAPSHOT_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("raft_snapshot_total", "snapshots persisted"),
        &["kind"]
    )
    .unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(BLOCK_PRODUCED_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(COMMIT_ENTRY_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(BLOCK_CONNECT_HISTOGRAM.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_COUNTER_VEC.clone()));
}
