//! Leader-side block production and the commit-side connect loop.
//!
//! A single task ticks at the block interval, builds a block on top of the
//! current best block when this node leads, and hands it to the raft
//! server. Committed blocks come back on the commit channel — produced
//! here or by a remote leader — and are connected to the chain service.

use crate::chain::{BlockState, ChainWal};
use crate::metrics;
use crate::pb::{Block, Tx};
use crate::raft::cluster::Cluster;
use crate::raft::server::{RaftOptions, RaftServer, EVENT_CHANNEL_SIZE};
use crate::raft::RaftEvent;
use crate::raft_client::Transport;
use crate::{config, raft};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

const SLOT_QUEUE_MAX: usize = 100;

/// A slow chain service backpressures the raft loop through the commit
/// channel; this bounds how long one connect may take.
const CONNECT_BLOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// A block this node proposed, with the execution state computed while
/// building it. If the same hash comes back committed, the state is
/// reused instead of re-executing.
struct Proposed {
    block: Block,
    block_state: BlockState,
}

/// Decides whether the cached proposed state applies to a committed
/// block. A mismatch means another leader produced this block; the stale
/// cache is discarded so it can never leak into a later connect.
fn resolve_cached_state(proposed: &mut Option<Proposed>, committed: &Block) -> Option<BlockState> {
    match proposed {
        Some(p) if p.block.hash == committed.hash => Some(p.block_state.clone()),
        Some(p) => {
            warn!(
                "committed block was not proposed by this node: proposed no={} hash={} committed no={} hash={}",
                p.block.block_no(),
                p.block.id(),
                committed.block_no(),
                committed.id()
            );
            *proposed = None;
            None
        }
        None => None,
    }
}

/// The leader skips a tick when the best block has not moved since its
/// last job; the previous proposal is still in flight.
fn best_block_changed(prev: &Option<Block>, best: &Block) -> bool {
    match prev {
        Some(prev) => prev.block_no() != best.block_no(),
        None => true,
    }
}

enum Input {
    Tick,
    Job(Block),
    Commit(Option<Option<Block>>),
    Quit,
}

pub struct BlockFactory {
    chain: Arc<dyn ChainWal>,
    rs: Arc<RaftServer>,
    commit_rx: mpsc::Receiver<Option<Block>>,
    job_tx: mpsc::Sender<Block>,
    job_rx: mpsc::Receiver<Block>,
    quit_rx: watch::Receiver<bool>,
    block_interval: Duration,
    skip_empty_block: bool,
    producer: String,
    prev_block: Option<Block>,
    proposed: Option<Proposed>,
}

impl BlockFactory {
    /// Builds the factory and the raft server it feeds. The factory owns
    /// the commit channel's receiving end; the raft server only ever sees
    /// the sending side.
    pub fn new(
        chain: Arc<dyn ChainWal>,
        quit_rx: watch::Receiver<bool>,
    ) -> (BlockFactory, Arc<RaftServer>, mpsc::Sender<RaftEvent>) {
        let cfg = config::instance().lock().unwrap().clone();

        let cluster = Arc::new(Cluster::new(cfg.chain_id.as_bytes(), &cfg.name));
        let peers: Vec<(String, String)> = cfg
            .peers
            .iter()
            .map(|p| (p.name.clone(), p.url.clone()))
            .collect();
        if let Err(e) = cluster.bootstrap_from_config(&peers) {
            raft::fatal!("invalid peer configuration: {}", e);
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let transport = Arc::new(Transport::new(event_tx.clone()));
        let (commit_tx, commit_rx) = mpsc::channel(1);
        let (job_tx, job_rx) = mpsc::channel(SLOT_QUEUE_MAX);

        let rs = RaftServer::new(
            cluster,
            transport,
            commit_tx,
            event_tx.clone(),
            event_rx,
            RaftOptions {
                join: !cfg.new_cluster,
                base_path: cfg.base_path.clone(),
                tick_interval: Duration::from_millis(cfg.raft_tick_ms),
                snap_frequency: cfg.snap_frequency,
                catch_up_entries: cfg.catch_up_entries,
            },
        );

        let factory = BlockFactory {
            chain,
            rs: rs.clone(),
            commit_rx,
            job_tx,
            job_rx,
            quit_rx,
            block_interval: Duration::from_millis(cfg.block_interval_ms),
            skip_empty_block: cfg.skip_empty_block,
            producer: cfg.name,
            prev_block: None,
            proposed: None,
        };

        (factory, rs, event_tx)
    }

    /// Runs the production loop until shutdown or until the raft server
    /// closes the commit channel.
    pub async fn run(mut self) {
        self.rs.start();

        let mut ticker = tokio::time::interval(self.block_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut quit_rx = self.quit_rx.clone();

        info!("block factory started, interval {:?}", self.block_interval);

        loop {
            let input = tokio::select! {
                _ = ticker.tick() => Input::Tick,
                maybe = self.job_rx.recv() => maybe.map(Input::Job).unwrap_or(Input::Quit),
                commit = self.commit_rx.recv() => Input::Commit(commit),
                _ = quit_rx.changed() => Input::Quit,
            };

            match input {
                Input::Tick => self.queue_job(),
                Input::Job(best) => self.build(best).await,
                Input::Commit(None) => {
                    info!("commit channel for raft is closed, stopping block factory");
                    return;
                }
                Input::Commit(Some(None)) => self.reset(),
                Input::Commit(Some(Some(block))) => {
                    if let Err(e) = self.connect(block).await {
                        error!("failed to connect block: {}", e);
                        return;
                    }
                }
                Input::Quit => {
                    info!("block factory shutdown");
                    return;
                }
            }
        }
    }

    fn queue_job(&mut self) {
        if !self.rs.is_leader() {
            debug!("skip producing block, this node is not leader");
            return;
        }

        let best = match self.chain.get_best_block() {
            Some(best) => best,
            None => return,
        };
        if !best_block_changed(&self.prev_block, &best) {
            debug!(
                "previous block {} not connected yet, skip producing",
                best.block_no()
            );
            return;
        }

        self.prev_block = Some(best.clone());
        if self.job_tx.try_send(best).is_err() {
            warn!("job queue is full, dropping production slot");
        }
    }

    async fn build(&mut self, best: Block) {
        let txs = self.gather_txs();
        if self.skip_empty_block && txs.is_empty() {
            debug!("skip producing empty block");
            return;
        }

        let block_state = self.chain.new_block_state(&best);
        let block = Block::build(&self.chain.chain_id(), Some(&best), txs, &self.producer);

        info!(
            "block produced: no={} hash={} txs={}",
            block.block_no(),
            block.id(),
            block.tx_count()
        );

        // leadership is re-checked right before handing the block over
        if !self.rs.is_leader() {
            info!("skip proposing block, leadership was lost while building");
            return;
        }

        self.proposed = Some(Proposed {
            block: block.clone(),
            block_state,
        });

        match self.rs.propose(block).await {
            Ok(()) => {
                metrics::BLOCK_PRODUCED_VEC.with_label_values(&["ok"]).inc();
                info!("block proposed by block factory");
            }
            Err(e) => {
                metrics::BLOCK_PRODUCED_VEC.with_label_values(&["err"]).inc();
                error!("propose error to raft: {}", e);
            }
        }
    }

    /// Transaction intake lives outside this core; the factory produces
    /// blocks over whatever the pool currently offers.
    fn gather_txs(&self) -> Vec<Tx> {
        Vec::new()
    }

    async fn connect(&mut self, block: Block) -> Result<(), crate::chain::ChainError> {
        let block_state = resolve_cached_state(&mut self.proposed, &block);
        let cached = block_state.is_some();

        debug!(
            "connect block: no={} hash={} prev={} proposed={}",
            block.block_no(),
            block.id(),
            block.prev_id(),
            cached
        );

        let started = Instant::now();
        let result = self
            .chain
            .connect_block(block, block_state, CONNECT_BLOCK_TIMEOUT)
            .await;
        metrics::BLOCK_CONNECT_HISTOGRAM
            .with_label_values(&[if cached { "true" } else { "false" }])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    fn reset(&mut self) {
        debug!("received an empty commit, reset block factory");
        self.prev_block = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainStore;

    fn block(no: u64) -> Block {
        let chain_id = b"test-chain".to_vec();
        let mut prev = None;
        let mut current = Block::build(&chain_id, None, Vec::new(), "alpha");
        for _ in 0..no {
            prev = Some(current);
            current = Block::build(&chain_id, prev.as_ref(), Vec::new(), "alpha");
        }
        current
    }

    #[test]
    fn cached_state_used_only_for_matching_hash() {
        let store = ChainStore::new(b"test-chain");
        let mine = block(1);
        let state = store.new_block_state(&block(0));

        let mut proposed = Some(Proposed {
            block: mine.clone(),
            block_state: state.clone(),
        });

        // same hash: the cached state is returned and stays cached
        let got = resolve_cached_state(&mut proposed, &mine);
        assert_eq!(got.map(|s| s.block_no), Some(state.block_no));
        assert!(proposed.is_some());

        // a different leader's block discards the cache entirely
        let theirs = Block::build(b"test-chain", Some(&block(0)), Vec::new(), "beta");
        assert_ne!(theirs.hash, mine.hash);
        let got = resolve_cached_state(&mut proposed, &theirs);
        assert!(got.is_none());
        assert!(proposed.is_none());

        // and a later commit finds no stale cache
        assert!(resolve_cached_state(&mut proposed, &mine).is_none());
    }

    #[test]
    fn tick_skips_until_best_block_moves() {
        let best = block(3);
        assert!(best_block_changed(&None, &best));
        assert!(!best_block_changed(&Some(best.clone()), &best));
        let next = block(4);
        assert!(best_block_changed(&Some(best), &next));
    }
}
