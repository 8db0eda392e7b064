//! Chain-side types: the block payload helpers, the interface the
//! consensus core drives the chain service through, and an in-process
//! chain store backing the binary and the tests.

use crate::debugger::{self, StopCond};
use crate::pb::{Block, BlockBody, BlockHeader, Tx};
use prost::Message as ProstMessage;
use sha2::{Digest, Sha256};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block {0} does not extend the current best block")]
    NotBestBlock(u64),
    #[error("block hash does not match its header")]
    BadHash,
    #[error("timed out connecting block {0}")]
    Timeout(u64),
}

pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

fn unix_nano() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl Block {
    /// Builds a block on top of `prev` and seals its content hash.
    pub fn build(chain_id: &[u8], prev: Option<&Block>, txs: Vec<Tx>, producer: &str) -> Block {
        Self::build_at(chain_id, prev, txs, producer, unix_nano())
    }

    fn build_at(
        chain_id: &[u8],
        prev: Option<&Block>,
        txs: Vec<Tx>,
        producer: &str,
        timestamp: i64,
    ) -> Block {
        let header = BlockHeader {
            chain_id: chain_id.to_vec(),
            block_no: prev.map(|p| p.block_no() + 1).unwrap_or(0),
            timestamp,
            prev_hash: prev.map(|p| p.hash.clone()).unwrap_or_default(),
            producer: producer.as_bytes().to_vec(),
            txs_root: txs_root(&txs),
        };
        let hash = calculate_hash(&header);
        Block {
            hash,
            header: Some(header),
            body: Some(BlockBody { txs }),
        }
    }

    /// The genesis block is a pure function of the chain id, so every
    /// member starts from an identical tip.
    pub fn genesis(chain_id: &[u8]) -> Block {
        Self::build_at(chain_id, None, Vec::new(), "genesis", 0)
    }

    pub fn block_no(&self) -> u64 {
        self.header.as_ref().map(|h| h.block_no).unwrap_or(0)
    }

    /// Short printable identifier of the block hash.
    pub fn id(&self) -> String {
        to_hex(&self.hash)
    }

    pub fn prev_id(&self) -> String {
        self.header
            .as_ref()
            .map(|h| to_hex(&h.prev_hash))
            .unwrap_or_default()
    }

    pub fn tx_count(&self) -> usize {
        self.body.as_ref().map(|b| b.txs.len()).unwrap_or(0)
    }

    /// Recomputes the content hash and compares it with the sealed one.
    pub fn verify_integrity(&self) -> Result<(), ChainError> {
        match self.header.as_ref() {
            Some(h) if calculate_hash(h) == self.hash => Ok(()),
            _ => Err(ChainError::BadHash),
        }
    }
}

pub fn calculate_hash(header: &BlockHeader) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(header.encode_to_vec());
    hasher.finalize().to_vec()
}

fn txs_root(txs: &[Tx]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for tx in txs {
        hasher.update(&tx.hash);
    }
    hasher.finalize().to_vec()
}

/// State produced while executing a block's transactions. The leader
/// caches it between propose and commit so the committed block connects
/// without re-execution.
#[derive(Clone, Debug, Default)]
pub struct BlockState {
    pub block_no: u64,
    pub state_root: Vec<u8>,
}

/// The chain service as seen from the consensus core.
#[tonic::async_trait]
pub trait ChainWal: Send + Sync {
    fn chain_id(&self) -> Vec<u8>;

    fn get_best_block(&self) -> Option<Block>;

    /// Seeds the execution state for a block built on top of `prev`.
    fn new_block_state(&self, prev: &Block) -> BlockState;

    /// Appends a committed block to the chain. `state` is the cached
    /// execution result when this node built the block itself.
    async fn connect_block(
        &self,
        block: Block,
        state: Option<BlockState>,
        timeout: Duration,
    ) -> Result<(), ChainError>;
}

/// In-process chain store. Keeps the canonical chain in memory; the
/// production deployment substitutes the full chain service behind
/// [`ChainWal`].
pub struct ChainStore {
    chain_id: Vec<u8>,
    blocks: RwLock<Vec<Block>>,
}

impl ChainStore {
    pub fn new(chain_id: &[u8]) -> Self {
        let genesis = Block::genesis(chain_id);
        ChainStore {
            chain_id: chain_id.to_vec(),
            blocks: RwLock::new(vec![genesis]),
        }
    }

    pub fn best_block_no(&self) -> u64 {
        self.blocks.read().unwrap().last().map(|b| b.block_no()).unwrap_or(0)
    }
}

#[tonic::async_trait]
impl ChainWal for ChainStore {
    fn chain_id(&self) -> Vec<u8> {
        self.chain_id.clone()
    }

    fn get_best_block(&self) -> Option<Block> {
        self.blocks.read().unwrap().last().cloned()
    }

    fn new_block_state(&self, prev: &Block) -> BlockState {
        BlockState {
            block_no: prev.block_no() + 1,
            state_root: prev.hash.clone(),
        }
    }

    async fn connect_block(
        &self,
        block: Block,
        _state: Option<BlockState>,
        timeout: Duration,
    ) -> Result<(), ChainError> {
        let mut sleep_ms = 0;
        debugger::check(StopCond::ChainConnectSleep, |v| sleep_ms = v.max(0) as u64);
        if sleep_ms > 0 {
            if Duration::from_millis(sleep_ms) > timeout {
                return Err(ChainError::Timeout(block.block_no()));
            }
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }

        block.verify_integrity()?;

        let mut blocks = self.blocks.write().unwrap();
        let best = blocks.last().expect("chain always has genesis");
        if block
            .header
            .as_ref()
            .map(|h| h.prev_hash != best.hash)
            .unwrap_or(true)
        {
            return Err(ChainError::NotBestBlock(block.block_no()));
        }
        blocks.push(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(payload: &[u8]) -> Tx {
        Tx {
            hash: Sha256::digest(payload).to_vec(),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn block_hash_covers_header() {
        let b = Block::build(b"test-chain", None, vec![tx(b"a")], "alpha");
        b.verify_integrity().unwrap();

        let mut tampered = b.clone();
        tampered.header.as_mut().unwrap().block_no = 7;
        assert!(tampered.verify_integrity().is_err());
    }

    #[test]
    fn build_links_to_previous() {
        let genesis = Block::build(b"test-chain", None, Vec::new(), "alpha");
        let next = Block::build(b"test-chain", Some(&genesis), Vec::new(), "alpha");
        assert_eq!(next.block_no(), 1);
        assert_eq!(next.header.as_ref().unwrap().prev_hash, genesis.hash);
    }

    #[tokio::test]
    async fn connect_rejects_fork() {
        let store = ChainStore::new(b"test-chain");
        let best = store.get_best_block().unwrap();
        let good = Block::build(b"test-chain", Some(&best), Vec::new(), "alpha");
        store
            .connect_block(good.clone(), None, Duration::from_secs(1))
            .await
            .unwrap();

        // a second block with the same parent no longer extends the tip
        let stale = Block::build(b"test-chain", Some(&best), Vec::new(), "beta");
        let err = store
            .connect_block(stale, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::NotBestBlock(_)));
        assert_eq!(store.best_block_no(), 1);
    }
}
