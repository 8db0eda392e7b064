//! Raft-backed block replication core.
//!
//! The consensus library drives elections and log replication; this module
//! owns everything around it: durable log storage, the membership registry,
//! the peer transport glue, and the event loop that turns library output
//! into committed blocks.

pub mod cluster;
pub mod proposal;
mod segment;
pub mod server;
pub mod wal;

use crate::raft::cluster::Member;
use raft::eraftpb::{Message, Snapshot};
use raft::SnapshotStatus;
use serde_derive::{Deserialize, Serialize};
use slog::{o, Drain};
use thiserror::Error;

/// No leader is currently known.
pub const HAS_NO_LEADER: u64 = 0;

/// Join-time discovery attempts before giving up.
pub const MAX_TRY_GET_CLUSTER: usize = 10;

/// Backoff between join-time discovery attempts.
pub const GET_CLUSTER_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_secs(10);

/// Per-RPC timeout for join-time discovery.
pub const GET_CLUSTER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Exit code for invariant violations on persistence paths.
pub const FATAL_EXIT_CODE: i32 = 1;

/// Exit code for panics escaping a consensus task.
pub const PANIC_EXIT_CODE: i32 = 10;

const LOGGER_CHANNEL_SIZE: usize = 4096;

/// Logs and terminates the process. Persistence failures must not let the
/// node keep serving raft with a lost write behind it.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::exit($crate::raft::FATAL_EXIT_CODE);
    }};
}
pub(crate) use fatal;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("no snapshot")]
    NoSnapshot,
    #[error("received empty snapshot")]
    EmptySnapshot,
    #[error("conf change entry is already applied")]
    CCAlreadyApplied,
    #[error("member has already been added")]
    CCAlreadyAdded,
    #[error("there is no member to remove")]
    CCNoMemberToRemove,
    #[error("member of conf change is invalid: {0}")]
    InvalidMember(String),
    #[error("raft identity is not set or does not match")]
    InvalidRaftIdentity,
    #[error("message is not a snapshot message")]
    NotMsgSnap,
    #[error("failed to unmarshal log entry")]
    Unmarshal,
    #[error("timed out getting cluster info from peer")]
    GetClusterTimeout,
    #[error("failed to get cluster info from any peer")]
    GetClusterFail,
    #[error("cluster is not ready")]
    ClusterNotReady,
    #[error("this node is not the raft leader")]
    NotRaftLeader,
    #[error("another membership change is in progress")]
    CCInProgress,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Raft(#[from] raft::Error),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Input fed to the raft event loop from the transport and the inbound
/// gRPC surface.
#[derive(Debug)]
pub enum RaftEvent {
    /// A protocol message from a peer.
    Message(Message),
    /// A peer link could not deliver; the library will retry after the
    /// next heartbeat.
    Unreachable(u64),
    /// Outcome of a streamed snapshot transfer.
    SnapshotResult { to: u64, status: SnapshotStatus },
}

/// Application payload stored in a raft snapshot: the last durably
/// connected block plus the membership at that index.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SnapshotData {
    /// Encoded block, empty when no block had been applied yet.
    pub block: Vec<u8>,
    pub members: Vec<Member>,
}

impl SnapshotData {
    pub fn new(block: Vec<u8>, members: Vec<Member>) -> Self {
        SnapshotData { block, members }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|_| ConsensusError::Unmarshal)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|_| ConsensusError::Unmarshal)
    }
}

/// Printable snapshot summary for logs.
pub fn snap_to_string(snap: &Snapshot) -> String {
    let meta = snap.get_metadata();
    format!(
        "term={} index={} voters={:?} datalen={}",
        meta.term,
        meta.index,
        meta.get_conf_state().voters,
        snap.get_data().len()
    )
}

/// Builds the logger handed to the raft library.
pub fn raft_logger(tag: &str) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!("tag" => tag.to_string()))
}

/// Spawns a consensus task whose panic terminates the process. A panic
/// here means a violated invariant; partial recovery is not attempted.
pub fn spawn_guarded<F>(name: &'static str, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                log::error!("panic in {}: {:?}", name, e);
                std::process::exit(PANIC_EXIT_CODE);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_data_round_trip() {
        let m = Member {
            id: 7,
            name: "alpha".into(),
            url: "http://127.0.0.1:11001".into(),
            peer_id: "16Uiu2alpha".into(),
            pub_key: vec![1, 2, 3],
        };
        let data = SnapshotData::new(vec![9, 9], vec![m.clone()]);
        let decoded = SnapshotData::decode(&data.encode().unwrap()).unwrap();
        assert_eq!(decoded.block, vec![9, 9]);
        assert_eq!(decoded.members, vec![m]);
    }
}
