//! Proposal envelopes carried from the producers into the raft event loop.

use crate::pb::Block;
use crate::raft::cluster::Member;
use crate::raft::Result;
use raft::eraftpb::ConfChange;
use tokio::sync::oneshot;

/// A block proposal. The reply resolves once the raft library has
/// accepted (or rejected) the payload for replication.
pub struct Proposal {
    pub block: Block,
    pub reply: oneshot::Sender<Result<()>>,
}

impl Proposal {
    pub fn new(block: Block) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (Proposal { block, reply: tx }, rx)
    }
}

/// A membership change proposal. The outcome travels back through the
/// cluster registry's pending-reply slot, keyed by the conf change id.
pub struct ConfChangePropose {
    pub cc: ConfChange,
    pub member: Member,
}
