//! The raft server: owns the consensus library node, drives its per-step
//! output, persists to the WAL store, talks to the transport and publishes
//! committed blocks to the chain side.
//!
//! Every side effect is sequenced inside the event loop. `progress`,
//! `conf_state`, `applied_index` and `snapshot_index` are touched from
//! that single task only.

use crate::debugger::{self, StopCond};
use crate::metrics;
use crate::pb;
use crate::pb::Block;
use crate::raft::cluster::{Cluster, Member};
use crate::raft::proposal::{ConfChangePropose, Proposal};
use crate::raft::wal::WalDb;
use crate::raft::{
    fatal, raft_logger, snap_to_string, spawn_guarded, ConsensusError, RaftEvent, Result,
    SnapshotData, GET_CLUSTER_RETRY_BACKOFF, GET_CLUSTER_TIMEOUT, HAS_NO_LEADER,
    MAX_TRY_GET_CLUSTER,
};
use crate::raft_client::{self, Transport};
use bytes::Bytes;
use log::{debug, info, warn};
use prost::Message as ProstMessage;
use protobuf::Message as PbMessage;
use raft::eraftpb::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Message, MessageType,
    Snapshot,
};
use raft::storage::MemStorage;
use raft::{Config, RawNode, StateRole, Storage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const PROPOSE_CHANNEL_SIZE: usize = 64;
const CONF_CHANGE_CHANNEL_SIZE: usize = 1;
pub const EVENT_CHANNEL_SIZE: usize = 4096;

pub fn marshal_entry_data(block: &Block) -> Result<Vec<u8>> {
    Ok(block.encode_to_vec())
}

pub fn unmarshal_entry_data(data: &[u8]) -> Result<Block> {
    Block::decode(data).map_err(|_| ConsensusError::Unmarshal)
}

fn make_config(id: u64) -> Config {
    Config {
        id,
        election_tick: 10,
        heartbeat_tick: 1,
        max_size_per_msg: 1024 * 1024,
        max_inflight_msgs: 256,
        check_quorum: true,
        ..Default::default()
    }
}

/// Drops the prefix of a committed batch that is already applied. A batch
/// whose first index skips past `applied + 1` means the log and the
/// applied state have diverged; the caller treats that as fatal.
fn drop_applied_entries(
    applied: u64,
    ents: Vec<Entry>,
) -> std::result::Result<Vec<Entry>, String> {
    if ents.is_empty() {
        return Ok(ents);
    }
    let first = ents[0].index;
    if first > applied + 1 {
        return Err(format!(
            "first index of committed entry[{}] should <= appliedIndex[{}] + 1",
            first, applied
        ));
    }
    let offset = (applied + 1 - first) as usize;
    if offset >= ents.len() {
        return Ok(Vec::new());
    }
    Ok(ents[offset..].to_vec())
}

/// Point-in-time view of the raft node, refreshed by the event loop so
/// external callers never touch the node itself.
#[derive(Clone, Debug, Default)]
pub struct RaftStatus {
    pub id: u64,
    pub term: u64,
    pub commit: u64,
    pub applied: u64,
    pub snapshot_index: u64,
    pub leader: u64,
    pub is_leader: bool,
}

/// Last committed block applied towards the chain service. Snapshots are
/// taken from the previous progress so they only capture state the chain
/// side has already durably absorbed.
#[derive(Clone, Default)]
struct BlockProgress {
    block: Option<Block>,
    index: u64,
    term: u64,
    conf_state: ConfState,
}

pub struct RaftOptions {
    pub join: bool,
    pub base_path: String,
    pub tick_interval: Duration,
    pub snap_frequency: u64,
    pub catch_up_entries: u64,
}

struct CoreInputs {
    propose_rx: mpsc::Receiver<Proposal>,
    cc_rx: mpsc::Receiver<ConfChangePropose>,
    event_rx: mpsc::Receiver<RaftEvent>,
    commit_tx: mpsc::Sender<Option<Block>>,
    transport: Arc<Transport>,
    opts: RaftOptions,
}

/// Shared handle to the raft server. The event loop owns the node, the
/// WAL store and the progress state; this handle mediates every outside
/// interaction through channels and atomics.
pub struct RaftServer {
    cluster: Arc<Cluster>,
    propose_tx: mpsc::Sender<Proposal>,
    cc_tx: mpsc::Sender<ConfChangePropose>,
    event_tx: mpsc::Sender<RaftEvent>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    leader: AtomicU64,
    leader_changed: AtomicU64,
    promotable: AtomicBool,
    status: RwLock<RaftStatus>,
    inputs: Mutex<Option<CoreInputs>>,
}

impl RaftServer {
    /// Wires up the server. `commit_tx` is the block factory's commit
    /// channel; `event_tx`/`event_rx` carry transport and inbound-RPC
    /// traffic into the loop. Nothing runs until [`RaftServer::start`].
    pub fn new(
        cluster: Arc<Cluster>,
        transport: Arc<Transport>,
        commit_tx: mpsc::Sender<Option<Block>>,
        event_tx: mpsc::Sender<RaftEvent>,
        event_rx: mpsc::Receiver<RaftEvent>,
        opts: RaftOptions,
    ) -> Arc<RaftServer> {
        let (propose_tx, propose_rx) = mpsc::channel(PROPOSE_CHANNEL_SIZE);
        let (cc_tx, cc_rx) = mpsc::channel(CONF_CHANGE_CHANNEL_SIZE);
        let (stop_tx, stop_rx) = watch::channel(false);

        Arc::new(RaftServer {
            cluster,
            propose_tx,
            cc_tx,
            event_tx,
            stop_tx,
            stop_rx,
            leader: AtomicU64::new(HAS_NO_LEADER),
            leader_changed: AtomicU64::new(0),
            promotable: AtomicBool::new(true),
            status: RwLock::new(RaftStatus::default()),
            inputs: Mutex::new(Some(CoreInputs {
                propose_rx,
                cc_rx,
                event_rx,
                commit_tx,
                transport,
                opts,
            })),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let inputs = self
            .inputs
            .lock()
            .unwrap()
            .take()
            .expect("raft server started twice");
        let rs = self.clone();
        spawn_guarded("raft-server", async move {
            start_raft(rs, inputs).await;
        });
    }

    /// Replicates a block. Resolves once the library has accepted the
    /// payload; the commit arrives later on the commit channel.
    pub async fn propose(&self, block: Block) -> Result<()> {
        let (proposal, reply) = Proposal::new(block);
        self.propose_tx
            .send(proposal)
            .await
            .map_err(|_| ConsensusError::ClusterNotReady)?;
        reply.await.map_err(|_| ConsensusError::ClusterNotReady)?
    }

    /// Membership API. Leader-only; the reply carries the member once the
    /// change has committed and been applied.
    pub async fn conf_change(&self, req: &pb::MembershipChangeRequest) -> Result<Member> {
        if !self.cluster.is_ready() {
            return Err(ConsensusError::ClusterNotReady);
        }
        if !self.is_leader() {
            return Err(ConsensusError::NotRaftLeader);
        }

        let (cc, member, reply) = self.cluster.prepare_membership_change(req)?;
        if self
            .cc_tx
            .send(ConfChangePropose {
                cc: cc.clone(),
                member,
            })
            .await
            .is_err()
        {
            self.cluster
                .send_conf_change_reply(&cc, None, Some(ConsensusError::ClusterNotReady));
            return Err(ConsensusError::ClusterNotReady);
        }
        reply.await.map_err(|_| ConsensusError::ClusterNotReady)?
    }

    pub fn cluster(&self) -> Arc<Cluster> {
        self.cluster.clone()
    }

    pub fn raft_events(&self) -> mpsc::Sender<RaftEvent> {
        self.event_tx.clone()
    }

    pub fn consensus_info(&self) -> String {
        self.cluster.consensus_info(self.get_leader())
    }

    pub fn get_leader(&self) -> u64 {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        let id = self.cluster.node_id();
        id != raft::INVALID_ID && id == self.get_leader()
    }

    /// Counts leadership transitions observed by this node.
    pub fn leader_changed(&self) -> u64 {
        self.leader_changed.load(Ordering::SeqCst)
    }

    fn note_leader(&self, leader: u64) {
        self.leader.store(leader, Ordering::SeqCst);
        self.leader_changed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_promotable(&self, val: bool) {
        self.promotable.store(val, Ordering::SeqCst);
    }

    /// A promotable node ticks the library and may campaign. A joining
    /// node stays non-promotable until it has caught up.
    pub fn get_promotable(&self) -> bool {
        self.promotable.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> RaftStatus {
        self.status.read().unwrap().clone()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }
}

enum StartState {
    Restart,
    JoinCluster,
    NewCluster,
}

async fn start_raft(rs: Arc<RaftServer>, inputs: CoreInputs) {
    let mut wal = match WalDb::open(&inputs.opts.base_path) {
        Ok(wal) => wal,
        Err(e) => fatal!("failed to open wal store: {}", e),
    };
    let cluster = rs.cluster.clone();

    let state = if wal.has_wal() {
        StartState::Restart
    } else if inputs.opts.join {
        StartState::JoinCluster
    } else {
        StartState::NewCluster
    };

    let logger = raft_logger(cluster.node_name());

    let (raw, raft_storage) = match state {
        StartState::Restart => {
            info!("raft restart from wal");

            let snapshot = match wal.get_snapshot() {
                Ok(snapshot) => snapshot,
                Err(e) => fatal!("failed to read snapshot: {}", e),
            };
            let (identity, hard_state, entries) = match wal.read_all(snapshot.as_ref()) {
                Ok(recovered) => recovered,
                Err(e) => fatal!("replay wal failed for raft: {}", e),
            };
            if let Err(e) = cluster.recover_identity(&identity) {
                fatal!("failed to recover raft identity from wal: {}", e);
            }

            let storage = match &snapshot {
                Some(snap) => {
                    info!("loaded snapshot meta: {}", snap_to_string(snap));
                    // membership comes from the snapshot payload; replayed
                    // entries past it bring the cluster up to date
                    cluster.reset_members();
                    let storage = MemStorage::new();
                    if let Err(e) = storage.wl().apply_snapshot(snap.clone()) {
                        fatal!("failed to apply snapshot while replaying wal: {}", e);
                    }
                    if let Err(e) = cluster.recover(snap) {
                        fatal!("failed to recover cluster from snapshot: {}", e);
                    }
                    storage
                }
                None if !inputs.opts.join => {
                    // nothing was ever snapshotted: the bootstrap voter set
                    // is a pure function of the static configuration, and
                    // replayed conf changes rebuild the rest
                    let voters = cluster.member_ids();
                    MemStorage::new_with_conf_state(ConfState::from((voters, Vec::new())))
                }
                None => {
                    // a joiner that crashed before its first snapshot: wait
                    // for the leader to send one again
                    cluster.reset_members();
                    MemStorage::new()
                }
            };
            // a crash between identity write and the first Ready leaves no
            // persisted hard state; keep the storage's initial one then
            if hard_state != HardState::default() {
                storage.wl().set_hardstate(hard_state);
            }
            if let Err(e) = storage.wl().append(&entries) {
                fatal!("failed to append entries while replaying wal: {}", e);
            }

            info!("replaying wal done, last index {}", wal.last_index());

            let config = make_config(cluster.node_id());
            match RawNode::new(&config, storage.clone(), &logger) {
                Ok(raw) => (raw, storage),
                Err(e) => fatal!("failed to restart raft node: {}", e),
            }
        }
        StartState::JoinCluster => {
            info!("raft start at first time, joining existing cluster");

            let (members, chain_id) = match get_existing_cluster(&cluster).await {
                Ok(found) => found,
                Err(e) => fatal!("failed to get existing cluster info: {}", e),
            };
            if let Err(e) = cluster.validate_and_merge_existing_cluster(members, &chain_id) {
                fatal!(
                    "this configuration is not compatible with the existing cluster: {}",
                    e
                );
            }
            if let Err(e) = wal.write_identity(&cluster.identity()) {
                fatal!("failed to save identity: {}", e);
            }

            // cannot campaign until caught up with the cluster's log
            rs.set_promotable(false);

            let storage = MemStorage::new();
            let config = make_config(cluster.node_id());
            match RawNode::new(&config, storage.clone(), &logger) {
                Ok(raw) => (raw, storage),
                Err(e) => fatal!("failed to start raft node: {}", e),
            }
        }
        StartState::NewCluster => {
            info!("raft start at first time, bootstrapping new cluster");

            if let Err(e) = cluster.set_this_node_id() {
                fatal!("failed to set id of this node: {}", e);
            }
            if let Err(e) = wal.write_identity(&cluster.identity()) {
                fatal!("failed to save identity: {}", e);
            }

            let voters = cluster.member_ids();
            let storage = MemStorage::new_with_conf_state(ConfState::from((voters, Vec::new())));
            let config = make_config(cluster.node_id());
            match RawNode::new(&config, storage.clone(), &logger) {
                Ok(raw) => (raw, storage),
                Err(e) => fatal!("failed to start raft node: {}", e),
            }
        }
    };

    let node_id = cluster.node_id();
    for member in cluster.members() {
        if member.id != node_id {
            inputs.transport.add_peer(member.id, &member.url);
        }
    }

    let core = RaftCore {
        rs,
        raw,
        raft_storage,
        wal,
        transport: inputs.transport,
        commit_tx: inputs.commit_tx,
        propose_rx: inputs.propose_rx,
        cc_rx: inputs.cc_rx,
        event_rx: inputs.event_rx,
        conf_state: ConfState::default(),
        snapshot_index: 0,
        applied_index: 0,
        progress: BlockProgress::default(),
        prev_progress: BlockProgress::default(),
        snap_frequency: inputs.opts.snap_frequency,
        catch_up_entries: inputs.opts.catch_up_entries,
        tick_interval: inputs.opts.tick_interval,
    };

    core.serve_channels().await;
}

/// Queries the configured seed peers for the running cluster's view,
/// retrying with a backoff. Timeouts move on to the next seed at once.
async fn get_existing_cluster(cluster: &Cluster) -> Result<(Vec<Member>, Vec<u8>)> {
    let seeds: Vec<String> = cluster
        .members()
        .into_iter()
        .filter(|m| m.name != cluster.node_name())
        .map(|m| m.url)
        .collect();
    if seeds.is_empty() {
        return Err(ConsensusError::GetClusterFail);
    }

    for attempt in 1..=MAX_TRY_GET_CLUSTER {
        let mut last_err = ConsensusError::GetClusterFail;
        for url in &seeds {
            match raft_client::get_cluster_info(url, GET_CLUSTER_TIMEOUT).await {
                Ok(found) => return Ok(found),
                Err(e) => {
                    debug!(
                        "failed to get cluster info from {} (try {}): {}",
                        url, attempt, e
                    );
                    last_err = e;
                }
            }
        }
        if attempt != MAX_TRY_GET_CLUSTER
            && !matches!(last_err, ConsensusError::GetClusterTimeout)
        {
            tokio::time::sleep(GET_CLUSTER_RETRY_BACKOFF).await;
        }
    }

    Err(ConsensusError::GetClusterFail)
}

enum Input {
    Tick,
    Event(RaftEvent),
    Propose(Proposal),
    ConfChange(ConfChangePropose),
    Stop,
}

struct RaftCore {
    rs: Arc<RaftServer>,
    raw: RawNode<MemStorage>,
    raft_storage: MemStorage,
    wal: WalDb,
    transport: Arc<Transport>,
    commit_tx: mpsc::Sender<Option<Block>>,
    propose_rx: mpsc::Receiver<Proposal>,
    cc_rx: mpsc::Receiver<ConfChangePropose>,
    event_rx: mpsc::Receiver<RaftEvent>,
    conf_state: ConfState,
    snapshot_index: u64,
    applied_index: u64,
    progress: BlockProgress,
    prev_progress: BlockProgress,
    snap_frequency: u64,
    catch_up_entries: u64,
    tick_interval: Duration,
}

impl RaftCore {
    async fn serve_channels(mut self) {
        let snap = match self.raft_storage.snapshot(0, 0) {
            Ok(snap) => snap,
            Err(e) => fatal!("failed to read initial snapshot state: {}", e),
        };
        self.conf_state = snap.get_metadata().get_conf_state().clone();
        self.snapshot_index = snap.get_metadata().index;
        self.applied_index = snap.get_metadata().index;

        let mut stop_rx = self.rs.stopped();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let input = tokio::select! {
                _ = ticker.tick() => Input::Tick,
                maybe = self.event_rx.recv() => maybe.map(Input::Event).unwrap_or(Input::Stop),
                maybe = self.propose_rx.recv() => maybe.map(Input::Propose).unwrap_or(Input::Stop),
                maybe = self.cc_rx.recv() => maybe.map(Input::ConfChange).unwrap_or(Input::Stop),
                _ = stop_rx.changed() => Input::Stop,
            };

            match input {
                Input::Tick => {
                    if self.rs.get_promotable() {
                        self.raw.tick();
                    }
                }
                Input::Event(ev) => {
                    self.handle_event(ev);
                    while let Ok(ev) = self.event_rx.try_recv() {
                        self.handle_event(ev);
                    }
                }
                Input::Propose(proposal) => self.handle_propose(proposal),
                Input::ConfChange(propose) => self.handle_conf_change(propose),
                Input::Stop => {
                    self.shutdown();
                    return;
                }
            }

            if self.raw.has_ready() {
                if !self.on_ready().await {
                    self.shutdown();
                    return;
                }
            }
            self.update_status();
        }
    }

    fn handle_event(&mut self, ev: RaftEvent) {
        match ev {
            RaftEvent::Message(msg) => {
                if let Err(e) = self.raw.step(msg) {
                    warn!("failed to step raft message: {}", e);
                }
            }
            RaftEvent::Unreachable(id) => {
                debug!("peer {:#x} reported unreachable", id);
                self.raw.report_unreachable(id);
            }
            RaftEvent::SnapshotResult { to, status } => {
                debug!("snapshot transfer to {:#x} finished: {:?}", to, status);
                self.raw.report_snapshot(to, status);
            }
        }
    }

    fn handle_propose(&mut self, proposal: Proposal) {
        if self.raw.raft.state != StateRole::Leader {
            let _ = proposal.reply.send(Err(ConsensusError::NotRaftLeader));
            return;
        }

        let result = marshal_entry_data(&proposal.block).and_then(|data| {
            debug!("proposing {} bytes to raft node", data.len());
            self.raw
                .propose(Vec::new(), data)
                .map_err(ConsensusError::from)
        });
        let _ = proposal.reply.send(result);
    }

    fn handle_conf_change(&mut self, propose: ConfChangePropose) {
        if let Err(e) = self.raw.propose_conf_change(Vec::new(), propose.cc.clone()) {
            warn!("failed to propose conf change: {}", e);
            self.rs
                .cluster
                .send_conf_change_reply(&propose.cc, None, Some(e.into()));
        }
    }

    /// One unit of library progress. Persistence always happens before the
    /// matching messages and before `advance`; a crash in between replays
    /// cleanly from the WAL.
    async fn on_ready(&mut self) -> bool {
        let mut ready = self.raw.ready();

        if !ready.messages().is_empty() {
            // on the leader these go out before fsync to cut commit latency
            let msgs = ready.take_messages();
            if let Err(e) = self.process_messages(msgs) {
                fatal!("process message error: {}", e);
            }
        }

        if let Err(e) = self.wal.save_entry(ready.hs().cloned(), ready.entries()) {
            fatal!("failed to save entry to wal: {}", e);
        }

        if *ready.snapshot() != Snapshot::default() {
            let snap = ready.snapshot().clone();
            if let Err(e) = self.wal.write_snapshot(&snap) {
                fatal!("failed to save snapshot to wal: {}", e);
            }
            if let Err(e) = self.raft_storage.wl().apply_snapshot(snap.clone()) {
                fatal!("failed to apply snapshot: {}", e);
            }
            if let Err(e) = self.publish_snapshot(&snap) {
                fatal!("failed to publish snapshot: {}", e);
            }
            metrics::SNAPSHOT_COUNTER_VEC
                .with_label_values(&["received"])
                .inc();
        }

        if !ready.entries().is_empty() {
            if let Err(e) = self.raft_storage.wl().append(ready.entries()) {
                fatal!("failed to append new entries to raft log: {}", e);
            }
        }

        if !ready.persisted_messages().is_empty() {
            let msgs = ready.take_persisted_messages();
            if let Err(e) = self.process_messages(msgs) {
                fatal!("process message error: {}", e);
            }
        }

        let committed = ready.take_committed_entries();
        match drop_applied_entries(self.applied_index, committed) {
            Ok(ents) => {
                if !self.publish_entries(ents).await {
                    return false;
                }
            }
            Err(msg) => fatal!("{}", msg),
        }

        if let Some(ss) = ready.ss() {
            let leader_id = ss.leader_id;
            self.update_leader(leader_id);
        }

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.raft_storage.wl().mut_hard_state().set_commit(commit);
        }
        let msgs = light.take_messages();
        if !msgs.is_empty() {
            if let Err(e) = self.process_messages(msgs) {
                fatal!("process message error: {}", e);
            }
        }
        match drop_applied_entries(self.applied_index, light.take_committed_entries()) {
            Ok(ents) => {
                if !self.publish_entries(ents).await {
                    return false;
                }
            }
            Err(msg) => fatal!("{}", msg),
        }

        self.trigger_snapshot();
        self.raw.advance_apply();
        true
    }

    /// Outbound snapshot messages are replaced with a streamed form so the
    /// payload never blocks the message channel; the normal-path copy is
    /// dropped by zeroing its destination.
    fn process_messages(&mut self, mut msgs: Vec<Message>) -> Result<()> {
        let mut snap_msgs = Vec::new();
        for msg in msgs.iter_mut() {
            if msg.get_msg_type() == MessageType::MsgSnapshot {
                snap_msgs.push(self.make_snap_message(msg)?);
                msg.to = raft::INVALID_ID;
            }
        }

        self.transport.send(msgs);

        for snap_msg in snap_msgs {
            self.transport.send_snapshot(snap_msg);
        }
        Ok(())
    }

    fn make_snap_message(&self, msg: &Message) -> Result<Message> {
        if msg.get_msg_type() != MessageType::MsgSnapshot {
            return Err(ConsensusError::NotMsgSnap);
        }

        // the streamed copy carries the membership payload; chain state is
        // fetched out-of-band by the receiver
        let block = match &self.prev_progress.block {
            Some(block) => marshal_entry_data(block)?,
            None => Vec::new(),
        };
        let data = SnapshotData::new(block, self.rs.cluster.members()).encode()?;

        let mut out = msg.clone();
        out.mut_snapshot().set_data(Bytes::from(data));
        debug!(
            "sending streamed snapshot message to {:#x}: {}",
            out.to,
            snap_to_string(out.get_snapshot())
        );
        Ok(out)
    }

    /// Applies committed entries in order: blocks go to the commit channel
    /// (backpressured by the chain service), conf changes mutate the
    /// cluster. Returns false when the node must shut down.
    async fn publish_entries(&mut self, ents: Vec<Entry>) -> bool {
        for ent in ents {
            debug!(
                "publish entry: term={} index={} type={:?} datalen={}",
                ent.term,
                ent.index,
                ent.get_entry_type(),
                ent.data.len()
            );

            match ent.get_entry_type() {
                EntryType::EntryNormal => {
                    let mut block = None;
                    if !ent.data.is_empty() {
                        match unmarshal_entry_data(ent.data.as_ref()) {
                            Ok(b) => block = Some(b),
                            Err(_) => fatal!(
                                "commit entry is corrupted: term={} index={}",
                                ent.term,
                                ent.index
                            ),
                        }
                    }
                    if let Some(b) = &block {
                        info!(
                            "commit normal block entry: no={} hash={}",
                            b.block_no(),
                            b.id()
                        );
                    }
                    metrics::COMMIT_ENTRY_VEC.with_label_values(&["normal"]).inc();

                    let commit_tx = self.commit_tx.clone();
                    let mut stop_rx = self.rs.stopped();
                    tokio::select! {
                        res = commit_tx.send(block.clone()) => {
                            if res.is_err() {
                                return false;
                            }
                        }
                        _ = stop_rx.changed() => return false,
                    }
                    self.update_block_progress(ent.term, ent.index, block);
                }
                EntryType::EntryConfChange => {
                    metrics::COMMIT_ENTRY_VEC
                        .with_label_values(&["confchange"])
                        .inc();
                    if !self.apply_conf_change_entry(&ent) {
                        return false;
                    }
                }
                _ => {}
            }

            self.set_applied_index(ent.index);
        }
        true
    }

    fn update_block_progress(&mut self, term: u64, index: u64, block: Option<Block>) {
        let block = match block {
            Some(block) => block,
            None => return,
        };

        debug!(
            "set progress of last block: term={} index={} no={} hash={}",
            term,
            index,
            block.block_no(),
            block.id()
        );

        self.prev_progress = self.progress.clone();
        self.progress = BlockProgress {
            block: Some(block),
            index,
            term,
            conf_state: self.conf_state.clone(),
        };
    }

    /// Applies a committed conf-change entry. An entry that fails
    /// validation is recovered locally: the library's pending change is
    /// cleared with a zeroed node id and the proposer is told why.
    fn apply_conf_change_entry(&mut self, ent: &Entry) -> bool {
        let mut cc = ConfChange::default();
        if cc.merge_from_bytes(ent.data.as_ref()).is_err() {
            fatal!(
                "failed to unmarshal conf change entry at index {}",
                ent.index
            );
        }

        // changes without a member context come from the library itself
        if cc.context.is_empty() {
            match self.raw.apply_conf_change(&cc) {
                Ok(cs) => self.conf_state = cs,
                Err(e) => fatal!("failed to apply conf change: {}", e),
            }
            return true;
        }

        let member = match self.validate_conf_change_entry(&cc, ent) {
            Ok(member) => member,
            Err(e) => {
                warn!("failed to validate conf change: {}", e);
                let mut cleared = cc.clone();
                cleared.node_id = raft::INVALID_ID;
                let _ = self.raw.apply_conf_change(&cleared);
                self.rs.cluster.send_conf_change_reply(&cc, None, Some(e));
                return true;
            }
        };

        match self.raw.apply_conf_change(&cc) {
            Ok(cs) => self.conf_state = cs,
            Err(e) => fatal!("failed to apply conf change: {}", e),
        }

        info!(
            "publish conf change entry: type={:?} member={}",
            cc.get_change_type(),
            member.to_string_short()
        );

        let self_id = self.rs.cluster.node_id();
        match cc.get_change_type() {
            ConfChangeType::AddNode => {
                if let Err(e) = self
                    .rs
                    .cluster
                    .add_member(member.clone(), ent.term, ent.index)
                {
                    fatal!("failed to add member to cluster: {}", e);
                }
                if cc.node_id != self_id {
                    self.transport.add_peer(cc.node_id, &member.url);
                }
            }
            ConfChangeType::RemoveNode => {
                if let Err(e) = self.rs.cluster.remove_member(cc.node_id, ent.term, ent.index) {
                    fatal!("failed to remove member from cluster: {}", e);
                }
                if cc.node_id == self_id {
                    info!("removed from the cluster, shutting down");
                    self.rs
                        .cluster
                        .send_conf_change_reply(&cc, Some(member), None);
                    return false;
                }
                self.transport.remove_peer(cc.node_id);
            }
            _ => {}
        }

        self.rs
            .cluster
            .send_conf_change_reply(&cc, Some(member), None);
        true
    }

    fn validate_conf_change_entry(&self, cc: &ConfChange, ent: &Entry) -> Result<Member> {
        if self.rs.cluster.already_applied(ent.index) {
            return Err(ConsensusError::CCAlreadyApplied);
        }

        let member: Member = serde_json::from_slice(cc.context.as_ref())
            .map_err(|_| ConsensusError::InvalidMember("bad conf change context".to_string()))?;

        self.rs
            .cluster
            .validate_change_membership(cc.get_change_type(), &member)?;
        Ok(member)
    }

    /// Installs a snapshot received from the leader: reset the applied
    /// position, restore membership from the payload and rebuild the
    /// transport around the new member set.
    fn publish_snapshot(&mut self, snap: &Snapshot) -> Result<()> {
        if *snap == Snapshot::default() {
            return Err(ConsensusError::EmptySnapshot);
        }

        info!("publishing snapshot: {}", snap_to_string(snap));

        let meta = snap.get_metadata();
        if meta.index <= self.applied_index {
            fatal!(
                "snapshot index [{}] should be > appliedIndex [{}]",
                meta.index,
                self.applied_index
            );
        }

        self.conf_state = meta.get_conf_state().clone();
        self.set_snapshot_index(meta.index);
        self.set_applied_index(meta.index);
        self.prev_progress = BlockProgress::default();
        self.progress = BlockProgress::default();

        self.rs.cluster.recover(snap)?;
        self.recover_transport();

        // a joining node is caught up once its first snapshot lands
        if !self.rs.get_promotable() {
            self.rs.set_promotable(true);
        }

        info!(
            "finished publishing snapshot at index {}",
            self.snapshot_index
        );
        Ok(())
    }

    fn recover_transport(&self) {
        info!("remove all peers to rebuild transport");
        self.transport.remove_all_peers();

        let self_id = self.rs.cluster.node_id();
        for member in self.rs.cluster.members() {
            if member.id == self_id {
                continue;
            }
            self.transport.add_peer(member.id, &member.url);
        }
    }

    /// Creates a snapshot once enough entries have been applied past the
    /// last one. Taken from the previous progress: the block at the
    /// current progress may not be durable in the chain service yet.
    fn trigger_snapshot(&mut self) {
        if self.prev_progress.index == 0 || self.prev_progress.block.is_none() {
            return;
        }

        let new_snapshot_index = self.prev_progress.index;
        if new_snapshot_index - self.snapshot_index <= self.snap_frequency {
            return;
        }

        info!(
            "start snapshot: applied={} new-snap-index={} last-snap-index={}",
            self.applied_index, new_snapshot_index, self.snapshot_index
        );

        let block = self.prev_progress.block.as_ref().unwrap();
        let block_bytes = match marshal_entry_data(block) {
            Ok(raw) => raw,
            Err(e) => fatal!("failed to encode snapshot block: {}", e),
        };
        let data = match SnapshotData::new(block_bytes, self.rs.cluster.members()).encode() {
            Ok(data) => data,
            Err(e) => fatal!("failed to marshal snapshot data: {}", e),
        };

        let mut snap = Snapshot::default();
        {
            let meta = snap.mut_metadata();
            meta.index = new_snapshot_index;
            meta.term = self.prev_progress.term;
            meta.set_conf_state(self.prev_progress.conf_state.clone());
        }
        snap.set_data(Bytes::from(data));

        if let Err(e) = self.wal.write_snapshot(&snap) {
            fatal!("failed to write snapshot: {}", e);
        }
        metrics::SNAPSHOT_COUNTER_VEC
            .with_label_values(&["created"])
            .inc();
        self.set_snapshot_index(new_snapshot_index);

        let compact_index = if new_snapshot_index > self.catch_up_entries {
            new_snapshot_index - self.catch_up_entries
        } else {
            1
        };
        match self.raft_storage.wl().compact(compact_index) {
            Ok(()) => info!("compacted raft log at index {}", compact_index),
            Err(raft::Error::Store(raft::StorageError::Compacted)) => {}
            Err(e) => fatal!("failed to compact raft log: {}", e),
        }

        debugger::check(StopCond::RaftSnapFreq, |freq| {
            if freq > 0 {
                self.snap_frequency = freq as u64;
            }
        });
    }

    fn update_leader(&mut self, leader_id: u64) {
        if leader_id != self.rs.get_leader() {
            self.rs.note_leader(leader_id);
            info!(
                "leader changed: id={:#x} leader={:#x}",
                self.rs.cluster.node_id(),
                leader_id
            );
        }
    }

    fn set_snapshot_index(&mut self, idx: u64) {
        debug!("set snapshotIndex to {}", idx);
        self.snapshot_index = idx;
    }

    fn set_applied_index(&mut self, idx: u64) {
        debug!("set appliedIndex to {}", idx);
        self.applied_index = idx;
    }

    fn update_status(&self) {
        let raft = &self.raw.raft;
        let mut status = self.rs.status.write().unwrap();
        *status = RaftStatus {
            id: raft.id,
            term: raft.term,
            commit: raft.raft_log.committed,
            applied: self.applied_index,
            snapshot_index: self.snapshot_index,
            leader: raft.leader_id,
            is_leader: raft.state == StateRole::Leader,
        };
    }

    fn shutdown(&mut self) {
        info!("raft server shutdown");
        self.transport.remove_all_peers();
        let _ = self.rs.stop_tx.send(true);
        // dropping the core closes the commit channel
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::*;
    use super::*;

    fn entry(index: u64) -> Entry {
        let mut e = Entry::default();
        e.term = 1;
        e.index = index;
        e
    }

    #[test]
    fn entry_data_round_trip() {
        let block = Block::build(b"test-chain", None, Vec::new(), "alpha");
        let data = marshal_entry_data(&block).unwrap();
        let decoded = unmarshal_entry_data(&data).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn unmarshal_rejects_garbage() {
        // a length-delimited field pointing past the buffer
        let err = unmarshal_entry_data(&[0x0a, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, ConsensusError::Unmarshal));
    }

    #[test]
    fn committed_batch_boundaries() {
        // empty input passes through
        assert!(drop_applied_entries(5, Vec::new()).unwrap().is_empty());

        // batch starting past applied + 1 is a divergence
        assert!(drop_applied_entries(3, vec![entry(5)]).is_err());

        // already-applied prefix is dropped
        let ents = vec![entry(3), entry(4), entry(5)];
        let kept = drop_applied_entries(3, ents).unwrap();
        assert_eq!(kept.iter().map(|e| e.index).collect::<Vec<_>>(), vec![4, 5]);

        // a fully applied batch leaves nothing
        assert!(drop_applied_entries(9, vec![entry(8), entry(9)])
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn single_node_bootstrap_commits_proposed_blocks() {
        let mut fixture = start_single_node("alpha", 10, 10).await;
        let rs = fixture.rs.clone();

        wait_for(|| rs.is_leader(), Duration::from_secs(5)).await;
        assert!(rs.leader_changed() > 0);

        let chain_id = b"test-chain".to_vec();
        let genesis = Block::build(&chain_id, None, Vec::new(), "alpha");
        let committed = fixture.propose_and_recv(genesis.clone()).await;
        assert_eq!(committed.hash, genesis.hash);

        let next = Block::build(&chain_id, Some(&genesis), Vec::new(), "alpha");
        let committed = fixture.propose_and_recv(next.clone()).await;
        assert_eq!(committed.hash, next.hash);

        let status = rs.status();
        assert!(status.is_leader);
        assert!(status.applied >= 2);

        rs.stop();
    }

    #[tokio::test]
    async fn snapshot_triggers_after_enough_applied_entries() {
        let mut fixture = start_single_node("alpha", 2, 2).await;
        let rs = fixture.rs.clone();

        wait_for(|| rs.is_leader(), Duration::from_secs(5)).await;

        let initial_snap = rs.status().snapshot_index;
        let chain_id = b"test-chain".to_vec();
        let mut prev: Option<Block> = None;
        for _ in 0..8 {
            let block = Block::build(&chain_id, prev.as_ref(), Vec::new(), "alpha");
            let committed = fixture.propose_and_recv(block.clone()).await;
            assert_eq!(committed.hash, block.hash);
            prev = Some(block);
        }

        wait_for(
            || rs.status().snapshot_index > initial_snap,
            Duration::from_secs(5),
        )
        .await;
        let status = rs.status();
        assert!(status.snapshot_index <= status.applied);

        rs.stop();
    }

    #[tokio::test]
    async fn restart_replays_committed_blocks_from_wal() {
        let dir = tempfile::TempDir::new().unwrap();

        let chain_id = b"test-chain".to_vec();
        let mut hashes = Vec::new();
        {
            let mut fixture = start_single_node_at(dir.path(), "alpha", 100, 100).await;
            let rs = fixture.rs.clone();
            wait_for(|| rs.is_leader(), Duration::from_secs(5)).await;

            let mut prev: Option<Block> = None;
            for _ in 0..3 {
                let block = Block::build(&chain_id, prev.as_ref(), Vec::new(), "alpha");
                fixture.propose_and_recv(block.clone()).await;
                hashes.push(block.hash.clone());
                prev = Some(block);
            }

            rs.stop();
            let mut stopped = rs.stopped();
            let _ = tokio::time::timeout(Duration::from_secs(5), stopped.changed()).await;
        }
        // give the old event loop a moment to drop its file handles
        tokio::time::sleep(Duration::from_millis(100)).await;

        // same directory, fresh process state: the wal drives recovery
        let mut fixture = start_single_node_at(dir.path(), "alpha", 100, 100).await;
        let rs = fixture.rs.clone();

        let mut replayed = Vec::new();
        while replayed.len() < 3 {
            let received = tokio::time::timeout(Duration::from_secs(5), fixture.commit_rx.recv())
                .await
                .expect("replayed commit within deadline")
                .expect("commit channel open");
            if let Some(block) = received {
                replayed.push(block.hash);
            }
        }
        assert_eq!(replayed, hashes);

        wait_for(|| rs.status().applied >= 4, Duration::from_secs(5)).await;
        rs.stop();
    }

    #[tokio::test]
    async fn propose_on_non_leader_is_rejected() {
        // non-promotable nodes never campaign, so leadership never arrives
        let fixture = start_single_node_non_promotable("alpha").await;
        let rs = fixture.rs.clone();

        let block = Block::build(b"test-chain", None, Vec::new(), "alpha");
        let err = rs.propose(block).await.unwrap_err();
        assert!(matches!(err, ConsensusError::NotRaftLeader));

        rs.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    pub struct Fixture {
        pub rs: Arc<RaftServer>,
        pub commit_rx: mpsc::Receiver<Option<Block>>,
        // held so the wal directory outlives the test
        pub _dir: Option<TempDir>,
    }

    impl Fixture {
        /// Proposes concurrently with draining the commit channel; the
        /// commit send backpressures the raft loop, so reading and
        /// proposing cannot be sequential.
        pub async fn propose_and_recv(&mut self, block: Block) -> Block {
            let rs = self.rs.clone();
            let proposed = block.clone();
            let proposer =
                tokio::spawn(async move { rs.propose(proposed).await });

            let deadline = Duration::from_secs(5);
            let committed = loop {
                let received = tokio::time::timeout(deadline, self.commit_rx.recv())
                    .await
                    .expect("commit within deadline")
                    .expect("commit channel open");
                // empty entries from elections arrive as None
                if let Some(b) = received {
                    break b;
                }
            };
            proposer.await.unwrap().unwrap();
            committed
        }
    }

    fn build_at(
        base_path: &Path,
        name: &str,
        snap_frequency: u64,
        catch_up: u64,
        promotable: bool,
    ) -> (Arc<RaftServer>, mpsc::Receiver<Option<Block>>) {
        let cluster = Arc::new(Cluster::new(b"test-chain", name));
        cluster
            .bootstrap_from_config(&[(name.to_string(), "http://127.0.0.1:19999".to_string())])
            .unwrap();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let transport = Arc::new(Transport::new(event_tx.clone()));
        let (commit_tx, commit_rx) = mpsc::channel(1);

        let rs = RaftServer::new(
            cluster,
            transport,
            commit_tx,
            event_tx,
            event_rx,
            RaftOptions {
                join: false,
                base_path: base_path.to_string_lossy().to_string(),
                tick_interval: Duration::from_millis(10),
                snap_frequency,
                catch_up_entries: catch_up,
            },
        );
        rs.set_promotable(promotable);
        (rs, commit_rx)
    }

    pub async fn start_single_node(name: &str, snap_frequency: u64, catch_up: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let (rs, commit_rx) = build_at(dir.path(), name, snap_frequency, catch_up, true);
        rs.start();
        Fixture {
            rs,
            commit_rx,
            _dir: Some(dir),
        }
    }

    pub async fn start_single_node_at(
        base_path: &Path,
        name: &str,
        snap_frequency: u64,
        catch_up: u64,
    ) -> Fixture {
        let (rs, commit_rx) = build_at(base_path, name, snap_frequency, catch_up, true);
        rs.start();
        Fixture {
            rs,
            commit_rx,
            _dir: None,
        }
    }

    pub async fn start_single_node_non_promotable(name: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let (rs, commit_rx) = build_at(dir.path(), name, 10, 10, false);
        rs.start();
        Fixture {
            rs,
            commit_rx,
            _dir: Some(dir),
        }
    }

    pub async fn wait_for<F: Fn() -> bool>(cond: F, deadline: Duration) {
        let start = std::time::Instant::now();
        while !cond() {
            if start.elapsed() > deadline {
                panic!("condition not reached within {:?}", deadline);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
