//! Outbound raft transport: one streaming link per peer, a side channel
//! for snapshot transfer, and the join-time cluster discovery client.

use crate::pb::raft_service_client::RaftServiceClient;
use crate::pb::{ClusterInfoRequest, PostDataRequest, SnapshotChunk};
use crate::raft::cluster::Member;
use crate::raft::{ConsensusError, RaftEvent, Result};
use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use raft::SnapshotStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};

const PEER_CHANNEL_SIZE: usize = 1000;

struct PeerLink {
    sender: Sender<PostDataRequest>,
    invalid: Arc<AtomicBool>,
}

impl PeerLink {
    fn new(url: String) -> std::result::Result<Self, tonic::transport::Error> {
        let endpoint = tonic::transport::Endpoint::from_shared(url)?;
        let client = RaftServiceClient::new(endpoint.connect_lazy());
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_SIZE);

        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::stream_messages(client, receiver).await {
                log::warn!("peer stream closed: {}", e);
            }
            invalid_clone.store(true, Ordering::SeqCst);
        });

        Ok(Self { sender, invalid })
    }

    async fn stream_messages(
        mut client: RaftServiceClient<tonic::transport::Channel>,
        receiver: Receiver<PostDataRequest>,
    ) -> std::result::Result<(), tonic::Status> {
        let stream = tokio_stream::wrappers::ReceiverStream::new(receiver);
        let _ = client.post_data(stream).await?;
        Ok(())
    }
}

/// Per-peer links keyed by member id. Sending is best-effort: a dead link
/// is torn down and reported so the raft library retries after the next
/// heartbeat.
pub struct Transport {
    urls: Mutex<HashMap<u64, String>>,
    peers: Mutex<HashMap<u64, PeerLink>>,
    events: Sender<RaftEvent>,
}

impl Transport {
    pub fn new(events: Sender<RaftEvent>) -> Self {
        Transport {
            urls: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn add_peer(&self, id: u64, url: &str) {
        log::info!("transport add peer {:#x} at {}", id, url);
        self.urls.lock().unwrap().insert(id, url.to_string());
    }

    pub fn remove_peer(&self, id: u64) {
        log::info!("transport remove peer {:#x}", id);
        self.urls.lock().unwrap().remove(&id);
        self.peers.lock().unwrap().remove(&id);
    }

    pub fn remove_all_peers(&self) {
        self.urls.lock().unwrap().clear();
        self.peers.lock().unwrap().clear();
    }

    fn url_of(&self, id: u64) -> Option<String> {
        self.urls.lock().unwrap().get(&id).cloned()
    }

    fn report_unreachable(&self, id: u64) {
        let _ = self.events.try_send(RaftEvent::Unreachable(id));
    }

    /// Queues protocol messages onto their peer links. Messages whose
    /// destination was cleared upstream are dropped.
    pub fn send(&self, msgs: Vec<Message>) {
        for msg in msgs {
            let to = msg.to;
            if to == raft::INVALID_ID {
                continue;
            }

            let url = match self.url_of(to) {
                Some(url) => url,
                None => {
                    log::debug!("no link for peer {:#x}, dropping message", to);
                    continue;
                }
            };

            let mut peers = self.peers.lock().unwrap();
            if let Some(link) = peers.get(&to) {
                if link.invalid.load(Ordering::SeqCst) {
                    peers.remove(&to);
                    self.report_unreachable(to);
                    continue;
                }
            } else {
                match PeerLink::new(url) {
                    Ok(link) => {
                        peers.insert(to, link);
                    }
                    Err(e) => {
                        log::warn!("failed to open link to peer {:#x}: {}", to, e);
                        self.report_unreachable(to);
                        continue;
                    }
                }
            }

            let raw = match msg.write_to_bytes() {
                Ok(raw) => raw,
                Err(e) => {
                    log::error!("failed to serialize raft message: {}", e);
                    continue;
                }
            };
            let link = peers.get(&to).unwrap();
            if link.sender.try_send(PostDataRequest { data: raw }).is_err() {
                self.report_unreachable(to);
            }
        }
    }

    /// Streams a snapshot message to its destination on a dedicated RPC so
    /// the payload never sits in the normal message channel. The outcome
    /// is reported back into the raft loop.
    pub fn send_snapshot(&self, msg: Message) {
        let to = msg.to;
        let url = self.url_of(to);
        let events = self.events.clone();

        tokio::spawn(async move {
            let status = match Self::stream_snapshot(url, msg).await {
                Ok(()) => SnapshotStatus::Finish,
                Err(e) => {
                    log::warn!("snapshot transfer to {:#x} failed: {}", to, e);
                    SnapshotStatus::Failure
                }
            };
            let _ = events
                .send(RaftEvent::SnapshotResult { to, status })
                .await;
        });
    }

    async fn stream_snapshot(url: Option<String>, msg: Message) -> Result<()> {
        let url = url.ok_or_else(|| {
            ConsensusError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no url for snapshot destination",
            ))
        })?;

        let mut client = RaftServiceClient::connect(url).await.map_err(io_other)?;

        let payload = msg.write_to_bytes().map_err(io_other)?;
        // marker frame first, then the serialized message; the chain state
        // itself is fetched out-of-band by the receiver
        let chunks = vec![
            SnapshotChunk {
                data: 1i32.to_le_bytes().to_vec(),
            },
            SnapshotChunk { data: payload },
        ];
        client
            .post_snapshot(tokio_stream::iter(chunks))
            .await
            .map_err(io_other)?;
        Ok(())
    }
}

fn io_other<E: std::error::Error + Send + Sync + 'static>(e: E) -> ConsensusError {
    ConsensusError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

/// Asks one running member for the cluster's current view. Used while
/// joining, before this node is part of the raft group.
pub async fn get_cluster_info(
    url: &str,
    timeout: Duration,
) -> Result<(Vec<Member>, Vec<u8>)> {
    let fut = async {
        let mut client = RaftServiceClient::connect(url.to_string())
            .await
            .map_err(|_| ConsensusError::GetClusterFail)?;
        let resp = client
            .get_cluster_info(ClusterInfoRequest {
                requester: String::new(),
            })
            .await
            .map_err(|_| ConsensusError::GetClusterFail)?
            .into_inner();

        if !resp.error.is_empty() {
            log::warn!("cluster info error from {}: {}", url, resp.error);
            return Err(ConsensusError::GetClusterFail);
        }
        let members = resp.members.iter().map(Member::from).collect();
        Ok((members, resp.chain_id))
    };

    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(ConsensusError::GetClusterTimeout),
    }
}
