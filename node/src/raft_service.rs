//! Inbound raft gRPC surface: the peer message stream, the snapshot
//! stream, and the cluster discovery RPC used by joining nodes.

use crate::pb::raft_service_server::RaftService;
use crate::pb::{
    ClusterInfoRequest, ClusterInfoResponse, MemberAttr, PostDataRequest, PostDataResponse,
    SnapshotChunk, SnapshotResponse,
};
use crate::raft::RaftEvent;
use crate::server;
use protobuf::Message as PbMessage;
use raft::eraftpb::{Message as RaftMessage, MessageType};
use tonic::Streaming;

/// Size of the marker frame opening a snapshot stream.
const SNAPSHOT_MARKER_LEN: usize = 4;

#[derive(Debug, Default)]
pub struct RaftServiceSVC {}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    /// Receives the peer's message stream and forwards each parsed message
    /// into the raft event loop. Messages from durably removed members are
    /// rejected so a zombie peer cannot disturb the cluster.
    async fn post_data(
        &self,
        request: tonic::Request<Streaming<PostDataRequest>>,
    ) -> Result<tonic::Response<PostDataResponse>, tonic::Status> {
        let mut stream = request.into_inner();
        while let Some(req) = stream.message().await? {
            let message = match RaftMessage::parse_from_bytes(req.data.as_slice()) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("raft parse error: {}", e);
                    continue;
                }
            };

            let (events, removed) = {
                let server = server::instance().lock().await;
                (
                    server.raft_events(),
                    server.cluster().is_id_removed(message.from),
                )
            };
            if removed {
                return Err(tonic::Status::permission_denied(
                    "sender was removed from the cluster",
                ));
            }

            if let Err(e) = events.send(RaftEvent::Message(message)).await {
                log::warn!("raft send error: {}", e);
                continue;
            }
        }
        Ok(tonic::Response::new(PostDataResponse::default()))
    }

    /// Receives a streamed snapshot: a marker frame followed by the
    /// serialized snapshot message. The reassembled message is stepped
    /// into the raft node like any other.
    async fn post_snapshot(
        &self,
        request: tonic::Request<Streaming<SnapshotChunk>>,
    ) -> Result<tonic::Response<SnapshotResponse>, tonic::Status> {
        let mut stream = request.into_inner();

        let mut payload: Vec<u8> = Vec::new();
        let mut seen_marker = false;
        while let Some(chunk) = stream.message().await? {
            if !seen_marker {
                if chunk.data.len() != SNAPSHOT_MARKER_LEN {
                    return Err(tonic::Status::invalid_argument("bad snapshot marker"));
                }
                seen_marker = true;
                continue;
            }
            payload.extend_from_slice(&chunk.data);
        }

        let message = RaftMessage::parse_from_bytes(&payload)
            .map_err(|e| tonic::Status::invalid_argument(format!("bad snapshot message: {}", e)))?;
        if message.get_msg_type() != MessageType::MsgSnapshot {
            return Err(tonic::Status::invalid_argument(
                "stream does not carry a snapshot message",
            ));
        }
        log::info!(
            "received streamed snapshot from {:#x}: {}",
            message.from,
            crate::raft::snap_to_string(message.get_snapshot())
        );

        let events = server::instance().lock().await.raft_events();
        events
            .send(RaftEvent::Message(message))
            .await
            .map_err(|_| tonic::Status::unavailable("raft loop stopped"))?;

        Ok(tonic::Response::new(SnapshotResponse::default()))
    }

    /// Answers a joining node with the member set and chain id.
    async fn get_cluster_info(
        &self,
        _request: tonic::Request<ClusterInfoRequest>,
    ) -> Result<tonic::Response<ClusterInfoResponse>, tonic::Status> {
        let cluster = server::instance().lock().await.cluster();

        let mut resp = ClusterInfoResponse::default();
        if !cluster.is_ready() {
            resp.error = "cluster is not ready".to_string();
        } else {
            resp.members = cluster
                .members()
                .iter()
                .map(MemberAttr::from)
                .collect();
            resp.chain_id = cluster.chain_id().to_vec();
        }
        Ok(tonic::Response::new(resp))
    }
}
