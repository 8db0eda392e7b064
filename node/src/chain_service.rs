//! Application gRPC surface: membership administration, consensus status
//! and chain queries.

use crate::chain::ChainWal;
use crate::pb::chain_service_server::ChainService;
use crate::pb::{
    BestBlockRequest, BestBlockResponse, ConsensusInfoRequest, ConsensusInfoResponse,
    MemberAttr, MembershipChangeRequest, MembershipChangeResponse,
};
use crate::server;

#[derive(Debug, Default)]
pub struct ChainServiceSVC {}

#[tonic::async_trait]
impl ChainService for ChainServiceSVC {
    /// Proposes a membership change. Only the leader accepts; everyone
    /// else reports why so the caller can redirect.
    async fn change_membership(
        &self,
        request: tonic::Request<MembershipChangeRequest>,
    ) -> Result<tonic::Response<MembershipChangeResponse>, tonic::Status> {
        let req = request.into_inner();
        let rs = server::instance().lock().await.raft_server();

        let mut resp = MembershipChangeResponse::default();
        match rs.conf_change(&req).await {
            Ok(member) => {
                log::info!("membership changed: {}", member.to_string_short());
                resp.member = Some(MemberAttr::from(&member));
            }
            Err(e) => {
                log::warn!("failed to change membership: {}", e);
                resp.error = e.to_string();
            }
        }
        Ok(tonic::Response::new(resp))
    }

    async fn get_consensus_info(
        &self,
        _request: tonic::Request<ConsensusInfoRequest>,
    ) -> Result<tonic::Response<ConsensusInfoResponse>, tonic::Status> {
        let rs = server::instance().lock().await.raft_server();
        Ok(tonic::Response::new(ConsensusInfoResponse {
            info: rs.consensus_info(),
        }))
    }

    async fn get_best_block(
        &self,
        _request: tonic::Request<BestBlockRequest>,
    ) -> Result<tonic::Response<BestBlockResponse>, tonic::Status> {
        let chain = server::instance().lock().await.chain();
        Ok(tonic::Response::new(BestBlockResponse {
            block: chain.get_best_block(),
        }))
    }
}
