//! Cluster membership registry.
//!
//! Holds the member set replicated through conf-change entries, the node's
//! own identity, and the applied position of the last membership change.
//! Shared between the raft event loop and the gRPC handlers, so all state
//! sits behind interior locks.

use crate::pb;
use crate::raft::{ConsensusError, Result};
use log::{info, warn};
use raft::eraftpb::{ConfChange, ConfChangeType, Snapshot};
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::oneshot;

/// Identity record persisted in the WAL. A node that loses its WAL cannot
/// come back under a different identity: the id is re-derived from the
/// name and must match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftIdentity {
    pub cluster_id: u64,
    pub node_id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub peer_id: String,
    #[serde(default)]
    pub pub_key: Vec<u8>,
}

impl Member {
    pub fn to_string_short(&self) -> String {
        format!("{}({:#x})@{}", self.name, self.id, self.url)
    }
}

impl From<&Member> for pb::MemberAttr {
    fn from(m: &Member) -> Self {
        pb::MemberAttr {
            id: m.id,
            name: m.name.clone(),
            url: m.url.clone(),
            peer_id: m.peer_id.clone(),
            pub_key: m.pub_key.clone(),
        }
    }
}

impl From<&pb::MemberAttr> for Member {
    fn from(a: &pb::MemberAttr) -> Self {
        Member {
            id: a.id,
            name: a.name.clone(),
            url: a.url.clone(),
            peer_id: a.peer_id.clone(),
            pub_key: a.pub_key.clone(),
        }
    }
}

/// Deterministic member id: the first 8 bytes of SHA-256(name ‖ chain_id).
pub fn derive_member_id(name: &str, chain_id: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(chain_id);
    let digest = hasher.finalize();
    let id = u64::from_be_bytes(digest[..8].try_into().unwrap());
    if id == raft::INVALID_ID {
        1
    } else {
        id
    }
}

/// Cluster-wide id derived from the chain id alone.
pub fn derive_cluster_id(chain_id: &[u8]) -> u64 {
    let digest = Sha256::digest(chain_id);
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

struct PendingChange {
    cc_id: u64,
    reply: oneshot::Sender<Result<Member>>,
}

#[derive(Default)]
struct ClusterInner {
    members: HashMap<u64, Member>,
    by_name: HashMap<String, u64>,
    removed: HashSet<u64>,
    applied_term: u64,
    applied_index: u64,
    node_id: u64,
}

pub struct Cluster {
    chain_id: Vec<u8>,
    cluster_id: u64,
    node_name: String,
    inner: RwLock<ClusterInner>,
    pending: Mutex<Option<PendingChange>>,
    next_cc_id: AtomicU64,
}

impl Cluster {
    pub fn new(chain_id: &[u8], node_name: &str) -> Self {
        Cluster {
            chain_id: chain_id.to_vec(),
            cluster_id: derive_cluster_id(chain_id),
            node_name: node_name.to_string(),
            inner: RwLock::new(ClusterInner::default()),
            pending: Mutex::new(None),
            next_cc_id: AtomicU64::new(1),
        }
    }

    pub fn chain_id(&self) -> &[u8] {
        &self.chain_id
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn node_id(&self) -> u64 {
        self.inner.read().unwrap().node_id
    }

    /// Assigns this node's id from its name. Used at bootstrap and after a
    /// join merge; a restart recovers the same value from the WAL instead.
    pub fn set_this_node_id(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(ConsensusError::InvalidRaftIdentity);
        }
        let id = derive_member_id(&self.node_name, &self.chain_id);
        self.inner.write().unwrap().node_id = id;
        Ok(())
    }

    pub fn identity(&self) -> RaftIdentity {
        RaftIdentity {
            cluster_id: self.cluster_id,
            node_id: self.node_id(),
            name: self.node_name.clone(),
        }
    }

    pub fn recover_identity(&self, identity: &RaftIdentity) -> Result<()> {
        if identity.name != self.node_name
            || identity.cluster_id != self.cluster_id
            || identity.node_id != derive_member_id(&self.node_name, &self.chain_id)
        {
            warn!(
                "recovered identity {:?} does not match this node (name={})",
                identity, self.node_name
            );
            return Err(ConsensusError::InvalidRaftIdentity);
        }
        self.inner.write().unwrap().node_id = identity.node_id;
        Ok(())
    }

    // ---- membership view ----

    pub fn members(&self) -> Vec<Member> {
        let inner = self.inner.read().unwrap();
        let mut members: Vec<Member> = inner.members.values().cloned().collect();
        members.sort_by_key(|m| m.id);
        members
    }

    pub fn member_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.read().unwrap().members.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn member_by_id(&self, id: u64) -> Option<Member> {
        self.inner.read().unwrap().members.get(&id).cloned()
    }

    pub fn applied(&self) -> (u64, u64) {
        let inner = self.inner.read().unwrap();
        (inner.applied_term, inner.applied_index)
    }

    pub fn is_id_removed(&self, id: u64) -> bool {
        self.inner.read().unwrap().removed.contains(&id)
    }

    pub fn is_ready(&self) -> bool {
        !self.inner.read().unwrap().members.is_empty()
    }

    /// Seeds the member set from the static peer configuration. This node
    /// must be among the declared peers.
    pub fn bootstrap_from_config(&self, peers: &[(String, String)]) -> Result<()> {
        let mut found_self = false;
        let mut inner = self.inner.write().unwrap();
        for (name, url) in peers {
            let member = Member {
                id: derive_member_id(name, &self.chain_id),
                name: name.clone(),
                url: url.clone(),
                peer_id: String::new(),
                pub_key: Vec::new(),
            };
            if member.name == self.node_name {
                found_self = true;
            }
            inner.by_name.insert(member.name.clone(), member.id);
            inner.members.insert(member.id, member);
        }
        drop(inner);

        if !found_self {
            return Err(ConsensusError::ClusterNotReady);
        }
        Ok(())
    }

    pub fn reset_members(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.members.clear();
        inner.by_name.clear();
        inner.removed.clear();
    }

    /// Rebuilds the member set from a snapshot payload.
    pub fn recover(&self, snap: &Snapshot) -> Result<()> {
        let data = super::SnapshotData::decode(snap.get_data())?;

        let mut inner = self.inner.write().unwrap();
        inner.members.clear();
        inner.by_name.clear();
        for member in data.members {
            inner.by_name.insert(member.name.clone(), member.id);
            inner.members.insert(member.id, member);
        }
        inner.applied_term = snap.get_metadata().term;
        inner.applied_index = snap.get_metadata().index;
        info!(
            "cluster recovered from snapshot: {} members at index {}",
            inner.members.len(),
            inner.applied_index
        );
        Ok(())
    }

    // ---- membership mutation (raft loop only) ----

    pub fn add_member(&self, member: Member, term: u64, index: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.members.contains_key(&member.id) {
            return Err(ConsensusError::CCAlreadyAdded);
        }
        inner.by_name.insert(member.name.clone(), member.id);
        inner.removed.remove(&member.id);
        inner.members.insert(member.id, member);
        Self::advance_applied(&mut inner, term, index);
        Ok(())
    }

    pub fn remove_member(&self, id: u64, term: u64, index: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let member = inner
            .members
            .remove(&id)
            .ok_or(ConsensusError::CCNoMemberToRemove)?;
        inner.by_name.remove(&member.name);
        inner.removed.insert(id);
        Self::advance_applied(&mut inner, term, index);
        Ok(())
    }

    fn advance_applied(inner: &mut ClusterInner, term: u64, index: u64) {
        // the applied position never goes backwards
        if index > inner.applied_index {
            inner.applied_index = index;
        }
        if term > inner.applied_term {
            inner.applied_term = term;
        }
    }

    /// True when a conf-change entry at this index has already taken
    /// effect on the member set. Re-applying is a no-op.
    pub fn already_applied(&self, index: u64) -> bool {
        self.inner.read().unwrap().applied_index >= index
    }

    // ---- validation ----

    pub fn validate_change_membership(
        &self,
        change_type: ConfChangeType,
        member: &Member,
    ) -> Result<()> {
        let inner = self.inner.read().unwrap();
        match change_type {
            ConfChangeType::AddNode => {
                if inner.members.contains_key(&member.id) {
                    return Err(ConsensusError::CCAlreadyAdded);
                }
                if inner.by_name.contains_key(&member.name) {
                    return Err(ConsensusError::CCAlreadyAdded);
                }
                let uri = member
                    .url
                    .parse::<hyper::Uri>()
                    .map_err(|_| ConsensusError::InvalidMember(member.url.clone()))?;
                if uri.scheme().is_none() || uri.authority().is_none() {
                    return Err(ConsensusError::InvalidMember(member.url.clone()));
                }
            }
            ConfChangeType::RemoveNode => {
                if !inner.members.contains_key(&member.id) {
                    return Err(ConsensusError::CCNoMemberToRemove);
                }
                if inner.members.len() <= 1 {
                    return Err(ConsensusError::InvalidMember(
                        "cannot remove the last member".to_string(),
                    ));
                }
            }
            _ => {
                return Err(ConsensusError::InvalidMember(format!(
                    "unsupported change type {:?}",
                    change_type
                )));
            }
        }
        Ok(())
    }

    /// Join-time check against the running cluster's view, followed by the
    /// merge that replaces the locally declared members.
    pub fn validate_and_merge_existing_cluster(
        &self,
        remote_members: Vec<Member>,
        remote_chain_id: &[u8],
    ) -> Result<()> {
        if remote_chain_id != self.chain_id.as_slice() {
            return Err(ConsensusError::InvalidMember(
                "chain id differs from the existing cluster".to_string(),
            ));
        }

        let local = self.members();
        for mine in &local {
            if mine.name == self.node_name {
                continue;
            }
            let matched = remote_members
                .iter()
                .any(|m| m.name == mine.name && m.url == mine.url);
            if !matched {
                return Err(ConsensusError::InvalidMember(format!(
                    "declared peer {} is not part of the existing cluster",
                    mine.to_string_short()
                )));
            }
        }

        if remote_members.iter().any(|m| m.name == self.node_name) {
            return Err(ConsensusError::CCAlreadyAdded);
        }

        let mut inner = self.inner.write().unwrap();
        inner.members.clear();
        inner.by_name.clear();
        for member in remote_members {
            inner.by_name.insert(member.name.clone(), member.id);
            inner.members.insert(member.id, member);
        }
        inner.node_id = derive_member_id(&self.node_name, &self.chain_id);
        Ok(())
    }

    // ---- conf change proposals ----

    /// Builds the conf change for a membership request and registers the
    /// reply slot the raft loop answers once the entry commits (or fails
    /// validation). One change may be in flight at a time.
    pub fn prepare_membership_change(
        &self,
        req: &pb::MembershipChangeRequest,
    ) -> Result<(ConfChange, Member, oneshot::Receiver<Result<Member>>)> {
        let (change_type, member) = match req.r#type() {
            pb::membership_change_request::Type::Add => {
                let member = Member {
                    id: derive_member_id(&req.name, &self.chain_id),
                    name: req.name.clone(),
                    url: req.url.clone(),
                    peer_id: req.peer_id.clone(),
                    pub_key: Vec::new(),
                };
                (ConfChangeType::AddNode, member)
            }
            pb::membership_change_request::Type::Remove => {
                let id = if req.id != 0 {
                    req.id
                } else {
                    derive_member_id(&req.name, &self.chain_id)
                };
                let member = self
                    .member_by_id(id)
                    .ok_or(ConsensusError::CCNoMemberToRemove)?;
                (ConfChangeType::RemoveNode, member)
            }
        };

        self.validate_change_membership(change_type, &member)?;

        let mut pending = self.pending.lock().unwrap();
        if pending.is_some() {
            return Err(ConsensusError::CCInProgress);
        }

        let mut cc = ConfChange::default();
        cc.id = self.next_cc_id.fetch_add(1, Ordering::Relaxed);
        cc.set_change_type(change_type);
        cc.node_id = member.id;
        cc.context = bytes::Bytes::from(
            serde_json::to_vec(&member).map_err(|_| ConsensusError::Unmarshal)?,
        );

        let (tx, rx) = oneshot::channel();
        *pending = Some(PendingChange {
            cc_id: cc.id,
            reply: tx,
        });

        Ok((cc, member, rx))
    }

    /// Delivers the outcome of a conf change to the waiting proposer, if
    /// the change is the one it is waiting for.
    pub fn send_conf_change_reply(
        &self,
        cc: &ConfChange,
        member: Option<Member>,
        err: Option<ConsensusError>,
    ) {
        let mut pending = self.pending.lock().unwrap();
        let matches = pending.as_ref().map(|p| p.cc_id == cc.id).unwrap_or(false);
        if !matches {
            return;
        }
        let slot = pending.take().unwrap();
        let result = match (member, err) {
            (_, Some(e)) => Err(e),
            (Some(m), None) => Ok(m),
            (None, None) => Err(ConsensusError::InvalidMember("empty reply".to_string())),
        };
        let _ = slot.reply.send(result);
    }

    // ---- status ----

    /// JSON consensus status for operators.
    pub fn consensus_info(&self, leader: u64) -> String {
        let inner = self.inner.read().unwrap();
        let members: Vec<serde_json::Value> = {
            let mut ms: Vec<&Member> = inner.members.values().collect();
            ms.sort_by_key(|m| m.id);
            ms.iter()
                .map(|m| {
                    serde_json::json!({
                        "id": format!("{:#x}", m.id),
                        "name": m.name,
                        "url": m.url,
                        "leader": m.id == leader,
                    })
                })
                .collect()
        };
        serde_json::json!({
            "type": "raft",
            "node": self.node_name,
            "applied_term": inner.applied_term,
            "applied_index": inner.applied_index,
            "members": members,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: &[u8] = b"test-chain";

    fn member(name: &str, url: &str) -> Member {
        Member {
            id: derive_member_id(name, CHAIN),
            name: name.to_string(),
            url: url.to_string(),
            peer_id: String::new(),
            pub_key: Vec::new(),
        }
    }

    fn three_node_cluster() -> Cluster {
        let cluster = Cluster::new(CHAIN, "alpha");
        cluster
            .bootstrap_from_config(&[
                ("alpha".to_string(), "http://127.0.0.1:11001".to_string()),
                ("beta".to_string(), "http://127.0.0.1:11002".to_string()),
                ("gamma".to_string(), "http://127.0.0.1:11003".to_string()),
            ])
            .unwrap();
        cluster.set_this_node_id().unwrap();
        cluster
    }

    #[test]
    fn member_id_is_deterministic_and_nonzero() {
        let a = derive_member_id("alpha", CHAIN);
        let b = derive_member_id("alpha", CHAIN);
        assert_eq!(a, b);
        assert_ne!(a, raft::INVALID_ID);
        assert_ne!(a, derive_member_id("beta", CHAIN));
        assert_ne!(a, derive_member_id("alpha", b"other-chain"));
    }

    #[test]
    fn bootstrap_requires_self() {
        let cluster = Cluster::new(CHAIN, "delta");
        let err = cluster
            .bootstrap_from_config(&[("alpha".to_string(), "http://x:1".to_string())])
            .unwrap_err();
        assert!(matches!(err, ConsensusError::ClusterNotReady));
    }

    #[test]
    fn validation_matrix() {
        let cluster = three_node_cluster();

        // add an existing member
        let dup = member("beta", "http://127.0.0.1:11002");
        assert!(matches!(
            cluster.validate_change_membership(ConfChangeType::AddNode, &dup),
            Err(ConsensusError::CCAlreadyAdded)
        ));

        // add with a malformed url
        let bad = member("delta", "not a url");
        assert!(matches!(
            cluster.validate_change_membership(ConfChangeType::AddNode, &bad),
            Err(ConsensusError::InvalidMember(_))
        ));

        // remove an unknown member
        let unknown = member("omega", "http://127.0.0.1:11009");
        assert!(matches!(
            cluster.validate_change_membership(ConfChangeType::RemoveNode, &unknown),
            Err(ConsensusError::CCNoMemberToRemove)
        ));

        // a valid add passes
        let fresh = member("delta", "http://127.0.0.1:11004");
        cluster
            .validate_change_membership(ConfChangeType::AddNode, &fresh)
            .unwrap();
    }

    #[test]
    fn remove_never_empties_the_cluster() {
        let cluster = Cluster::new(CHAIN, "alpha");
        cluster
            .bootstrap_from_config(&[(
                "alpha".to_string(),
                "http://127.0.0.1:11001".to_string(),
            )])
            .unwrap();
        let only = member("alpha", "http://127.0.0.1:11001");
        assert!(matches!(
            cluster.validate_change_membership(ConfChangeType::RemoveNode, &only),
            Err(ConsensusError::InvalidMember(_))
        ));
    }

    #[test]
    fn applied_index_is_monotonic() {
        let cluster = three_node_cluster();
        let delta = member("delta", "http://127.0.0.1:11004");
        cluster.add_member(delta.clone(), 2, 10).unwrap();
        assert_eq!(cluster.applied(), (2, 10));
        assert!(cluster.already_applied(10));
        assert!(cluster.already_applied(3));
        assert!(!cluster.already_applied(11));

        cluster.remove_member(delta.id, 2, 12).unwrap();
        assert_eq!(cluster.applied(), (2, 12));
        assert!(cluster.is_id_removed(delta.id));
        assert!(!cluster.is_id_removed(derive_member_id("alpha", CHAIN)));
    }

    #[test]
    fn join_merge_checks() {
        let cluster = Cluster::new(CHAIN, "delta");
        cluster
            .bootstrap_from_config(&[
                ("alpha".to_string(), "http://127.0.0.1:11001".to_string()),
                ("delta".to_string(), "http://127.0.0.1:11004".to_string()),
            ])
            .unwrap();

        let remote = vec![
            member("alpha", "http://127.0.0.1:11001"),
            member("beta", "http://127.0.0.1:11002"),
        ];

        // wrong chain id
        assert!(cluster
            .validate_and_merge_existing_cluster(remote.clone(), b"other")
            .is_err());

        // remote already contains this node's name
        let mut with_self = remote.clone();
        with_self.push(member("delta", "http://127.0.0.1:11004"));
        assert!(matches!(
            cluster.validate_and_merge_existing_cluster(with_self, CHAIN),
            Err(ConsensusError::CCAlreadyAdded)
        ));

        // valid merge replaces the local view and assigns the node id
        cluster
            .validate_and_merge_existing_cluster(remote, CHAIN)
            .unwrap();
        assert_eq!(cluster.members().len(), 2);
        assert_eq!(cluster.node_id(), derive_member_id("delta", CHAIN));
    }

    #[test]
    fn conf_change_reply_matches_by_id() {
        let cluster = three_node_cluster();
        let req = pb::MembershipChangeRequest {
            r#type: pb::membership_change_request::Type::Add as i32,
            name: "delta".to_string(),
            url: "http://127.0.0.1:11004".to_string(),
            peer_id: String::new(),
            id: 0,
        };
        let (cc, member, mut rx) = cluster.prepare_membership_change(&req).unwrap();
        assert_eq!(member.id, cc.node_id);

        // a second change is rejected while one is pending
        assert!(matches!(
            cluster.prepare_membership_change(&req),
            Err(ConsensusError::CCInProgress)
        ));

        // a reply for an unrelated change is ignored
        let mut other = ConfChange::default();
        other.id = cc.id + 100;
        cluster.send_conf_change_reply(&other, None, Some(ConsensusError::CCAlreadyApplied));
        assert!(rx.try_recv().is_err());

        cluster.send_conf_change_reply(&cc, Some(member.clone()), None);
        let got = rx.try_recv().unwrap().unwrap();
        assert_eq!(got, member);
    }
}
