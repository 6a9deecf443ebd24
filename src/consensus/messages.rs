use crate::common::{op_id_or_min, HybridTime, OpId, ReplicationError, Result};
use crate::grpc;
use crate::wal::LogRecord;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemberType {
    Unknown,
    Voter,
    Observer,
    PreVoter,
    PreObserver,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftPeer {
    pub uuid: String,
    pub member_type: MemberType,
    pub last_known_addr: Option<String>,
}

impl RaftPeer {
    pub fn voter(uuid: impl Into<String>, addr: Option<String>) -> Self {
        RaftPeer {
            uuid: uuid.into(),
            member_type: MemberType::Voter,
            last_known_addr: addr,
        }
    }
}

/// The membership a leader replicates to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RaftConfig {
    pub peers: Vec<RaftPeer>,
}

impl RaftConfig {
    pub fn new(peers: Vec<RaftPeer>) -> Self {
        RaftConfig { peers }
    }

    pub fn member(&self, uuid: &str) -> Option<&RaftPeer> {
        self.peers.iter().find(|p| p.uuid == uuid)
    }

    pub fn count_voters(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.member_type == MemberType::Voter)
            .count()
    }

    pub fn is_voter(&self, uuid: &str) -> bool {
        self.member(uuid).map_or(false, |p| p.member_type == MemberType::Voter)
    }
}

/// Leader to follower replication request.
#[derive(Clone, Debug, Default)]
pub struct ConsensusRequest {
    pub tablet_id: String,
    pub caller_uuid: String,
    pub dest_uuid: String,
    pub caller_term: i64,
    pub preceding_id: OpId,
    pub committed_op_id: OpId,
    pub ops: Vec<Arc<LogRecord>>,
    /// Absent while the follower is new to this leader.
    pub leader_lease_duration_ms: Option<u64>,
    pub ht_lease_expiration: Option<u64>,
    pub propagated_hybrid_time: HybridTime,
    /// Only sent along the last batch of a catch-up.
    pub propagated_safe_time: Option<HybridTime>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConsensusErrorCode {
    Unknown,
    PrecedingEntryDidntMatch,
    InvalidTerm,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusError {
    pub code: ConsensusErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusStatus {
    pub last_received: OpId,
    pub last_received_current_leader: OpId,
    pub last_committed_idx: i64,
    pub last_applied: OpId,
    pub error: Option<ConsensusError>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TabletErrorCode {
    Unknown,
    TabletNotFound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletServerError {
    pub code: TabletErrorCode,
    pub message: String,
}

/// Follower to leader replication response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusResponse {
    pub responder_uuid: String,
    pub responder_term: Option<i64>,
    pub status: Option<ConsensusStatus>,
    pub error: Option<TabletServerError>,
    pub num_sst_files: u64,
}

impl ConsensusResponse {
    /// A successful exchange reporting `last_received`.
    pub fn success(
        responder_uuid: impl Into<String>,
        term: i64,
        last_received: OpId,
        last_committed_idx: i64,
    ) -> Self {
        ConsensusResponse {
            responder_uuid: responder_uuid.into(),
            responder_term: Some(term),
            status: Some(ConsensusStatus {
                last_received,
                last_received_current_leader: last_received,
                last_committed_idx,
                last_applied: OpId::MIN,
                error: None,
            }),
            error: None,
            num_sst_files: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteBootstrapRequest {
    pub dest_uuid: String,
    pub tablet_id: String,
    pub bootstrap_peer_uuid: String,
    pub bootstrap_peer_addr: Option<String>,
    pub caller_term: i64,
}

impl fmt::Display for ConsensusResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "responder: {}", self.responder_uuid)?;
        if let Some(term) = self.responder_term {
            write!(f, ", term: {}", term)?;
        }
        if let Some(status) = &self.status {
            write!(
                f,
                ", last received: {}, last received current leader: {}, last committed idx: {}",
                status.last_received, status.last_received_current_leader, status.last_committed_idx
            )?;
            if let Some(error) = &status.error {
                write!(f, ", consensus error: {:?} {}", error.code, error.message)?;
            }
        }
        if let Some(error) = &self.error {
            write!(f, ", tablet error: {:?} {}", error.code, error.message)?;
        }
        Ok(())
    }
}

// ------- Conversions --------

impl From<MemberType> for grpc::MemberType {
    fn from(member_type: MemberType) -> Self {
        match member_type {
            MemberType::Unknown => grpc::MemberType::UnknownMemberType,
            MemberType::Voter => grpc::MemberType::Voter,
            MemberType::Observer => grpc::MemberType::Observer,
            MemberType::PreVoter => grpc::MemberType::PreVoter,
            MemberType::PreObserver => grpc::MemberType::PreObserver,
        }
    }
}

impl From<&ConsensusRequest> for grpc::ConsensusRequestPb {
    fn from(request: &ConsensusRequest) -> Self {
        grpc::ConsensusRequestPb {
            tablet_id: request.tablet_id.clone(),
            caller_uuid: request.caller_uuid.clone(),
            dest_uuid: request.dest_uuid.clone(),
            caller_term: request.caller_term,
            preceding_id: Some(request.preceding_id.into()),
            committed_op_id: Some(request.committed_op_id.into()),
            ops: request.ops.iter().map(|r| r.to_pb()).collect(),
            leader_lease_duration_ms: request.leader_lease_duration_ms.unwrap_or(0),
            ht_lease_expiration: request.ht_lease_expiration.unwrap_or(0),
            propagated_hybrid_time: request.propagated_hybrid_time.as_u64(),
            propagated_safe_time: request.propagated_safe_time.map_or(0, |ht| ht.as_u64()),
        }
    }
}

impl TryFrom<grpc::ConsensusRequestPb> for ConsensusRequest {
    type Error = ReplicationError;

    fn try_from(pb: grpc::ConsensusRequestPb) -> Result<Self> {
        let ops = pb
            .ops
            .into_iter()
            .map(|msg| LogRecord::try_from(msg).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(ConsensusRequest {
            tablet_id: pb.tablet_id,
            caller_uuid: pb.caller_uuid,
            dest_uuid: pb.dest_uuid,
            caller_term: pb.caller_term,
            preceding_id: op_id_or_min(&pb.preceding_id),
            committed_op_id: op_id_or_min(&pb.committed_op_id),
            ops,
            leader_lease_duration_ms: non_zero(pb.leader_lease_duration_ms),
            ht_lease_expiration: non_zero(pb.ht_lease_expiration),
            propagated_hybrid_time: HybridTime::from_u64(pb.propagated_hybrid_time),
            propagated_safe_time: non_zero(pb.propagated_safe_time).map(HybridTime::from_u64),
        })
    }
}

impl TryFrom<grpc::ConsensusResponsePb> for ConsensusResponse {
    type Error = ReplicationError;

    /// A status missing its last-received ids is a broken peer, reported as `Internal`.
    fn try_from(pb: grpc::ConsensusResponsePb) -> Result<Self> {
        let status = match pb.status {
            Some(status) => {
                let last_received = status.last_received.as_ref().ok_or_else(|| missing("last_received"))?;
                let last_received_current_leader = status
                    .last_received_current_leader
                    .as_ref()
                    .ok_or_else(|| missing("last_received_current_leader"))?;
                Some(ConsensusStatus {
                    last_received: last_received.into(),
                    last_received_current_leader: last_received_current_leader.into(),
                    last_committed_idx: status.last_committed_idx,
                    last_applied: op_id_or_min(&status.last_applied),
                    error: status.error.map(|e| ConsensusError {
                        code: match grpc::ConsensusErrorCode::from_i32(e.code) {
                            Some(grpc::ConsensusErrorCode::PrecedingEntryDidntMatch) => {
                                ConsensusErrorCode::PrecedingEntryDidntMatch
                            }
                            Some(grpc::ConsensusErrorCode::InvalidTerm) => ConsensusErrorCode::InvalidTerm,
                            _ => ConsensusErrorCode::Unknown,
                        },
                        message: e.message,
                    }),
                })
            }
            None => None,
        };

        Ok(ConsensusResponse {
            responder_uuid: pb.responder_uuid,
            responder_term: pb.responder_term.map(|t| t.term),
            status,
            error: pb.error.map(|e| TabletServerError {
                code: match grpc::TabletErrorCode::from_i32(e.code) {
                    Some(grpc::TabletErrorCode::TabletNotFound) => TabletErrorCode::TabletNotFound,
                    _ => TabletErrorCode::Unknown,
                },
                message: e.message,
            }),
            num_sst_files: pb.num_sst_files,
        })
    }
}

impl From<&ConsensusResponse> for grpc::ConsensusResponsePb {
    fn from(response: &ConsensusResponse) -> Self {
        grpc::ConsensusResponsePb {
            responder_uuid: response.responder_uuid.clone(),
            responder_term: response.responder_term.map(|term| grpc::TermPb { term }),
            status: response.status.as_ref().map(|s| grpc::ConsensusStatusPb {
                last_received: Some(s.last_received.into()),
                last_received_current_leader: Some(s.last_received_current_leader.into()),
                last_committed_idx: s.last_committed_idx,
                last_applied: Some(s.last_applied.into()),
                error: s.error.as_ref().map(|e| grpc::ConsensusErrorPb {
                    code: match e.code {
                        ConsensusErrorCode::Unknown => grpc::ConsensusErrorCode::UnknownConsensusError,
                        ConsensusErrorCode::PrecedingEntryDidntMatch => {
                            grpc::ConsensusErrorCode::PrecedingEntryDidntMatch
                        }
                        ConsensusErrorCode::InvalidTerm => grpc::ConsensusErrorCode::InvalidTerm,
                    } as i32,
                    message: e.message.clone(),
                }),
            }),
            error: response.error.as_ref().map(|e| grpc::TabletServerErrorPb {
                code: match e.code {
                    TabletErrorCode::Unknown => grpc::TabletErrorCode::UnknownTabletError,
                    TabletErrorCode::TabletNotFound => grpc::TabletErrorCode::TabletNotFound,
                } as i32,
                message: e.message.clone(),
            }),
            num_sst_files: response.num_sst_files,
        }
    }
}

impl From<&RemoteBootstrapRequest> for grpc::StartRemoteBootstrapRequestPb {
    fn from(request: &RemoteBootstrapRequest) -> Self {
        grpc::StartRemoteBootstrapRequestPb {
            dest_uuid: request.dest_uuid.clone(),
            tablet_id: request.tablet_id.clone(),
            bootstrap_peer_uuid: request.bootstrap_peer_uuid.clone(),
            bootstrap_peer_addr: request.bootstrap_peer_addr.clone().unwrap_or_default(),
            caller_term: request.caller_term,
        }
    }
}

fn non_zero(value: u64) -> Option<u64> {
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

fn missing(field: &str) -> ReplicationError {
    ReplicationError::Internal(format!("Consensus response status without {}", field))
}
