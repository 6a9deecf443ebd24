use crate::common::{HybridTime, OpId, ReplicationError};
use crate::grpc::{OpIdPb, OperationType, ReplicateMsg, WriteRequestPb};
use bytes::Bytes;
use prost::Message;
use std::convert::TryFrom;
use std::fmt;

/// Identifies the client that issued a write, for de-duplicating its retries.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(Bytes);

impl ClientId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        ClientId(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteRequest {
    pub client_id: ClientId,
    pub request_id: i64,
    /// Lowest request id the client still waits on. Everything below has a known outcome.
    pub min_running_request_id: i64,
    pub write_batch: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    NoOp,
    Write(WriteRequest),
    ChangeConfig(Bytes),
}

/// LogRecord is one replicated operation.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub op_id: OpId,
    pub hybrid_time: HybridTime,
    /// What the writer believed was committed when it appended this record.
    pub committed_op_id: Option<OpId>,
    pub payload: Payload,
}

impl LogRecord {
    pub fn new(op_id: OpId, hybrid_time: HybridTime, payload: Payload) -> Self {
        LogRecord {
            op_id,
            hybrid_time,
            committed_op_id: None,
            payload,
        }
    }

    pub fn write_request(&self) -> Option<&WriteRequest> {
        match &self.payload {
            Payload::Write(request) => Some(request),
            _ => None,
        }
    }

    pub(crate) fn to_pb(&self) -> ReplicateMsg {
        let (op_type, write_request, payload) = match &self.payload {
            Payload::NoOp => (OperationType::NoOp, None, Vec::new()),
            Payload::Write(request) => (
                OperationType::WriteOp,
                Some(WriteRequestPb {
                    client_id: request.client_id.as_bytes().to_vec(),
                    request_id: request.request_id,
                    min_running_request_id: request.min_running_request_id,
                    write_batch: request.write_batch.to_vec(),
                }),
                Vec::new(),
            ),
            Payload::ChangeConfig(body) => (OperationType::ChangeConfigOp, None, body.to_vec()),
        };

        ReplicateMsg {
            id: Some(OpIdPb::from(self.op_id)),
            op_type: op_type as i32,
            hybrid_time: self.hybrid_time.as_u64(),
            committed_op_id: self.committed_op_id.map(OpIdPb::from),
            write_request,
            payload,
        }
    }

    /// Size this record occupies inside a replication request.
    pub(crate) fn serialized_size(&self) -> usize {
        let len = self.to_pb().encoded_len();
        len + prost::length_delimiter_len(len) + 1
    }
}

impl TryFrom<ReplicateMsg> for LogRecord {
    type Error = ReplicationError;

    fn try_from(msg: ReplicateMsg) -> Result<Self, Self::Error> {
        let op_id = match &msg.id {
            Some(id) => OpId::from(id),
            None => return Err(ReplicationError::Corruption("Replicate message without op id".to_string())),
        };
        let payload = match OperationType::from_i32(msg.op_type) {
            Some(OperationType::NoOp) => Payload::NoOp,
            Some(OperationType::WriteOp) => {
                let request = msg.write_request.ok_or_else(|| {
                    ReplicationError::Corruption(format!("Write op {} without write request", op_id))
                })?;
                Payload::Write(WriteRequest {
                    client_id: ClientId::new(request.client_id),
                    request_id: request.request_id,
                    min_running_request_id: request.min_running_request_id,
                    write_batch: Bytes::from(request.write_batch),
                })
            }
            Some(OperationType::ChangeConfigOp) => Payload::ChangeConfig(Bytes::from(msg.payload)),
            _ => {
                return Err(ReplicationError::Corruption(format!(
                    "Unknown operation type {} for op {}",
                    msg.op_type, op_id
                )))
            }
        };

        Ok(LogRecord {
            op_id,
            hybrid_time: HybridTime::from_u64(msg.hybrid_time),
            committed_op_id: msg.committed_op_id.as_ref().map(OpId::from),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_record_survives_protobuf() {
        let mut record = LogRecord::new(
            OpId::new(3, 17),
            HybridTime::from_micros(42),
            Payload::Write(WriteRequest {
                client_id: ClientId::new("client-a"),
                request_id: 9,
                min_running_request_id: 4,
                write_batch: Bytes::from_static(b"k=v"),
            }),
        );
        record.committed_op_id = Some(OpId::new(3, 15));

        let decoded = LogRecord::try_from(record.to_pb()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.write_request().unwrap().request_id, 9);
    }

    #[test]
    fn missing_op_id_is_corruption() {
        let mut pb = LogRecord::new(OpId::new(1, 1), HybridTime::MIN, Payload::NoOp).to_pb();
        pb.id = None;
        assert!(matches!(
            LogRecord::try_from(pb),
            Err(ReplicationError::Corruption(_))
        ));
    }
}
