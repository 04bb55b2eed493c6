//! Wire messages exchanged between gateways, the broker, and worker nodes.
//!
//! Payloads travel through the broker as opaque bytes; only gateways and
//! workers decode them into these structures.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::registry::{ClassroomUnit, UnitKind};

/// Opaque address of a gateway connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientAddress(pub String);

impl ClientAddress {
    /// A fresh random address.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ClientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque address of a worker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerAddress(pub String);

impl WorkerAddress {
    /// Address of handler slot `slot` on node `node`.
    #[must_use]
    pub fn slot(node: &str, slot: usize) -> Self {
        Self(format!("{node}/{slot}"))
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing frame `[clientAddress][correlationId][payload]`.
///
/// The broker never looks inside `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Where the reply goes.
    pub client: ClientAddress,
    /// Matches a reply to its request.
    pub correlation_id: String,
    /// Encoded request or reply.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an envelope.
    pub fn new(client: ClientAddress, correlation_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            client,
            correlation_id: correlation_id.into(),
            payload,
        }
    }

    /// Same routing, different payload.
    #[must_use]
    pub fn reply_with(&self, payload: Vec<u8>) -> Self {
        Self {
            client: self.client.clone(),
            correlation_id: self.correlation_id.clone(),
            payload,
        }
    }
}

/// Request sent by a faculty gateway.
///
/// Counts are signed on the wire so that negative values reach validation
/// instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    /// Requesting faculty.
    pub faculty: String,
    /// Requesting program.
    pub program: String,
    /// Academic semester.
    pub semester: i64,
    /// Rooms wanted.
    pub rooms: i64,
    /// Labs wanted.
    pub labs: i64,
    /// Minimum seats per unit.
    pub min_capacity: i64,
    /// When the program issued the request (epoch ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<u64>,
}

impl AllocationRequest {
    /// Build a request.
    pub fn new(
        faculty: impl Into<String>,
        program: impl Into<String>,
        semester: i64,
        rooms: i64,
        labs: i64,
        min_capacity: i64,
    ) -> Self {
        Self {
            faculty: faculty.into(),
            program: program.into(),
            semester,
            rooms,
            labs,
            min_capacity,
            requested_at: None,
        }
    }

    /// Encode as a JSON payload.
    ///
    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns the decoder error for malformed input.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(value: &bool) -> bool {
    !*value
}

/// Outcome of an allocation. A shortfall is a normal outcome flagged by
/// `unavailable`, with nothing reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResponse {
    /// Echoed faculty.
    pub faculty: String,
    /// Echoed program.
    pub program: String,
    /// Echoed semester.
    pub semester: i64,
    /// Assigned rooms in ascending id order.
    pub room_ids: Vec<String>,
    /// Assigned labs: native labs first, then converted rooms.
    pub lab_ids: Vec<String>,
    /// Conversion or shortfall explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    /// Set when the request could not be met in full.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unavailable: bool,
}

/// Category of a terminal failure reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The request was malformed or named an unknown faculty/program.
    Validation,
    /// The request could not be delivered or answered in time.
    Transport,
    /// The request lost its worker twice.
    Eviction,
    /// The broker is draining.
    Shutdown,
    /// The pending queue is full.
    Overload,
    /// The worker failed while handling the request.
    Internal,
}

/// Failure reply. The `error` field matches what legacy clients look for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Human-readable reason.
    pub error: String,
    /// Failure category.
    pub kind: FailureKind,
}

impl ErrorReply {
    /// Build an error reply.
    pub fn new(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind,
        }
    }

    /// Encode as a JSON payload. Falls back to a fixed literal if encoding fails.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self)
            .unwrap_or_else(|_| br#"{"error":"unencodable error","kind":"internal"}"#.to_vec())
    }
}

/// Any reply a gateway can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    /// Allocation outcome (success or shortfall).
    Allocation(AllocationResponse),
    /// Terminal failure.
    Error(ErrorReply),
}

impl Reply {
    /// Decode a JSON reply payload.
    ///
    /// # Errors
    ///
    /// Returns the decoder error for a payload matching neither shape.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// The allocation outcome, if this is one.
    #[must_use]
    pub const fn allocation(&self) -> Option<&AllocationResponse> {
        match self {
            Self::Allocation(response) => Some(response),
            Self::Error(_) => None,
        }
    }
}

/// Role of a worker node in its redundant pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Serving requests and shipping state.
    Active,
    /// Mirroring state and watching heartbeats.
    Standby,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("ACTIVE"),
            Self::Standby => f.write_str("STANDBY"),
        }
    }
}

/// Liveness beacon from an ACTIVE node to its peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Sending node id.
    pub node: String,
    /// Sender role.
    pub role: Role,
    /// Sender generation.
    pub generation: u64,
    /// Send time (epoch ms).
    pub timestamp: u64,
}

/// Registry mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaOp {
    /// Units reserved for a faculty/program.
    Assign,
    /// Units returned to AVAILABLE.
    Release,
    /// Rooms converted to labs.
    Convert,
    /// Units returned to baseline; an empty id list means all of them.
    Reset,
}

/// Resulting fields carried by a delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaFields {
    /// New kind (CONVERT).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<UnitKind>,
    /// Holding faculty (ASSIGN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faculty: Option<String>,
    /// Holding program (ASSIGN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    /// Request time (ASSIGN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<u64>,
    /// Commit time (ASSIGN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<u64>,
    /// Correlation id of the request that caused this ASSIGN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Reply recorded for that correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<AllocationResponse>,
}

/// One committed registry mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    /// Mutation kind.
    pub op: DeltaOp,
    /// Affected unit ids.
    pub unit_ids: Vec<String>,
    /// Resulting fields.
    #[serde(default)]
    pub fields: DeltaFields,
}

impl StateDelta {
    /// Delta with no extra fields.
    #[must_use]
    pub fn new(op: DeltaOp, unit_ids: Vec<String>) -> Self {
        Self {
            op,
            unit_ids,
            fields: DeltaFields::default(),
        }
    }
}

/// Message on the ACTIVE → STANDBY replication channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationMessage {
    /// A single committed mutation.
    Delta {
        /// Generation of the shipping node.
        generation: u64,
        /// Position in the delta stream.
        seq: u64,
        /// The mutation.
        delta: StateDelta,
    },
    /// The full registry as of `seq`.
    Snapshot {
        /// Generation of the shipping node.
        generation: u64,
        /// Last delta included.
        seq: u64,
        /// Every unit in ascending id order.
        units: Vec<ClassroomUnit>,
    },
}

impl ReplicationMessage {
    /// Generation of the sender.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        match self {
            Self::Delta { generation, .. } | Self::Snapshot { generation, .. } => *generation,
        }
    }

    /// Stream position.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        match self {
            Self::Delta { seq, .. } | Self::Snapshot { seq, .. } => *seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_names() {
        let request = AllocationRequest::new("Engineering", "Systems", 3, 2, 1, 30);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"minCapacity\":30"));
        assert!(!json.contains("requestedAt"));
    }

    #[test]
    fn test_response_omits_optional_fields() {
        let response = AllocationResponse {
            faculty: "Engineering".into(),
            program: "Systems".into(),
            semester: 3,
            room_ids: vec!["R001".into()],
            lab_ids: vec![],
            notice: None,
            unavailable: false,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"roomIds\":[\"R001\"]"));
        assert!(!json.contains("notice"));
        assert!(!json.contains("unavailable"));
    }

    #[test]
    fn test_reply_decodes_both_shapes() {
        let error = ErrorReply::new(FailureKind::Validation, "unknown faculty");
        let reply = Reply::from_payload(&error.to_payload()).unwrap();
        assert_eq!(reply, Reply::Error(error));

        let ok = br#"{"faculty":"F","program":"P","semester":1,"roomIds":[],"labIds":["L001"]}"#;
        let reply = Reply::from_payload(ok).unwrap();
        assert_eq!(reply.allocation().unwrap().lab_ids, vec!["L001"]);
    }

    #[test]
    fn test_heartbeat_role_is_uppercase() {
        let hb = HeartbeatRecord {
            node: "primary".into(),
            role: Role::Active,
            generation: 2,
            timestamp: 5,
        };
        let json = serde_json::to_string(&hb).unwrap();
        assert!(json.contains("\"role\":\"ACTIVE\""));
    }

    #[test]
    fn test_replication_message_tagging() {
        let msg = ReplicationMessage::Delta {
            generation: 1,
            seq: 7,
            delta: StateDelta::new(DeltaOp::Reset, vec![]),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"delta\""));
        assert!(json.contains("\"op\":\"RESET\""));
        assert_eq!(msg.seq(), 7);
        assert_eq!(msg.generation(), 1);
    }
}
