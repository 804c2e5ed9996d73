//! Binary protocol for session membership and event streaming.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬─────────────┬────────────┬──────────┬──────────┐
//! │ msg_type │ endpoint_id │ session_id │ sequence │ payload  │
//! │ 1 byte   │ 16 bytes    │ 16 bytes   │ varint   │ variable │
//! └──────────┴─────────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! The meaning of `sequence` depends on `msg_type` (checkpoint on join,
//! assigned number on ack, event number on replay/live delivery).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{
    EventKind, EventPayload, PackageRef, SequenceNumber, SessionEvent, SessionFlags,
};

/// Message types for the session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks to join; `sequence` carries its checkpoint
    JoinRequest = 1,
    /// Server accepted the join; `sequence` carries the tail at join time
    JoinAccepted = 2,
    /// Server refused the join
    JoinRejected = 3,
    /// Client submits a new (unsequenced) event
    SubmitEvent = 4,
    /// Server assigned a sequence number to the sender's own submission
    SubmitAck = 5,
    /// Server refused a submission
    SubmitRejected = 6,
    /// Historical event delivered during replay
    ReplayEvent = 7,
    /// Replay reached the tail captured at join time
    ReplayComplete = 8,
    /// Live broadcast event
    Event = 9,
    /// Liveness ping; `sequence` carries the last applied number
    Heartbeat = 10,
    /// Liveness reply; `sequence` carries the session tail
    HeartbeatAck = 11,
    /// Endpoint leaves the session
    Leave = 12,
    /// Server lost consistency; client must reconnect and replay
    ResyncRequired = 13,
    /// A historical event could not be read; `sequence` is skipped
    ReplaySkipped = 14,
}

/// Payload of `JoinRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub display_name: String,
    pub role: String,
}

/// Payload of `JoinAccepted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAccepted {
    /// First sequence number the replay stream will deliver
    pub replay_from: SequenceNumber,
    pub flags: SessionFlags,
}

/// Payload of `SubmitEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: Uuid,
    pub kind: EventKind,
    pub package_name: Option<String>,
    pub payload: EventPayload,
}

/// Payload of `SubmitAck`: what the originator needs to rebuild its own event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub submission_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub package: Option<PackageRef>,
}

/// Payload of `SubmitRejected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRejected {
    pub submission_id: Uuid,
    pub reason: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub msg_type: MessageType,
    pub endpoint_id: Uuid,
    pub session_id: Uuid,
    pub sequence: SequenceNumber,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

impl SessionMessage {
    fn bare(msg_type: MessageType, endpoint_id: Uuid, session_id: Uuid, sequence: SequenceNumber) -> Self {
        Self {
            msg_type,
            endpoint_id,
            session_id,
            sequence,
            payload: Vec::new(),
        }
    }

    /// Create a join request carrying the client's checkpoint.
    pub fn join_request(
        endpoint_id: Uuid,
        session_id: Uuid,
        last_applied: SequenceNumber,
        request: &JoinRequest,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(request)?,
            ..Self::bare(MessageType::JoinRequest, endpoint_id, session_id, last_applied)
        })
    }

    pub fn join_accepted(
        endpoint_id: Uuid,
        session_id: Uuid,
        tail: SequenceNumber,
        accepted: &JoinAccepted,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(accepted)?,
            ..Self::bare(MessageType::JoinAccepted, endpoint_id, session_id, tail)
        })
    }

    pub fn join_rejected(endpoint_id: Uuid, session_id: Uuid, reason: &str) -> Self {
        Self {
            payload: reason.as_bytes().to_vec(),
            ..Self::bare(MessageType::JoinRejected, endpoint_id, session_id, 0)
        }
    }

    pub fn submit(
        endpoint_id: Uuid,
        session_id: Uuid,
        submission: &Submission,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(submission)?,
            ..Self::bare(MessageType::SubmitEvent, endpoint_id, session_id, 0)
        })
    }

    pub fn submit_ack(
        endpoint_id: Uuid,
        session_id: Uuid,
        sequence: SequenceNumber,
        ack: &SubmitAck,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(ack)?,
            ..Self::bare(MessageType::SubmitAck, endpoint_id, session_id, sequence)
        })
    }

    pub fn submit_rejected(
        endpoint_id: Uuid,
        session_id: Uuid,
        rejected: &SubmitRejected,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(rejected)?,
            ..Self::bare(MessageType::SubmitRejected, endpoint_id, session_id, 0)
        })
    }

    /// Historical event for a joining endpoint.
    pub fn replay_event(
        endpoint_id: Uuid,
        session_id: Uuid,
        event: &SessionEvent,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(event)?,
            ..Self::bare(MessageType::ReplayEvent, endpoint_id, session_id, event.sequence)
        })
    }

    pub fn replay_complete(endpoint_id: Uuid, session_id: Uuid, through: SequenceNumber) -> Self {
        Self::bare(MessageType::ReplayComplete, endpoint_id, session_id, through)
    }

    /// Live broadcast event.
    pub fn event(
        endpoint_id: Uuid,
        session_id: Uuid,
        event: &SessionEvent,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(event)?,
            ..Self::bare(MessageType::Event, endpoint_id, session_id, event.sequence)
        })
    }

    pub fn heartbeat(endpoint_id: Uuid, session_id: Uuid, last_applied: SequenceNumber) -> Self {
        Self::bare(MessageType::Heartbeat, endpoint_id, session_id, last_applied)
    }

    pub fn heartbeat_ack(endpoint_id: Uuid, session_id: Uuid, tail: SequenceNumber) -> Self {
        Self::bare(MessageType::HeartbeatAck, endpoint_id, session_id, tail)
    }

    pub fn leave(endpoint_id: Uuid, session_id: Uuid) -> Self {
        Self::bare(MessageType::Leave, endpoint_id, session_id, 0)
    }

    pub fn resync_required(endpoint_id: Uuid, session_id: Uuid, tail: SequenceNumber, reason: &str) -> Self {
        Self {
            payload: reason.as_bytes().to_vec(),
            ..Self::bare(MessageType::ResyncRequired, endpoint_id, session_id, tail)
        }
    }

    /// Replay could not read `sequence`; the client counts it as consumed.
    pub fn replay_skipped(endpoint_id: Uuid, session_id: Uuid, sequence: SequenceNumber, reason: &str) -> Self {
        Self {
            payload: reason.as_bytes().to_vec(),
            ..Self::bare(MessageType::ReplaySkipped, endpoint_id, session_id, sequence)
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    fn parse<T: DeserializeOwned>(&self, expected: &[MessageType]) -> Result<T, ProtocolError> {
        if !expected.contains(&self.msg_type) {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(value)
    }

    pub fn join_request_payload(&self) -> Result<JoinRequest, ProtocolError> {
        self.parse(&[MessageType::JoinRequest])
    }

    pub fn join_accepted_payload(&self) -> Result<JoinAccepted, ProtocolError> {
        self.parse(&[MessageType::JoinAccepted])
    }

    pub fn submission(&self) -> Result<Submission, ProtocolError> {
        self.parse(&[MessageType::SubmitEvent])
    }

    pub fn submit_ack_payload(&self) -> Result<SubmitAck, ProtocolError> {
        self.parse(&[MessageType::SubmitAck])
    }

    pub fn submit_rejected_payload(&self) -> Result<SubmitRejected, ProtocolError> {
        self.parse(&[MessageType::SubmitRejected])
    }

    /// Parse the event carried by `ReplayEvent` or `Event`.
    pub fn session_event(&self) -> Result<SessionEvent, ProtocolError> {
        self.parse(&[MessageType::ReplayEvent, MessageType::Event])
    }

    /// Reason text of `JoinRejected` / `ResyncRequired` / `ReplaySkipped`.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type: {0:?}")]
    InvalidMessageType(MessageType),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
