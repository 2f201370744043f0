//! Records exchanged with a checkpoint store.

use chrono::{DateTime, Utc};
use ftpool_id::{Incarnation, NodeUrl, SequenceNumber, UnitId};
use serde::{Deserialize, Serialize};

/// Opaque, versioned capture of a unit's state.
///
/// The version belongs to the unit's state format. A unit that cannot read
/// a version refuses to restore from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub bytes: Vec<u8>,
}

impl StateSnapshot {
    pub fn new(version: u32, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            bytes: bytes.into(),
        }
    }
}

/// Fault-tolerance metadata piggybacked on every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FtTag {
    /// Sequence of the sender's latest checkpoint when the message left.
    pub checkpoint_seq: SequenceNumber,
    /// Incarnation of the sender.
    pub incarnation: Incarnation,
}

/// A request sent from one unit to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Sender-local identifier, assigned at send time.
    pub id: u64,
    pub sender: UnitId,
    pub target: UnitId,
    pub method: String,
    pub payload: Vec<u8>,
    pub tag: FtTag,
}

impl Request {
    pub fn new(
        sender: UnitId,
        target: UnitId,
        method: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: 0,
            sender,
            target,
            method: method.into(),
            payload: payload.into(),
            tag: FtTag::default(),
        }
    }
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// `id` of the request being answered.
    pub request_id: u64,
    pub sender: UnitId,
    pub target: UnitId,
    pub payload: Vec<u8>,
    pub tag: FtTag,
}

impl Reply {
    /// Builds the reply to `request`, addressed back to its sender.
    pub fn to(request: &Request, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id: request.id,
            sender: request.target,
            target: request.sender,
            payload: payload.into(),
            tag: FtTag::default(),
        }
    }
}

/// A message recorded in a unit's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoggedMessage {
    Request(Request),
    Reply(Reply),
}

impl LoggedMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            LoggedMessage::Request(_) => "request",
            LoggedMessage::Reply(_) => "reply",
        }
    }
}

/// One entry of a unit's message log, bound to the checkpoint it follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub checkpoint_seq: SequenceNumber,
    pub message: LoggedMessage,
}

/// Protocol bookkeeping saved next to the unit state.
///
/// Restoring it lets a restarted unit continue numbering its requests and
/// work out which of its outstanding requests still need an answer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointInfo {
    /// Next identifier the unit will give an outgoing request.
    pub next_request_id: u64,
    /// Requests the unit has served since it first started.
    pub served_requests: u64,
    /// Outgoing requests still waiting for a reply.
    pub awaiting_reply: Vec<Request>,
    /// Node the unit ran on when the checkpoint was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<NodeUrl>,
}

/// A snapshot of one unit at one point of its execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub unit_id: UnitId,
    pub seq: SequenceNumber,
    /// Incarnation that produced the checkpoint.
    pub incarnation: Incarnation,
    pub state: StateSnapshot,
    pub info: CheckpointInfo,
    pub taken_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        unit_id: UnitId,
        seq: SequenceNumber,
        incarnation: Incarnation,
        state: StateSnapshot,
        info: CheckpointInfo,
    ) -> Self {
        Self {
            unit_id,
            seq,
            incarnation,
            state,
            info,
            taken_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_addresses_sender() {
        let a = UnitId::new();
        let b = UnitId::new();
        let mut req = Request::new(a, b, "compute", b"x".to_vec());
        req.id = 7;

        let reply = Reply::to(&req, b"y".to_vec());
        assert_eq!(reply.request_id, 7);
        assert_eq!(reply.sender, b);
        assert_eq!(reply.target, a);
    }

    #[test]
    fn test_logged_message_tagged_json() {
        let req = Request::new(UnitId::new(), UnitId::new(), "m", Vec::new());
        let json = serde_json::to_value(LoggedMessage::Request(req)).unwrap();
        assert_eq!(json["kind"], "request");
        assert_eq!(json["method"], "m");
    }
}
