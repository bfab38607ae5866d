//! WebSocket wire protocol between clients and the relay server.
//!
//! Every frame is a JSON text message tagged by `type`. Writes carry a
//! client-chosen `request_id` that the server echoes in an `ack` or `error`,
//! which is how a client learns whether a write landed.

use crate::presence::PresenceRecord;
use crate::remote::{DocFields, FeedBatch, SnapshotDocument};
use crate::shapes::{ClientId, ShapeId};
use serde::{Deserialize, Serialize};

/// Correlates a request with its acknowledgement.
pub type RequestId = u64;

/// One document of a batch write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeDoc {
    pub id: ShapeId,
    pub fields: DocFields,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter a room. Must precede everything else.
    Join { room: String, client_id: ClientId },
    SetShape {
        request_id: RequestId,
        id: ShapeId,
        fields: DocFields,
    },
    SetShapes {
        request_id: RequestId,
        docs: Vec<ShapeDoc>,
    },
    DeleteShape { request_id: RequestId, id: ShapeId },
    SubscribeShapes,
    Heartbeat { record: PresenceRecord },
    LeavePresence { client_id: ClientId },
    SubscribePresence,
    WriteSnapshot {
        request_id: RequestId,
        snapshot: SnapshotDocument,
    },
    ReadSnapshot { request_id: RequestId },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined { room: String, client_count: usize },
    /// A write request succeeded.
    Ack { request_id: RequestId },
    /// A batch from the shape subscription.
    Shapes {
        #[serde(flatten)]
        batch: FeedBatch,
    },
    /// The complete current presence set.
    Presence { records: Vec<PresenceRecord> },
    Snapshot {
        request_id: RequestId,
        snapshot: Option<SnapshotDocument>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        message: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
