//! Viewer channel messages.
//!
//! Every frame is a JSON text message tagged by `type`. Requests that expect a
//! reply carry a `request_id` chosen by the viewer; the bridge echoes it in the
//! matching [`ServerMessage::Response`] and never sends that response to any
//! other viewer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from a viewer to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request the full state mapping.
    GetStates { request_id: u64 },
    /// Request the full object mapping.
    GetObjects { request_id: u64 },
    /// Write a state upstream. Without a `request_id` the result is dropped.
    SetState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        id: String,
        value: Value,
    },
    /// Merge-patch an object upstream. Without a `request_id` the result is dropped.
    ExtendObject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        id: String,
        patch: Value,
    },
}

impl ClientMessage {
    /// The correlation id a reply must carry, if the viewer asked for one.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientMessage::GetStates { request_id } | ClientMessage::GetObjects { request_id } => {
                Some(*request_id)
            }
            ClientMessage::SetState { request_id, .. }
            | ClientMessage::ExtendObject { request_id, .. } => *request_id,
        }
    }

    /// Whether the request writes upstream.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ClientMessage::SetState { .. } | ClientMessage::ExtendObject { .. }
        )
    }
}

/// Messages sent from the bridge to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An object document changed upstream. Pushed to every attached viewer.
    ObjectChange { id: String, doc: Value },
    /// A state record changed upstream. Pushed to every attached viewer.
    StateChange { id: String, value: Value },
    /// Reply to a single viewer request.
    Response {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        result: Value,
    },
    /// The viewer fell behind and `missed` pushes were dropped.
    /// It should re-request snapshots to recover.
    Lagged { missed: u64 },
    /// A frame from the viewer could not be understood.
    Error { message: String },
}

impl ServerMessage {
    /// Build a response from a request outcome.
    pub fn response(request_id: u64, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(result) => ServerMessage::Response {
                request_id,
                error: None,
                result,
            },
            Err(error) => ServerMessage::Response {
                request_id,
                error: Some(error),
                result: Value::Null,
            },
        }
    }
}
