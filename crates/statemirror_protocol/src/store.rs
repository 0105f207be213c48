//! Upstream store protocol.
//!
//! The bridge talks to the store over a single WebSocket. Requests carry a
//! monotonically increasing `seq`; the store answers each with exactly one
//! [`StoreFrame::Reply`] bearing the same `seq`. Change events are interleaved
//! on the same socket and arrive in the order the store emitted them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request envelope sent from the bridge to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub seq: u64,
    #[serde(flatten)]
    pub op: StoreOp,
}

/// Operations the bridge can ask the store to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    /// Start streaming every object and state change on this socket.
    SubscribeAll,
    /// Full state mapping (id -> record).
    GetStates,
    /// Full object mapping (id -> document).
    GetObjects,
    SetState { id: String, state: Value },
    ExtendObject { id: String, patch: Value },
    /// Reply `result` is a JSON boolean.
    CheckPassword { user: String, password: String },
}

/// Frames sent from the store to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreFrame {
    Reply {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        result: Value,
    },
    ObjectChange {
        id: String,
        #[serde(default)]
        doc: Value,
    },
    StateChange {
        id: String,
        #[serde(default)]
        state: Value,
    },
}
