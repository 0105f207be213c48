//! Store client abstraction.
//!
//! The upstream store is the single source of truth for object documents and
//! state records. The bridge reaches it only through [`StoreClient`]:
//!
//! ```text
//! ┌──────────────┐  subscribe_all / load_all_*   ┌─────────────────┐
//! │ MirrorCache  │ ◄──────────────────────────── │                 │
//! └──────────────┘                               │   StoreClient   │
//! ┌──────────────┐  write_state / write_object   │ (Memory/Remote) │
//! │ BroadcastHub │ ────────────────────────────► │                 │
//! └──────────────┘                               └─────────────────┘
//! ```

mod memory;
mod remote;

pub use memory::{MemoryStore, StoreSeed};
pub use remote::RemoteStore;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// A single change notification from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    ObjectChanged { id: String, doc: Value },
    StateChanged { id: String, state: Value },
}

impl ChangeEvent {
    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::ObjectChanged { id, .. } | ChangeEvent::StateChanged { id, .. } => id,
        }
    }
}

/// Ordered stream of change events. Events for one id arrive in the order the
/// store emitted them. The feed ends when the store connection is lost.
pub type ChangeFeed = mpsc::UnboundedReceiver<ChangeEvent>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("store connection closed")]
    Disconnected,
    #[error("store did not answer within {0} seconds")]
    Timeout(u64),
    #[error("{0}")]
    Rejected(String),
    #[error("unexpected store reply: {0}")]
    Protocol(String),
    #[error("invalid store seed: {0}")]
    Seed(String),
    #[error("change feed already subscribed")]
    AlreadySubscribed,
}

/// The sole conduit to the external source of truth.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Register interest in every object and state change.
    ///
    /// Called once at startup, before the bulk loads.
    async fn subscribe_all(&self) -> Result<ChangeFeed, StoreError>;

    /// Full object snapshot (id -> document).
    async fn load_all_objects(&self) -> Result<HashMap<String, Value>, StoreError>;

    /// Full state snapshot (id -> record).
    async fn load_all_states(&self) -> Result<HashMap<String, Value>, StoreError>;

    /// Write a state record. `state` is already normalized to a record.
    async fn write_state(&self, id: &str, state: Value) -> Result<Value, StoreError>;

    /// Merge-patch an object document.
    async fn write_object(&self, id: &str, patch: Value) -> Result<Value, StoreError>;

    /// Verify a user's credential. `Ok(false)` is a normal negative answer.
    async fn check_credential(&self, user: &str, secret: &str) -> Result<bool, StoreError>;
}

/// Convert a JSON object reply into an id-keyed mapping.
pub(crate) fn value_into_map(value: Value) -> Result<HashMap<String, Value>, StoreError> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        Value::Null => Ok(HashMap::new()),
        other => Err(StoreError::Protocol(format!(
            "expected an object mapping, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
