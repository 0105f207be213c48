use super::mirror::MirrorDelta;
use crate::auth::Identity;
use statemirror_protocol::ServerMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

impl From<MirrorDelta> for ServerMessage {
    fn from(delta: MirrorDelta) -> Self {
        match delta {
            MirrorDelta::Object { id, doc } => ServerMessage::ObjectChange { id, doc },
            MirrorDelta::State { id, value } => ServerMessage::StateChange { id, value },
        }
    }
}

/// One attached viewer.
///
/// Holds only its identity and its receiver of mirror deltas; it sees every
/// delta applied after it attached and nothing from before. Dropping the
/// session detaches it.
pub struct ViewerSession {
    id: String,
    identity: Identity,
    deltas: broadcast::Receiver<MirrorDelta>,
    viewer_count: Arc<AtomicUsize>,
}

impl ViewerSession {
    pub(crate) fn new(
        identity: Identity,
        deltas: broadcast::Receiver<MirrorDelta>,
        viewer_count: Arc<AtomicUsize>,
    ) -> Self {
        viewer_count.fetch_add(1, Ordering::SeqCst);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            identity,
            deltas,
            viewer_count,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Wait for the next push to this viewer.
    ///
    /// Returns `None` once the mirror has shut down.
    pub async fn next_push(&mut self) -> Option<ServerMessage> {
        match self.deltas.recv().await {
            Ok(delta) => Some(delta.into()),
            Err(RecvError::Lagged(missed)) => {
                warn!("Viewer {} lagged, {} pushes dropped", self.id, missed);
                Some(ServerMessage::Lagged { missed })
            }
            Err(RecvError::Closed) => None,
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.viewer_count.fetch_sub(1, Ordering::SeqCst);
    }
}
