use super::connection::ViewerSession;
use super::mirror::MirrorCache;
use crate::auth::Identity;
use crate::store::{StoreClient, StoreError};
use serde_json::{Map, Value};
use statemirror_protocol::{ClientMessage, ServerMessage, normalize_state};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Fan-out of mirror deltas and dispatch of viewer requests.
///
/// The hub holds no lock across operations: reads take an owned snapshot of
/// the mirror and writes go straight to the store. A write's acknowledgement
/// and the broadcast of the resulting change are not ordered relative to each
/// other.
pub struct BroadcastHub {
    mirror: Arc<MirrorCache>,
    store: Arc<dyn StoreClient>,
    viewer_count: Arc<AtomicUsize>,
}

impl BroadcastHub {
    pub fn new(mirror: Arc<MirrorCache>, store: Arc<dyn StoreClient>) -> Self {
        Self {
            mirror,
            store,
            viewer_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attach a viewer. It receives pushes for changes applied from now on.
    pub fn attach(&self, identity: Identity) -> ViewerSession {
        let session =
            ViewerSession::new(identity, self.mirror.subscribe(), self.viewer_count.clone());
        info!(
            "Viewer {} attached ({}), viewers={}",
            session.id(),
            session.identity(),
            self.viewer_count()
        );
        session
    }

    /// Number of currently attached viewers.
    pub fn viewer_count(&self) -> usize {
        self.viewer_count.load(Ordering::SeqCst)
    }

    pub fn mirror(&self) -> &Arc<MirrorCache> {
        &self.mirror
    }

    pub async fn get_states(&self) -> HashMap<String, Value> {
        self.mirror.snapshot_states().await
    }

    pub async fn get_objects(&self) -> HashMap<String, Value> {
        self.mirror.snapshot_objects().await
    }

    /// Forward a state write. A bare scalar becomes `{"value": scalar}`.
    pub async fn set_state(&self, id: &str, value: Value) -> Result<Value, StoreError> {
        let state = normalize_state(value);
        debug!("setState {} -> {}", id, state);
        self.store.write_state(id, state).await
    }

    /// Forward an object merge-patch.
    pub async fn extend_object(&self, id: &str, patch: Value) -> Result<Value, StoreError> {
        debug!("extendObject {}", id);
        self.store.write_object(id, patch).await
    }

    /// Run one viewer request and build the reply for that viewer alone.
    ///
    /// Returns `None` when the viewer did not ask for a reply.
    pub async fn dispatch(&self, request: ClientMessage) -> Option<ServerMessage> {
        match request {
            ClientMessage::GetStates { request_id } => Some(ServerMessage::response(
                request_id,
                Ok(into_object(self.get_states().await)),
            )),
            ClientMessage::GetObjects { request_id } => Some(ServerMessage::response(
                request_id,
                Ok(into_object(self.get_objects().await)),
            )),
            ClientMessage::SetState {
                request_id,
                id,
                value,
            } => {
                let outcome = self.set_state(&id, value).await;
                reply(request_id, &id, outcome)
            }
            ClientMessage::ExtendObject {
                request_id,
                id,
                patch,
            } => {
                let outcome = self.extend_object(&id, patch).await;
                reply(request_id, &id, outcome)
            }
        }
    }
}

fn into_object(map: HashMap<String, Value>) -> Value {
    Value::Object(map.into_iter().collect::<Map<String, Value>>())
}

fn reply(
    request_id: Option<u64>,
    id: &str,
    outcome: Result<Value, StoreError>,
) -> Option<ServerMessage> {
    if let Err(e) = &outcome {
        warn!("Store write for {} failed: {}", id, e);
    }
    let request_id = request_id?;
    Some(ServerMessage::response(
        request_id,
        outcome.map_err(|e| e.to_string()),
    ))
}
