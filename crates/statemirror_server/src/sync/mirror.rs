use crate::store::{ChangeEvent, ChangeFeed};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

/// A single mirrored change, fanned out to every attached viewer.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorDelta {
    Object { id: String, doc: Value },
    State { id: String, value: Value },
}

#[derive(Default)]
struct MirrorData {
    objects: HashMap<String, Value>,
    states: HashMap<String, Value>,
    /// Ids written by a change event; bulk loads must not overwrite these
    live_objects: HashSet<String>,
    live_states: HashSet<String>,
}

/// In-process view of every object and state known to the store.
///
/// Only the change-event path writes to the mirror. Every other component
/// reads owned snapshots, so nothing outside can alias the live maps.
pub struct MirrorCache {
    data: RwLock<MirrorData>,
    delta_tx: broadcast::Sender<MirrorDelta>,
    /// Set while `follow` is draining a live change feed
    following: AtomicBool,
}

impl MirrorCache {
    /// Create an empty mirror. `capacity` bounds the per-receiver backlog of
    /// deltas before a slow viewer starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (delta_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            data: RwLock::new(MirrorData::default()),
            delta_tx,
            following: AtomicBool::new(false),
        }
    }

    /// Subscribe to deltas applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MirrorDelta> {
        self.delta_tx.subscribe()
    }

    /// Overwrite an object document. `Value::Null` is kept as an empty entry.
    pub async fn apply_object_change(&self, id: &str, doc: Value) {
        let mut data = self.data.write().await;
        data.objects.insert(id.to_string(), doc.clone());
        data.live_objects.insert(id.to_string());
        // Sent under the write lock so delta order matches apply order.
        let _ = self.delta_tx.send(MirrorDelta::Object {
            id: id.to_string(),
            doc,
        });
    }

    /// Overwrite a state record. `Value::Null` is kept as an empty entry.
    pub async fn apply_state_change(&self, id: &str, value: Value) {
        let mut data = self.data.write().await;
        data.states.insert(id.to_string(), value.clone());
        data.live_states.insert(id.to_string());
        let _ = self.delta_tx.send(MirrorDelta::State {
            id: id.to_string(),
            value,
        });
    }

    pub async fn apply(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::ObjectChanged { id, doc } => self.apply_object_change(&id, doc).await,
            ChangeEvent::StateChanged { id, state } => self.apply_state_change(&id, state).await,
        }
    }

    /// Merge a bulk object load. Entries already set by a change event win.
    /// Returns how many entries were taken from the load.
    pub async fn prime_objects(&self, objects: HashMap<String, Value>) -> usize {
        let mut data = self.data.write().await;
        let MirrorData {
            objects: current,
            live_objects,
            ..
        } = &mut *data;
        prime(current, live_objects, objects)
    }

    /// Merge a bulk state load. Entries already set by a change event win.
    pub async fn prime_states(&self, states: HashMap<String, Value>) -> usize {
        let mut data = self.data.write().await;
        let MirrorData {
            states: current,
            live_states,
            ..
        } = &mut *data;
        prime(current, live_states, states)
    }

    pub async fn snapshot_objects(&self) -> HashMap<String, Value> {
        self.data.read().await.objects.clone()
    }

    pub async fn snapshot_states(&self) -> HashMap<String, Value> {
        self.data.read().await.states.clone()
    }

    /// (objects, states)
    pub async fn counts(&self) -> (usize, usize) {
        let data = self.data.read().await;
        (data.objects.len(), data.states.len())
    }

    /// Whether the mirror is still receiving store changes.
    pub fn is_following(&self) -> bool {
        self.following.load(Ordering::SeqCst)
    }

    /// Apply every event from `feed` in receipt order until it ends.
    pub async fn follow(&self, mut feed: ChangeFeed) {
        self.following.store(true, Ordering::SeqCst);
        while let Some(event) = feed.recv().await {
            debug!("Mirror change: {}", event.id());
            self.apply(event).await;
        }
        self.following.store(false, Ordering::SeqCst);
        warn!("Store change feed ended; mirror is no longer updated");
    }
}

fn prime(
    current: &mut HashMap<String, Value>,
    live: &HashSet<String>,
    loaded: HashMap<String, Value>,
) -> usize {
    let total = loaded.len();
    let mut applied = 0;
    for (id, value) in loaded {
        if live.contains(&id) {
            continue;
        }
        current.insert(id, value);
        applied += 1;
    }
    if applied < total {
        info!(
            "Bulk load: kept {} newer entries from change events",
            total - applied
        );
    }
    applied
}
