//! In-process store used for standalone runs and tests.

use super::{ChangeEvent, ChangeFeed, StoreClient, StoreError};
use async_trait::async_trait;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use statemirror_protocol::merge_patch;
use std::collections::HashMap;
use std::path::Path;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info};

/// Seed file layout for [`MemoryStore::from_seed_file`].
///
/// ```json
/// {
///   "objects": { "dev.0.temp": { "type": "state", "common": { "name": "Temp" } } },
///   "states":  { "dev.0.temp": { "value": 21, "ack": true } },
///   "users":   { "admin": "plaintext-password" }
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub objects: HashMap<String, Value>,
    #[serde(default)]
    pub states: HashMap<String, Value>,
    #[serde(default)]
    pub users: HashMap<String, String>,
}

#[derive(Default)]
struct StoreData {
    objects: HashMap<String, Value>,
    states: HashMap<String, Value>,
}

/// Salted SHA-256 credential.
struct PasswordHash {
    salt: [u8; 16],
    digest: [u8; 32],
}

impl PasswordHash {
    fn new(password: &str) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let digest = Self::digest(&salt, password);
        Self { salt, digest }
    }

    fn digest(salt: &[u8], password: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        hasher.finalize().into()
    }

    fn verify(&self, password: &str) -> bool {
        let offered = Self::digest(&self.salt, password);
        offered.as_slice().ct_eq(self.digest.as_slice()).into()
    }
}

/// Authoritative object/state store living inside the process.
///
/// Writes are applied and announced to subscribers while the data lock is held,
/// so every subscriber sees changes in write order.
pub struct MemoryStore {
    data: RwLock<StoreData>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    users: std::sync::RwLock<HashMap<String, PasswordHash>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            subscribers: Mutex::new(Vec::new()),
            users: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Build a store pre-populated from a seed.
    pub fn from_seed(seed: StoreSeed) -> Self {
        let users = seed
            .users
            .iter()
            .map(|(user, password)| (user.clone(), PasswordHash::new(password)))
            .collect();
        Self {
            data: RwLock::new(StoreData {
                objects: seed.objects,
                states: seed.states,
            }),
            subscribers: Mutex::new(Vec::new()),
            users: std::sync::RwLock::new(users),
        }
    }

    /// Load a seed file from disk.
    pub fn from_seed_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Seed(format!("{}: {}", path.display(), e)))?;
        let seed: StoreSeed = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Seed(format!("{}: {}", path.display(), e)))?;
        info!(
            "Loaded store seed from {}: {} objects, {} states, {} users",
            path.display(),
            seed.objects.len(),
            seed.states.len(),
            seed.users.len()
        );
        Ok(Self::from_seed(seed))
    }

    /// Add or replace a user credential.
    pub fn set_user(&self, user: &str, password: &str) {
        if let Ok(mut users) = self.users.write() {
            users.insert(user.to_string(), PasswordHash::new(password));
        }
    }

    /// Apply an object change as if another writer made it, announcing it to
    /// subscribers. A `Value::Null` document keeps its id.
    pub async fn put_object(&self, id: &str, doc: Value) {
        let mut data = self.data.write().await;
        data.objects.insert(id.to_string(), doc.clone());
        self.announce(ChangeEvent::ObjectChanged {
            id: id.to_string(),
            doc,
        })
        .await;
    }

    /// Apply a state change as if another writer made it.
    pub async fn put_state(&self, id: &str, state: Value) {
        let mut data = self.data.write().await;
        data.states.insert(id.to_string(), state.clone());
        self.announce(ChangeEvent::StateChanged {
            id: id.to_string(),
            state,
        })
        .await;
    }

    async fn announce(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(
            "Announced change of {} to {} subscribers",
            event.id(),
            subscribers.len()
        );
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn subscribe_all(&self) -> Result<ChangeFeed, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        Ok(rx)
    }

    async fn load_all_objects(&self) -> Result<HashMap<String, Value>, StoreError> {
        Ok(self.data.read().await.objects.clone())
    }

    async fn load_all_states(&self) -> Result<HashMap<String, Value>, StoreError> {
        Ok(self.data.read().await.states.clone())
    }

    async fn write_state(&self, id: &str, state: Value) -> Result<Value, StoreError> {
        let Value::Object(mut record) = state else {
            return Err(StoreError::Rejected(format!(
                "state for {} must be a record",
                id
            )));
        };
        record.entry("ack").or_insert(Value::Bool(false));
        record.insert(
            "ts".to_string(),
            json!(chrono::Utc::now().timestamp_millis()),
        );
        let record = Value::Object(record);

        self.put_state(id, record.clone()).await;
        Ok(record)
    }

    async fn write_object(&self, id: &str, patch: Value) -> Result<Value, StoreError> {
        if !patch.is_object() {
            return Err(StoreError::Rejected(format!(
                "patch for {} must be an object",
                id
            )));
        }

        let mut data = self.data.write().await;
        let doc = data
            .objects
            .entry(id.to_string())
            .or_insert_with(|| json!({}));
        if !doc.is_object() {
            *doc = json!({});
        }
        merge_patch(doc, patch);
        if let Value::Object(fields) = doc {
            fields.insert("_id".to_string(), Value::String(id.to_string()));
        }
        let doc = doc.clone();

        self.announce(ChangeEvent::ObjectChanged {
            id: id.to_string(),
            doc: doc.clone(),
        })
        .await;
        Ok(doc)
    }

    async fn check_credential(&self, user: &str, secret: &str) -> Result<bool, StoreError> {
        let users = self
            .users
            .read()
            .map_err(|_| StoreError::Rejected("credential table unavailable".to_string()))?;
        Ok(users.get(user).is_some_and(|hash| hash.verify(secret)))
    }
}
