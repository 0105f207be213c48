//! WebSocket client for a remote store.
//!
//! One socket carries both request/reply traffic and the change feed. A writer
//! task drains an outbound queue; a reader task routes replies to the waiting
//! caller by `seq` and forwards change events to the subscribed feed in
//! arrival order.

use super::{ChangeEvent, ChangeFeed, StoreClient, StoreError, value_into_map};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use statemirror_protocol::{StoreFrame, StoreOp, StoreRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type ReplySender = oneshot::Sender<Result<Value, StoreError>>;

/// State shared between the client handle and its reader task.
struct Shared {
    /// In-flight requests keyed by `seq`
    pending: DashMap<u64, ReplySender>,
    /// Subscriber of the change feed, once `subscribe_all` ran
    feed: Mutex<Option<mpsc::UnboundedSender<ChangeEvent>>>,
    /// Set once the socket is gone
    closed: AtomicBool,
}

impl Shared {
    async fn deliver(&self, event: ChangeEvent) {
        let feed = self.feed.lock().await;
        match feed.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("Change feed receiver dropped");
                }
            }
            None => debug!("Dropping change of {} before subscription", event.id()),
        }
    }

    async fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let seqs: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for seq in seqs {
            if let Some((_, tx)) = self.pending.remove(&seq) {
                let _ = tx.send(Err(StoreError::Disconnected));
            }
        }
        // Dropping the sender ends the change feed.
        self.feed.lock().await.take();
    }
}

/// [`StoreClient`] backed by a WebSocket connection to a remote store.
pub struct RemoteStore {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    next_seq: AtomicU64,
    request_timeout: Duration,
    io_tasks: Vec<JoinHandle<()>>,
}

impl RemoteStore {
    /// Connect to the store. Fails with [`StoreError::Unreachable`] if the
    /// socket cannot be opened.
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, StoreError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| StoreError::Unreachable(format!("{}: {}", url, e)))?;
        info!("Connected to store at {}", url);

        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            feed: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(stream, shared.clone()));

        Ok(Self {
            shared,
            outbound,
            next_seq: AtomicU64::new(1),
            request_timeout,
            io_tasks: vec![writer, reader],
        })
    }

    /// Whether the underlying socket has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn request(&self, op: StoreOp) -> Result<Value, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Disconnected);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&StoreRequest { seq, op })
            .map_err(|e| StoreError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(seq, tx);

        if self.is_closed() || self.outbound.send(Message::Text(text.into())).is_err() {
            self.shared.pending.remove(&seq);
            return Err(StoreError::Disconnected);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(StoreError::Disconnected),
            Err(_) => {
                self.shared.pending.remove(&seq);
                Err(StoreError::Timeout(self.request_timeout.as_secs()))
            }
        }
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        for task in &self.io_tasks {
            task.abort();
        }
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            error!("Failed to send to store: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<StoreFrame>(text.as_str()) {
                Ok(StoreFrame::Reply { seq, error, result }) => match shared.pending.remove(&seq) {
                    Some((_, tx)) => {
                        let outcome = match error {
                            Some(message) => Err(StoreError::Rejected(message)),
                            None => Ok(result),
                        };
                        // The caller may have timed out already.
                        let _ = tx.send(outcome);
                    }
                    None => debug!("Discarding store reply for unknown request {}", seq),
                },
                Ok(StoreFrame::ObjectChange { id, doc }) => {
                    shared.deliver(ChangeEvent::ObjectChanged { id, doc }).await;
                }
                Ok(StoreFrame::StateChange { id, state }) => {
                    shared.deliver(ChangeEvent::StateChanged { id, state }).await;
                }
                Err(e) => warn!("Ignoring malformed store frame: {}", e),
            },
            Ok(Message::Close(_)) => {
                debug!("Store requested close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Store connection error: {}", e);
                break;
            }
        }
    }

    warn!("Store connection closed");
    shared.fail_all().await;
}

#[async_trait]
impl StoreClient for RemoteStore {
    async fn subscribe_all(&self) -> Result<ChangeFeed, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut feed = self.shared.feed.lock().await;
            if feed.is_some() {
                return Err(StoreError::AlreadySubscribed);
            }
            *feed = Some(tx);
        }

        if let Err(e) = self.request(StoreOp::SubscribeAll).await {
            self.shared.feed.lock().await.take();
            return Err(e);
        }
        Ok(rx)
    }

    async fn load_all_objects(&self) -> Result<HashMap<String, Value>, StoreError> {
        value_into_map(self.request(StoreOp::GetObjects).await?)
    }

    async fn load_all_states(&self) -> Result<HashMap<String, Value>, StoreError> {
        value_into_map(self.request(StoreOp::GetStates).await?)
    }

    async fn write_state(&self, id: &str, state: Value) -> Result<Value, StoreError> {
        self.request(StoreOp::SetState {
            id: id.to_string(),
            state,
        })
        .await
    }

    async fn write_object(&self, id: &str, patch: Value) -> Result<Value, StoreError> {
        self.request(StoreOp::ExtendObject {
            id: id.to_string(),
            patch,
        })
        .await
    }

    async fn check_credential(&self, user: &str, secret: &str) -> Result<bool, StoreError> {
        match self
            .request(StoreOp::CheckPassword {
                user: user.to_string(),
                password: secret.to_string(),
            })
            .await?
        {
            Value::Bool(ok) => Ok(ok),
            other => Err(StoreError::Protocol(format!(
                "credential check returned {}",
                other
            ))),
        }
    }
}
