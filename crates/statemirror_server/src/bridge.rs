//! Bridge lifecycle.
//!
//! `install` prepares the filesystem, `ready` connects the mirror to the
//! store and opens the listeners, `unload` closes everything again. A failed
//! `ready` releases whatever it had already started before returning.

use crate::auth::{BasicCredentials, SessionGate, SessionStore};
use crate::config::Config;
use crate::handlers::{AppState, StaticAssets};
use crate::listener::{self, ListenerError, ListenerSpec, RunningListener};
use crate::store::{StoreClient, StoreError};
use crate::sync::{BroadcastHub, MirrorCache};
use chrono::TimeDelta;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often expired login sessions are pruned.
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// How long `unload` waits for a listener to drain before aborting it.
const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct AdminBridge {
    config: Config,
    store: Arc<dyn StoreClient>,
    hub: Arc<BroadcastHub>,
    gate: Arc<SessionGate>,
    shutdown: CancellationToken,
    listeners: Vec<RunningListener>,
    tasks: Vec<JoinHandle<()>>,
}

impl AdminBridge {
    pub fn new(config: Config, store: Arc<dyn StoreClient>) -> Self {
        let mirror = Arc::new(MirrorCache::new(config.broadcast_capacity));
        let hub = Arc::new(BroadcastHub::new(mirror, store.clone()));

        let lifetime = TimeDelta::try_hours(config.session_expiry_hours)
            .filter(|d| *d > TimeDelta::zero())
            .unwrap_or_else(|| TimeDelta::hours(24));
        let gate = Arc::new(SessionGate::new(
            config.auth,
            store.clone(),
            SessionStore::new(lifetime),
        ));

        Self {
            config,
            store,
            hub,
            gate,
            shutdown: CancellationToken::new(),
            listeners: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn gate(&self) -> &Arc<SessionGate> {
        &self.gate
    }

    /// Addresses the listeners actually bound, by listener name.
    pub fn local_addrs(&self) -> Vec<(&'static str, SocketAddr)> {
        self.listeners
            .iter()
            .map(|l| (l.name, l.local_addr))
            .collect()
    }

    /// Create the static asset root if it does not exist yet.
    pub fn install(&self) -> Result<(), BridgeError> {
        if !self.config.www_dir.exists() {
            std::fs::create_dir_all(&self.config.www_dir)?;
            info!("Created static asset directory {:?}", self.config.www_dir);
        }
        Ok(())
    }

    /// Subscribe, prime the mirror, then open the configured listeners.
    pub async fn ready(&mut self) -> Result<(), BridgeError> {
        if let Err(e) = self.start().await {
            self.unload().await;
            return Err(e);
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), BridgeError> {
        // Subscribe before loading so no change between the two is lost.
        let feed = self.store.subscribe_all().await?;
        info!("Subscribed to store changes");

        let mirror = self.hub.mirror().clone();
        self.tasks
            .push(tokio::spawn(async move { mirror.follow(feed).await }));

        let (objects, states) = tokio::try_join!(
            self.store.load_all_objects(),
            self.store.load_all_states()
        )?;
        let mirror = self.hub.mirror();
        let object_count = mirror.prime_objects(objects).await;
        let state_count = mirror.prime_states(states).await;
        info!(
            "Mirror primed: {} objects, {} states",
            object_count, state_count
        );

        for spec in self.listener_specs() {
            let state = AppState {
                hub: self.hub.clone(),
                gate: self.gate.clone(),
                shutdown: self.shutdown.clone(),
            };
            let running = listener::start(spec, state, &self.static_assets()).await?;
            self.listeners.push(running);
        }
        if self.listeners.is_empty() {
            warn!("No listener configured; viewers cannot connect");
        }

        self.tasks.push(self.spawn_session_cleanup());
        Ok(())
    }

    fn listener_specs(&self) -> Vec<ListenerSpec> {
        let mut specs = Vec::new();
        if let Some(port) = self.config.listen_port {
            specs.push(ListenerSpec::plain(&self.config.host, port));
        }
        if let Some(port) = self.config.listen_port_ssl {
            let basic = self
                .config
                .basic_credentials()
                .map(|(user, password)| BasicCredentials::new(user, password));
            specs.push(ListenerSpec::tls(
                &self.config.host,
                port,
                self.config.tls.clone(),
                basic,
            ));
        }
        specs
    }

    fn static_assets(&self) -> StaticAssets {
        StaticAssets {
            root: self.config.www_dir.clone(),
            cache: self.config.cache,
        }
    }

    fn spawn_session_cleanup(&self) -> JoinHandle<()> {
        let gate = self.gate.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = gate.sessions().cleanup_expired();
                        if removed > 0 {
                            debug!("Pruned {} expired sessions", removed);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Close every listener and background task. Never fails; teardown
    /// problems are logged.
    pub async fn unload(&mut self) {
        self.shutdown.cancel();

        for running in self.listeners.drain(..) {
            let abort = running.task.abort_handle();
            match tokio::time::timeout(LISTENER_DRAIN_TIMEOUT, running.task).await {
                Ok(Ok(())) => info!("Listener ({}) on {} closed", running.name, running.local_addr),
                Ok(Err(e)) => error!("Listener ({}) task failed: {}", running.name, e),
                Err(_) => {
                    warn!(
                        "Listener ({}) did not drain within {:?}, aborting",
                        running.name, LISTENER_DRAIN_TIMEOUT
                    );
                    abort.abort();
                }
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
            match task.await {
                Err(e) if !e.is_cancelled() => error!("Background task failed: {}", e),
                _ => {}
            }
        }
    }
}
