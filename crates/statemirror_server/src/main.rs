use statemirror_server::{
    bridge::AdminBridge,
    config::Config,
    store::{MemoryStore, RemoteStore, StoreClient, StoreError},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "statemirror_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting statemirror v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Listeners: http={:?}, https={:?}, auth={}",
        config.listen_port, config.listen_port_ssl, config.auth
    );
    info!("Static assets: {:?} (cache={})", config.www_dir, config.cache);

    let store = match connect_store(&config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    let mut bridge = AdminBridge::new(config, store);

    if let Err(e) = bridge.install() {
        error!("Install failed: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = bridge.ready().await {
        error!("Startup failed: {}", e);
        std::process::exit(1);
    }

    shutdown_signal().await;

    bridge.unload().await;
    info!("Server shutdown complete");
}

async fn connect_store(config: &Config) -> Result<Arc<dyn StoreClient>, StoreError> {
    if let Some(url) = &config.store_url {
        let timeout = Duration::from_secs(config.store_request_timeout_secs);
        let store = RemoteStore::connect(url, timeout).await?;
        return Ok(Arc::new(store));
    }

    let store = match &config.store_seed_path {
        Some(path) => {
            info!("Seeding in-memory store from {:?}", path);
            MemoryStore::from_seed_file(path)?
        }
        None => MemoryStore::new(),
    };
    if let (Some(user), Some(password)) = (&config.auth_user, &config.auth_password) {
        store.set_user(user, password);
    }
    info!("Using in-memory store");
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
