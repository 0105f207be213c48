pub mod api;
pub mod auth;
pub mod ws;

pub use api::api_routes;
pub use auth::auth_routes;
pub use ws::ws_handler;

use crate::auth::{GateGuard, SessionGate, require_login};
use crate::config::STATIC_CACHE_MAX_AGE_SECS;
use crate::sync::BroadcastHub;
use axum::{
    Router,
    http::{HeaderValue, header},
    middleware,
    routing::get,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::Layer;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};

/// Path of the viewer WebSocket endpoint.
pub const SOCKET_PATH: &str = "/socket";

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub gate: Arc<SessionGate>,
    /// Cancelled when the bridge unloads; open viewer sockets close on it.
    pub shutdown: CancellationToken,
}

/// Static asset root and caching policy.
#[derive(Debug, Clone)]
pub struct StaticAssets {
    pub root: PathBuf,
    pub cache: bool,
}

/// Build the full application router for one listener.
pub fn build_router(state: AppState, guard: GateGuard, assets: &StaticAssets) -> Router {
    let router = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(SOCKET_PATH, get(ws_handler))
        .merge(auth_routes())
        .nest("/api", api_routes())
        .with_state(state);

    let serve_dir = ServeDir::new(&assets.root);
    let router = if assets.cache {
        let max_age = format!("public, max-age={}", STATIC_CACHE_MAX_AGE_SECS);
        let cache_control = HeaderValue::from_str(&max_age)
            .unwrap_or_else(|_| HeaderValue::from_static("no-cache"));
        router.fallback_service(
            SetResponseHeaderLayer::if_not_present(header::CACHE_CONTROL, cache_control)
                .layer(serve_dir),
        )
    } else {
        router.fallback_service(serve_dir)
    };

    router
        .layer(middleware::from_fn_with_state(guard, require_login))
        .layer(TraceLayer::new_for_http())
}
