use super::AppState;
use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

/// Bridge status as reported by `GET /api/status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub viewers: usize,
    pub objects: usize,
    pub states: usize,
    pub auth: bool,
    /// False once the store's change feed has ended
    pub store_connected: bool,
}

pub fn api_routes() -> Router<AppState> {
    Router::new().route("/status", get(status))
}

/// GET /api/status
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let (objects, states) = state.hub.mirror().counts().await;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        viewers: state.hub.viewer_count(),
        objects,
        states,
        auth: state.gate.is_enabled(),
        store_connected: state.hub.mirror().is_following(),
    })
}
