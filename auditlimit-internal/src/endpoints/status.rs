use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::gateway_util::AppStateData;

pub const AUDITLIMIT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Liveness plus admission counters for this instance
pub async fn status_handler(State(app_state): State<AppStateData>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": AUDITLIMIT_VERSION,
        "metrics": app_state.engine.metrics(),
    }))
}

pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
