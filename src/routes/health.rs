use axum::Json;
use serde_json::{Value, json};

/// Liveness only — no backend calls, no slot-manager lookups.
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
