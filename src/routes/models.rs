use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::State;

use crate::api_types::{ModelListResponse, ModelObject};
use crate::state::AppState;

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelListResponse> {
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    Json(ModelListResponse {
        object: "list",
        data: vec![ModelObject {
            id: state.config.model_id.clone(),
            object: "model",
            created,
            owned_by: "local",
        }],
    })
}
