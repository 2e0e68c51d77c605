use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::metadata::MetadataIndex;
use crate::slots::SlotManager;

/// Shared application state, built once at startup and handed to every
/// request handler via `axum::extract::State`.
pub struct AppState {
    pub slot_manager: Arc<SlotManager>,
    pub metadata: Arc<MetadataIndex>,
    pub config: ProxyConfig,
    pub system_prompt: Option<String>,
}
