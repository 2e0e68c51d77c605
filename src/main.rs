use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod api_types;
mod backend;
mod canonical;
mod config;
mod error;
mod metadata;
mod routes;
mod slots;
mod state;
mod streaming;

use backend::ReqwestBackendClient;
use config::ProxyConfig;
use metadata::MetadataIndex;
use slots::{BackendDesc, SlotManager};
use state::AppState;

/// Multi-backend global slot pool proxy with prefix-aware KV-cache routing.
#[derive(Parser, Debug)]
#[command(version, about = "OpenAI-compatible prefix-caching proxy", long_about = None)]
struct Args {
    /// Reserved for a future file-based configuration source; configuration
    /// today is entirely environment-variable driven (see README).
    #[arg(long, global = true)]
    config: Option<String>,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn load_system_prompt(path: Option<&str>) -> Option<String> {
    let path = path?;
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let trimmed = text.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        }
        Err(e) => {
            tracing::warn!(path, error = %e, "system_prompt_file_unreadable");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _args = Args::parse();

    let config = ProxyConfig::from_env()?;
    init_tracing(&config.log_level);

    tracing::info!(
        backends = config.backends.len(),
        model_id = %config.model_id,
        "startup_config_loaded"
    );

    let mut backend_descs = Vec::with_capacity(config.backends.len());
    for (idx, desc) in config.backends.iter().enumerate() {
        let client = ReqwestBackendClient::new(desc.url.clone(), config.request_timeout)?;
        tracing::info!(id = idx, url = %desc.url, slots = desc.slots, "backend_registered");
        backend_descs.push(BackendDesc {
            id: idx as u32,
            url: desc.url.clone(),
            num_slots: desc.slots,
            client: Arc::new(client),
        });
    }
    let total_slots: u32 = backend_descs.iter().map(|b| b.num_slots).sum();

    let slot_manager = Arc::new(SlotManager::with_save_mount(
        backend_descs,
        config.model_id.clone(),
        config.similarity_min_ratio,
        config.pinned_keys.clone(),
        config.slot_save_mount.clone(),
    ));
    let metadata = Arc::new(MetadataIndex::open(config.local_meta_dir.clone()).await?);
    let system_prompt = load_system_prompt(config.system_prompt_file.as_deref()).await;

    tracing::info!(
        backends = slot_manager.backend_count(),
        total_slots,
        "lifespan_startup"
    );

    let host = config.host.clone();
    let port = config.port;
    let state = Arc::new(AppState {
        slot_manager,
        metadata,
        config,
        system_prompt,
    });

    let router = routes::build_router(state);
    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    tracing::info!(host = %host, port, "server_start");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("lifespan_shutdown");
}
