//! Dyad sandbox daemon entry point: loads configuration, wires the
//! containerization facade, lifecycle reaper, stream processor, and preview
//! proxy onto one router, then serves.

use std::sync::Arc;

use tracing::info;

use dyad_sandbox_daemon::config::Configuration;
use dyad_sandbox_daemon::cron::Scheduler;
use dyad_sandbox_daemon::data::{FixtureModelProvider, InMemoryChatRepository, InMemoryWorkspaceRepository};
use dyad_sandbox_daemon::lifecycle::Lifecycle;
use dyad_sandbox_daemon::preview::PreviewRouter;
use dyad_sandbox_daemon::router::{build_router, AppState};
use dyad_sandbox_daemon::stream::StreamProcessor;
use dyad_sandbox_daemon::ContainerizationService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "dyad_sandbox_daemon=info".into()),
        )
        .init();

    let config = Configuration::from_env();
    info!(bind_addr = %config.bind_addr, "starting dyad sandbox daemon");

    let lifecycle = Arc::new(Lifecycle::new(config.lifecycle.clone()));
    let containerization = Arc::new(ContainerizationService::new(config.containerization.clone(), lifecycle));

    containerization.discover().await;

    let scheduler = Scheduler::new();
    let _reaper_handle = containerization.start_reaper(&scheduler).await;

    let workspaces = Arc::new(InMemoryWorkspaceRepository::new());
    let chats = Arc::new(InMemoryChatRepository::new());
    let model = Arc::new(FixtureModelProvider::new(Vec::new()));

    let stream_processor = Arc::new(StreamProcessor::new(workspaces.clone(), chats, model, containerization.clone()));
    let preview = Arc::new(PreviewRouter::new(containerization.clone(), workspaces));

    let state = AppState { stream_processor, containerization, preview };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, router).await?;

    Ok(())
}
