pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod monitoring;

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

// Re-exports
pub use crate::api::routes::{create_router, AppState};
pub use crate::config::Settings;
pub use crate::core::{LifecycleSimulator, StatsSampler, VmRepository, VmService};

/// Wires storage, simulator, service and router together and serves until
/// Ctrl-C / SIGTERM. In-flight lifecycle tasks are aborted on the way out.
pub async fn run_server(settings: Settings, port: u16) -> anyhow::Result<()> {
    let settings = Arc::new(settings);

    let repo = crate::core::repository::open(&settings.database)
        .await
        .context("failed to open VM repository")?;
    let simulator = LifecycleSimulator::new(
        Arc::clone(&repo),
        StatsSampler::new(settings.simulation.stats.clone()),
    );
    let service = Arc::new(VmService::new(
        repo,
        settings.limits.clone(),
        simulator.clone(),
    ));

    if settings.database.seed {
        service.seed_sample_vms().await.context("failed to seed sample VMs")?;
    }
    service.resume_stats_updaters().await?;

    let metrics = monitoring::ApiMetrics::new().context("failed to register metrics")?;
    let state = Arc::new(AppState::new(service, Arc::clone(&settings), metrics));
    let app = create_router(state);

    let addr = format!("{}:{}", settings.server.host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on {} (mode: {})", addr, settings.server.mode);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    simulator.abort_all();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}
