use std::sync::Arc;

use anyhow::Context;
use hookrelay_infra::config::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hookrelay_observability::init();

    let config = EngineConfig::from_env()?;
    let services = Arc::new(hookrelay_api::app::services::build_services(&config).await?);
    let tasks = services.start();

    let app = hookrelay_api::app::build_app(Arc::clone(&services));
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        host_id = %services.leader.host_id(),
        backend = services.backend(),
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.stop(tasks).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
