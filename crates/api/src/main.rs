use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use reelforge_api::{AppConfig, AppServices, build_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    reelforge_observability::tracing::init(&config.log);

    let services = AppServices::build(config.clone());
    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    let signals = tokio::spawn(shutdown_on_signal(services.clone()));
    let host = services.host_token().clone();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { host.cancelled().await })
        .await
        .context("server error")?;

    signals.abort();
    info!("server stopped");
    Ok(())
}

async fn shutdown_on_signal(services: Arc<AppServices>) {
    wait_for_signal().await;
    info!("shutdown signal received");

    if let Err(err) = services.stop().await {
        error!(error = %err, "shutdown failed; stopping the server anyway");
        services.host_token().cancel();
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "cannot listen for SIGTERM; relying on Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
