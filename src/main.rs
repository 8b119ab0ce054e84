use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reservd::clock::SystemClock;
use reservd::config::Config;
use reservd::engine::Engine;
use reservd::notify::NotifyHub;
use reservd::sweeper::Sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    reservd::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let wal_path = config.wal_path();
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(wal_path.clone(), notify, Arc::new(SystemClock))?);
    let sweeper = Sweeper::start_with_compaction(
        engine.clone(),
        config.sweep_interval,
        config.compact_threshold,
    );

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("reservd listening on {addr}");
    info!("  wal: {}", wal_path.display());
    info!("  sweep_interval: {:?}", config.sweep_interval);
    info!("  compact_threshold: {}", config.compact_threshold);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Closing the hub ends open event streams, which graceful shutdown waits on.
    let notify = engine.notify.clone();
    axum::serve(listener, reservd::api::router(engine))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            notify.close();
        })
        .await?;

    info!("stopping background tasks...");
    sweeper.stop().await;

    info!("reservd stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }

    info!("shutdown signal received, draining requests");
}
