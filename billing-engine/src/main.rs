//! Renewal worker entry point.

use billing_engine::config::WorkerConfig;
use billing_engine::startup::Application;

use service_core::observability::init_tracing;
use tokio::signal;
use tokio_util::sync::CancellationToken;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load configuration
    let config = WorkerConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        http_port = %config.server.port,
        db_max_connections = %config.database.max_connections,
        db_min_connections = %config.database.min_connections,
        renewal_hour = config.schedule.hour,
        renewal_minute = config.schedule.minute,
        "Starting renewal worker"
    );

    let grace = config.shutdown_grace();
    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    let cancel = CancellationToken::new();
    let mut running = tokio::spawn(app.run_until_stopped(cancel.clone()));

    tokio::select! {
        result = &mut running => {
            return match result {
                Ok(outcome) => outcome,
                Err(e) => Err(std::io::Error::other(format!("Worker task failed: {}", e))),
            };
        }
        _ = shutdown_signal() => {
            tracing::info!("Graceful shutdown initiated");
        }
    }

    cancel.cancel();
    match tokio::time::timeout(grace, running).await {
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "Worker stopped with error"),
        Ok(Err(e)) => tracing::error!(error = %e, "Worker task failed"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => tracing::warn!(
            grace_secs = grace.as_secs(),
            "Shutdown grace period elapsed, exiting"
        ),
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
