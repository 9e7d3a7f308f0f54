//! Worker process startup and lifecycle management.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::Registry;
use secrecy::ExposeSecret;
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::clock::{Clock, SystemClock};
use crate::config::WorkerConfig;
use crate::error::BillingError;
use crate::jobs::renewal::RenewalJob;
use crate::jobs::schedule::{DailySchedule, run_daily};
use crate::services::{BillingMetrics, Database, PgAdvisoryLock, TransactionRunner};
use crate::services::lock::LockOutcome;

/// State for health and metrics endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
    metrics: Arc<BillingMetrics>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "billing-engine",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "billing-engine",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            body,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                String::new(),
            )
        }
    }
}

/// Renewal worker: daily scheduler plus health/metrics HTTP endpoints.
pub struct Application {
    port: u16,
    listener: TcpListener,
    db: Arc<Database>,
    metrics: Arc<BillingMetrics>,
    job: Arc<RenewalJob>,
    lock: Arc<PgAdvisoryLock>,
    schedule: DailySchedule,
    clock: Arc<dyn Clock>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: WorkerConfig) -> Result<Self, AppError> {
        let schedule = config.daily_schedule()?;

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let metrics = Arc::new(
            BillingMetrics::new(Registry::new())
                .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?,
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let runner = TransactionRunner::new(db.unit_of_work_factory(), config.retry_policy())
            .with_metrics(metrics.clone());
        let job = RenewalJob::new(db.repositories(), clock.clone(), metrics.clone())
            .with_runner(runner);
        let lock = PgAdvisoryLock::new(db.pool().clone());

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            http_port = port,
            renewal_at = %schedule.time(),
            "Renewal worker initialised"
        );

        Ok(Self {
            port,
            listener,
            db: Arc::new(db),
            metrics,
            job: Arc::new(job),
            lock: Arc::new(lock),
            schedule,
            clock,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the scheduler and HTTP server until `cancel` fires.
    pub async fn run_until_stopped(self, cancel: CancellationToken) -> std::io::Result<()> {
        let health_state = HealthState {
            db: self.db.clone(),
            metrics: self.metrics.clone(),
        };

        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(health_state);

        let job = self.job.clone();
        let lock = self.lock.clone();
        let job_cancel = cancel.clone();
        let scheduler = tokio::spawn(run_daily(
            self.schedule,
            self.clock.clone(),
            cancel.clone(),
            move || {
                let job = job.clone();
                let lock = lock.clone();
                let cancel = job_cancel.clone();
                async move {
                    // Failures are logged by the job and retried at the next firing.
                    if let Ok(LockOutcome::Skipped) = job.run_locked(lock.as_ref(), &cancel).await {
                        tracing::debug!("Renewal run skipped by this instance");
                    }
                }
            },
        ));

        tracing::info!(
            service = "billing-engine",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            "Worker ready"
        );

        let server_cancel = cancel.clone();
        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            })?;

        match scheduler.await {
            Ok(Err(BillingError::Cancelled)) | Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(std::io::Error::other(format!("Scheduler error: {}", e))),
            Err(e) => Err(std::io::Error::other(format!("Scheduler task failed: {}", e))),
        }
    }
}
