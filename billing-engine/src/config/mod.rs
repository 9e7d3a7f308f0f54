use dotenvy::dotenv;
use secrecy::Secret;
use service_core::config::ServerConfig;
use service_core::error::AppError;
use service_core::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::schedule::DailySchedule;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub service_name: String,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub schedule: ScheduleConfig,
    pub retry: RetryConfig,
    pub shutdown_grace_secs: u64,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub hour: u32,
    pub minute: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

/// Parse `raw`, falling back to `default` when absent or malformed.
fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    parse_or(env::var(key).ok(), default)
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let db_url = env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AppError::ConfigError(anyhow::anyhow!("DATABASE_URL must be set")))?;

        let server = match ServerConfig::load() {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!(error = %e, "Falling back to default server settings");
                ServerConfig::default()
            }
        };

        let config = Self {
            service_name: "billing-engine".to_string(),
            server,
            database: DatabaseConfig {
                url: Secret::new(db_url),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 1),
            },
            schedule: ScheduleConfig {
                hour: env_or("RENEWAL_HOUR", 0),
                minute: env_or("RENEWAL_MINUTE", 5),
            },
            retry: RetryConfig {
                max_attempts: env_or("TX_MAX_ATTEMPTS", 3),
                base_delay_ms: env_or("TX_RETRY_BASE_DELAY_MS", 25),
            },
            shutdown_grace_secs: env_or("SHUTDOWN_GRACE_SECS", 10),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
        };

        config.daily_schedule()?;
        Ok(config)
    }

    pub fn daily_schedule(&self) -> Result<DailySchedule, AppError> {
        DailySchedule::new(self.schedule.hour, self.schedule.minute)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e.to_string())))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
        )
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
