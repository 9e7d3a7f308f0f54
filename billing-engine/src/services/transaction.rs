//! Serializable unit-of-work execution with conflict retries.

use async_trait::async_trait;
use service_core::retry::{RetryError, RetryPolicy, retry_async};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::BillingError;
use crate::repository::Repositories;
use crate::services::metrics::BillingMetrics;

/// One all-or-nothing unit of work. Every repository in the bundle it hands
/// out reads and writes through the same transaction.
#[async_trait]
pub trait UnitOfWork: Send {
    fn repositories(&self) -> Arc<Repositories>;

    async fn commit(self: Box<Self>) -> Result<(), BillingError>;

    async fn rollback(self: Box<Self>) -> Result<(), BillingError>;
}

/// Starts units of work at the strictest isolation level the store offers.
#[async_trait]
pub trait UnitOfWorkFactory: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, BillingError>;
}

/// Runs closures inside a fresh unit of work, replaying them from scratch
/// when the store reports a serialization failure.
#[derive(Clone)]
pub struct TransactionRunner {
    factory: Arc<dyn UnitOfWorkFactory>,
    policy: RetryPolicy,
    metrics: Option<Arc<BillingMetrics>>,
}

impl TransactionRunner {
    pub fn new(factory: Arc<dyn UnitOfWorkFactory>, policy: RetryPolicy) -> Self {
        Self {
            factory,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BillingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `work` until it commits, fails with a non-retryable error, or the
    /// attempt budget is spent (`RetryLimitExceeded`).
    pub async fn run<T, F, Fut>(&self, operation: &str, work: F) -> Result<T, BillingError>
    where
        T: Send,
        F: Fn(Arc<Repositories>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BillingError>> + Send,
    {
        let outcome = retry_async(
            &self.policy,
            operation,
            BillingError::is_retryable,
            |attempt| {
                let work = &work;
                async move { self.attempt(operation, attempt, work).await }
            },
        )
        .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(RetryError::Exhausted { attempts, .. }) => {
                Err(BillingError::RetryLimitExceeded { attempts })
            }
            Err(RetryError::Permanent(err)) => Err(err),
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        operation: &str,
        attempt: u32,
        work: &F,
    ) -> Result<T, BillingError>
    where
        F: Fn(Arc<Repositories>) -> Fut,
        Fut: Future<Output = Result<T, BillingError>>,
    {
        if attempt > 1 {
            if let Some(metrics) = &self.metrics {
                metrics.record_tx_retry();
            }
        }

        let unit = self.factory.begin().await?;
        debug!(operation = operation, attempt = attempt, "Unit of work started");

        match work(unit.repositories()).await {
            Ok(value) => {
                unit.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = unit.rollback().await {
                    warn!(
                        operation = operation,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                Err(err)
            }
        }
    }
}
