//! Daily renewal of auto-renewing subscriptions.

use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::billing::balance::apply_stored_credit;
use crate::billing::periods::ensure_billing_periods;
use crate::clock::Clock;
use crate::error::BillingError;
use crate::models::Subscription;
use crate::repository::Repositories;
use crate::services::lock::{DistributedLock, LockOutcome, run_exclusive};
use crate::services::metrics::BillingMetrics;
use crate::services::transaction::TransactionRunner;

/// Lock name shared by every instance running the renewal job.
pub const RENEWAL_LOCK_NAME: &str = "billing:renewal_job";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalSummary {
    pub today: NaiveDate,
    pub subscriptions: usize,
}

pub struct RenewalJob {
    repositories: Repositories,
    runner: Option<TransactionRunner>,
    clock: Arc<dyn Clock>,
    metrics: Arc<BillingMetrics>,
}

impl RenewalJob {
    pub fn new(
        repositories: Repositories,
        clock: Arc<dyn Clock>,
        metrics: Arc<BillingMetrics>,
    ) -> Self {
        Self {
            repositories,
            runner: None,
            clock,
            metrics,
        }
    }

    /// Process each subscription inside its own serializable unit of work.
    pub fn with_runner(mut self, runner: TransactionRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Bring every auto-renewing subscription's periods and credit up to date.
    ///
    /// Stops at the first failing subscription.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RenewalSummary, BillingError> {
        let started = Instant::now();
        let result = self.run_batch(cancel).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(BillingError::Cancelled) => "cancelled",
            Err(_) => "failure",
        };
        self.metrics
            .record_renewal_run(outcome, Some(started.elapsed()));

        match &result {
            Ok(summary) => info!(
                today = %summary.today,
                subscriptions = summary.subscriptions,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Renewal job completed"
            ),
            Err(BillingError::Cancelled) => info!("Renewal job cancelled"),
            Err(e) => error!(error = %e, kind = e.kind(), "Renewal job failed"),
        }
        result
    }

    /// Run only when no other instance holds the renewal lock.
    pub async fn run_locked(
        &self,
        lock: &dyn DistributedLock,
        cancel: &CancellationToken,
    ) -> Result<LockOutcome<RenewalSummary>, BillingError> {
        let outcome = run_exclusive(lock, RENEWAL_LOCK_NAME, || self.run(cancel)).await?;
        if outcome == LockOutcome::Skipped {
            self.metrics.record_renewal_run("skipped", None);
        }
        Ok(outcome)
    }

    async fn run_batch(&self, cancel: &CancellationToken) -> Result<RenewalSummary, BillingError> {
        let subscriptions = self.repositories.subscriptions()?;
        self.repositories.plans()?;
        self.repositories.periods()?;

        let today = self.clock.today();
        let due = subscriptions.list_auto_renew().await?;
        info!(today = %today, subscriptions = due.len(), "Renewal job started");

        for subscription in &due {
            if cancel.is_cancelled() {
                return Err(BillingError::Cancelled);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(BillingError::Cancelled),
                result = self.renew(subscription, today) => result?,
            }
            self.metrics.record_renewed_subscription();
        }

        Ok(RenewalSummary {
            today,
            subscriptions: due.len(),
        })
    }

    async fn renew(&self, subscription: &Subscription, today: NaiveDate) -> Result<(), BillingError> {
        match &self.runner {
            Some(runner) => {
                runner
                    .run("renew_subscription", |repos| {
                        let subscription = subscription.clone();
                        async move { renew_subscription(&repos, &subscription, today).await }
                    })
                    .await
            }
            None => renew_subscription(&self.repositories, subscription, today).await,
        }
    }
}

#[instrument(skip_all, fields(subscription_id = %subscription.subscription_id))]
async fn renew_subscription(
    repos: &Repositories,
    subscription: &Subscription,
    today: NaiveDate,
) -> Result<(), BillingError> {
    let plan = repos.plans()?.find_by_id(subscription.plan_id).await?;
    let periods = ensure_billing_periods(repos.periods()?, subscription, &plan, today).await?;
    let consumed = apply_stored_credit(
        repos.balances.as_deref(),
        repos.periods.as_deref(),
        subscription,
        today,
    )
    .await?;

    info!(
        periods = periods.len(),
        credit_applied_cents = consumed,
        "Subscription renewed"
    );
    Ok(())
}
