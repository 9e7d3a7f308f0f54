//! Billing period generation and renewal.

use chrono::{Days, NaiveDate};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::billing::status::{due_date, resolve_period_status, resolve_status};
use crate::error::BillingError;
use crate::models::{BillingPeriod, NewBillingPeriod, Plan, Subscription};
use crate::repository::BillingPeriodRepository;

/// Start of the period following `last`: the day after its due date, pushed
/// forward to `last.period_end` so periods never overlap.
pub fn next_period_start(last: &BillingPeriod, payment_day: u32) -> NaiveDate {
    let after_due = due_date(last.period_start, payment_day) + Days::new(1);
    after_due.max(last.period_end)
}

fn build_period(
    subscription: &Subscription,
    start: NaiveDate,
    duration_days: u64,
    price_cents: i64,
    payment_day: u32,
    today: NaiveDate,
) -> NewBillingPeriod {
    NewBillingPeriod {
        subscription_id: subscription.subscription_id,
        period_start: start,
        period_end: start + Days::new(duration_days),
        amount_due_cents: price_cents,
        amount_paid_cents: 0,
        status: resolve_status(price_cents, 0, start, today, payment_day),
    }
}

/// Create `period`, or return the row a concurrent writer created first.
async fn create_or_reread(
    repo: &dyn BillingPeriodRepository,
    period: &NewBillingPeriod,
) -> Result<BillingPeriod, BillingError> {
    match repo.create(period).await {
        Ok(created) => {
            info!(
                subscription_id = %created.subscription_id,
                period_id = %created.period_id,
                period_start = %created.period_start,
                "Billing period created"
            );
            Ok(created)
        }
        Err(err) if err.is_conflict() => {
            debug!(
                subscription_id = %period.subscription_id,
                period_start = %period.period_start,
                "Billing period already exists, re-reading"
            );
            repo.list_by_subscription(period.subscription_id)
                .await?
                .into_iter()
                .find(|p| p.period_start == period.period_start)
                .ok_or_else(|| {
                    BillingError::Conflict(format!(
                        "billing period starting {} conflicted but could not be read back",
                        period.period_start
                    ))
                })
        }
        Err(err) => Err(err),
    }
}

/// Make sure the subscription has every period it owes as of `today`.
///
/// Creates the first period when none exist and, for auto-renewing
/// subscriptions, each following period whose start is not after `today`.
/// Stored statuses that drifted with time are corrected. Returns all periods,
/// oldest first.
pub async fn ensure_billing_periods(
    repo: &dyn BillingPeriodRepository,
    subscription: &Subscription,
    plan: &Plan,
    today: NaiveDate,
) -> Result<Vec<BillingPeriod>, BillingError> {
    ensure_billing_periods_through(repo, subscription, plan, today, today).await
}

/// Like [`ensure_billing_periods`], but only creates periods starting on or
/// before `through`. Statuses are still resolved against `today`.
#[instrument(skip_all, fields(subscription_id = %subscription.subscription_id, through = %through, today = %today))]
pub async fn ensure_billing_periods_through(
    repo: &dyn BillingPeriodRepository,
    subscription: &Subscription,
    plan: &Plan,
    through: NaiveDate,
    today: NaiveDate,
) -> Result<Vec<BillingPeriod>, BillingError> {
    if plan.duration_days <= 0 {
        return Err(BillingError::validation(format!(
            "plan {} has non-positive duration",
            plan.plan_id
        )));
    }
    let duration_days = plan.duration_days as u64;
    let price_cents = subscription.effective_price_cents(plan)?;
    let payment_day = subscription.effective_payment_day()?;

    let mut periods = repo
        .list_by_subscription(subscription.subscription_id)
        .await?;

    if subscription.status.is_terminal() {
        return refresh_period_statuses(repo, periods, payment_day, today).await;
    }

    if periods.is_empty() {
        let first = build_period(
            subscription,
            subscription.start_date,
            duration_days,
            price_cents,
            payment_day,
            today,
        );
        periods.push(create_or_reread(repo, &first).await?);
    }

    periods.sort_by_key(|p| p.period_start);

    if subscription.auto_renew {
        let mut last = periods.last().cloned();
        while let Some(current) = last.take() {
            let start = next_period_start(&current, payment_day);
            if start > through {
                break;
            }

            let next = match periods.iter().find(|p| p.period_start == start) {
                Some(existing) => existing.clone(),
                None => {
                    let period = build_period(
                        subscription,
                        start,
                        duration_days,
                        price_cents,
                        payment_day,
                        today,
                    );
                    let created = create_or_reread(repo, &period).await?;
                    periods.push(created.clone());
                    created
                }
            };
            last = Some(next);
        }
        periods.sort_by_key(|p| p.period_start);
    }

    refresh_period_statuses(repo, periods, payment_day, today).await
}

/// Persist a new status for every period whose stored one is stale.
pub async fn refresh_period_statuses(
    repo: &dyn BillingPeriodRepository,
    periods: Vec<BillingPeriod>,
    payment_day: u32,
    today: NaiveDate,
) -> Result<Vec<BillingPeriod>, BillingError> {
    let mut refreshed = Vec::with_capacity(periods.len());
    for mut period in periods {
        let status = resolve_period_status(&period, today, payment_day);
        if status != period.status {
            debug!(
                period_id = %period.period_id,
                from = period.status.as_str(),
                to = status.as_str(),
                "Billing period status changed"
            );
            period.status = status;
            period = repo.update(&period).await?;
        }
        refreshed.push(period);
    }
    Ok(refreshed)
}

/// Reload a subscription's periods and correct stale statuses.
pub async fn refresh_subscription_periods(
    repo: &dyn BillingPeriodRepository,
    subscription_id: Uuid,
    payment_day: u32,
    today: NaiveDate,
) -> Result<Vec<BillingPeriod>, BillingError> {
    let periods = repo.list_by_subscription(subscription_id).await?;
    refresh_period_statuses(repo, periods, payment_day, today).await
}
