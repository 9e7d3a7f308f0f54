//! Oldest-first allocation of money against open billing periods.

use chrono::NaiveDate;
use tracing::{info, instrument};

use crate::billing::periods::refresh_subscription_periods;
use crate::billing::status::resolve_period_status;
use crate::error::BillingError;
use crate::models::{BillingPeriod, Subscription};
use crate::repository::{BillingPeriodRepository, SubscriptionBalanceRepository};

/// Cents applied to one period, with the period as persisted afterwards.
#[derive(Debug, Clone)]
pub struct AppliedAmount {
    pub period: BillingPeriod,
    pub applied_cents: i64,
}

impl AppliedAmount {
    pub fn settled(&self) -> bool {
        self.period.amount_paid_cents >= self.period.amount_due_cents
    }
}

/// Outcome of spreading an amount over open periods.
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub applied: Vec<AppliedAmount>,
    /// Cents left over once every open period was satisfied.
    pub remaining_cents: i64,
}

/// Apply `amount_cents` to `periods`, oldest first, persisting each touched
/// period. Periods with nothing left to pay are skipped.
pub async fn allocate_oldest_first(
    repo: &dyn BillingPeriodRepository,
    mut periods: Vec<BillingPeriod>,
    amount_cents: i64,
    payment_day: u32,
    today: NaiveDate,
) -> Result<Allocation, BillingError> {
    periods.sort_by_key(|p| p.period_start);

    let mut remaining = amount_cents.max(0);
    let mut applied = Vec::new();

    for mut period in periods {
        if remaining == 0 {
            break;
        }
        let owed = period.remaining_cents();
        if owed <= 0 {
            continue;
        }

        let portion = remaining.min(owed);
        period.amount_paid_cents += portion;
        period.status = resolve_period_status(&period, today, payment_day);
        let period = repo.update(&period).await?;

        remaining -= portion;
        applied.push(AppliedAmount {
            period,
            applied_cents: portion,
        });
    }

    Ok(Allocation {
        applied,
        remaining_cents: remaining,
    })
}

/// Spend the subscription's stored credit on its open periods.
///
/// Does nothing when either repository is missing or there is no credit.
/// Returns the cents consumed.
#[instrument(skip_all, fields(subscription_id = %subscription.subscription_id))]
pub async fn apply_stored_credit(
    balances: Option<&dyn SubscriptionBalanceRepository>,
    periods: Option<&dyn BillingPeriodRepository>,
    subscription: &Subscription,
    today: NaiveDate,
) -> Result<i64, BillingError> {
    let (Some(balances), Some(periods)) = (balances, periods) else {
        return Ok(0);
    };

    let balance = balances.get(subscription.subscription_id).await?;
    if balance.credit_cents <= 0 {
        return Ok(0);
    }

    let payment_day = subscription.effective_payment_day()?;
    refresh_subscription_periods(periods, subscription.subscription_id, payment_day, today)
        .await?;
    let open = periods
        .list_open_by_subscription(subscription.subscription_id)
        .await?;

    let allocation =
        allocate_oldest_first(periods, open, balance.credit_cents, payment_day, today).await?;

    let consumed = balance.credit_cents - allocation.remaining_cents;
    if consumed > 0 {
        balances
            .set(subscription.subscription_id, allocation.remaining_cents)
            .await?;
        info!(
            consumed_cents = consumed,
            remaining_credit_cents = allocation.remaining_cents,
            periods = allocation.applied.len(),
            "Stored credit applied"
        );
    }

    Ok(consumed)
}
