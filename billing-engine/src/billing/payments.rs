//! Payment registration, editing and reversal.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::billing::balance::{AppliedAmount, allocate_oldest_first, apply_stored_credit};
use crate::billing::periods::{ensure_billing_periods_through, refresh_subscription_periods};
use crate::billing::status::resolve_period_status;
use crate::clock::Clock;
use crate::error::BillingError;
use crate::models::{
    NewPayment, NewPaymentAllocation, Payment, PaymentKind, PaymentMethod, PaymentStatus,
    RegisterPayment, UpdatePayment,
};
use crate::repository::Repositories;
use crate::services::metrics::BillingMetrics;
use crate::services::transaction::TransactionRunner;

/// Classify what a payment did, given the periods it touched and the cents
/// left over as credit.
///
/// A payment that touched several periods and still left a surplus is an
/// advance, as long as none of the touched periods stays short.
pub fn classify_payment(applied: &[AppliedAmount], credit_cents: i64) -> PaymentKind {
    if applied.is_empty() {
        PaymentKind::Credit
    } else if applied.iter().any(|a| !a.settled()) {
        PaymentKind::Partial
    } else if credit_cents > 0 {
        PaymentKind::Advance
    } else {
        PaymentKind::Full
    }
}

/// Validated registration request.
#[derive(Debug, Clone)]
struct Registration {
    subscription_id: Uuid,
    amount_cents: i64,
    method: PaymentMethod,
    status: PaymentStatus,
    paid_at: DateTime<Utc>,
    /// Day period statuses are resolved against.
    today: NaiveDate,
    reference: Option<String>,
    notes: Option<String>,
    idempotency_key: Option<String>,
}

pub struct PaymentEngine {
    runner: TransactionRunner,
    clock: Arc<dyn Clock>,
    metrics: Arc<BillingMetrics>,
}

impl PaymentEngine {
    pub fn new(
        runner: TransactionRunner,
        clock: Arc<dyn Clock>,
        metrics: Arc<BillingMetrics>,
    ) -> Self {
        Self {
            runner,
            clock,
            metrics,
        }
    }

    fn validate(&self, input: RegisterPayment) -> Result<Registration, BillingError> {
        let subscription_id = input
            .subscription_id
            .ok_or_else(|| BillingError::validation("subscription id is required"))?;
        if input.amount_cents <= 0 {
            return Err(BillingError::validation("amount must be positive"));
        }

        let method: PaymentMethod = input.method.trim().parse()?;
        let status = match input.status.as_deref().map(str::trim) {
            None | Some("") => PaymentStatus::Confirmed,
            Some(raw) => raw.parse()?,
        };
        if status == PaymentStatus::Reversed {
            return Err(BillingError::validation(
                "a payment cannot be registered as reversed",
            ));
        }

        let idempotency_key = input
            .idempotency_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        Ok(Registration {
            subscription_id,
            amount_cents: input.amount_cents,
            method,
            status,
            paid_at: input.paid_at.unwrap_or_else(|| self.clock.now()),
            today: self.clock.today(),
            reference: input.reference,
            notes: input.notes,
            idempotency_key,
        })
    }

    /// Record a payment and spread it over the subscription's open periods.
    ///
    /// Registering again with the same idempotency key returns the payment
    /// recorded the first time.
    #[instrument(skip_all, fields(subscription_id = ?input.subscription_id, amount_cents = input.amount_cents))]
    pub async fn register(&self, input: RegisterPayment) -> Result<Payment, BillingError> {
        let registration = self.validate(input)?;

        let result = self
            .runner
            .run("register_payment", |repos| {
                let registration = registration.clone();
                async move { register_in(&repos, registration).await }
            })
            .await;

        let (payment, created) = match result {
            Err(BillingError::Conflict(msg)) => match &registration.idempotency_key {
                // Lost the race for the idempotency key: hand back the winner.
                Some(key) => {
                    let winner = self
                        .find_by_idempotency_key(key)
                        .await?
                        .ok_or(BillingError::Conflict(msg))?;
                    (winner, false)
                }
                None => return Err(BillingError::Conflict(msg)),
            },
            other => other?,
        };

        if created {
            self.metrics.record_payment_registered(payment.kind.as_str());
        }

        Ok(payment)
    }

    /// Edit the descriptive fields of a payment.
    ///
    /// Amount, subscription and payment time are fixed once recorded; change
    /// them by reversing and registering again. Setting the status to
    /// `reversed` reverses the payment.
    #[instrument(skip_all, fields(payment_id = %input.payment_id))]
    pub async fn update(&self, input: UpdatePayment) -> Result<Payment, BillingError> {
        let method = match input.method.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<PaymentMethod>()?),
        };
        let status = match input.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<PaymentStatus>()?),
        };
        let today = self.clock.today();

        let (payment, reversed) = self
            .runner
            .run("update_payment", |repos| {
                let input = input.clone();
                async move {
                    let payments = repos.payments()?;
                    let mut payment = payments.find_by_id(input.payment_id).await?;

                    if input.amount_cents.is_some_and(|a| a != payment.amount_cents) {
                        return Err(BillingError::validation(
                            "payment amount cannot be changed; reverse it and register a new payment",
                        ));
                    }
                    if input
                        .subscription_id
                        .is_some_and(|s| s != payment.subscription_id)
                    {
                        return Err(BillingError::validation(
                            "payment subscription cannot be changed",
                        ));
                    }
                    if input.paid_at.is_some_and(|p| p != payment.paid_at) {
                        return Err(BillingError::validation(
                            "payment date cannot be changed",
                        ));
                    }

                    let reverse = match (payment.status, status) {
                        (PaymentStatus::Reversed, Some(PaymentStatus::Confirmed)) => {
                            return Err(BillingError::validation(
                                "a reversed payment cannot be confirmed again",
                            ));
                        }
                        (PaymentStatus::Confirmed, Some(PaymentStatus::Reversed)) => true,
                        _ => false,
                    };

                    if let Some(method) = method {
                        payment.method = method;
                    }
                    if input.reference.is_some() {
                        payment.reference = input.reference;
                    }
                    if input.notes.is_some() {
                        payment.notes = input.notes;
                    }
                    let payment = payments.update(&payment).await?;

                    if reverse {
                        Ok((reverse_in(&repos, payment, today).await?, true))
                    } else {
                        Ok((payment, false))
                    }
                }
            })
            .await?;

        if reversed {
            self.metrics.record_payment_reversed();
        }
        info!(payment_id = %payment.payment_id, status = payment.status.as_str(), "Payment updated");
        Ok(payment)
    }

    /// Undo a payment's effect on periods and stored credit. Reversing an
    /// already reversed payment changes nothing.
    #[instrument(skip(self))]
    pub async fn reverse(&self, payment_id: Uuid) -> Result<Payment, BillingError> {
        let today = self.clock.today();

        let (payment, changed) = self
            .runner
            .run("reverse_payment", |repos| async move {
                let payment = repos.payments()?.find_by_id(payment_id).await?;
                if payment.status == PaymentStatus::Reversed {
                    return Ok((payment, false));
                }
                Ok((reverse_in(&repos, payment, today).await?, true))
            })
            .await?;

        if changed {
            self.metrics.record_payment_reversed();
        } else {
            info!(payment_id = %payment_id, "Payment already reversed");
        }
        Ok(payment)
    }

    pub async fn find_by_id(&self, payment_id: Uuid) -> Result<Payment, BillingError> {
        self.runner
            .run("find_payment", |repos| async move {
                repos.payments()?.find_by_id(payment_id).await
            })
            .await
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>, BillingError> {
        self.runner
            .run("find_payment_by_key", |repos| async move {
                repos.payments()?.find_by_idempotency_key(key).await
            })
            .await
    }

    pub async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<Payment>, BillingError> {
        self.runner
            .run("list_payments", |repos| async move {
                repos.payments()?.list_by_subscription(subscription_id).await
            })
            .await
    }

    pub async fn list_by_period(&self, period_id: Uuid) -> Result<Vec<Payment>, BillingError> {
        self.runner
            .run("list_period_payments", |repos| async move {
                repos.payments()?.list_by_period(period_id).await
            })
            .await
    }

    /// Payments received in `[start, end)`.
    pub async fn list_paid_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>, BillingError> {
        if end <= start {
            return Err(BillingError::validation("range end must be after its start"));
        }
        self.runner
            .run("list_payments_between", |repos| async move {
                repos.payments()?.list_paid_between(start, end).await
            })
            .await
    }
}

/// Returns the payment and whether this call created it.
async fn register_in(
    repos: &Repositories,
    registration: Registration,
) -> Result<(Payment, bool), BillingError> {
    let payments = repos.payments()?;
    if let Some(key) = &registration.idempotency_key {
        if let Some(existing) = payments.find_by_idempotency_key(key).await? {
            info!(
                payment_id = %existing.payment_id,
                idempotency_key = %key,
                "Payment already registered"
            );
            return Ok((existing, false));
        }
    }

    let subscriptions = repos.subscriptions()?;
    let plans = repos.plans()?;
    let periods = repos.periods()?;
    let balances = repos.balances()?;
    let allocations = repos.allocations()?;

    let subscription = subscriptions.find_by_id(registration.subscription_id).await?;
    let plan = plans.find_by_id(subscription.plan_id).await?;
    let today = registration.today;
    let payment_day = subscription.effective_payment_day()?;

    ensure_billing_periods_through(
        periods,
        &subscription,
        &plan,
        registration.paid_at.date_naive(),
        today,
    )
    .await?;
    apply_stored_credit(Some(balances), Some(periods), &subscription, today).await?;

    let open = periods
        .list_open_by_subscription(subscription.subscription_id)
        .await?;
    let allocation = allocate_oldest_first(
        periods,
        open,
        registration.amount_cents,
        payment_day,
        today,
    )
    .await?;
    let kind = classify_payment(&allocation.applied, allocation.remaining_cents);

    let payment = payments
        .create(&NewPayment {
            subscription_id: subscription.subscription_id,
            paid_at: registration.paid_at,
            amount_cents: registration.amount_cents,
            method: registration.method,
            reference: registration.reference,
            notes: registration.notes,
            status: registration.status,
            kind,
            credit_cents: allocation.remaining_cents,
            idempotency_key: registration.idempotency_key,
        })
        .await?;

    for applied in &allocation.applied {
        allocations
            .create(&NewPaymentAllocation {
                payment_id: payment.payment_id,
                period_id: applied.period.period_id,
                amount_cents: applied.applied_cents,
            })
            .await?;
    }

    if allocation.remaining_cents > 0 {
        balances
            .add(subscription.subscription_id, allocation.remaining_cents)
            .await?;
    }

    info!(
        payment_id = %payment.payment_id,
        kind = kind.as_str(),
        periods = allocation.applied.len(),
        credit_cents = allocation.remaining_cents,
        "Payment registered"
    );
    Ok((payment, true))
}

/// Roll back allocations and generated credit, then mark the payment reversed.
async fn reverse_in(
    repos: &Repositories,
    mut payment: Payment,
    today: NaiveDate,
) -> Result<Payment, BillingError> {
    let allocations = repos.allocations()?;
    let rows = allocations.list_by_payment(payment.payment_id).await?;

    if !rows.is_empty() {
        let periods = repos.periods()?;
        let subscription = repos
            .subscriptions()?
            .find_by_id(payment.subscription_id)
            .await?;
        let payment_day = subscription.effective_payment_day()?;

        let mut by_id: HashMap<Uuid, _> = periods
            .list_by_subscription(payment.subscription_id)
            .await?
            .into_iter()
            .map(|p| (p.period_id, p))
            .collect();

        for row in &rows {
            let Some(period) = by_id.get_mut(&row.period_id) else {
                warn!(
                    payment_id = %payment.payment_id,
                    period_id = %row.period_id,
                    "Allocated period not found, skipping"
                );
                continue;
            };
            period.amount_paid_cents = (period.amount_paid_cents - row.amount_cents).max(0);
            period.status = resolve_period_status(period, today, payment_day);
            *period = periods.update(period).await?;
        }

        allocations.delete_by_payment(payment.payment_id).await?;
        refresh_subscription_periods(periods, payment.subscription_id, payment_day, today)
            .await?;
    }

    if payment.credit_cents > 0 {
        repos
            .balances()?
            .add(payment.subscription_id, -payment.credit_cents)
            .await?;
    }

    payment.status = PaymentStatus::Reversed;
    let payment = repos.payments()?.update(&payment).await?;

    info!(
        payment_id = %payment.payment_id,
        allocations = rows.len(),
        credit_cents = payment.credit_cents,
        "Payment reversed"
    );
    Ok(payment)
}
