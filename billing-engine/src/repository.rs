//! Storage contracts consumed by the billing core.
//!
//! Adapters implement these traits; the core only ever sees them through a
//! [`Repositories`] bundle, which the transaction runner binds to one unit of
//! work and passes to the operation explicitly.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::{
    BillingPeriod, CreateSubscription, NewBillingPeriod, NewPayment, NewPaymentAllocation,
    Payment, PaymentAllocation, Plan, Subscription, SubscriptionBalance,
};

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn create(&self, input: &CreateSubscription) -> Result<Subscription, BillingError>;

    async fn update(&self, subscription: &Subscription) -> Result<Subscription, BillingError>;

    /// Fails with `NotFound` when the subscription does not exist.
    async fn find_by_id(&self, subscription_id: Uuid) -> Result<Subscription, BillingError>;

    async fn list_by_customer(&self, customer_id: Uuid) -> Result<Vec<Subscription>, BillingError>;

    async fn list_by_plan(&self, plan_id: Uuid) -> Result<Vec<Subscription>, BillingError>;

    /// Subscriptions whose end date falls in `[start, end]`.
    async fn list_due_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Subscription>, BillingError>;

    /// Auto-renewing subscriptions that are not ended or canceled.
    async fn list_auto_renew(&self) -> Result<Vec<Subscription>, BillingError>;
}

#[async_trait]
pub trait PlanRepository: Send + Sync {
    /// Fails with `NotFound` when the plan does not exist.
    async fn find_by_id(&self, plan_id: Uuid) -> Result<Plan, BillingError>;

    async fn list_active(&self) -> Result<Vec<Plan>, BillingError>;
}

#[async_trait]
pub trait BillingPeriodRepository: Send + Sync {
    /// Fails with `Conflict` when the subscription already has a period
    /// starting on the same day.
    async fn create(&self, period: &NewBillingPeriod) -> Result<BillingPeriod, BillingError>;

    /// Persists paid amount and status.
    async fn update(&self, period: &BillingPeriod) -> Result<BillingPeriod, BillingError>;

    /// All periods of a subscription, oldest first.
    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<BillingPeriod>, BillingError>;

    /// Periods not yet `paid`, oldest first.
    async fn list_open_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<BillingPeriod>, BillingError>;

    /// Flags unpaid `open` periods that ended on or before `today` as
    /// overdue. Returns the number of rows changed.
    async fn mark_overdue(&self, subscription_id: Uuid, today: NaiveDate)
    -> Result<u64, BillingError>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Fails with `Conflict` when the idempotency key is already taken.
    async fn create(&self, payment: &NewPayment) -> Result<Payment, BillingError>;

    async fn update(&self, payment: &Payment) -> Result<Payment, BillingError>;

    /// Fails with `NotFound` when the payment does not exist.
    async fn find_by_id(&self, payment_id: Uuid) -> Result<Payment, BillingError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>, BillingError>;

    async fn list_by_subscription(&self, subscription_id: Uuid)
    -> Result<Vec<Payment>, BillingError>;

    /// Payments holding an allocation against the given period.
    async fn list_by_period(&self, period_id: Uuid) -> Result<Vec<Payment>, BillingError>;

    /// Payments with `paid_at` in `[start, end)`.
    async fn list_paid_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>, BillingError>;
}

#[async_trait]
pub trait PaymentAllocationRepository: Send + Sync {
    async fn create(
        &self,
        allocation: &NewPaymentAllocation,
    ) -> Result<PaymentAllocation, BillingError>;

    async fn list_by_payment(&self, payment_id: Uuid)
    -> Result<Vec<PaymentAllocation>, BillingError>;

    async fn delete_by_payment(&self, payment_id: Uuid) -> Result<u64, BillingError>;
}

#[async_trait]
pub trait SubscriptionBalanceRepository: Send + Sync {
    /// Missing rows read as zero credit.
    async fn get(&self, subscription_id: Uuid) -> Result<SubscriptionBalance, BillingError>;

    async fn set(
        &self,
        subscription_id: Uuid,
        credit_cents: i64,
    ) -> Result<SubscriptionBalance, BillingError>;

    /// Adds `delta` (possibly negative); the stored credit is floored at zero.
    async fn add(
        &self,
        subscription_id: Uuid,
        delta: i64,
    ) -> Result<SubscriptionBalance, BillingError>;
}

/// The repositories one operation may touch. Any member can be left out;
/// operations that need it fail with a configuration error.
#[derive(Clone, Default)]
pub struct Repositories {
    pub subscriptions: Option<Arc<dyn SubscriptionRepository>>,
    pub plans: Option<Arc<dyn PlanRepository>>,
    pub periods: Option<Arc<dyn BillingPeriodRepository>>,
    pub payments: Option<Arc<dyn PaymentRepository>>,
    pub allocations: Option<Arc<dyn PaymentAllocationRepository>>,
    pub balances: Option<Arc<dyn SubscriptionBalanceRepository>>,
}

fn missing(name: &str) -> BillingError {
    BillingError::configuration(format!("{} repository is not configured", name))
}

impl Repositories {
    pub fn with_subscriptions(mut self, repo: Arc<dyn SubscriptionRepository>) -> Self {
        self.subscriptions = Some(repo);
        self
    }

    pub fn with_plans(mut self, repo: Arc<dyn PlanRepository>) -> Self {
        self.plans = Some(repo);
        self
    }

    pub fn with_periods(mut self, repo: Arc<dyn BillingPeriodRepository>) -> Self {
        self.periods = Some(repo);
        self
    }

    pub fn with_payments(mut self, repo: Arc<dyn PaymentRepository>) -> Self {
        self.payments = Some(repo);
        self
    }

    pub fn with_allocations(mut self, repo: Arc<dyn PaymentAllocationRepository>) -> Self {
        self.allocations = Some(repo);
        self
    }

    pub fn with_balances(mut self, repo: Arc<dyn SubscriptionBalanceRepository>) -> Self {
        self.balances = Some(repo);
        self
    }

    pub fn subscriptions(&self) -> Result<&dyn SubscriptionRepository, BillingError> {
        self.subscriptions
            .as_deref()
            .ok_or_else(|| missing("subscription"))
    }

    pub fn plans(&self) -> Result<&dyn PlanRepository, BillingError> {
        self.plans.as_deref().ok_or_else(|| missing("plan"))
    }

    pub fn periods(&self) -> Result<&dyn BillingPeriodRepository, BillingError> {
        self.periods
            .as_deref()
            .ok_or_else(|| missing("billing period"))
    }

    pub fn payments(&self) -> Result<&dyn PaymentRepository, BillingError> {
        self.payments.as_deref().ok_or_else(|| missing("payment"))
    }

    pub fn allocations(&self) -> Result<&dyn PaymentAllocationRepository, BillingError> {
        self.allocations
            .as_deref()
            .ok_or_else(|| missing("payment allocation"))
    }

    pub fn balances(&self) -> Result<&dyn SubscriptionBalanceRepository, BillingError> {
        self.balances
            .as_deref()
            .ok_or_else(|| missing("subscription balance"))
    }
}
