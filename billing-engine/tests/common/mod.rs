//! Test helper module for billing-engine integration tests.
//!
//! Provides in-memory repositories, a snapshot-based unit of work with
//! injectable serialization failures, an in-memory lock and fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use billing_engine::billing::PaymentEngine;
use billing_engine::clock::FixedClock;
use billing_engine::error::BillingError;
use billing_engine::models::{
    BillingPeriod, BillingPeriodStatus, CreateSubscription, NewBillingPeriod, NewPayment,
    NewPaymentAllocation, Payment, PaymentAllocation, Plan, Subscription, SubscriptionBalance,
    SubscriptionStatus,
};
use billing_engine::repository::{
    BillingPeriodRepository, PaymentAllocationRepository, PaymentRepository, PlanRepository,
    Repositories, SubscriptionBalanceRepository, SubscriptionRepository,
};
use billing_engine::services::{
    BillingMetrics, DistributedLock, LockLease, TransactionRunner, UnitOfWork,
    UnitOfWorkFactory,
};
use chrono::{DateTime, NaiveDate, Utc};
use service_core::retry::RetryPolicy;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn noon(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(12, 0, 0).unwrap().and_utc()
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Clone, Default)]
pub struct Store {
    pub subscriptions: HashMap<Uuid, Subscription>,
    pub plans: HashMap<Uuid, Plan>,
    pub periods: HashMap<Uuid, BillingPeriod>,
    pub payments: HashMap<Uuid, Payment>,
    pub allocations: Vec<PaymentAllocation>,
    pub balances: HashMap<Uuid, SubscriptionBalance>,
}

/// Implements every repository contract over one shared [`Store`].
#[derive(Clone, Default)]
pub struct MemoryRepos {
    store: Arc<Mutex<Store>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryRepos {
    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap()
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// A bundle with every repository present.
    pub fn bundle(&self) -> Repositories {
        let me = Arc::new(self.clone());
        Repositories::default()
            .with_subscriptions(me.clone())
            .with_plans(me.clone())
            .with_periods(me.clone())
            .with_payments(me.clone())
            .with_allocations(me.clone())
            .with_balances(me)
    }

    pub fn snapshot(&self) -> Store {
        self.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn insert_plan(&self, plan: Plan) {
        self.lock().plans.insert(plan.plan_id, plan);
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        self.lock()
            .subscriptions
            .insert(subscription.subscription_id, subscription);
    }

    pub fn insert_period(&self, period: BillingPeriod) {
        self.lock().periods.insert(period.period_id, period);
    }

    pub fn set_credit(&self, subscription_id: Uuid, credit_cents: i64) {
        self.lock().balances.insert(
            subscription_id,
            SubscriptionBalance {
                subscription_id,
                credit_cents,
                updated_utc: Some(Utc::now()),
            },
        );
    }

    pub fn periods_of(&self, subscription_id: Uuid) -> Vec<BillingPeriod> {
        let mut periods: Vec<_> = self
            .lock()
            .periods
            .values()
            .filter(|p| p.subscription_id == subscription_id)
            .cloned()
            .collect();
        periods.sort_by_key(|p| p.period_start);
        periods
    }

    pub fn credit_of(&self, subscription_id: Uuid) -> i64 {
        self.lock()
            .balances
            .get(&subscription_id)
            .map(|b| b.credit_cents)
            .unwrap_or(0)
    }

    pub fn allocations_of(&self, payment_id: Uuid) -> Vec<PaymentAllocation> {
        self.lock()
            .allocations
            .iter()
            .filter(|a| a.payment_id == payment_id)
            .cloned()
            .collect()
    }

    pub fn payment_count(&self) -> usize {
        self.lock().payments.len()
    }

    fn replace_with(&self, store: Store) {
        *self.lock() = store;
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryRepos {
    async fn create(&self, input: &CreateSubscription) -> Result<Subscription, BillingError> {
        let now = Utc::now();
        let subscription = Subscription {
            subscription_id: Uuid::new_v4(),
            customer_id: input.customer_id,
            plan_id: input.plan_id,
            start_date: input.start_date,
            end_date: input.end_date,
            status: SubscriptionStatus::Active,
            price_cents: input.price_cents,
            payment_day: input.payment_day,
            auto_renew: input.auto_renew,
            created_utc: now,
            updated_utc: now,
        };
        self.wrote();
        self.insert_subscription(subscription.clone());
        Ok(subscription)
    }

    async fn update(&self, subscription: &Subscription) -> Result<Subscription, BillingError> {
        let mut store = self.lock();
        let stored = store
            .subscriptions
            .get_mut(&subscription.subscription_id)
            .ok_or_else(|| BillingError::not_found("subscription"))?;
        *stored = subscription.clone();
        stored.updated_utc = Utc::now();
        self.wrote();
        Ok(stored.clone())
    }

    async fn find_by_id(&self, subscription_id: Uuid) -> Result<Subscription, BillingError> {
        self.lock()
            .subscriptions
            .get(&subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found(format!("subscription {}", subscription_id)))
    }

    async fn list_by_customer(&self, customer_id: Uuid) -> Result<Vec<Subscription>, BillingError> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn list_by_plan(&self, plan_id: Uuid) -> Result<Vec<Subscription>, BillingError> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.plan_id == plan_id)
            .cloned()
            .collect())
    }

    async fn list_due_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Subscription>, BillingError> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.end_date.is_some_and(|d| d >= start && d <= end))
            .cloned()
            .collect())
    }

    async fn list_auto_renew(&self) -> Result<Vec<Subscription>, BillingError> {
        let mut subscriptions: Vec<_> = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.auto_renew && !s.status.is_terminal())
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.created_utc);
        Ok(subscriptions)
    }
}

#[async_trait]
impl PlanRepository for MemoryRepos {
    async fn find_by_id(&self, plan_id: Uuid) -> Result<Plan, BillingError> {
        self.lock()
            .plans
            .get(&plan_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found(format!("plan {}", plan_id)))
    }

    async fn list_active(&self) -> Result<Vec<Plan>, BillingError> {
        Ok(self
            .lock()
            .plans
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BillingPeriodRepository for MemoryRepos {
    async fn create(&self, period: &NewBillingPeriod) -> Result<BillingPeriod, BillingError> {
        let mut store = self.lock();
        let exists = store.periods.values().any(|p| {
            p.subscription_id == period.subscription_id && p.period_start == period.period_start
        });
        if exists {
            return Err(BillingError::Conflict("duplicate period start".to_string()));
        }

        let now = Utc::now();
        let created = BillingPeriod {
            period_id: Uuid::new_v4(),
            subscription_id: period.subscription_id,
            period_start: period.period_start,
            period_end: period.period_end,
            amount_due_cents: period.amount_due_cents,
            amount_paid_cents: period.amount_paid_cents,
            status: period.status,
            created_utc: now,
            updated_utc: now,
        };
        store.periods.insert(created.period_id, created.clone());
        self.wrote();
        Ok(created)
    }

    async fn update(&self, period: &BillingPeriod) -> Result<BillingPeriod, BillingError> {
        let mut store = self.lock();
        let stored = store
            .periods
            .get_mut(&period.period_id)
            .ok_or_else(|| BillingError::not_found("billing period"))?;
        stored.amount_paid_cents = period.amount_paid_cents;
        stored.status = period.status;
        stored.updated_utc = Utc::now();
        self.wrote();
        Ok(stored.clone())
    }

    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<BillingPeriod>, BillingError> {
        Ok(self.periods_of(subscription_id))
    }

    async fn list_open_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<BillingPeriod>, BillingError> {
        Ok(self
            .periods_of(subscription_id)
            .into_iter()
            .filter(|p| p.status != BillingPeriodStatus::Paid)
            .collect())
    }

    async fn mark_overdue(
        &self,
        subscription_id: Uuid,
        today: NaiveDate,
    ) -> Result<u64, BillingError> {
        let mut store = self.lock();
        let mut changed = 0;
        for period in store.periods.values_mut() {
            if period.subscription_id == subscription_id
                && period.status == BillingPeriodStatus::Open
                && period.amount_paid_cents == 0
                && period.period_end <= today
            {
                period.status = BillingPeriodStatus::Overdue;
                changed += 1;
            }
        }
        if changed > 0 {
            self.wrote();
        }
        Ok(changed)
    }
}

#[async_trait]
impl PaymentRepository for MemoryRepos {
    async fn create(&self, payment: &NewPayment) -> Result<Payment, BillingError> {
        let mut store = self.lock();
        if let Some(key) = &payment.idempotency_key {
            if store
                .payments
                .values()
                .any(|p| p.idempotency_key.as_ref() == Some(key))
            {
                return Err(BillingError::Conflict("idempotency key already used".to_string()));
            }
        }

        let created = Payment {
            payment_id: Uuid::new_v4(),
            subscription_id: payment.subscription_id,
            paid_at: payment.paid_at,
            amount_cents: payment.amount_cents,
            method: payment.method,
            reference: payment.reference.clone(),
            notes: payment.notes.clone(),
            status: payment.status,
            kind: payment.kind,
            credit_cents: payment.credit_cents,
            idempotency_key: payment.idempotency_key.clone(),
            created_utc: Utc::now(),
        };
        store.payments.insert(created.payment_id, created.clone());
        self.wrote();
        Ok(created)
    }

    async fn update(&self, payment: &Payment) -> Result<Payment, BillingError> {
        let mut store = self.lock();
        let stored = store
            .payments
            .get_mut(&payment.payment_id)
            .ok_or_else(|| BillingError::not_found("payment"))?;
        stored.method = payment.method;
        stored.reference = payment.reference.clone();
        stored.notes = payment.notes.clone();
        stored.status = payment.status;
        stored.kind = payment.kind;
        stored.credit_cents = payment.credit_cents;
        self.wrote();
        Ok(stored.clone())
    }

    async fn find_by_id(&self, payment_id: Uuid) -> Result<Payment, BillingError> {
        self.lock()
            .payments
            .get(&payment_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found(format!("payment {}", payment_id)))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>, BillingError> {
        Ok(self
            .lock()
            .payments
            .values()
            .find(|p| p.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<Payment>, BillingError> {
        let mut payments: Vec<_> = self
            .lock()
            .payments
            .values()
            .filter(|p| p.subscription_id == subscription_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.paid_at.cmp(&a.paid_at));
        Ok(payments)
    }

    async fn list_by_period(&self, period_id: Uuid) -> Result<Vec<Payment>, BillingError> {
        let store = self.lock();
        let ids: HashSet<Uuid> = store
            .allocations
            .iter()
            .filter(|a| a.period_id == period_id)
            .map(|a| a.payment_id)
            .collect();
        let mut payments: Vec<_> = store
            .payments
            .values()
            .filter(|p| ids.contains(&p.payment_id))
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.paid_at);
        Ok(payments)
    }

    async fn list_paid_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>, BillingError> {
        let mut payments: Vec<_> = self
            .lock()
            .payments
            .values()
            .filter(|p| p.paid_at >= start && p.paid_at < end)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.paid_at);
        Ok(payments)
    }
}

#[async_trait]
impl PaymentAllocationRepository for MemoryRepos {
    async fn create(
        &self,
        allocation: &NewPaymentAllocation,
    ) -> Result<PaymentAllocation, BillingError> {
        if allocation.amount_cents <= 0 {
            return Err(BillingError::validation("allocation amount must be positive"));
        }
        let created = PaymentAllocation {
            payment_id: allocation.payment_id,
            period_id: allocation.period_id,
            amount_cents: allocation.amount_cents,
            created_utc: Utc::now(),
        };
        self.lock().allocations.push(created.clone());
        self.wrote();
        Ok(created)
    }

    async fn list_by_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentAllocation>, BillingError> {
        Ok(self.allocations_of(payment_id))
    }

    async fn delete_by_payment(&self, payment_id: Uuid) -> Result<u64, BillingError> {
        let mut store = self.lock();
        let before = store.allocations.len();
        store.allocations.retain(|a| a.payment_id != payment_id);
        self.wrote();
        Ok((before - store.allocations.len()) as u64)
    }
}

#[async_trait]
impl SubscriptionBalanceRepository for MemoryRepos {
    async fn get(&self, subscription_id: Uuid) -> Result<SubscriptionBalance, BillingError> {
        Ok(self
            .lock()
            .balances
            .get(&subscription_id)
            .cloned()
            .unwrap_or_else(|| SubscriptionBalance::empty(subscription_id)))
    }

    async fn set(
        &self,
        subscription_id: Uuid,
        credit_cents: i64,
    ) -> Result<SubscriptionBalance, BillingError> {
        if credit_cents < 0 {
            return Err(BillingError::validation("credit cannot be negative"));
        }
        self.set_credit(subscription_id, credit_cents);
        self.wrote();
        SubscriptionBalanceRepository::get(self, subscription_id).await
    }

    async fn add(
        &self,
        subscription_id: Uuid,
        delta: i64,
    ) -> Result<SubscriptionBalance, BillingError> {
        let current = self.credit_of(subscription_id);
        self.set_credit(subscription_id, (current + delta).max(0));
        self.wrote();
        SubscriptionBalanceRepository::get(self, subscription_id).await
    }
}

// =============================================================================
// Units of work
// =============================================================================

type Customize = dyn Fn(&MemoryRepos, Repositories) -> Repositories + Send + Sync;

/// Each unit of work edits a private copy of the committed store; commit
/// swaps the copy in.
#[derive(Clone)]
pub struct MemoryUnitOfWorkFactory {
    committed: MemoryRepos,
    pending_failures: Arc<AtomicU32>,
    begins: Arc<AtomicU32>,
    commits: Arc<AtomicU32>,
    rollbacks: Arc<AtomicU32>,
    customize: Option<Arc<Customize>>,
}

impl MemoryUnitOfWorkFactory {
    pub fn new(committed: MemoryRepos) -> Self {
        Self {
            committed,
            pending_failures: Arc::new(AtomicU32::new(0)),
            begins: Arc::new(AtomicU32::new(0)),
            commits: Arc::new(AtomicU32::new(0)),
            rollbacks: Arc::new(AtomicU32::new(0)),
            customize: None,
        }
    }

    /// The next `count` commits fail with a serialization failure.
    pub fn fail_next_commits(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Rewrites the bundle handed to each unit of work.
    pub fn with_customizer<F>(mut self, customize: F) -> Self
    where
        F: Fn(&MemoryRepos, Repositories) -> Repositories + Send + Sync + 'static,
    {
        self.customize = Some(Arc::new(customize));
        self
    }

    pub fn begins(&self) -> u32 {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u32 {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitOfWorkFactory for MemoryUnitOfWorkFactory {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, BillingError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        let working = MemoryRepos {
            store: Arc::new(Mutex::new(self.committed.snapshot())),
            writes: self.committed.writes.clone(),
        };
        let bundle = match &self.customize {
            Some(customize) => customize(&working, working.bundle()),
            None => working.bundle(),
        };
        Ok(Box::new(MemoryUnitOfWork {
            factory: self.clone(),
            working,
            repositories: Arc::new(bundle),
        }))
    }
}

struct MemoryUnitOfWork {
    factory: MemoryUnitOfWorkFactory,
    working: MemoryRepos,
    repositories: Arc<Repositories>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    fn repositories(&self) -> Arc<Repositories> {
        self.repositories.clone()
    }

    async fn commit(self: Box<Self>) -> Result<(), BillingError> {
        let failures = &self.factory.pending_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BillingError::SerializationFailure);
        }
        self.factory.committed.replace_with(self.working.snapshot());
        self.factory.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), BillingError> {
        self.factory.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Fault-injecting repositories
// =============================================================================

/// Period repository whose first `create` loses a race: a concurrent writer
/// inserts the same period just before ours.
pub struct RacingPeriods {
    inner: MemoryRepos,
    races_left: AtomicU32,
}

impl RacingPeriods {
    pub fn new(inner: MemoryRepos, races: u32) -> Self {
        Self {
            inner,
            races_left: AtomicU32::new(races),
        }
    }
}

#[async_trait]
impl BillingPeriodRepository for RacingPeriods {
    async fn create(&self, period: &NewBillingPeriod) -> Result<BillingPeriod, BillingError> {
        if self
            .races_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            BillingPeriodRepository::create(&self.inner, period).await?;
        }
        BillingPeriodRepository::create(&self.inner, period).await
    }

    async fn update(&self, period: &BillingPeriod) -> Result<BillingPeriod, BillingError> {
        BillingPeriodRepository::update(&self.inner, period).await
    }

    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<BillingPeriod>, BillingError> {
        BillingPeriodRepository::list_by_subscription(&self.inner, subscription_id).await
    }

    async fn list_open_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<BillingPeriod>, BillingError> {
        self.inner.list_open_by_subscription(subscription_id).await
    }

    async fn mark_overdue(
        &self,
        subscription_id: Uuid,
        today: NaiveDate,
    ) -> Result<u64, BillingError> {
        self.inner.mark_overdue(subscription_id, today).await
    }
}

/// Payment repository whose next idempotency lookup misses while `hide` is
/// set, as if a concurrent registration committed right after it.
pub struct LateKeyPayments {
    inner: MemoryRepos,
    hide: Arc<AtomicBool>,
}

impl LateKeyPayments {
    pub fn new(inner: MemoryRepos, hide: Arc<AtomicBool>) -> Self {
        Self { inner, hide }
    }
}

#[async_trait]
impl PaymentRepository for LateKeyPayments {
    async fn create(&self, payment: &NewPayment) -> Result<Payment, BillingError> {
        PaymentRepository::create(&self.inner, payment).await
    }

    async fn update(&self, payment: &Payment) -> Result<Payment, BillingError> {
        PaymentRepository::update(&self.inner, payment).await
    }

    async fn find_by_id(&self, payment_id: Uuid) -> Result<Payment, BillingError> {
        PaymentRepository::find_by_id(&self.inner, payment_id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>, BillingError> {
        if self.hide.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_by_idempotency_key(key).await
    }

    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<Payment>, BillingError> {
        PaymentRepository::list_by_subscription(&self.inner, subscription_id).await
    }

    async fn list_by_period(&self, period_id: Uuid) -> Result<Vec<Payment>, BillingError> {
        self.inner.list_by_period(period_id).await
    }

    async fn list_paid_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>, BillingError> {
        self.inner.list_paid_between(start, end).await
    }
}

// =============================================================================
// Lock
// =============================================================================

#[derive(Clone, Default)]
pub struct MemoryLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLock {
    /// Simulate another instance holding `name`.
    pub fn hold(&self, name: &str) {
        self.held.lock().unwrap().insert(name.to_string());
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.lock().unwrap().contains(name)
    }
}

struct MemoryLease {
    name: String,
    held: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, name: &str) -> Result<Option<Box<dyn LockLease>>, BillingError> {
        if !self.held.lock().unwrap().insert(name.to_string()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLease {
            name: name.to_string(),
            held: self.held.clone(),
        })))
    }
}

#[async_trait]
impl LockLease for MemoryLease {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(self: Box<Self>) -> Result<(), BillingError> {
        self.held.lock().unwrap().remove(&self.name);
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn plan(duration_days: i32, price_cents: i64) -> Plan {
    let now = Utc::now();
    Plan {
        plan_id: Uuid::new_v4(),
        name: "Monthly".to_string(),
        description: None,
        duration_days,
        price_cents,
        is_active: true,
        created_utc: now,
        updated_utc: now,
    }
}

pub fn subscription(
    plan: &Plan,
    start_date: NaiveDate,
    payment_day: Option<i32>,
    auto_renew: bool,
) -> Subscription {
    let now = Utc::now();
    Subscription {
        subscription_id: Uuid::new_v4(),
        customer_id: Uuid::new_v4(),
        plan_id: plan.plan_id,
        start_date,
        end_date: None,
        status: SubscriptionStatus::Active,
        price_cents: None,
        payment_day,
        auto_renew,
        created_utc: now,
        updated_utc: now,
    }
}

pub fn open_period(subscription: &Subscription, start: NaiveDate, due_cents: i64) -> BillingPeriod {
    let now = Utc::now();
    BillingPeriod {
        period_id: Uuid::new_v4(),
        subscription_id: subscription.subscription_id,
        period_start: start,
        period_end: start + chrono::Days::new(30),
        amount_due_cents: due_cents,
        amount_paid_cents: 0,
        status: BillingPeriodStatus::Open,
        created_utc: now,
        updated_utc: now,
    }
}

/// Everything a test needs around one in-memory database.
pub struct TestHarness {
    pub db: MemoryRepos,
    pub factory: MemoryUnitOfWorkFactory,
    pub clock: Arc<FixedClock>,
    pub metrics: Arc<BillingMetrics>,
}

impl TestHarness {
    pub fn new(today: NaiveDate) -> Self {
        let db = MemoryRepos::default();
        Self {
            factory: MemoryUnitOfWorkFactory::new(db.clone()),
            db,
            clock: Arc::new(FixedClock::new(noon(today))),
            metrics: Arc::new(BillingMetrics::detached().unwrap()),
        }
    }

    pub fn with_factory(mut self, factory: MemoryUnitOfWorkFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Seed a plan and a subscription on it.
    pub fn seed(
        &self,
        duration_days: i32,
        price_cents: i64,
        start: NaiveDate,
        payment_day: Option<i32>,
        auto_renew: bool,
    ) -> Subscription {
        let plan = plan(duration_days, price_cents);
        let subscription = subscription(&plan, start, payment_day, auto_renew);
        self.db.insert_plan(plan);
        self.db.insert_subscription(subscription.clone());
        subscription
    }

    pub fn runner(&self) -> TransactionRunner {
        TransactionRunner::new(
            Arc::new(self.factory.clone()),
            RetryPolicy::without_delay(3),
        )
        .with_metrics(self.metrics.clone())
    }

    pub fn engine(&self) -> PaymentEngine {
        PaymentEngine::new(self.runner(), self.clock.clone(), self.metrics.clone())
    }
}
