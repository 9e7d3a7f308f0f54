//! PostgreSQL storage for billing-engine.
//!
//! Repository adapters hold a [`PgSession`]: either the pool (autocommit) or
//! one shared serializable transaction opened by [`PgUnitOfWorkFactory`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, Postgres};
use sqlx::{FromRow, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::{
    BillingPeriod, CreateSubscription, NewBillingPeriod, NewPayment, NewPaymentAllocation,
    Payment, PaymentAllocation, Plan, Subscription, SubscriptionBalance,
};
use crate::repository::{
    BillingPeriodRepository, PaymentAllocationRepository, PaymentRepository, PlanRepository,
    Repositories, SubscriptionBalanceRepository, SubscriptionRepository,
};
use crate::services::transaction::{UnitOfWork, UnitOfWorkFactory};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Repositories running each statement in autocommit mode.
    pub fn repositories(&self) -> Repositories {
        PgSession::Pool(self.pool.clone()).repositories()
    }

    pub fn unit_of_work_factory(&self) -> Arc<dyn UnitOfWorkFactory> {
        Arc::new(PgUnitOfWorkFactory {
            pool: self.pool.clone(),
        })
    }
}

// =============================================================================
// Sessions and units of work
// =============================================================================

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

/// Where a repository sends its statements.
#[derive(Clone)]
pub enum PgSession {
    Pool(PgPool),
    Transaction(SharedTransaction),
}

/// A connection borrowed from a session for one statement.
pub enum SessionConnection<'a> {
    Pooled(PoolConnection<Postgres>),
    Transaction(MutexGuard<'a, Option<Transaction<'static, Postgres>>>),
}

impl SessionConnection<'_> {
    pub fn get(&mut self) -> Result<&mut PgConnection, BillingError> {
        match self {
            SessionConnection::Pooled(conn) => Ok(&mut **conn),
            SessionConnection::Transaction(guard) => guard
                .as_deref_mut()
                .ok_or_else(|| BillingError::Database(anyhow::anyhow!("transaction already finished"))),
        }
    }
}

impl PgSession {
    pub async fn acquire(&self) -> Result<SessionConnection<'_>, BillingError> {
        match self {
            PgSession::Pool(pool) => Ok(SessionConnection::Pooled(pool.acquire().await?)),
            PgSession::Transaction(tx) => Ok(SessionConnection::Transaction(tx.lock().await)),
        }
    }

    /// Every repository, bound to this session.
    pub fn repositories(&self) -> Repositories {
        Repositories::default()
            .with_subscriptions(Arc::new(PgSubscriptionRepository::new(self.clone())))
            .with_plans(Arc::new(PgPlanRepository::new(self.clone())))
            .with_periods(Arc::new(PgBillingPeriodRepository::new(self.clone())))
            .with_payments(Arc::new(PgPaymentRepository::new(self.clone())))
            .with_allocations(Arc::new(PgPaymentAllocationRepository::new(self.clone())))
            .with_balances(Arc::new(PgSubscriptionBalanceRepository::new(self.clone())))
    }
}

/// Opens `SERIALIZABLE` transactions on the pool.
pub struct PgUnitOfWorkFactory {
    pool: PgPool,
}

#[async_trait]
impl UnitOfWorkFactory for PgUnitOfWorkFactory {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, BillingError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let shared: SharedTransaction = Arc::new(Mutex::new(Some(tx)));
        let repositories = Arc::new(PgSession::Transaction(shared.clone()).repositories());
        Ok(Box::new(PgUnitOfWork {
            tx: shared,
            repositories,
        }))
    }
}

struct PgUnitOfWork {
    tx: SharedTransaction,
    repositories: Arc<Repositories>,
}

impl PgUnitOfWork {
    async fn take(&self) -> Result<Transaction<'static, Postgres>, BillingError> {
        self.tx
            .lock()
            .await
            .take()
            .ok_or_else(|| BillingError::Database(anyhow::anyhow!("transaction already finished")))
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    fn repositories(&self) -> Arc<Repositories> {
        self.repositories.clone()
    }

    async fn commit(self: Box<Self>) -> Result<(), BillingError> {
        self.take().await?.commit().await?;
        debug!("Transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), BillingError> {
        self.take().await?.rollback().await?;
        debug!("Transaction rolled back");
        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

#[derive(FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    customer_id: Uuid,
    plan_id: Uuid,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    status: String,
    price_cents: Option<i64>,
    payment_day: Option<i32>,
    auto_renew: bool,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            subscription_id: row.subscription_id,
            customer_id: row.customer_id,
            plan_id: row.plan_id,
            start_date: row.start_date,
            end_date: row.end_date,
            status: row.status.parse()?,
            price_cents: row.price_cents,
            payment_day: row.payment_day,
            auto_renew: row.auto_renew,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct BillingPeriodRow {
    period_id: Uuid,
    subscription_id: Uuid,
    period_start: NaiveDate,
    period_end: NaiveDate,
    amount_due_cents: i64,
    amount_paid_cents: i64,
    status: String,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<BillingPeriodRow> for BillingPeriod {
    type Error = BillingError;

    fn try_from(row: BillingPeriodRow) -> Result<Self, Self::Error> {
        Ok(BillingPeriod {
            period_id: row.period_id,
            subscription_id: row.subscription_id,
            period_start: row.period_start,
            period_end: row.period_end,
            amount_due_cents: row.amount_due_cents,
            amount_paid_cents: row.amount_paid_cents,
            status: row.status.parse()?,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct PaymentRow {
    payment_id: Uuid,
    subscription_id: Uuid,
    paid_at: DateTime<Utc>,
    amount_cents: i64,
    method: String,
    reference: Option<String>,
    notes: Option<String>,
    status: String,
    kind: String,
    credit_cents: i64,
    idempotency_key: Option<String>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            payment_id: row.payment_id,
            subscription_id: row.subscription_id,
            paid_at: row.paid_at,
            amount_cents: row.amount_cents,
            method: row.method.parse()?,
            reference: row.reference,
            notes: row.notes,
            status: row.status.parse()?,
            kind: row.kind.parse()?,
            credit_cents: row.credit_cents,
            idempotency_key: row.idempotency_key,
            created_utc: row.created_utc,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, BillingError>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// =============================================================================
// Subscriptions
// =============================================================================

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, customer_id, plan_id, start_date, end_date, status, price_cents, payment_day, auto_renew, created_utc, updated_utc";

pub struct PgSubscriptionRepository {
    session: PgSession,
}

impl PgSubscriptionRepository {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    #[instrument(skip(self, input), fields(customer_id = %input.customer_id))]
    async fn create(&self, input: &CreateSubscription) -> Result<Subscription, BillingError> {
        let mut conn = self.session.acquire().await?;
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            INSERT INTO subscriptions (subscription_id, customer_id, plan_id, start_date, end_date, status, price_cents, payment_day, auto_renew)
            VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.customer_id)
        .bind(input.plan_id)
        .bind(input.start_date)
        .bind(input.end_date)
        .bind(input.price_cents)
        .bind(input.payment_day)
        .bind(input.auto_renew)
        .fetch_one(conn.get()?)
        .await?;

        let subscription = Subscription::try_from(row)?;
        info!(subscription_id = %subscription.subscription_id, "Subscription created");
        Ok(subscription)
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    async fn update(&self, subscription: &Subscription) -> Result<Subscription, BillingError> {
        let mut conn = self.session.acquire().await?;
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            UPDATE subscriptions
            SET plan_id = $2, end_date = $3, status = $4, price_cents = $5, payment_day = $6, auto_renew = $7, updated_utc = NOW()
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription.subscription_id)
        .bind(subscription.plan_id)
        .bind(subscription.end_date)
        .bind(subscription.status.as_str())
        .bind(subscription.price_cents)
        .bind(subscription.payment_day)
        .bind(subscription.auto_renew)
        .fetch_optional(conn.get()?)
        .await?
        .ok_or_else(|| {
            BillingError::not_found(format!("subscription {}", subscription.subscription_id))
        })?;

        Subscription::try_from(row)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, subscription_id: Uuid) -> Result<Subscription, BillingError> {
        let mut conn = self.session.acquire().await?;
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE subscription_id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(conn.get()?)
        .await?
        .ok_or_else(|| BillingError::not_found(format!("subscription {}", subscription_id)))?;

        Subscription::try_from(row)
    }

    #[instrument(skip(self))]
    async fn list_by_customer(&self, customer_id: Uuid) -> Result<Vec<Subscription>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE customer_id = $1 ORDER BY start_date DESC"
        ))
        .bind(customer_id)
        .fetch_all(conn.get()?)
        .await?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn list_by_plan(&self, plan_id: Uuid) -> Result<Vec<Subscription>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE plan_id = $1 ORDER BY start_date DESC"
        ))
        .bind(plan_id)
        .fetch_all(conn.get()?)
        .await?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn list_due_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Subscription>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE end_date BETWEEN $1 AND $2 ORDER BY end_date"
        ))
        .bind(start)
        .bind(end)
        .fetch_all(conn.get()?)
        .await?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn list_auto_renew(&self) -> Result<Vec<Subscription>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE auto_renew = TRUE AND status NOT IN ('ended', 'canceled')
            ORDER BY created_utc
            "#
        ))
        .fetch_all(conn.get()?)
        .await?;

        convert_all(rows)
    }
}

// =============================================================================
// Plans
// =============================================================================

const PLAN_COLUMNS: &str =
    "plan_id, name, description, duration_days, price_cents, is_active, created_utc, updated_utc";

pub struct PgPlanRepository {
    session: PgSession,
}

impl PgPlanRepository {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl PlanRepository for PgPlanRepository {
    #[instrument(skip(self))]
    async fn find_by_id(&self, plan_id: Uuid) -> Result<Plan, BillingError> {
        let mut conn = self.session.acquire().await?;
        sqlx::query_as::<_, Plan>(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE plan_id = $1"))
            .bind(plan_id)
            .fetch_optional(conn.get()?)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("plan {}", plan_id)))
    }

    #[instrument(skip(self))]
    async fn list_active(&self) -> Result<Vec<Plan>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let plans = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE is_active = TRUE ORDER BY name"
        ))
        .fetch_all(conn.get()?)
        .await?;
        Ok(plans)
    }
}

// =============================================================================
// Billing periods
// =============================================================================

const PERIOD_COLUMNS: &str = "period_id, subscription_id, period_start, period_end, amount_due_cents, amount_paid_cents, status, created_utc, updated_utc";

pub struct PgBillingPeriodRepository {
    session: PgSession,
}

impl PgBillingPeriodRepository {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl BillingPeriodRepository for PgBillingPeriodRepository {
    #[instrument(skip(self, period), fields(subscription_id = %period.subscription_id, period_start = %period.period_start))]
    async fn create(&self, period: &NewBillingPeriod) -> Result<BillingPeriod, BillingError> {
        let mut conn = self.session.acquire().await?;
        // DO NOTHING keeps the surrounding transaction usable for the re-read.
        let row = sqlx::query_as::<_, BillingPeriodRow>(&format!(
            r#"
            INSERT INTO billing_periods (period_id, subscription_id, period_start, period_end, amount_due_cents, amount_paid_cents, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (subscription_id, period_start) DO NOTHING
            RETURNING {PERIOD_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(period.subscription_id)
        .bind(period.period_start)
        .bind(period.period_end)
        .bind(period.amount_due_cents)
        .bind(period.amount_paid_cents)
        .bind(period.status.as_str())
        .fetch_optional(conn.get()?)
        .await?
        .ok_or_else(|| {
            BillingError::Conflict(format!(
                "billing period starting {} already exists",
                period.period_start
            ))
        })?;

        BillingPeriod::try_from(row)
    }

    #[instrument(skip(self, period), fields(period_id = %period.period_id))]
    async fn update(&self, period: &BillingPeriod) -> Result<BillingPeriod, BillingError> {
        let mut conn = self.session.acquire().await?;
        let row = sqlx::query_as::<_, BillingPeriodRow>(&format!(
            r#"
            UPDATE billing_periods
            SET amount_paid_cents = $2, status = $3, updated_utc = NOW()
            WHERE period_id = $1
            RETURNING {PERIOD_COLUMNS}
            "#
        ))
        .bind(period.period_id)
        .bind(period.amount_paid_cents)
        .bind(period.status.as_str())
        .fetch_optional(conn.get()?)
        .await?
        .ok_or_else(|| BillingError::not_found(format!("billing period {}", period.period_id)))?;

        BillingPeriod::try_from(row)
    }

    #[instrument(skip(self))]
    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<BillingPeriod>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let rows = sqlx::query_as::<_, BillingPeriodRow>(&format!(
            "SELECT {PERIOD_COLUMNS} FROM billing_periods WHERE subscription_id = $1 ORDER BY period_start"
        ))
        .bind(subscription_id)
        .fetch_all(conn.get()?)
        .await?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn list_open_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<BillingPeriod>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let rows = sqlx::query_as::<_, BillingPeriodRow>(&format!(
            r#"
            SELECT {PERIOD_COLUMNS} FROM billing_periods
            WHERE subscription_id = $1 AND status <> 'paid'
            ORDER BY period_start
            "#
        ))
        .bind(subscription_id)
        .fetch_all(conn.get()?)
        .await?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn mark_overdue(
        &self,
        subscription_id: Uuid,
        today: NaiveDate,
    ) -> Result<u64, BillingError> {
        let mut conn = self.session.acquire().await?;
        let result = sqlx::query(
            r#"
            UPDATE billing_periods
            SET status = 'overdue', updated_utc = NOW()
            WHERE subscription_id = $1 AND status = 'open' AND amount_paid_cents = 0 AND period_end <= $2
            "#,
        )
        .bind(subscription_id)
        .bind(today)
        .execute(conn.get()?)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Payments
// =============================================================================

const PAYMENT_COLUMNS: &str = "payment_id, subscription_id, paid_at, amount_cents, method, reference, notes, status, kind, credit_cents, idempotency_key, created_utc";

pub struct PgPaymentRepository {
    session: PgSession,
}

impl PgPaymentRepository {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl PaymentRepository for PgPaymentRepository {
    #[instrument(skip(self, payment), fields(subscription_id = %payment.subscription_id))]
    async fn create(&self, payment: &NewPayment) -> Result<Payment, BillingError> {
        let mut conn = self.session.acquire().await?;
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            INSERT INTO payments (payment_id, subscription_id, paid_at, amount_cents, method, reference, notes, status, kind, credit_cents, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(payment.subscription_id)
        .bind(payment.paid_at)
        .bind(payment.amount_cents)
        .bind(payment.method.as_str())
        .bind(&payment.reference)
        .bind(&payment.notes)
        .bind(payment.status.as_str())
        .bind(payment.kind.as_str())
        .bind(payment.credit_cents)
        .bind(&payment.idempotency_key)
        .fetch_optional(conn.get()?)
        .await?
        .ok_or_else(|| BillingError::Conflict("idempotency key already used".to_string()))?;

        Payment::try_from(row)
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.payment_id))]
    async fn update(&self, payment: &Payment) -> Result<Payment, BillingError> {
        let mut conn = self.session.acquire().await?;
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            UPDATE payments
            SET method = $2, reference = $3, notes = $4, status = $5, kind = $6, credit_cents = $7
            WHERE payment_id = $1
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.payment_id)
        .bind(payment.method.as_str())
        .bind(&payment.reference)
        .bind(&payment.notes)
        .bind(payment.status.as_str())
        .bind(payment.kind.as_str())
        .bind(payment.credit_cents)
        .fetch_optional(conn.get()?)
        .await?
        .ok_or_else(|| BillingError::not_found(format!("payment {}", payment.payment_id)))?;

        Payment::try_from(row)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, payment_id: Uuid) -> Result<Payment, BillingError> {
        let mut conn = self.session.acquire().await?;
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(conn.get()?)
        .await?
        .ok_or_else(|| BillingError::not_found(format!("payment {}", payment_id)))?;

        Payment::try_from(row)
    }

    #[instrument(skip(self))]
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>, BillingError> {
        let mut conn = self.session.acquire().await?;
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(conn.get()?)
        .await?
        .map(Payment::try_from)
        .transpose()
    }

    #[instrument(skip(self))]
    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<Payment>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE subscription_id = $1 ORDER BY paid_at DESC"
        ))
        .bind(subscription_id)
        .fetch_all(conn.get()?)
        .await?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn list_by_period(&self, period_id: Uuid) -> Result<Vec<Payment>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let rows = sqlx::query_as::<_, PaymentRow>(
            r#"
            SELECT p.payment_id, p.subscription_id, p.paid_at, p.amount_cents, p.method, p.reference,
                   p.notes, p.status, p.kind, p.credit_cents, p.idempotency_key, p.created_utc
            FROM payments p
            JOIN payment_allocations a ON a.payment_id = p.payment_id
            WHERE a.period_id = $1
            ORDER BY p.paid_at
            "#,
        )
        .bind(period_id)
        .fetch_all(conn.get()?)
        .await?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn list_paid_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE paid_at >= $1 AND paid_at < $2 ORDER BY paid_at"
        ))
        .bind(start)
        .bind(end)
        .fetch_all(conn.get()?)
        .await?;

        convert_all(rows)
    }
}

// =============================================================================
// Payment allocations
// =============================================================================

pub struct PgPaymentAllocationRepository {
    session: PgSession,
}

impl PgPaymentAllocationRepository {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl PaymentAllocationRepository for PgPaymentAllocationRepository {
    #[instrument(skip(self, allocation), fields(payment_id = %allocation.payment_id, period_id = %allocation.period_id))]
    async fn create(
        &self,
        allocation: &NewPaymentAllocation,
    ) -> Result<PaymentAllocation, BillingError> {
        if allocation.amount_cents <= 0 {
            return Err(BillingError::validation("allocation amount must be positive"));
        }

        let mut conn = self.session.acquire().await?;
        let row = sqlx::query_as::<_, PaymentAllocation>(
            r#"
            INSERT INTO payment_allocations (payment_id, period_id, amount_cents)
            VALUES ($1, $2, $3)
            RETURNING payment_id, period_id, amount_cents, created_utc
            "#,
        )
        .bind(allocation.payment_id)
        .bind(allocation.period_id)
        .bind(allocation.amount_cents)
        .fetch_one(conn.get()?)
        .await?;

        Ok(row)
    }

    #[instrument(skip(self))]
    async fn list_by_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentAllocation>, BillingError> {
        let mut conn = self.session.acquire().await?;
        let rows = sqlx::query_as::<_, PaymentAllocation>(
            r#"
            SELECT payment_id, period_id, amount_cents, created_utc
            FROM payment_allocations
            WHERE payment_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(payment_id)
        .fetch_all(conn.get()?)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn delete_by_payment(&self, payment_id: Uuid) -> Result<u64, BillingError> {
        let mut conn = self.session.acquire().await?;
        let result = sqlx::query("DELETE FROM payment_allocations WHERE payment_id = $1")
            .bind(payment_id)
            .execute(conn.get()?)
            .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Subscription balances
// =============================================================================

pub struct PgSubscriptionBalanceRepository {
    session: PgSession,
}

impl PgSubscriptionBalanceRepository {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SubscriptionBalanceRepository for PgSubscriptionBalanceRepository {
    #[instrument(skip(self))]
    async fn get(&self, subscription_id: Uuid) -> Result<SubscriptionBalance, BillingError> {
        let mut conn = self.session.acquire().await?;
        let balance = sqlx::query_as::<_, SubscriptionBalance>(
            "SELECT subscription_id, credit_cents, updated_utc FROM subscription_balances WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(conn.get()?)
        .await?;

        Ok(balance.unwrap_or_else(|| SubscriptionBalance::empty(subscription_id)))
    }

    #[instrument(skip(self))]
    async fn set(
        &self,
        subscription_id: Uuid,
        credit_cents: i64,
    ) -> Result<SubscriptionBalance, BillingError> {
        if credit_cents < 0 {
            return Err(BillingError::validation("credit cannot be negative"));
        }

        let mut conn = self.session.acquire().await?;
        let balance = sqlx::query_as::<_, SubscriptionBalance>(
            r#"
            INSERT INTO subscription_balances (subscription_id, credit_cents, updated_utc)
            VALUES ($1, $2, NOW())
            ON CONFLICT (subscription_id)
            DO UPDATE SET credit_cents = EXCLUDED.credit_cents, updated_utc = NOW()
            RETURNING subscription_id, credit_cents, updated_utc
            "#,
        )
        .bind(subscription_id)
        .bind(credit_cents)
        .fetch_one(conn.get()?)
        .await?;

        Ok(balance)
    }

    #[instrument(skip(self))]
    async fn add(
        &self,
        subscription_id: Uuid,
        delta: i64,
    ) -> Result<SubscriptionBalance, BillingError> {
        let mut conn = self.session.acquire().await?;
        let balance = sqlx::query_as::<_, SubscriptionBalance>(
            r#"
            INSERT INTO subscription_balances (subscription_id, credit_cents, updated_utc)
            VALUES ($1, GREATEST(0, $2), NOW())
            ON CONFLICT (subscription_id)
            DO UPDATE SET credit_cents = GREATEST(0, subscription_balances.credit_cents + $2), updated_utc = NOW()
            RETURNING subscription_id, credit_cents, updated_utc
            "#,
        )
        .bind(subscription_id)
        .bind(delta)
        .fetch_one(conn.get()?)
        .await?;

        Ok(balance)
    }
}
