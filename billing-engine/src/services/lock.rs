//! Cross-process job locking.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::postgres::Postgres;
use std::future::Future;
use tracing::{debug, info, instrument, warn};

use crate::error::BillingError;

/// Non-blocking named mutex shared by every process instance.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// `None` when another holder owns the lock.
    async fn try_acquire(&self, name: &str) -> Result<Option<Box<dyn LockLease>>, BillingError>;
}

/// Proof of ownership for an acquired lock.
#[async_trait]
pub trait LockLease: Send {
    fn name(&self) -> &str;

    async fn release(self: Box<Self>) -> Result<(), BillingError>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome<T> {
    Completed(T),
    /// Someone else held the lock; the job did not run.
    Skipped,
}

/// Run `job` only if `name` can be locked right now. The lease is released
/// whether or not the job succeeds.
pub async fn run_exclusive<T, F, Fut>(
    lock: &dyn DistributedLock,
    name: &str,
    job: F,
) -> Result<LockOutcome<T>, BillingError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, BillingError>>,
{
    let Some(lease) = lock.try_acquire(name).await? else {
        info!(lock = name, "Lock held by another instance, skipping run");
        return Ok(LockOutcome::Skipped);
    };

    let result = job().await;

    if let Err(e) = lease.release().await {
        warn!(lock = name, error = %e, "Failed to release lock");
    }

    result.map(LockOutcome::Completed)
}

/// Stable 64-bit advisory key: the first eight bytes of SHA-256(name).
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Session-level Postgres advisory lock. The lease pins the connection that
/// took the lock until it is released.
#[derive(Clone)]
pub struct PgAdvisoryLock {
    pool: PgPool,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for PgAdvisoryLock {
    #[instrument(skip(self))]
    async fn try_acquire(&self, name: &str) -> Result<Option<Box<dyn LockLease>>, BillingError> {
        let key = advisory_key(name);
        let mut conn = self.pool.acquire().await?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if !locked {
            return Ok(None);
        }

        debug!(lock = name, key = key, "Advisory lock acquired");
        Ok(Some(Box::new(PgAdvisoryLease {
            name: name.to_string(),
            key,
            conn: Some(conn),
        })))
    }
}

struct PgAdvisoryLease {
    name: String,
    key: i64,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl LockLease for PgAdvisoryLease {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(self: Box<Self>) -> Result<(), BillingError> {
        let mut lease = self;
        let Some(mut conn) = lease.conn.take() else {
            return Ok(());
        };

        let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(lease.key)
            .fetch_one(&mut *conn)
            .await?;

        if !unlocked {
            warn!(lock = %lease.name, key = lease.key, "Advisory lock was not held at release");
        }
        debug!(lock = %lease.name, "Advisory lock released");
        Ok(())
    }
}

impl Drop for PgAdvisoryLease {
    fn drop(&mut self) {
        // An unreleased session lock must not go back to the pool.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}
