//! Services for billing-engine.

pub mod database;
pub mod lock;
pub mod metrics;
pub mod transaction;

pub use database::{Database, PgSession};
pub use lock::{DistributedLock, LockLease, LockOutcome, PgAdvisoryLock, run_exclusive};
pub use metrics::BillingMetrics;
pub use transaction::{TransactionRunner, UnitOfWork, UnitOfWorkFactory};
