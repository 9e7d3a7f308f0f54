//! Billing core: status resolution, period generation, credit allocation and
//! the payment engine.

pub mod balance;
pub mod payments;
pub mod periods;
pub mod status;

pub use balance::{Allocation, AppliedAmount, allocate_oldest_first, apply_stored_credit};
pub use payments::{PaymentEngine, classify_payment};
pub use periods::{
    ensure_billing_periods, ensure_billing_periods_through, next_period_start,
    refresh_period_statuses,
};
pub use status::{due_date, resolve_period_status, resolve_status};
