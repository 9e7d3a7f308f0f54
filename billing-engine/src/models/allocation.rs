//! Payment allocation model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Cents of a payment applied to one billing period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PaymentAllocation {
    pub payment_id: Uuid,
    pub period_id: Uuid,
    pub amount_cents: i64,
    pub created_utc: DateTime<Utc>,
}

/// Input for creating an allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPaymentAllocation {
    pub payment_id: Uuid,
    pub period_id: Uuid,
    pub amount_cents: i64,
}
