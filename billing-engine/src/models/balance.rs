//! Subscription balance model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Stored credit not yet matched to a period. Never negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionBalance {
    pub subscription_id: Uuid,
    pub credit_cents: i64,
    pub updated_utc: Option<DateTime<Utc>>,
}

impl SubscriptionBalance {
    /// Balance for a subscription that never stored credit.
    pub fn empty(subscription_id: Uuid) -> Self {
        Self {
            subscription_id,
            credit_cents: 0,
            updated_utc: None,
        }
    }
}
