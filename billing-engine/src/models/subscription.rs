//! Subscription model.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::Plan;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Ended,
    Canceled,
    Suspended,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Ended => "ended",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Suspended => "suspended",
        }
    }

    /// Ended and canceled subscriptions never get new billing periods.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Ended | SubscriptionStatus::Canceled)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "ended" => Ok(SubscriptionStatus::Ended),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            other => Err(BillingError::validation(format!(
                "invalid subscription status: {}",
                other
            ))),
        }
    }
}

/// A plan purchased by a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub status: SubscriptionStatus,
    /// Overrides the plan price when positive.
    pub price_cents: Option<i64>,
    /// Day of month the period is due. Defaults to the start day.
    pub payment_day: Option<i32>,
    pub auto_renew: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    /// Payment day in `1..=31`, falling back to the start date's day.
    pub fn effective_payment_day(&self) -> Result<u32, BillingError> {
        match self.payment_day {
            None | Some(0) => Ok(self.start_date.day()),
            Some(day) if (1..=31).contains(&day) => Ok(day as u32),
            Some(day) => Err(BillingError::validation(format!(
                "invalid payment day: {}",
                day
            ))),
        }
    }

    /// Subscription override if set, otherwise the plan price.
    pub fn effective_price_cents(&self, plan: &Plan) -> Result<i64, BillingError> {
        match self.price_cents {
            Some(price) if price > 0 => Ok(price),
            _ if plan.price_cents > 0 => Ok(plan.price_cents),
            _ => Err(BillingError::validation(format!(
                "plan {} has no positive price",
                plan.plan_id
            ))),
        }
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub price_cents: Option<i64>,
    pub payment_day: Option<i32>,
    pub auto_renew: bool,
}
