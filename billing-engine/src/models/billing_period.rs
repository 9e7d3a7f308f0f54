//! Billing period model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BillingError;

/// Billing period status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriodStatus {
    Open,
    Partial,
    Paid,
    Overdue,
}

impl BillingPeriodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriodStatus::Open => "open",
            BillingPeriodStatus::Partial => "partial",
            BillingPeriodStatus::Paid => "paid",
            BillingPeriodStatus::Overdue => "overdue",
        }
    }
}

impl FromStr for BillingPeriodStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(BillingPeriodStatus::Open),
            "partial" => Ok(BillingPeriodStatus::Partial),
            "paid" => Ok(BillingPeriodStatus::Paid),
            "overdue" => Ok(BillingPeriodStatus::Overdue),
            other => Err(BillingError::validation(format!(
                "invalid billing period status: {}",
                other
            ))),
        }
    }
}

/// One plan cycle owed by a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub period_id: Uuid,
    pub subscription_id: Uuid,
    pub period_start: NaiveDate,
    /// Exclusive: `period_start + plan.duration_days`.
    pub period_end: NaiveDate,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub status: BillingPeriodStatus,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl BillingPeriod {
    /// Cents still owed, never negative.
    pub fn remaining_cents(&self) -> i64 {
        (self.amount_due_cents - self.amount_paid_cents).max(0)
    }
}

/// Input for creating a billing period.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBillingPeriod {
    pub subscription_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub status: BillingPeriodStatus,
}
