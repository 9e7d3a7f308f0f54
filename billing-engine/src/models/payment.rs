//! Payment model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BillingError;

/// Payment status. Only `confirmed -> reversed` is a valid transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Confirmed,
    Reversed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Reversed => "reversed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(PaymentStatus::Confirmed),
            "reversed" => Ok(PaymentStatus::Reversed),
            other => Err(BillingError::validation(format!(
                "invalid payment status: {}",
                other
            ))),
        }
    }
}

/// What a payment did to the subscription's dues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Full,
    Partial,
    Advance,
    Credit,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Full => "full",
            PaymentKind::Partial => "partial",
            PaymentKind::Advance => "advance",
            PaymentKind::Credit => "credit",
        }
    }
}

impl FromStr for PaymentKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(PaymentKind::Full),
            "partial" => Ok(PaymentKind::Partial),
            "advance" => Ok(PaymentKind::Advance),
            "credit" => Ok(PaymentKind::Credit),
            other => Err(BillingError::validation(format!(
                "invalid payment kind: {}",
                other
            ))),
        }
    }
}

/// Payment method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Pix,
    Card,
    Transfer,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Pix => "pix",
            PaymentMethod::Card => "card",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Other => "other",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "pix" => Ok(PaymentMethod::Pix),
            "card" => Ok(PaymentMethod::Card),
            "transfer" => Ok(PaymentMethod::Transfer),
            "other" => Ok(PaymentMethod::Other),
            other => Err(BillingError::validation(format!(
                "invalid payment method: {}",
                other
            ))),
        }
    }
}

/// Recorded payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub subscription_id: Uuid,
    pub paid_at: DateTime<Utc>,
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub status: PaymentStatus,
    pub kind: PaymentKind,
    /// Portion of the amount that became stored credit.
    pub credit_cents: i64,
    pub idempotency_key: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Caller input for registering a payment. Free-form fields are validated by
/// the payment engine.
#[derive(Debug, Clone, Default)]
pub struct RegisterPayment {
    pub subscription_id: Option<Uuid>,
    pub amount_cents: i64,
    pub method: String,
    pub status: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Fully resolved payment row handed to the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub subscription_id: Uuid,
    pub paid_at: DateTime<Utc>,
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub status: PaymentStatus,
    pub kind: PaymentKind,
    pub credit_cents: i64,
    pub idempotency_key: Option<String>,
}

/// Caller input for editing a payment. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct UpdatePayment {
    pub payment_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub amount_cents: Option<i64>,
    pub paid_at: Option<DateTime<Utc>>,
    pub method: Option<String>,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub status: Option<String>,
}
