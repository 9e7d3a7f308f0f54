//! Domain models for billing-engine.

mod allocation;
mod balance;
mod billing_period;
mod payment;
mod plan;
mod subscription;

pub use allocation::{NewPaymentAllocation, PaymentAllocation};
pub use balance::SubscriptionBalance;
pub use billing_period::{BillingPeriod, BillingPeriodStatus, NewBillingPeriod};
pub use payment::{
    NewPayment, Payment, PaymentKind, PaymentMethod, PaymentStatus, RegisterPayment,
    UpdatePayment,
};
pub use plan::Plan;
pub use subscription::{CreateSubscription, Subscription, SubscriptionStatus};
