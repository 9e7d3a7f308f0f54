//! Due-date arithmetic and period status resolution.
//!
//! Everything here is pure: same inputs, same answer.

use chrono::{Datelike, Days, Months, NaiveDate};

use crate::models::{BillingPeriod, BillingPeriodStatus};

fn first_of_month(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    first_of_month(date)
        .checked_add_months(Months::new(1))
        .unwrap_or(NaiveDate::MAX)
}

fn days_in_month(first: NaiveDate) -> u32 {
    first_of_next_month(first)
        .pred_opt()
        .map_or(31, |last| last.day())
}

/// `payment_day` inside the month starting at `first`, clamped to its last day.
fn clamp_in_month(first: NaiveDate, payment_day: u32) -> NaiveDate {
    let day = payment_day.clamp(1, days_in_month(first));
    first + Days::new(u64::from(day - 1))
}

/// Date a period is due: the payment day in the period's start month, or in
/// the following month when that would fall before the start.
pub fn due_date(period_start: NaiveDate, payment_day: u32) -> NaiveDate {
    let due = clamp_in_month(first_of_month(period_start), payment_day);
    if due < period_start {
        clamp_in_month(first_of_next_month(period_start), payment_day)
    } else {
        due
    }
}

/// Status of a period holding `due_cents` and `paid_cents` on `today`.
pub fn resolve_status(
    due_cents: i64,
    paid_cents: i64,
    period_start: NaiveDate,
    today: NaiveDate,
    payment_day: u32,
) -> BillingPeriodStatus {
    if paid_cents >= due_cents {
        BillingPeriodStatus::Paid
    } else if paid_cents > 0 {
        BillingPeriodStatus::Partial
    } else if today > due_date(period_start, payment_day) {
        BillingPeriodStatus::Overdue
    } else {
        BillingPeriodStatus::Open
    }
}

pub fn resolve_period_status(
    period: &BillingPeriod,
    today: NaiveDate,
    payment_day: u32,
) -> BillingPeriodStatus {
    resolve_status(
        period.amount_due_cents,
        period.amount_paid_cents,
        period.period_start,
        today,
        payment_day,
    )
}
