//! Background jobs.

pub mod renewal;
pub mod schedule;

pub use renewal::{RENEWAL_LOCK_NAME, RenewalJob, RenewalSummary};
pub use schedule::{DailySchedule, run_daily};
