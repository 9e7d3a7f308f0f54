//! Once-a-day timer for background jobs.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::error::BillingError;

/// Fires every day at a fixed wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    pub fn new(hour: u32, minute: u32) -> Result<Self, BillingError> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            BillingError::configuration(format!("invalid schedule time {}:{}", hour, minute))
        })?;
        Ok(Self { at })
    }

    pub fn time(&self) -> NaiveTime {
        self.at
    }

    /// Next firing strictly after `now`.
    pub fn next_run_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.at);
        if today > now {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

/// Sleep until each firing and run `job`, until `cancel` fires.
///
/// Returns `Cancelled` once the token is cancelled, even mid-wait.
pub async fn run_daily<F, Fut>(
    schedule: DailySchedule,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    mut job: F,
) -> Result<(), BillingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let now = clock.local_now();
        let next = schedule.next_run_after(now);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next_run = %next, wait_secs = wait.as_secs(), "Next scheduled run");

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Scheduler stopping");
                return Err(BillingError::Cancelled);
            }
            _ = tokio::time::sleep(wait) => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Scheduler stopping during run");
                return Err(BillingError::Cancelled);
            }
            _ = job() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn fires_later_today_when_time_not_reached() {
        let schedule = DailySchedule::new(0, 5).unwrap();
        assert_eq!(
            schedule.next_run_after(at(2024, 1, 1, 0, 1)),
            at(2024, 1, 1, 0, 5)
        );
    }

    #[test]
    fn rolls_to_tomorrow_when_time_passed() {
        let schedule = DailySchedule::new(0, 5).unwrap();
        assert_eq!(
            schedule.next_run_after(at(2024, 1, 1, 13, 0)),
            at(2024, 1, 2, 0, 5)
        );
    }

    #[test]
    fn exact_fire_time_is_not_reused() {
        let schedule = DailySchedule::new(0, 5).unwrap();
        assert_eq!(
            schedule.next_run_after(at(2024, 12, 31, 0, 5)),
            at(2025, 1, 1, 0, 5)
        );
    }

    #[test]
    fn rejects_out_of_range_time() {
        assert!(DailySchedule::new(24, 0).is_err());
        assert!(DailySchedule::new(0, 60).is_err());
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let clock = Arc::new(crate::clock::SystemClock);
        let result = run_daily(DailySchedule::new(0, 5).unwrap(), clock, cancel, || async {}).await;
        assert!(matches!(result, Err(BillingError::Cancelled)));
    }
}
