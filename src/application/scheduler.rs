//! Local-time trigger arithmetic for the daily and weekly jobs. Interval
//! jobs use plain tokio intervals; anything pinned to a wall-clock time in
//! the configured timezone computes its next fire here.

use chrono::{Datelike, Duration as ChronoDuration, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use std::time::Duration;

/// Time until the next occurrence of `hour:minute` local time.
pub fn until_next_daily(tz: Tz, hour: u32, minute: u32) -> Duration {
    let now = Utc::now().with_timezone(&tz);
    let mut candidate_date = now.date_naive();
    for _ in 0..3 {
        if let Some(naive) = candidate_date.and_hms_opt(hour, minute, 0) {
            // DST gaps can make a local time nonexistent; earliest() skips
            // to the next valid instant on the following day instead
            if let Some(local) = tz.from_local_datetime(&naive).earliest() {
                let target = local.with_timezone(&Utc);
                let delta = target - Utc::now();
                if delta > ChronoDuration::zero() {
                    return delta.to_std().unwrap_or(Duration::from_secs(60));
                }
            }
        }
        candidate_date = candidate_date.succ_opt().unwrap_or(candidate_date);
    }
    Duration::from_secs(60)
}

/// Time until the next `weekday` at `hour:minute` local time.
pub fn until_next_weekly(tz: Tz, weekday: Weekday, hour: u32, minute: u32) -> Duration {
    let now = Utc::now().with_timezone(&tz);
    let mut candidate_date = now.date_naive();
    for _ in 0..9 {
        if candidate_date.weekday() == weekday {
            if let Some(naive) = candidate_date.and_hms_opt(hour, minute, 0) {
                if let Some(local) = tz.from_local_datetime(&naive).earliest() {
                    let target = local.with_timezone(&Utc);
                    let delta = target - Utc::now();
                    if delta > ChronoDuration::zero() {
                        return delta.to_std().unwrap_or(Duration::from_secs(60));
                    }
                }
            }
        }
        candidate_date = candidate_date.succ_opt().unwrap_or(candidate_date);
    }
    Duration::from_secs(3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_trigger_is_within_24_hours() {
        let wait = until_next_daily(chrono_tz::UTC, 0, 0);
        assert!(wait <= Duration::from_secs(24 * 3600));
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn weekly_trigger_is_within_a_week() {
        let wait = until_next_weekly(chrono_tz::US::Eastern, Weekday::Sun, 20, 0);
        assert!(wait <= Duration::from_secs(7 * 24 * 3600 + 3600));
        assert!(wait > Duration::ZERO);
    }
}
