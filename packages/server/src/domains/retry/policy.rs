//! Retry classification and backoff policy.
//!
//! Failure kinds map to a fixed table of retryability, attempt caps,
//! base delays, and multipliers. Delays get ±10% jitter, then an
//! optional clamp into the off-peak calling window.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use rand::Rng;

use crate::domains::calls::models::FailureReason;

/// Off-peak calling window: weekdays, local time.
pub const OFF_PEAK_START_HOUR: u32 = 10;
pub const OFF_PEAK_END_HOUR: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

/// The classification table. `None` means the kind is never retried.
pub fn policy_for(reason: FailureReason) -> Option<RetryPolicy> {
    let policy = match reason {
        FailureReason::NoAnswer => RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::minutes(5),
            multiplier: 2.0,
        },
        FailureReason::Busy => RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::minutes(10),
            multiplier: 2.0,
        },
        FailureReason::Voicemail => RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::minutes(30),
            multiplier: 2.0,
        },
        FailureReason::NetworkError | FailureReason::RateLimited | FailureReason::ApiUnavailable => {
            RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::minutes(2),
                multiplier: 2.0,
            }
        }
        FailureReason::CallRejected => RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::hours(1),
            multiplier: 1.0,
        },
        FailureReason::InvalidNumber
        | FailureReason::Blocked
        | FailureReason::ComplianceBlock => return None,
    };
    Some(policy)
}

/// `base · multiplier^(n−1) · (1 ± 10%)` for attempt `n ≥ 1`.
pub fn compute_delay(policy: &RetryPolicy, attempt: i32) -> Duration {
    let exponent = (attempt - 1).max(0) as i32;
    let scaled = policy.base_delay.num_milliseconds() as f64
        * policy.multiplier.powi(exponent);
    let jitter = rand::thread_rng().gen_range(-0.10..=0.10);
    Duration::milliseconds((scaled * (1.0 + jitter)) as i64)
}

/// Clamp an instant into the off-peak window. Already inside: returned
/// unchanged. Outside: advanced to the next weekday window start.
pub fn clamp_to_off_peak(at: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = at.with_timezone(&tz);
    let weekday_ok = !matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
    if weekday_ok && (OFF_PEAK_START_HOUR..OFF_PEAK_END_HOUR).contains(&local.hour()) {
        return at;
    }

    // Walk forward to the next weekday at the window start.
    let mut date = local.date_naive();
    if weekday_ok && local.hour() < OFF_PEAK_START_HOUR {
        // Later today.
    } else {
        date = date.succ_opt().unwrap_or(date);
        while matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            date = date.succ_opt().unwrap_or(date);
        }
    }
    let naive = date.and_hms_opt(OFF_PEAK_START_HOUR, 0, 0).unwrap_or_else(|| {
        date.and_hms_opt(0, 0, 0).expect("midnight always exists")
    });
    match tz.from_local_datetime(&naive).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn kolkata() -> Tz {
        "Asia/Kolkata".parse().unwrap()
    }

    fn at(tz: Tz, y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        tz.with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn terminal_kinds_have_no_policy() {
        assert!(policy_for(FailureReason::InvalidNumber).is_none());
        assert!(policy_for(FailureReason::Blocked).is_none());
        assert!(policy_for(FailureReason::ComplianceBlock).is_none());
    }

    #[test]
    fn busy_first_attempt_is_about_ten_minutes() {
        let policy = policy_for(FailureReason::Busy).unwrap();
        let delay = compute_delay(&policy, 1);
        let ms = delay.num_milliseconds() as f64;
        let base = 10.0 * 60.0 * 1000.0;
        assert!(ms >= base * 0.9 && ms <= base * 1.1, "delay {ms} out of band");
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let policy = policy_for(FailureReason::NoAnswer).unwrap();
        let third = compute_delay(&policy, 3);
        // 5 min · 2^2 = 20 min, ±10%
        let ms = third.num_milliseconds() as f64;
        let expected = 20.0 * 60.0 * 1000.0;
        assert!(ms >= expected * 0.9 && ms <= expected * 1.1);
    }

    #[test]
    fn inside_window_is_unchanged() {
        // Wednesday 11:00 IST
        let t = at(kolkata(), 2025, 6, 11, 11, 0);
        assert_eq!(clamp_to_off_peak(t, kolkata()), t);
    }

    #[test]
    fn evening_advances_to_next_morning() {
        // Wednesday 18:30 IST → Thursday 10:00 IST
        let t = at(kolkata(), 2025, 6, 11, 18, 30);
        let clamped = clamp_to_off_peak(t, kolkata()).with_timezone(&kolkata());
        assert_eq!(clamped.date_naive(), NaiveDate::from_ymd_opt(2025, 6, 12).unwrap());
        assert_eq!((clamped.hour(), clamped.minute()), (10, 0));
    }

    #[test]
    fn weekend_advances_to_monday() {
        // Saturday 12:00 IST → Monday 10:00 IST
        let t = at(kolkata(), 2025, 6, 14, 12, 0);
        let clamped = clamp_to_off_peak(t, kolkata()).with_timezone(&kolkata());
        assert_eq!(clamped.weekday(), Weekday::Mon);
        assert_eq!(clamped.hour(), 10);
    }

    #[test]
    fn early_morning_clamps_to_window_start_same_day() {
        // Tuesday 07:00 IST → Tuesday 10:00 IST
        let t = at(kolkata(), 2025, 6, 10, 7, 0);
        let clamped = clamp_to_off_peak(t, kolkata()).with_timezone(&kolkata());
        assert_eq!(clamped.date_naive(), NaiveDate::from_ymd_opt(2025, 6, 10).unwrap());
        assert_eq!(clamped.hour(), 10);
    }
}
