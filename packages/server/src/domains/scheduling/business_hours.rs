//! Business-hours adjustment for scheduled calls.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use super::models::BusinessHours;

/// Move an instant forward until it lands inside the window: first to
/// the next allowed day-of-week, then the hour is clamped into
/// `[start, end)`; past `end`, advance to the next allowed day's start.
/// Instants already inside the window come back unchanged.
pub fn adjust_forward(at: DateTime<Utc>, hours: &BusinessHours) -> DateTime<Utc> {
    let Ok(tz) = hours.timezone.parse::<Tz>() else {
        return at;
    };
    let local = at.with_timezone(&tz);

    let day_allowed =
        |d: chrono::NaiveDate| hours.days_of_week.contains(&(d.weekday().num_days_from_sunday() as u8));

    let mut date = local.date_naive();
    let mut time = Some((local.hour(), local.minute(), local.second()));

    if day_allowed(date) {
        if local.hour() < hours.start {
            time = None; // clamp to window start
        } else if local.hour() >= hours.end {
            date = date.succ_opt().unwrap_or(date);
            time = None;
        }
    } else {
        time = None;
    }

    // Walk to the next allowed day (bounded: a week covers all cases
    // unless the mask is empty).
    let mut hops = 0;
    while !day_allowed(date) && hops < 8 {
        date = date.succ_opt().unwrap_or(date);
        hops += 1;
    }
    if hops >= 8 {
        return at;
    }

    let (h, m, s) = time.unwrap_or((hours.start, 0, 0));
    let naive = match date.and_hms_opt(h, m, s) {
        Some(n) => n,
        None => return at,
    };
    match tz.from_local_datetime(&naive).earliest() {
        Some(adjusted) => adjusted.with_timezone(&Utc),
        None => at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn weekdays_9_to_18() -> BusinessHours {
        BusinessHours {
            start: 9,
            end: 18,
            timezone: "Asia/Kolkata".to_string(),
            days_of_week: vec![1, 2, 3, 4, 5],
        }
    }

    fn kolkata(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        tz.with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn saturday_afternoon_moves_to_monday_morning() {
        // Sat 15:00 IST → Mon 09:00 IST
        let t = kolkata(2025, 6, 14, 15, 0);
        let adjusted = adjust_forward(t, &weekdays_9_to_18());
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let local = adjusted.with_timezone(&tz);
        assert_eq!(local.weekday(), Weekday::Mon);
        assert_eq!((local.hour(), local.minute()), (9, 0));
    }

    #[test]
    fn inside_window_is_untouched() {
        let t = kolkata(2025, 6, 11, 14, 30);
        assert_eq!(adjust_forward(t, &weekdays_9_to_18()), t);
    }

    #[test]
    fn before_opening_clamps_to_start() {
        let t = kolkata(2025, 6, 11, 6, 45);
        let adjusted = adjust_forward(t, &weekdays_9_to_18());
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let local = adjusted.with_timezone(&tz);
        assert_eq!(local.date_naive(), chrono::NaiveDate::from_ymd_opt(2025, 6, 11).unwrap());
        assert_eq!((local.hour(), local.minute()), (9, 0));
    }

    #[test]
    fn after_close_moves_to_next_allowed_day() {
        // Fri 19:00 IST → Mon 09:00 IST
        let t = kolkata(2025, 6, 13, 19, 0);
        let adjusted = adjust_forward(t, &weekdays_9_to_18());
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let local = adjusted.with_timezone(&tz);
        assert_eq!(local.weekday(), Weekday::Mon);
        assert_eq!(local.hour(), 9);
    }

    #[test]
    fn empty_day_mask_is_left_alone() {
        let mut hours = weekdays_9_to_18();
        hours.days_of_week.clear();
        let t = kolkata(2025, 6, 14, 15, 0);
        assert_eq!(adjust_forward(t, &hours), t);
    }
}
