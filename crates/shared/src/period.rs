//! Calendar arithmetic for subscription windows.
//!
//! `time` has no calendar-month addition, so window ends are computed here
//! with day-of-month clamping (Jan 31 + 1 month lands on Feb 28/29).

use time::{Date, Month, OffsetDateTime};

/// Add `months` calendar months, clamping the day to the target month length.
pub fn add_months(ts: OffsetDateTime, months: u32) -> OffsetDateTime {
    let date = ts.date();
    let zero_based = u32::from(u8::from(date.month())) - 1 + months;
    let year = date.year() + i32::try_from(zero_based / 12).unwrap_or(0);
    let month = Month::try_from((zero_based % 12 + 1) as u8).unwrap_or(date.month());
    let day = date.day().min(month.length(year));
    match Date::from_calendar_date(year, month, day) {
        Ok(d) => ts.replace_date(d),
        Err(_) => ts,
    }
}

/// Add `years` calendar years (Feb 29 clamps to Feb 28 outside leap years).
pub fn add_years(ts: OffsetDateTime, years: u32) -> OffsetDateTime {
    add_months(ts, years * 12)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use time::macros::datetime;

    #[test]
    fn add_months_mid_month() {
        let t = datetime!(2026-03-10 08:30 UTC);
        assert_eq!(add_months(t, 1), datetime!(2026-04-10 08:30 UTC));
    }

    #[test]
    fn add_months_clamps_at_month_end() {
        let t = datetime!(2026-01-31 00:00 UTC);
        assert_eq!(add_months(t, 1), datetime!(2026-02-28 00:00 UTC));
    }

    #[test]
    fn add_months_clamps_to_leap_day() {
        let t = datetime!(2024-01-31 00:00 UTC);
        assert_eq!(add_months(t, 1), datetime!(2024-02-29 00:00 UTC));
    }

    #[test]
    fn add_months_rolls_over_year() {
        let t = datetime!(2026-12-15 12:00 UTC);
        assert_eq!(add_months(t, 1), datetime!(2027-01-15 12:00 UTC));
    }

    #[test]
    fn add_years_clamps_leap_day() {
        let t = datetime!(2024-02-29 06:00 UTC);
        assert_eq!(add_years(t, 1), datetime!(2025-02-28 06:00 UTC));
    }

    #[test]
    fn add_years_is_twelve_months() {
        let t = datetime!(2026-05-01 00:00 UTC);
        assert_eq!(add_years(t, 1), add_months(t, 12));
    }
}
