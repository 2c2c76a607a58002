//! Calendar arithmetic for the due set.

use chrono::{Datelike, NaiveDate, Weekday};

use cadence_core::Frequency;

/// Whether an order of the given frequency fires on `date`:
/// daily orders always, weekly orders on Mondays, monthly orders on the
/// first of the month.
#[must_use]
pub fn is_due(frequency: Frequency, date: NaiveDate) -> bool {
    match frequency {
        Frequency::Daily => true,
        Frequency::Weekly => date.weekday() == Weekday::Mon,
        Frequency::Monthly => date.day() == 1,
    }
}

/// Human hint for when a not-due order next fires, used in the
/// "no orders today" notification.
#[must_use]
pub fn next_due_hint(frequency: Frequency, date: NaiveDate) -> &'static str {
    match frequency {
        Frequency::Daily => "tomorrow",
        Frequency::Weekly => {
            if date.weekday() == Weekday::Mon {
                "today"
            } else {
                "next Monday"
            }
        }
        Frequency::Monthly => {
            if date.day() == 1 {
                "today"
            } else {
                "on the 1st"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn daily_orders_are_always_due() {
        assert!(is_due(Frequency::Daily, date(2025, 9, 16)));
        assert!(is_due(Frequency::Daily, date(2025, 9, 21)));
    }

    #[test]
    fn weekly_orders_fire_only_on_monday() {
        // 2025-09-15 is a Monday.
        assert!(is_due(Frequency::Weekly, date(2025, 9, 15)));
        // Wednesday.
        assert!(!is_due(Frequency::Weekly, date(2025, 9, 17)));
        // Tuesday.
        assert!(!is_due(Frequency::Weekly, date(2025, 9, 16)));
    }

    #[test]
    fn monthly_orders_fire_only_on_the_first() {
        assert!(is_due(Frequency::Monthly, date(2025, 9, 1)));
        assert!(!is_due(Frequency::Monthly, date(2025, 9, 2)));
        assert!(!is_due(Frequency::Monthly, date(2025, 9, 30)));
    }
}
