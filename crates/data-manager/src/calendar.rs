use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};

use trading_core::TradingHours;

/// Exchange trading calendar: weekends, full-day holidays and the regular
/// session. Defaults model US equities; per-symbol details from the
/// provider override the session and extend the holiday set.
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    trading_hours: TradingHours,
    extra_holidays: Vec<NaiveDate>,
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self {
            trading_hours: TradingHours::session(
                chrono::NaiveTime::from_hms_opt(14, 30, 0).unwrap(),
                chrono::NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
            ),
            extra_holidays: Vec::new(),
        }
    }
}

impl TradingCalendar {
    pub fn new(trading_hours: TradingHours, extra_holidays: Vec<NaiveDate>) -> Self {
        Self {
            trading_hours,
            extra_holidays,
        }
    }

    pub fn is_weekend(&self, ts: DateTime<Utc>) -> bool {
        matches!(ts.weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn is_holiday(&self, ts: DateTime<Utc>) -> bool {
        let date = ts.date_naive();
        self.extra_holidays.contains(&date) || us_market_holidays(date.year()).contains(&date)
    }

    /// Whether an intraday grid point falls outside the regular session.
    pub fn is_outside_trading_hours(&self, ts: DateTime<Utc>) -> bool {
        !self.trading_hours.contains(ts.time())
    }
}

/// US equity full-day market holidays for one year, observance-shifted.
pub fn us_market_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);
    let fixed = |m: u32, d: u32| observed(NaiveDate::from_ymd_opt(year, m, d).unwrap());

    days.push(fixed(1, 1)); // New Year's Day
    days.push(nth_weekday(year, 1, Weekday::Mon, 3)); // MLK Day
    days.push(nth_weekday(year, 2, Weekday::Mon, 3)); // Presidents' Day
    days.push(easter_sunday(year) - Duration::days(2)); // Good Friday
    days.push(last_weekday(year, 5, Weekday::Mon)); // Memorial Day
    if year >= 2022 {
        days.push(fixed(6, 19)); // Juneteenth
    }
    days.push(fixed(7, 4)); // Independence Day
    days.push(nth_weekday(year, 9, Weekday::Mon, 1)); // Labor Day
    days.push(nth_weekday(year, 11, Weekday::Thu, 4)); // Thanksgiving
    days.push(fixed(12, 25)); // Christmas
    days
}

/// Saturday holidays are observed the Friday before, Sunday holidays the
/// Monday after.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let offset = (7 + weekday.num_days_from_monday() as i64
        - first.weekday().num_days_from_monday() as i64)
        % 7;
    first + Duration::days(offset + 7 * (n as i64 - 1))
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    };
    let last = first_next - Duration::days(1);
    let offset = (7 + last.weekday().num_days_from_monday() as i64
        - weekday.num_days_from_monday() as i64)
        % 7;
    last - Duration::days(offset)
}

/// Anonymous Gregorian computus.
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn easter_reference_dates() {
        assert_eq!(easter_sunday(2024), date("2024-03-31"));
        assert_eq!(easter_sunday(2025), date("2025-04-20"));
        assert_eq!(easter_sunday(2023), date("2023-04-09"));
    }

    #[test]
    fn holidays_2024() {
        let days = us_market_holidays(2024);
        assert!(days.contains(&date("2024-01-01"))); // New Year
        assert!(days.contains(&date("2024-01-15"))); // MLK
        assert!(days.contains(&date("2024-03-29"))); // Good Friday
        assert!(days.contains(&date("2024-05-27"))); // Memorial Day
        assert!(days.contains(&date("2024-07-04"))); // Independence Day
        assert!(days.contains(&date("2024-11-28"))); // Thanksgiving
        assert!(days.contains(&date("2024-12-25"))); // Christmas
    }

    #[test]
    fn weekend_observance_shifts() {
        // 2027-12-25 is a Saturday -> observed Friday 2027-12-24.
        let days = us_market_holidays(2027);
        assert!(days.contains(&date("2027-12-24")));
        // 2022-12-25 is a Sunday -> observed Monday 2022-12-26.
        let days = us_market_holidays(2022);
        assert!(days.contains(&date("2022-12-26")));
    }

    #[test]
    fn calendar_classifies_weekends_and_sessions() {
        let cal = TradingCalendar::default();
        assert!(cal.is_weekend("2024-01-06T00:00:00Z".parse().unwrap()));
        assert!(!cal.is_weekend("2024-01-08T00:00:00Z".parse().unwrap()));
        assert!(cal.is_holiday("2024-01-01T00:00:00Z".parse().unwrap()));
        // 10:00 UTC is before the 14:30 UTC equity open.
        assert!(cal.is_outside_trading_hours("2024-01-08T10:00:00Z".parse().unwrap()));
        assert!(!cal.is_outside_trading_hours("2024-01-08T15:00:00Z".parse().unwrap()));
    }
}
