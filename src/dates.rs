use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike};

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First day of the month `months` before the month containing `date`
pub fn months_back(date: NaiveDate, months: u32) -> NaiveDate {
    month_start(date)
        .checked_sub_months(Months::new(months))
        .unwrap_or(NaiveDate::MIN)
}

pub fn next_month(date: NaiveDate) -> NaiveDate {
    month_start(date)
        .checked_add_months(Months::new(1))
        .unwrap_or(NaiveDate::MAX)
}

pub fn days_in_month(date: NaiveDate) -> i64 {
    (next_month(date) - month_start(date)).num_days()
}

pub fn truncate_hour(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date()
        .and_hms_opt(dt.hour(), 0, 0)
        .unwrap_or(dt)
}

pub fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

/// Earliest representable local timestamp, used when a stream has no history
pub fn epoch() -> NaiveDateTime {
    midnight(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN))
}

pub fn one_hour() -> Duration {
    Duration::hours(1)
}
