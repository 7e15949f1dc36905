use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Weekday};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// 2.0TD tariff periods: p1 peak, p2 mid, p3 off-peak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tariff {
    P1,
    P2,
    P3,
}

impl Tariff {
    pub const ALL: [Tariff; 3] = [Tariff::P1, Tariff::P2, Tariff::P3];

    pub fn label(self) -> &'static str {
        match self {
            Tariff::P1 => "p1",
            Tariff::P2 => "p2",
            Tariff::P3 => "p3",
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(Tariff::P1),
            2 => Some(Tariff::P2),
            3 => Some(Tariff::P3),
            _ => None,
        }
    }
}

impl fmt::Display for Tariff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// National holidays with a fixed date. Movable ones do not count as p3 days.
const FIXED_HOLIDAYS: [(u32, u32); 9] = [
    (1, 1),
    (1, 6),
    (5, 1),
    (8, 15),
    (10, 12),
    (11, 1),
    (12, 6),
    (12, 8),
    (12, 25),
];

pub fn is_holiday(date: NaiveDate) -> bool {
    FIXED_HOLIDAYS.contains(&(date.month(), date.day()))
}

/// Tariff period of the hourly bucket starting at `start` (local time)
pub fn tariff_at(start: NaiveDateTime) -> Tariff {
    let date = start.date();
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) || is_holiday(date) {
        return Tariff::P3;
    }
    match start.hour() {
        0..=7 => Tariff::P3,
        8..=9 | 14..=17 | 22..=23 => Tariff::P2,
        _ => Tariff::P1,
    }
}

/// Maximeter only distinguishes two periods, everything outside p1 counts as p2
pub fn maximeter_tariff(start: NaiveDateTime) -> Tariff {
    match tariff_at(start) {
        Tariff::P1 => Tariff::P1,
        _ => Tariff::P2,
    }
}
