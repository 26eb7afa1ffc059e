//! Peak / off-peak classification of civil timestamps.
//!
//! Rules are checked in order and the first match wins:
//! night hours, weekends, fixed yearly dates, then the Easter-relative
//! holidays (Easter Monday, Ascension Day, Pentecost Monday).

use crate::config::TariffConfig;
use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

/// Days after Easter Sunday that are low tariff.
const EASTER_MONDAY: u64 = 1;
const ASCENSION_DAY: u64 = 39;
const PENTECOST_MONDAY: u64 = ASCENSION_DAY + 10 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TariffPeriod {
    High,
    Low,
}

#[derive(Debug, Clone)]
pub struct TariffClassifier {
    config: TariffConfig,
}

impl TariffClassifier {
    pub fn new(config: TariffConfig) -> Self {
        Self { config }
    }

    pub fn period(&self, at: NaiveDateTime) -> TariffPeriod {
        if self.is_low_tariff(at) {
            TariffPeriod::Low
        } else {
            TariffPeriod::High
        }
    }

    pub fn is_low_tariff(&self, at: NaiveDateTime) -> bool {
        if self.in_low_tariff_hours(at.time()) {
            return true;
        }

        let date = at.date();

        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return true;
        }

        if self.config.low_tariff_days.iter().any(|d| d.matches(date)) {
            return true;
        }

        is_easter_holiday(date)
    }

    /// Both boundaries are exclusive. A window whose start is later than its
    /// end wraps midnight.
    fn in_low_tariff_hours(&self, time: NaiveTime) -> bool {
        let start = self.config.low_tariff_start;
        let end = self.config.low_tariff_end;
        if start > end {
            time > start || time < end
        } else {
            time > start && time < end
        }
    }
}

fn is_easter_holiday(date: NaiveDate) -> bool {
    let Some(easter) = easter_sunday(date.year()) else {
        return false;
    };

    [EASTER_MONDAY, ASCENSION_DAY, PENTECOST_MONDAY]
        .into_iter()
        .filter_map(|offset| easter.checked_add_days(Days::new(offset)))
        .any(|holiday| holiday == date)
}

/// Western Easter Sunday for `year` (anonymous Gregorian algorithm).
pub fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year.rem_euclid(19);
    let b = year.div_euclid(100);
    let c = year.rem_euclid(100);
    let d = b.div_euclid(4);
    let e = b.rem_euclid(4);
    let f = (b + 8).div_euclid(25);
    let g = (b - f + 1).div_euclid(3);
    let h = (19 * a + b - d - g + 15).rem_euclid(30);
    let i = c.div_euclid(4);
    let k = c.rem_euclid(4);
    let l = (32 + 2 * e + 2 * i - h - k).rem_euclid(7);
    let m = (a + 11 * h + 22 * l).div_euclid(451);
    let n = h + l - 7 * m + 114;

    let month = n.div_euclid(31);
    let day = n.rem_euclid(31) + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}
