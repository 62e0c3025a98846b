//! Business-day calendars.
//!
//! Deterministic, pure logic. Holiday sets are computed per year from fixed
//! rules (Easter computus, nth-weekday, weekend observance), so there is no
//! table to keep current.

use crate::types::{text_enum, AssetClass};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CalendarKind {
    /// Monday to Friday, no holidays. Commodities and tests.
    Weekdays,
    Nyse,
    UsTreasury,
    /// Euro-area settlement calendar.
    Target,
}

text_enum!(CalendarKind {
    Weekdays => "weekdays",
    Nyse => "nyse",
    UsTreasury => "us_treasury",
    Target => "target",
});

impl CalendarKind {
    pub fn for_asset_class(asset_class: AssetClass) -> Self {
        match asset_class {
            AssetClass::Equities    => Self::Nyse,
            AssetClass::Rates       => Self::UsTreasury,
            AssetClass::Fx          => Self::Target,
            AssetClass::Commodities => Self::Weekdays,
        }
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        // A Jan 1 falling on Saturday is observed on Dec 31 of the prior year.
        let year = date.year();
        !self.holidays(year).contains(&date) && !self.holidays(year + 1).contains(&date)
    }

    /// Business days in `[start, end]`, ascending.
    pub fn business_days(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut d = start;
        while d <= end {
            if self.is_business_day(d) {
                out.push(d);
            }
            d += Duration::days(1);
        }
        out
    }

    /// First business day strictly after `date`.
    pub fn next_business_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date + Duration::days(1);
        while !self.is_business_day(d) {
            d += Duration::days(1);
        }
        d
    }

    /// Last business day strictly before `date`.
    pub fn previous_business_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date - Duration::days(1);
        while !self.is_business_day(d) {
            d -= Duration::days(1);
        }
        d
    }

    /// True when no business day lies strictly between `a` and `b` (`a <= b`).
    pub fn adjacent(&self, a: NaiveDate, b: NaiveDate) -> bool {
        b <= self.next_business_day(a)
    }

    pub fn holidays(&self, year: i32) -> Vec<NaiveDate> {
        match self {
            Self::Weekdays => Vec::new(),
            Self::Nyse | Self::UsTreasury => us_holidays(year, *self == Self::Nyse),
            Self::Target => target_holidays(year),
        }
    }
}

fn us_holidays(year: i32, nyse: bool) -> Vec<NaiveDate> {
    let mut out: Vec<NaiveDate> = Vec::with_capacity(10);
    let mut push = |d: Option<NaiveDate>| {
        if let Some(d) = d {
            out.push(d);
        }
    };

    push(ymd(year, 1, 1).map(nearest_workday));
    push(NaiveDate::from_weekday_of_month_opt(year, 1, Weekday::Mon, 3));
    push(NaiveDate::from_weekday_of_month_opt(year, 2, Weekday::Mon, 3));
    push(easter_sunday(year).map(|e| e - Duration::days(2)));
    push(last_weekday_of_month(year, 5, Weekday::Mon));
    let juneteenth_from = if nyse { 2022 } else { 2021 };
    if year >= juneteenth_from {
        push(ymd(year, 6, 19).map(nearest_workday));
    }
    push(ymd(year, 7, 4).map(nearest_workday));
    push(NaiveDate::from_weekday_of_month_opt(year, 9, Weekday::Mon, 1));
    push(NaiveDate::from_weekday_of_month_opt(year, 11, Weekday::Thu, 4));
    push(ymd(year, 12, 25).map(nearest_workday));
    out
}

fn target_holidays(year: i32) -> Vec<NaiveDate> {
    let easter = easter_sunday(year);
    [
        ymd(year, 1, 1),
        easter.map(|e| e - Duration::days(2)),
        easter.map(|e| e + Duration::days(1)),
        ymd(year, 5, 1),
        ymd(year, 12, 25),
        ymd(year, 12, 26),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Saturday -> Friday, Sunday -> Monday.
fn nearest_workday(d: NaiveDate) -> NaiveDate {
    match d.weekday() {
        Weekday::Sat => d - Duration::days(1),
        Weekday::Sun => d + Duration::days(1),
        _ => d,
    }
}

fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, 5)
        .or_else(|| NaiveDate::from_weekday_of_month_opt(year, month, weekday, 4))
}

/// Anonymous Gregorian computus.
fn easter_sunday(year: i32) -> Option<NaiveDate> {
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
    ymd(year, month as u32, day as u32)
}
