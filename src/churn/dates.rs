//! Calendar Date Semantics
//!
//! Single source of truth for how dates enter the pipeline and how month
//! boundaries are computed.
//!
//! # Encoding
//!
//! Source tables encode dates as decimal `YYYYMMDD` integers. Parsing is
//! lenient about surrounding whitespace and a trailing `.0` (float-typed
//! exports), and strict about everything else: a value that does not name a
//! real calendar day yields `None` and the row is dropped upstream. Nothing is
//! ever coerced to a "nearby" valid date.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parse a `YYYYMMDD` source value.
pub fn parse_yyyymmdd(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = digits[0..4].parse().ok()?;
    let month: u32 = digits[4..6].parse().ok()?;
    let day: u32 = digits[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parse a user-supplied date: ISO `YYYY-MM-DD` or `YYYYMMDD`.
pub fn parse_cli_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_yyyymmdd(raw))
}

/// Signed number of days from `from` to `to`.
#[inline]
pub fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}

/// A calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && NaiveDate::from_ymd_opt(year, month, 1).is_some() {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next()
            .first_day()
            .pred_opt()
            .unwrap_or_else(|| self.first_day())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn prev(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// Whole months from `self` to `later` (negative if `later` is earlier).
    pub fn months_until(&self, later: YearMonth) -> i64 {
        (later.year as i64 - self.year as i64) * 12 + (later.month as i64 - self.month as i64)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    /// Accepts `YYYY-MM` or `YYYYMM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (y, m) = match s.split_once('-') {
            Some((y, m)) => (y, m),
            None => match (s.len(), s.get(0..4), s.get(4..6)) {
                (6, Some(y), Some(m)) => (y, m),
                _ => return Err(format!("expected YYYY-MM, got '{}'", s)),
            },
        };
        let year: i32 = y
            .parse()
            .map_err(|_| format!("invalid year in '{}'", s))?;
        let month: u32 = m
            .parse()
            .map_err(|_| format!("invalid month in '{}'", s))?;
        Self::new(year, month).ok_or_else(|| format!("month out of range in '{}'", s))
    }
}

impl TryFrom<String> for YearMonth {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_parse_yyyymmdd_accepts_integer_and_float_forms() {
        assert_eq!(parse_yyyymmdd("20170215"), Some(d(2017, 2, 15)));
        assert_eq!(parse_yyyymmdd(" 20170215 "), Some(d(2017, 2, 15)));
        assert_eq!(parse_yyyymmdd("20170215.0"), Some(d(2017, 2, 15)));
    }

    #[test]
    fn test_parse_yyyymmdd_rejects_invalid_without_coercion() {
        assert_eq!(parse_yyyymmdd(""), None);
        assert_eq!(parse_yyyymmdd("invalid"), None);
        assert_eq!(parse_yyyymmdd("20170230"), None);
        assert_eq!(parse_yyyymmdd("2017021"), None);
        assert_eq!(parse_yyyymmdd("-2017021"), None);
        assert_eq!(parse_yyyymmdd("20171301"), None);
    }

    #[test]
    fn test_parse_cli_date_both_forms() {
        assert_eq!(parse_cli_date("2017-02-28"), Some(d(2017, 2, 28)));
        assert_eq!(parse_cli_date("20170228"), Some(d(2017, 2, 28)));
        assert_eq!(parse_cli_date("28/02/2017"), None);
    }

    #[test]
    fn test_month_bounds() {
        let feb: YearMonth = "2017-02".parse().unwrap();
        assert_eq!(feb.first_day(), d(2017, 2, 1));
        assert_eq!(feb.last_day(), d(2017, 2, 28));
        let leap: YearMonth = "201602".parse().unwrap();
        assert_eq!(leap.last_day(), d(2016, 2, 29));
        let dec: YearMonth = "2016-12".parse().unwrap();
        assert_eq!(dec.last_day(), d(2016, 12, 31));
        assert_eq!(dec.next().to_string(), "2017-01");
        assert_eq!(dec.next().prev(), dec);
    }

    #[test]
    fn test_month_parse_errors() {
        assert!("2017-13".parse::<YearMonth>().is_err());
        assert!("2017".parse::<YearMonth>().is_err());
        assert!("abcd-01".parse::<YearMonth>().is_err());
        assert!("ab\u{20ac}a".parse::<YearMonth>().is_err());
        assert!("20\u{20ac}a".parse::<YearMonth>().is_err());
        assert_eq!("201703".parse::<YearMonth>().unwrap().to_string(), "2017-03");
    }

    #[test]
    fn test_months_until_and_days_between() {
        let jan: YearMonth = "2017-01".parse().unwrap();
        let apr: YearMonth = "2017-04".parse().unwrap();
        assert_eq!(jan.months_until(apr), 3);
        assert_eq!(apr.months_until(jan), -3);
        assert_eq!(days_between(d(2017, 2, 15), d(2017, 3, 17)), 30);
        assert_eq!(days_between(d(2017, 2, 15), d(2017, 2, 15)), 0);
    }
}
