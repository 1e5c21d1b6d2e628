//! Time expressions accepted by `wait_and` / `wait_or`
//!
//! ```text
//! NOW <n> (second|minute|hour|day|week|month)
//! EVERY [MONTHDAY <±d> | WEEKDAY <w>] [DAYHOUR <h>] [HOURMINUTE <m>] [MINUTESECOND <s>]
//! ```
//!
//! A relative expression fires `n` units after the call; a day is 24 hours,
//! a week 7 days and a month 30 days. A calendar expression fires at the
//! first local wall-clock second strictly after the call that matches every
//! given field. Fields finer than the coarsest given one default to zero,
//! coarser ones are free. `EVERY` alone fires one second after the call.
//! `MONTHDAY -1` is the last day of a month; months too short for the
//! requested day are skipped. `WEEKDAY 0` is Sunday.

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, Local, LocalResult, NaiveDate, NaiveDateTime,
    NaiveTime, TimeZone, Timelike, Utc,
};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{TimeExprError, TimeExprResult};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Longest search window; every selector recurs well within it
const SEARCH_DAYS: u32 = 400;

/// Unit of a relative expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl TimeUnit {
    fn seconds(self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 60 * 60,
            TimeUnit::Day => DAY_SECS,
            TimeUnit::Week => 7 * DAY_SECS,
            TimeUnit::Month => 30 * DAY_SECS,
        }
    }

    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "second" => TimeUnit::Second,
            "minute" => TimeUnit::Minute,
            "hour" => TimeUnit::Hour,
            "day" => TimeUnit::Day,
            "week" => TimeUnit::Week,
            "month" => TimeUnit::Month,
            _ => return None,
        })
    }
}

/// Day restriction of a calendar expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaySelector {
    /// 1..=31 from the start of the month, -1..=-31 from its end
    MonthDay(i8),
    /// 0 = Sunday .. 6 = Saturday
    WeekDay(u8),
}

/// A recurring wall-clock pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Calendar {
    pub day: Option<DaySelector>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub second: Option<u32>,
}

/// A parsed time expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExpr {
    Relative { amount: u64, unit: TimeUnit },
    Calendar(Calendar),
}

fn field(
    name: &'static str,
    token: Option<&str>,
    range: std::ops::RangeInclusive<i64>,
    text: &str,
) -> TimeExprResult<i64> {
    let value: i64 = token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| TimeExprError::Syntax(text.to_string()))?;
    if !range.contains(&value) {
        return Err(TimeExprError::OutOfRange { field: name, value });
    }
    Ok(value)
}

impl FromStr for TimeExpr {
    type Err = TimeExprError;

    fn from_str(text: &str) -> TimeExprResult<Self> {
        let syntax = || TimeExprError::Syntax(text.to_string());
        let mut tokens = text.split_whitespace().peekable();

        match tokens.next() {
            Some("NOW") => {
                let amount: u64 = tokens
                    .next()
                    .filter(|t| t.bytes().all(|b| b.is_ascii_digit()))
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(syntax)?;
                let unit = tokens.next().and_then(TimeUnit::parse).ok_or_else(syntax)?;
                if tokens.next().is_some() {
                    return Err(syntax());
                }
                if amount == 0 {
                    return Err(TimeExprError::ZeroAmount(amount));
                }
                Ok(TimeExpr::Relative { amount, unit })
            }
            Some("EVERY") => {
                let mut calendar = Calendar::default();

                match tokens.peek().copied() {
                    Some("MONTHDAY") => {
                        tokens.next();
                        let day = field("MONTHDAY", tokens.next(), -31..=31, text)?;
                        if day == 0 {
                            return Err(TimeExprError::OutOfRange { field: "MONTHDAY", value: 0 });
                        }
                        calendar.day = Some(DaySelector::MonthDay(day as i8));
                    }
                    Some("WEEKDAY") => {
                        tokens.next();
                        let day = field("WEEKDAY", tokens.next(), 0..=6, text)?;
                        calendar.day = Some(DaySelector::WeekDay(day as u8));
                    }
                    _ => {}
                }
                if tokens.peek() == Some(&"DAYHOUR") {
                    tokens.next();
                    calendar.hour = Some(field("DAYHOUR", tokens.next(), 0..=23, text)? as u32);
                }
                if tokens.peek() == Some(&"HOURMINUTE") {
                    tokens.next();
                    calendar.minute = Some(field("HOURMINUTE", tokens.next(), 0..=59, text)? as u32);
                }
                if tokens.peek() == Some(&"MINUTESECOND") {
                    tokens.next();
                    calendar.second =
                        Some(field("MINUTESECOND", tokens.next(), 0..=59, text)? as u32);
                }
                if tokens.next().is_some() {
                    return Err(syntax());
                }
                Ok(TimeExpr::Calendar(calendar))
            }
            _ => Err(syntax()),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeUnit::Second => "second",
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
        };
        f.write_str(name)
    }
}

impl fmt::Display for TimeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeExpr::Relative { amount, unit } => write!(f, "NOW {amount} {unit}"),
            TimeExpr::Calendar(c) => {
                f.write_str("EVERY")?;
                match c.day {
                    Some(DaySelector::MonthDay(d)) => write!(f, " MONTHDAY {d}")?,
                    Some(DaySelector::WeekDay(d)) => write!(f, " WEEKDAY {d}")?,
                    None => {}
                }
                if let Some(h) = c.hour {
                    write!(f, " DAYHOUR {h}")?;
                }
                if let Some(m) = c.minute {
                    write!(f, " HOURMINUTE {m}")?;
                }
                if let Some(s) = c.second {
                    write!(f, " MINUTESECOND {s}")?;
                }
                Ok(())
            }
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(28, |last| last.day())
}

impl DaySelector {
    fn matches(self, date: NaiveDate) -> bool {
        match self {
            DaySelector::MonthDay(d) if d > 0 => date.day() == d as u32,
            DaySelector::MonthDay(d) => {
                let from_end = u32::from(d.unsigned_abs());
                let last = days_in_month(date.year(), date.month());
                from_end <= last && date.day() == last + 1 - from_end
            }
            DaySelector::WeekDay(w) => date.weekday().num_days_from_sunday() == u32::from(w),
        }
    }
}

impl Calendar {
    /// Constraint per clock field after applying the zero defaults
    fn clock_fields(&self) -> [Option<u32>; 3] {
        let [mut hour, mut minute, mut second] = [self.hour, self.minute, self.second];
        let coarse = [self.day.is_some(), hour.is_some(), minute.is_some()];
        if coarse[0] {
            hour.get_or_insert(0);
        }
        if coarse[0] || coarse[1] {
            minute.get_or_insert(0);
        }
        if coarse.iter().any(|c| *c) {
            second.get_or_insert(0);
        }
        [hour, minute, second]
    }

    /// Earliest matching time of day at or after `from`
    fn first_time(fields: [Option<u32>; 3], from: NaiveTime) -> Option<NaiveTime> {
        let accept = |constraint: Option<u32>, v: u32| constraint.map_or(true, |c| c == v);
        let [hour, minute, second] = fields;

        for h in from.hour()..24 {
            if !accept(hour, h) {
                continue;
            }
            let m0 = if h == from.hour() { from.minute() } else { 0 };
            for m in m0..60 {
                if !accept(minute, m) {
                    continue;
                }
                let s0 = if h == from.hour() && m == from.minute() { from.second() } else { 0 };
                if let Some(s) = (s0..60).find(|s| accept(second, *s)) {
                    return NaiveTime::from_hms_opt(h, m, s);
                }
            }
        }
        None
    }

    /// First matching local wall-clock second strictly after `now`
    pub fn next_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let start = now.with_nanosecond(0)? + ChronoDuration::seconds(1);
        if *self == Calendar::default() {
            return Some(start);
        }

        let fields = self.clock_fields();
        let mut date = start.date();
        let mut from = start.time();
        for _ in 0..SEARCH_DAYS {
            if self.day.map_or(true, |d| d.matches(date)) {
                if let Some(time) = Self::first_time(fields, from) {
                    return Some(date.and_time(time));
                }
            }
            date = date.succ_opt()?;
            from = NaiveTime::MIN;
        }
        None
    }
}

impl TimeExpr {
    pub fn parse(text: &str) -> TimeExprResult<Self> {
        text.parse()
    }

    /// Absolute deadline of the expression evaluated at `now`
    pub fn deadline(&self, now: DateTime<Local>) -> TimeExprResult<DateTime<Utc>> {
        match self {
            TimeExpr::Relative { amount, unit } => {
                let secs = amount.saturating_mul(unit.seconds());
                let offset = ChronoDuration::from_std(Duration::from_secs(secs))
                    .map_err(|_| TimeExprError::NoOccurrence(self.to_string()))?;
                now.checked_add_signed(offset)
                    .map(|t| t.with_timezone(&Utc))
                    .ok_or_else(|| TimeExprError::NoOccurrence(self.to_string()))
            }
            TimeExpr::Calendar(calendar) => {
                let mut after = now.naive_local();
                // Wall-clock times skipped by a DST change are not occurrences
                for _ in 0..SEARCH_DAYS {
                    let next = calendar
                        .next_after(after)
                        .ok_or_else(|| TimeExprError::NoOccurrence(self.to_string()))?;
                    match Local.from_local_datetime(&next) {
                        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => {
                            return Ok(t.with_timezone(&Utc))
                        }
                        LocalResult::None => after = next,
                    }
                }
                Err(TimeExprError::NoOccurrence(self.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn next(expr: &str, now: NaiveDateTime) -> NaiveDateTime {
        match TimeExpr::parse(expr).unwrap() {
            TimeExpr::Calendar(c) => c.next_after(now).unwrap(),
            other => panic!("not a calendar expression: {other:?}"),
        }
    }

    #[test]
    fn test_parse_relative() {
        assert_eq!(
            TimeExpr::parse("NOW 2 second").unwrap(),
            TimeExpr::Relative { amount: 2, unit: TimeUnit::Second }
        );
        assert_eq!(
            TimeExpr::parse("NOW 3 month").unwrap(),
            TimeExpr::Relative { amount: 3, unit: TimeUnit::Month }
        );
    }

    #[test]
    fn test_parse_rejects() {
        for text in [
            "",
            "now 2 second",
            "NOW second",
            "NOW -2 second",
            "NOW 2 seconds",
            "NOW 2 second extra",
            "EVERY DAYHOUR",
            "EVERY DAYHOUR 7 WEEKDAY 1",
            "EVERY HOURMINUTE 5 DAYHOUR 7",
            "EVERY MONTHDAY 1 WEEKDAY 2",
            "LATER",
        ] {
            assert!(
                matches!(TimeExpr::parse(text), Err(TimeExprError::Syntax(_))),
                "accepted {text:?}"
            );
        }
    }

    #[test]
    fn test_parse_ranges() {
        assert_eq!(TimeExpr::parse("NOW 0 minute"), Err(TimeExprError::ZeroAmount(0)));
        assert!(matches!(
            TimeExpr::parse("EVERY MONTHDAY 0"),
            Err(TimeExprError::OutOfRange { field: "MONTHDAY", .. })
        ));
        assert!(matches!(
            TimeExpr::parse("EVERY MONTHDAY -32"),
            Err(TimeExprError::OutOfRange { field: "MONTHDAY", .. })
        ));
        assert!(matches!(
            TimeExpr::parse("EVERY WEEKDAY 7"),
            Err(TimeExprError::OutOfRange { field: "WEEKDAY", .. })
        ));
        assert!(matches!(
            TimeExpr::parse("EVERY DAYHOUR 24"),
            Err(TimeExprError::OutOfRange { field: "DAYHOUR", .. })
        ));
        assert!(TimeExpr::parse("EVERY MONTHDAY -31 DAYHOUR 23 HOURMINUTE 59 MINUTESECOND 59").is_ok());
    }

    #[test]
    fn test_display_round_trip() {
        let text = "EVERY WEEKDAY 3 DAYHOUR 6 MINUTESECOND 30";
        assert_eq!(TimeExpr::parse(text).unwrap().to_string(), text);
    }

    #[test]
    fn test_bare_every_is_next_second() {
        assert_eq!(next("EVERY", at(2024, 5, 10, 12, 0, 59)), at(2024, 5, 10, 12, 1, 0));
    }

    #[test]
    fn test_minute_second() {
        let now = at(2024, 5, 10, 12, 30, 20);
        assert_eq!(next("EVERY MINUTESECOND 45", now), at(2024, 5, 10, 12, 30, 45));
        assert_eq!(next("EVERY MINUTESECOND 10", now), at(2024, 5, 10, 12, 31, 10));
        // Strictly after now
        assert_eq!(next("EVERY MINUTESECOND 20", now), at(2024, 5, 10, 12, 31, 20));
    }

    #[test]
    fn test_finer_fields_default_to_zero() {
        let now = at(2024, 5, 10, 12, 30, 20);
        assert_eq!(next("EVERY HOURMINUTE 15", now), at(2024, 5, 10, 13, 15, 0));
        assert_eq!(next("EVERY DAYHOUR 7", now), at(2024, 5, 11, 7, 0, 0));
        assert_eq!(next("EVERY DAYHOUR 13 MINUTESECOND 5", now), at(2024, 5, 10, 13, 0, 5));
    }

    #[test]
    fn test_day_rollover() {
        assert_eq!(
            next("EVERY DAYHOUR 0", at(2024, 12, 31, 23, 59, 59)),
            at(2025, 1, 1, 0, 0, 0)
        );
    }

    #[test]
    fn test_weekday() {
        // 2024-05-10 is a Friday
        let now = at(2024, 5, 10, 12, 0, 0);
        assert_eq!(next("EVERY WEEKDAY 0", now), at(2024, 5, 12, 0, 0, 0));
        assert_eq!(next("EVERY WEEKDAY 5 DAYHOUR 18", now), at(2024, 5, 10, 18, 0, 0));
        assert_eq!(next("EVERY WEEKDAY 5 DAYHOUR 8", now), at(2024, 5, 17, 8, 0, 0));
    }

    #[test]
    fn test_monthday() {
        let now = at(2024, 5, 10, 12, 0, 0);
        assert_eq!(next("EVERY MONTHDAY 15", now), at(2024, 5, 15, 0, 0, 0));
        assert_eq!(next("EVERY MONTHDAY 10 DAYHOUR 9", now), at(2024, 6, 10, 9, 0, 0));
    }

    #[test]
    fn test_monthday_from_end() {
        assert_eq!(
            next("EVERY MONTHDAY -1", at(2024, 2, 10, 0, 0, 0)),
            at(2024, 2, 29, 0, 0, 0)
        );
        assert_eq!(
            next("EVERY MONTHDAY -1", at(2023, 2, 28, 0, 0, 0)),
            at(2023, 3, 31, 0, 0, 0)
        );
        assert_eq!(
            next("EVERY MONTHDAY -2 DAYHOUR 6", at(2024, 4, 29, 7, 0, 0)),
            at(2024, 5, 30, 6, 0, 0)
        );
    }

    #[test]
    fn test_monthday_last_day_every_month() {
        let mut now = at(2023, 1, 1, 0, 0, 0);
        for _ in 0..24 {
            let fired = next("EVERY MONTHDAY -1", now);
            assert_eq!(fired.day(), days_in_month(fired.year(), fired.month()));
            assert!(fired.month() == now.month() || fired.month() % 12 == (now.month() + 1) % 12);
            now = fired;
        }
    }

    #[test]
    fn test_short_months_are_skipped() {
        assert_eq!(
            next("EVERY MONTHDAY 31", at(2024, 4, 1, 0, 0, 0)),
            at(2024, 5, 31, 0, 0, 0)
        );
        assert_eq!(
            next("EVERY MONTHDAY -31", at(2024, 2, 1, 0, 0, 0)),
            at(2024, 3, 1, 0, 0, 0)
        );
    }

    #[test]
    fn test_relative_deadline() {
        let now = Local::now();
        let deadline = TimeExpr::parse("NOW 2 week").unwrap().deadline(now).unwrap();
        assert_eq!((deadline - now.with_timezone(&Utc)).num_days(), 14);
    }

    #[test]
    fn test_calendar_deadline_is_in_future() {
        let now = Local::now();
        let deadline = TimeExpr::parse("EVERY MINUTESECOND 0").unwrap().deadline(now).unwrap();
        let ahead = deadline - now.with_timezone(&Utc);
        assert!(ahead > ChronoDuration::zero());
        assert!(ahead <= ChronoDuration::seconds(60));
    }
}
