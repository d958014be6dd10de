//! Schedules and next-run computation
//!
//! [`next_run`] is a pure function of a [`Schedule`] and the current time.
//! It has no memory of previous firings, so callers re-query it after
//! every trigger; [`ScheduleRunner`] does exactly that.
//!
//! Weekdays use a fixed numbering: 1 = Sunday through 7 = Saturday.

pub mod runner;

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use runner::{ScheduleRunner, SystemClock, WallClock};

/// Rejected schedule definitions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Interval must be at least one minute
    #[error("Schedule interval must be at least 1 minute")]
    InvalidInterval,

    /// Weekday number outside 1..=7
    #[error("Invalid weekday number {0} (expected 1 = Sunday .. 7 = Saturday)")]
    InvalidWeekday(u8),

    /// Malformed or out-of-range time of day
    #[error("Invalid time of day: {0}")]
    InvalidTimeOfDay(Cow<'static, str>),
}

/// Day of week, 1 = Sunday .. 7 = Saturday
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ScheduleDay(u8);

impl ScheduleDay {
    /// Sunday (1)
    pub const SUNDAY: Self = Self(1);
    /// Monday (2)
    pub const MONDAY: Self = Self(2);
    /// Tuesday (3)
    pub const TUESDAY: Self = Self(3);
    /// Wednesday (4)
    pub const WEDNESDAY: Self = Self(4);
    /// Thursday (5)
    pub const THURSDAY: Self = Self(5);
    /// Friday (6)
    pub const FRIDAY: Self = Self(6);
    /// Saturday (7)
    pub const SATURDAY: Self = Self(7);

    /// Day from its number
    pub fn new(number: u8) -> Result<Self, ScheduleError> {
        if (1..=7).contains(&number) {
            Ok(Self(number))
        } else {
            Err(ScheduleError::InvalidWeekday(number))
        }
    }

    /// Day number, 1..=7
    #[must_use]
    pub const fn number(self) -> u8 {
        self.0
    }

    /// Day of `weekday`
    #[must_use]
    pub fn from_weekday(weekday: Weekday) -> Self {
        // number_from_sunday is 1..=7 by construction
        Self(weekday.number_from_sunday() as u8)
    }
}

impl TryFrom<u8> for ScheduleDay {
    type Error = ScheduleError;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        Self::new(number)
    }
}

impl From<ScheduleDay> for u8 {
    fn from(day: ScheduleDay) -> Self {
        day.0
    }
}

impl fmt::Display for ScheduleDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            1 => "Sun",
            2 => "Mon",
            3 => "Tue",
            4 => "Wed",
            5 => "Thu",
            6 => "Fri",
            _ => "Sat",
        };
        write!(f, "{name}")
    }
}

/// Local wall-clock time, minute resolution, written `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    /// Time from hour (0..=23) and minute (0..=59)
    pub fn new(hour: u8, minute: u8) -> Result<Self, ScheduleError> {
        if hour > 23 || minute > 59 {
            return Err(ScheduleError::InvalidTimeOfDay(
                format!("{hour:02}:{minute:02}").into(),
            ));
        }
        Ok(Self { hour, minute })
    }

    /// Hour, 0..=23
    #[must_use]
    pub const fn hour(self) -> u8 {
        self.hour
    }

    /// Minute, 0..=59
    #[must_use]
    pub const fn minute(self) -> u8 {
        self.minute
    }

    fn naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for TimeOfDay {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidTimeOfDay(s.to_string().into());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse::<u8>().map_err(|_| invalid())?;
        let minute = minute.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ScheduleError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(time: TimeOfDay) -> Self {
        time.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Recurrence rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Every `minutes` minutes from now
    Interval {
        /// Period in minutes, at least 1
        minutes: u32,
    },
    /// Every day at a local time
    Daily {
        /// Local time of day
        at: TimeOfDay,
    },
    /// On the given weekdays at a local time
    Weekly {
        /// Days to run on; empty never fires
        days: BTreeSet<ScheduleDay>,
        /// Local time of day
        at: TimeOfDay,
    },
}

/// A recurrence rule with an on/off switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Disabled schedules never fire
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// The rule
    #[serde(flatten)]
    pub kind: ScheduleKind,
}

impl Schedule {
    /// Enabled interval schedule
    #[must_use]
    pub fn interval(minutes: u32) -> Self {
        Self {
            enabled: true,
            kind: ScheduleKind::Interval { minutes },
        }
    }

    /// Enabled daily schedule
    #[must_use]
    pub fn daily(at: TimeOfDay) -> Self {
        Self {
            enabled: true,
            kind: ScheduleKind::Daily { at },
        }
    }

    /// Enabled weekly schedule
    #[must_use]
    pub fn weekly(days: impl IntoIterator<Item = ScheduleDay>, at: TimeOfDay) -> Self {
        Self {
            enabled: true,
            kind: ScheduleKind::Weekly {
                days: days.into_iter().collect(),
                at,
            },
        }
    }

    /// Reject rules that could never be armed sensibly
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self.kind {
            ScheduleKind::Interval { minutes: 0 } => Err(ScheduleError::InvalidInterval),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ScheduleKind::Interval { minutes } => write!(f, "every {minutes} min")?,
            ScheduleKind::Daily { at } => write!(f, "daily at {at}")?,
            ScheduleKind::Weekly { days, at } => {
                let days: Vec<String> = days.iter().map(ToString::to_string).collect();
                write!(f, "weekly on {} at {at}", days.join(","))?;
            }
        }
        if !self.enabled {
            write!(f, " (disabled)")?;
        }
        Ok(())
    }
}

/// Next trigger strictly after `now`, in `now`'s time zone
///
/// `None` when the schedule is disabled, is a zero interval, or is weekly
/// with no days.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use skiff_core::schedule::{Schedule, TimeOfDay, next_run};
///
/// let schedule = Schedule::daily(TimeOfDay::new(2, 0).unwrap());
/// let now = Utc.with_ymd_and_hms(2024, 3, 4, 3, 0, 0).unwrap();
/// assert_eq!(
///     next_run(&schedule, &now),
///     Some(Utc.with_ymd_and_hms(2024, 3, 5, 2, 0, 0).unwrap())
/// );
/// ```
pub fn next_run<Tz: TimeZone>(schedule: &Schedule, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    if !schedule.enabled {
        return None;
    }

    match &schedule.kind {
        ScheduleKind::Interval { minutes } => {
            if *minutes == 0 {
                return None;
            }
            now.clone()
                .checked_add_signed(TimeDelta::minutes(i64::from(*minutes)))
        }
        ScheduleKind::Daily { at } => {
            let today = now.date_naive();
            (0..=2)
                .filter_map(|offset| today.checked_add_days(chrono::Days::new(offset)))
                .filter_map(|date| at_local(&now.timezone(), date, *at))
                .find(|candidate| candidate > now)
        }
        ScheduleKind::Weekly { days, at } => {
            if days.is_empty() {
                return None;
            }
            let today = now.date_naive();
            // Offset 7 is today's weekday next week
            (0..=7)
                .filter_map(|offset| today.checked_add_days(chrono::Days::new(offset)))
                .filter(|date| days.contains(&ScheduleDay::from_weekday(date.weekday())))
                .filter_map(|date| at_local(&now.timezone(), date, *at))
                .find(|candidate| candidate > now)
        }
    }
}

/// The next `count` triggers after `now`
pub fn upcoming<Tz: TimeZone>(
    schedule: &Schedule,
    now: &DateTime<Tz>,
    count: usize,
) -> Vec<DateTime<Tz>> {
    let mut runs = Vec::with_capacity(count);
    let mut cursor = now.clone();
    while runs.len() < count {
        let Some(next) = next_run(schedule, &cursor) else {
            break;
        };
        cursor = next.clone();
        runs.push(next);
    }
    runs
}

// Local wall time on `date` in `tz`. Ambiguous times (clocks going back)
// take the earlier instant; times inside a gap (clocks going forward) move
// to the first valid minute after the gap.
fn at_local<Tz: TimeZone>(tz: &Tz, date: NaiveDate, at: TimeOfDay) -> Option<DateTime<Tz>> {
    let local: NaiveDateTime = date.and_time(at.naive());
    if let Some(instant) = tz.from_local_datetime(&local).earliest() {
        return Some(instant);
    }
    (1..=24 * 60).find_map(|minutes| {
        let shifted = local.checked_add_signed(TimeDelta::minutes(minutes))?;
        tz.from_local_datetime(&shifted).earliest()
    })
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Offset, Utc};

    fn at(hour: u8, minute: u8) -> TimeOfDay {
        TimeOfDay::new(hour, minute).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    // 2024-03-04 is a Monday

    #[test]
    fn test_interval() {
        let now = utc(2024, 3, 4, 10, 0);
        assert_eq!(
            next_run(&Schedule::interval(90), &now),
            Some(utc(2024, 3, 4, 11, 30))
        );
        assert_eq!(next_run(&Schedule::interval(0), &now), None);
    }

    #[test]
    fn test_daily_later_today() {
        let schedule = Schedule::daily(at(2, 0));
        assert_eq!(
            next_run(&schedule, &utc(2024, 3, 4, 1, 0)),
            Some(utc(2024, 3, 4, 2, 0))
        );
    }

    #[test]
    fn test_daily_already_passed() {
        let schedule = Schedule::daily(at(2, 0));
        assert_eq!(
            next_run(&schedule, &utc(2024, 3, 4, 3, 0)),
            Some(utc(2024, 3, 5, 2, 0))
        );
        // Exactly at the trigger time is not "still in the future"
        assert_eq!(
            next_run(&schedule, &utc(2024, 3, 4, 2, 0)),
            Some(utc(2024, 3, 5, 2, 0))
        );
    }

    #[test]
    fn test_weekly_wraps_to_next_week() {
        let schedule = Schedule::weekly([ScheduleDay::MONDAY, ScheduleDay::FRIDAY], at(22, 0));
        // Saturday 2024-03-09
        assert_eq!(
            next_run(&schedule, &utc(2024, 3, 9, 12, 0)),
            Some(utc(2024, 3, 11, 22, 0))
        );
    }

    #[test]
    fn test_weekly_same_day() {
        let schedule = Schedule::weekly([ScheduleDay::MONDAY, ScheduleDay::FRIDAY], at(22, 0));
        // Monday before and after the trigger
        assert_eq!(
            next_run(&schedule, &utc(2024, 3, 4, 21, 59)),
            Some(utc(2024, 3, 4, 22, 0))
        );
        assert_eq!(
            next_run(&schedule, &utc(2024, 3, 4, 22, 30)),
            Some(utc(2024, 3, 8, 22, 0))
        );
    }

    #[test]
    fn test_weekly_single_day_passed_today() {
        let schedule = Schedule::weekly([ScheduleDay::MONDAY], at(8, 0));
        assert_eq!(
            next_run(&schedule, &utc(2024, 3, 4, 9, 0)),
            Some(utc(2024, 3, 11, 8, 0))
        );
    }

    #[test]
    fn test_weekly_sunday_saturday_boundaries() {
        let schedule = Schedule::weekly([ScheduleDay::SUNDAY], at(0, 0));
        // Saturday late evening
        assert_eq!(
            next_run(&schedule, &utc(2024, 3, 9, 23, 59)),
            Some(utc(2024, 3, 10, 0, 0))
        );

        let schedule = Schedule::weekly([ScheduleDay::SATURDAY], at(23, 30));
        // Sunday
        assert_eq!(
            next_run(&schedule, &utc(2024, 3, 10, 1, 0)),
            Some(utc(2024, 3, 16, 23, 30))
        );
    }

    #[test]
    fn test_weekly_empty_and_disabled() {
        let schedule = Schedule::weekly(Vec::new(), at(8, 0));
        assert_eq!(next_run(&schedule, &utc(2024, 3, 4, 9, 0)), None);

        let mut schedule = Schedule::daily(at(8, 0));
        schedule.enabled = false;
        assert_eq!(next_run(&schedule, &utc(2024, 3, 4, 9, 0)), None);
    }

    #[test]
    fn test_result_in_callers_time_zone() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 3, 4, 23, 0, 0).unwrap();
        let next = next_run(&Schedule::daily(at(1, 30)), &now).unwrap();
        assert_eq!(next, tz.with_ymd_and_hms(2024, 3, 5, 1, 30, 0).unwrap());
        assert_eq!(next.offset().fix(), tz);
    }

    #[test]
    fn test_upcoming() {
        let schedule = Schedule::weekly([ScheduleDay::MONDAY, ScheduleDay::FRIDAY], at(22, 0));
        let runs = upcoming(&schedule, &utc(2024, 3, 4, 23, 0), 3);
        assert_eq!(
            runs,
            vec![
                utc(2024, 3, 8, 22, 0),
                utc(2024, 3, 11, 22, 0),
                utc(2024, 3, 15, 22, 0)
            ]
        );
        assert!(upcoming(&Schedule::weekly(Vec::new(), at(1, 0)), &utc(2024, 3, 4, 0, 0), 3).is_empty());
    }

    #[test]
    fn test_schedule_day_numbering() {
        assert_eq!(ScheduleDay::from_weekday(Weekday::Sun), ScheduleDay::SUNDAY);
        assert_eq!(ScheduleDay::from_weekday(Weekday::Sat).number(), 7);
        assert_eq!(ScheduleDay::new(0), Err(ScheduleError::InvalidWeekday(0)));
        assert_eq!(ScheduleDay::new(8), Err(ScheduleError::InvalidWeekday(8)));
        assert_eq!(ScheduleDay::MONDAY.to_string(), "Mon");
    }

    #[test]
    fn test_time_of_day_parsing() {
        assert_eq!("02:00".parse::<TimeOfDay>().unwrap(), at(2, 0));
        assert_eq!("7:05".parse::<TimeOfDay>().unwrap().to_string(), "07:05");
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("12:60".parse::<TimeOfDay>().is_err());
        assert!("noon".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn test_schedule_serde() {
        let json = r#"{"type":"weekly","days":[2,6],"at":"22:00"}"#;
        let schedule: Schedule = serde_json::from_str(json).unwrap();
        assert!(schedule.enabled);
        assert_eq!(
            schedule,
            Schedule::weekly([ScheduleDay::MONDAY, ScheduleDay::FRIDAY], at(22, 0))
        );

        let bad = r#"{"type":"weekly","days":[9],"at":"22:00"}"#;
        assert!(serde_json::from_str::<Schedule>(bad).is_err());

        let json = serde_json::to_string(&Schedule::interval(15)).unwrap();
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Schedule::interval(15));
    }

    #[test]
    fn test_validate() {
        assert_eq!(
            Schedule::interval(0).validate(),
            Err(ScheduleError::InvalidInterval)
        );
        assert!(Schedule::daily(at(0, 0)).validate().is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(Schedule::interval(30).to_string(), "every 30 min");
        assert_eq!(
            Schedule::weekly([ScheduleDay::FRIDAY, ScheduleDay::MONDAY], at(22, 0)).to_string(),
            "weekly on Mon,Fri at 22:00"
        );
    }
}
