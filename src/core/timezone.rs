//! Fixed-offset timezones for day partitioning and timestamp display.
//!
//! Day files are partitioned by the calendar day of the store's timezone.
//! Only UTC and fixed offsets exist: a store configured at `+01:00` keeps its
//! day boundary at 23:00Z all year, so summer days are not shifted by daylight
//! saving. Named zones such as `Europe/Paris` are rejected.

use std::fmt;
use std::str::FromStr;

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::core::{Error, Result, NANOS_PER_SEC};

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timezone {
    #[default]
    UTC,
    /// Offset east of UTC in seconds, never zero.
    FixedOffset(i32),
}

impl Timezone {
    /// A fixed offset east of UTC. Zero is [`Timezone::UTC`].
    pub fn fixed(offset_secs: i32) -> Result<Self> {
        UtcOffset::from_whole_seconds(offset_secs)?;
        Ok(match offset_secs {
            0 => Timezone::UTC,
            secs => Timezone::FixedOffset(secs),
        })
    }

    /// Offset in seconds from UTC.
    pub fn offset_seconds(&self) -> i32 {
        match self {
            Timezone::UTC => 0,
            Timezone::FixedOffset(offset) => *offset,
        }
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        Ok(UtcOffset::from_whole_seconds(self.offset_seconds())?)
    }

    /// Seconds since the epoch as read on a local wall clock.
    pub fn local_secs(&self, timestamp_ns: i64) -> i64 {
        timestamp_ns.div_euclid(NANOS_PER_SEC) + self.offset_seconds() as i64
    }

    /// Local calendar day of a timestamp.
    pub fn day_of(&self, timestamp_ns: i64) -> Result<Date> {
        let days = self.local_secs(timestamp_ns).div_euclid(SECS_PER_DAY);
        let date = OffsetDateTime::UNIX_EPOCH.date();
        date.checked_add(time::Duration::days(days))
            .ok_or_else(|| Error::Time(format!("timestamp out of range: {timestamp_ns}")))
    }

    /// Timestamp of local midnight starting `day`.
    pub fn day_start_ns(&self, day: Date) -> Result<i64> {
        let local = PrimitiveDateTime::new(day, Time::MIDNIGHT).assume_offset(self.utc_offset()?);
        i64::try_from(local.unix_timestamp_nanos())
            .map_err(|_| Error::Time(format!("day out of range: {day}")))
    }

    /// Every local day touched by `[t0_ns, t1_ns]`, in order.
    pub fn days_covering(&self, t0_ns: i64, t1_ns: i64) -> Result<Vec<Date>> {
        if t1_ns < t0_ns {
            return Ok(Vec::new());
        }
        let last = self.day_of(t1_ns)?;
        let mut day = self.day_of(t0_ns)?;
        let mut days = vec![day];
        while day < last {
            day = day
                .next_day()
                .ok_or_else(|| Error::Time(format!("day out of range after {day}")))?;
            days.push(day);
        }
        Ok(days)
    }

    pub fn to_datetime(&self, timestamp_ns: i64) -> Result<OffsetDateTime> {
        Ok(OffsetDateTime::from_unix_timestamp_nanos(timestamp_ns as i128)?
            .to_offset(self.utc_offset()?))
    }

    /// RFC 3339 rendering in this timezone.
    pub fn format_timestamp(&self, timestamp_ns: i64) -> Result<String> {
        self.to_datetime(timestamp_ns)?
            .format(&Rfc3339)
            .map_err(|err| Error::Time(err.to_string()))
    }

    /// Parse RFC 3339, `YYYY-MM-DD HH:MM:SS` (local) or `YYYY-MM-DD` (local midnight).
    pub fn parse_timestamp(&self, value: &str) -> Result<i64> {
        let value = value.trim();
        if let Ok(dt) = OffsetDateTime::parse(value, &Rfc3339) {
            return to_ns(dt);
        }
        let offset = self.utc_offset()?;
        let with_time = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        if let Ok(dt) = PrimitiveDateTime::parse(value, &with_time) {
            return to_ns(dt.assume_offset(offset));
        }
        let day = parse_day(value)?;
        self.day_start_ns(day)
    }
}

fn to_ns(dt: OffsetDateTime) -> Result<i64> {
    i64::try_from(dt.unix_timestamp_nanos())
        .map_err(|_| Error::Time(format!("timestamp out of range: {dt}")))
}

/// `YYYY-MM-DD` rendering used for day directories.
pub fn format_day(day: Date) -> String {
    format!("{:04}-{:02}-{:02}", day.year(), day.month() as u8, day.day())
}

pub fn parse_day(value: &str) -> Result<Date> {
    Date::parse(value, &format_description!("[year]-[month]-[day]"))
        .map_err(|_| Error::Time(format!("expected YYYY-MM-DD, got {value:?}")))
}

impl FromStr for Timezone {
    type Err = Error;

    /// `UTC`, `Z`, or an offset such as `+0800` or `-05:00`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if matches!(s, "UTC" | "utc" | "Z") {
            return Ok(Timezone::UTC);
        }
        let digits: String = s.chars().filter(|c| *c != ':').collect();
        let sign = match digits.as_bytes().first() {
            Some(b'+') => 1,
            Some(b'-') => -1,
            _ => {
                return Err(Error::Config(format!(
                    "unsupported timezone {s:?}: use UTC or a fixed offset such as +01:00"
                )))
            }
        };
        let invalid = || Error::Config(format!("invalid timezone offset: {s}"));
        if digits.len() != 5 || !digits[1..].bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let hours: i32 = digits[1..3].parse().map_err(|_| invalid())?;
        let minutes: i32 = digits[3..5].parse().map_err(|_| invalid())?;
        if hours > 23 || minutes > 59 {
            return Err(invalid());
        }
        Timezone::fixed(sign * (hours * 3600 + minutes * 60))
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timezone::UTC => f.write_str("UTC"),
            Timezone::FixedOffset(offset) => {
                let sign = if *offset < 0 { '-' } else { '+' };
                let abs = offset.abs();
                write!(f, "{sign}{:02}:{:02}", abs / 3600, (abs % 3600) / 60)
            }
        }
    }
}

impl TryFrom<String> for Timezone {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Timezone> for String {
    fn from(value: Timezone) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    #[test]
    fn parses_utc_and_fixed_offsets() {
        assert_eq!("UTC".parse::<Timezone>().unwrap(), Timezone::UTC);
        assert_eq!("+00:00".parse::<Timezone>().unwrap(), Timezone::UTC);
        assert_eq!(
            "+0800".parse::<Timezone>().unwrap().offset_seconds(),
            8 * 3600
        );
        assert_eq!(
            "-05:30".parse::<Timezone>().unwrap(),
            Timezone::FixedOffset(-(5 * 3600 + 30 * 60))
        );
        assert!("+9900".parse::<Timezone>().is_err());
    }

    #[test]
    fn named_zones_are_rejected() {
        for named in ["Europe/Paris", "CET", "America/New_York", "Mars/Olympus"] {
            assert!(
                matches!(named.parse::<Timezone>(), Err(Error::Config(_))),
                "{named}"
            );
        }
    }

    #[test]
    fn fixed_offset_ignores_daylight_saving() -> anyhow::Result<()> {
        // Central Europe switches to summer time at 2024-03-31T01:00Z; a
        // +01:00 store keeps every day at 24 hours across that night.
        let tz: Timezone = "+01:00".parse()?;
        let days = ["2024-03-30", "2024-03-31", "2024-04-01", "2024-04-02"];
        let starts = days
            .iter()
            .map(|d| tz.day_start_ns(parse_day(d)?))
            .collect::<Result<Vec<i64>>>()?;
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], SECS_PER_DAY * NANOS_PER_SEC);
        }
        // summer 23:30Z is already the next local day, as it is in winter
        let summer = tz.parse_timestamp("2024-07-01T23:30:00Z")?;
        assert_eq!(format_day(tz.day_of(summer)?), "2024-07-02");
        assert_eq!(
            tz.format_timestamp(summer)?,
            "2024-07-02T00:30:00+01:00"
        );
        Ok(())
    }

    #[test]
    fn day_of_respects_offset() {
        // 2024-03-01T23:30:00Z is already March 2nd at +01:00.
        let ts = Timezone::UTC.parse_timestamp("2024-03-01T23:30:00Z").unwrap();
        assert_eq!(
            Timezone::UTC.day_of(ts).unwrap(),
            Date::from_calendar_date(2024, Month::March, 1).unwrap()
        );
        assert_eq!(
            Timezone::FixedOffset(3600).day_of(ts).unwrap(),
            Date::from_calendar_date(2024, Month::March, 2).unwrap()
        );
    }

    #[test]
    fn days_covering_spans_boundaries() {
        let tz = Timezone::FixedOffset(8 * 3600);
        let t0 = tz.parse_timestamp("2024-02-28 22:00:00").unwrap();
        let t1 = tz.parse_timestamp("2024-03-01 01:00:00").unwrap();
        let days: Vec<String> = tz
            .days_covering(t0, t1)
            .unwrap()
            .into_iter()
            .map(format_day)
            .collect();
        assert_eq!(days, vec!["2024-02-28", "2024-02-29", "2024-03-01"]);
        assert!(tz.days_covering(t1, t0).unwrap().is_empty());
    }

    #[test]
    fn day_start_round_trips() {
        let tz = Timezone::FixedOffset(-5 * 3600);
        let day = parse_day("2024-01-10").unwrap();
        let start = tz.day_start_ns(day).unwrap();
        assert_eq!(tz.day_of(start).unwrap(), day);
        assert_eq!(tz.day_of(start - 1).unwrap(), parse_day("2024-01-09").unwrap());
    }

    #[test]
    fn display_round_trips_offsets() {
        let tz = Timezone::FixedOffset(-(3 * 3600 + 30 * 60));
        assert_eq!(tz.to_string(), "-03:30");
        assert_eq!(Timezone::UTC.to_string(), "UTC");
        assert_eq!(tz.to_string().parse::<Timezone>().unwrap(), tz);
    }
}
