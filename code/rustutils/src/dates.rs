/// Types and utilities for manipulating timestamps.
///
/// There are three kinds of times floating around:
///
/// - `Timestamp` is an absolute instant, always in UTC.  This is what we compare and what we
///   print.
///
/// - Decoder times are naive local times with an optional zone suffix; the zone that applies when
///   the suffix is missing is a `LocalZone`.
///
/// - Times given by the user on the command line are also naive local times, converted once to
///   `Timestamp` through a `LocalZone`.
use anyhow::{bail, Result};
use chrono::{
    DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc,
};
use std::str::FromStr;

pub type Timestamp = DateTime<Utc>;

/// Given year, month, day, hour, minute, second (all UTC), return a Timestamp.  Panics on
/// out-of-range values, this is for constant data only.

pub fn timestamp_from_ymdhms(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Timestamp {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .unwrap()
}

/// The zone used to interpret local times that carry no zone of their own.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalZone {
    /// Whatever the machine we're running on thinks local time is, including DST rules.
    System,

    /// A fixed offset from UTC, given by the user.
    Fixed(FixedOffset),
}

impl LocalZone {
    /// The UTC offset in effect at local time `t`, or None if `t` does not exist in the zone (it
    /// falls in a DST gap).  For ambiguous times (DST fold) the earlier instant is chosen.

    pub fn offset_at(&self, t: &NaiveDateTime) -> Option<FixedOffset> {
        match self {
            LocalZone::System => Local.from_local_datetime(t).earliest().map(|d| d.offset().fix()),
            LocalZone::Fixed(off) => Some(*off),
        }
    }

    pub fn to_timestamp(&self, t: &NaiveDateTime) -> Option<Timestamp> {
        let off = self.offset_at(t)?;
        off.from_local_datetime(t)
            .single()
            .map(|d| d.with_timezone(&Utc))
    }
}

/// Parse a UTC offset: `Z`, `UTC`, `GMT`, `+HH`, `+HHMM`, `+HH:MM`, and the same with `-`.  An
/// optional `UTC` or `GMT` prefix is allowed before the sign, as in `UTC+0100`.

pub fn parse_utc_offset(s: &str) -> Result<FixedOffset> {
    let mut s = s.trim();
    if s == "Z" || s == "UTC" || s == "GMT" {
        return Ok(Utc.fix());
    }
    if let Some(rest) = s.strip_prefix("UTC").or_else(|| s.strip_prefix("GMT")) {
        s = rest;
    }
    let (sign, digits) = if let Some(rest) = s.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = s.strip_prefix('-') {
        (-1, rest)
    } else {
        bail!("Offset must start with + or -")
    };
    let digits = digits.replace(':', "");
    let (hh, mm) = match digits.len() {
        1 | 2 => (&digits[..], "0"),
        4 => (&digits[0..2], &digits[2..4]),
        _ => bail!("Bad offset syntax"),
    };
    if !hh.chars().all(|c| c.is_ascii_digit()) || !mm.chars().all(|c| c.is_ascii_digit()) {
        bail!("Bad offset syntax");
    }
    let hours = u32::from_str(hh)?;
    let minutes = u32::from_str(mm)?;
    if hours > 23 || minutes > 59 {
        bail!("Offset out of range");
    }
    let secs = sign * ((hours * 3600 + minutes * 60) as i32);
    match FixedOffset::east_opt(secs) {
        Some(off) => Ok(off),
        None => bail!("Offset out of range"),
    }
}

/// Parse a local time given by the user and convert it to a Timestamp through `zone`.
///
/// Accepted forms are YYYY-MM-DD, YYYY-MM-DD HH:MM, YYYY-MM-DD HH:MM:SS, and the latter two with a
/// `T` in place of the space.  A bare date means the start of the day, or the last second of the
/// day if `end_of_day` is true, so that a date used as an inclusive upper bound covers the day.

pub fn parse_local_time(s: &str, zone: &LocalZone, end_of_day: bool) -> Result<Timestamp> {
    let s = s.trim();
    let naive = if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let (h, m, sec) = if end_of_day { (23, 59, 59) } else { (0, 0, 0) };
        match NaiveTime::from_hms_opt(h, m, sec) {
            Some(t) => d.and_time(t),
            None => bail!("Invalid time"),
        }
    } else {
        let normalized = s.replacen('T', " ", 1);
        if let Ok(t) = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S") {
            t
        } else if let Ok(t) = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M") {
            t
        } else {
            bail!("Invalid date/time syntax")
        }
    };
    match zone.to_timestamp(&naive) {
        Some(t) => Ok(t),
        None => bail!("Time does not exist in the local time zone"),
    }
}

#[test]
fn test_parse_utc_offset() {
    assert!(parse_utc_offset("UTC").unwrap().local_minus_utc() == 0);
    assert!(parse_utc_offset("Z").unwrap().local_minus_utc() == 0);
    assert!(parse_utc_offset("+01:00").unwrap().local_minus_utc() == 3600);
    assert!(parse_utc_offset("+0130").unwrap().local_minus_utc() == 5400);
    assert!(parse_utc_offset("-05").unwrap().local_minus_utc() == -5 * 3600);
    assert!(parse_utc_offset("UTC+0200").unwrap().local_minus_utc() == 7200);
    assert!(parse_utc_offset("0100").is_err());
    assert!(parse_utc_offset("+25:00").is_err());
    assert!(parse_utc_offset("+1:0:0").is_err());
    assert!(parse_utc_offset("CET").is_err());
}

#[test]
fn test_parse_local_time() {
    let zone = LocalZone::Fixed(FixedOffset::east_opt(3600).unwrap());

    let t = parse_local_time("2024-01-01T06:00:00", &zone, false).unwrap();
    assert!(t == timestamp_from_ymdhms(2024, 1, 1, 5, 0, 0));

    let t = parse_local_time("2024-01-01 06:30", &zone, true).unwrap();
    assert!(t == timestamp_from_ymdhms(2024, 1, 1, 5, 30, 0));

    let t = parse_local_time("2024-01-02", &zone, false).unwrap();
    assert!(t == timestamp_from_ymdhms(2024, 1, 1, 23, 0, 0));

    let t = parse_local_time("2024-01-02", &zone, true).unwrap();
    assert!(t == timestamp_from_ymdhms(2024, 1, 2, 22, 59, 59));

    assert!(parse_local_time("2024-13-01", &zone, false).is_err());
    assert!(parse_local_time("yesterday", &zone, false).is_err());
}
