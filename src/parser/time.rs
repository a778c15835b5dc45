//! Date-time resolution for feed values.
//!
//! Every timed value ends up as an absolute instant carrying the offset it
//! had in its own zone. Dates stay dates.

use chrono::{DateTime, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use icalendar::parser::Property;
use icalendar::{CalendarDateTime, DatePerhapsTime};

use crate::domain::EventTime;

/// Windows zone names seen in Exchange/Outlook feeds.
const WINDOWS_ZONES: &[(&str, &str)] = &[
    ("UTC", "UTC"),
    ("GMT Standard Time", "Europe/London"),
    ("Greenwich Standard Time", "Atlantic/Reykjavik"),
    ("W. Europe Standard Time", "Europe/Berlin"),
    ("Central Europe Standard Time", "Europe/Budapest"),
    ("Romance Standard Time", "Europe/Paris"),
    ("Central European Standard Time", "Europe/Warsaw"),
    ("E. Europe Standard Time", "Europe/Chisinau"),
    ("FLE Standard Time", "Europe/Kiev"),
    ("GTB Standard Time", "Europe/Bucharest"),
    ("Russian Standard Time", "Europe/Moscow"),
    ("Turkey Standard Time", "Europe/Istanbul"),
    ("Israel Standard Time", "Asia/Jerusalem"),
    ("South Africa Standard Time", "Africa/Johannesburg"),
    ("Arabian Standard Time", "Asia/Dubai"),
    ("India Standard Time", "Asia/Kolkata"),
    ("China Standard Time", "Asia/Shanghai"),
    ("Singapore Standard Time", "Asia/Singapore"),
    ("Tokyo Standard Time", "Asia/Tokyo"),
    ("Korea Standard Time", "Asia/Seoul"),
    ("AUS Eastern Standard Time", "Australia/Sydney"),
    ("New Zealand Standard Time", "Pacific/Auckland"),
    ("Eastern Standard Time", "America/New_York"),
    ("Central Standard Time", "America/Chicago"),
    ("Mountain Standard Time", "America/Denver"),
    ("US Mountain Standard Time", "America/Phoenix"),
    ("Pacific Standard Time", "America/Los_Angeles"),
    ("Alaskan Standard Time", "America/Anchorage"),
    ("Hawaiian Standard Time", "Pacific/Honolulu"),
    ("Atlantic Standard Time", "America/Halifax"),
    ("SA Pacific Standard Time", "America/Bogota"),
    ("E. South America Standard Time", "America/Sao_Paulo"),
];

/// Resolve a `TZID` to an IANA zone.
///
/// Accepts plain IANA names, vendor-prefixed paths such as
/// `/mozilla.org/20070129_1/Europe/Berlin`, and common Windows names.
pub fn resolve_zone(tzid: &str) -> Option<Tz> {
    let tzid = tzid.trim().trim_matches('"');
    if tzid.is_empty() {
        return None;
    }
    if let Ok(tz) = tzid.parse::<Tz>() {
        return Some(tz);
    }

    let segments: Vec<&str> = tzid.split('/').filter(|s| !s.is_empty()).collect();
    for start in 1..segments.len() {
        if let Ok(tz) = segments[start..].join("/").parse::<Tz>() {
            return Some(tz);
        }
    }

    WINDOWS_ZONES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(tzid))
        .and_then(|(_, iana)| iana.parse::<Tz>().ok())
}

/// Pin a wall-clock time in `zone` to an instant.
///
/// Times inside a DST gap move forward by the gap's length; ambiguous times
/// in an overlap take the earlier instant.
pub fn localize(zone: &Tz, naive: NaiveDateTime) -> DateTime<FixedOffset> {
    match zone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.fixed_offset(),
        LocalResult::Ambiguous(earliest, _) => earliest.fixed_offset(),
        LocalResult::None => {
            let before = zone
                .offset_from_utc_datetime(&(naive - Duration::hours(24)))
                .fix();
            let utc = naive - Duration::seconds(i64::from(before.local_minus_utc()));
            utc.and_utc().with_timezone(zone).fixed_offset()
        }
    }
}

/// Express an instant in `zone`, keeping that zone's offset for display.
pub fn in_zone(zone: &Tz, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
    instant.with_timezone(zone).fixed_offset()
}

/// A property value resolved to an [`EventTime`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub time: EventTime,
    /// Zone recurrences of this value are generated in.
    pub zone: Tz,
    /// `TZID` that could not be resolved and fell back to the default zone.
    pub unknown_tzid: Option<String>,
}

pub fn resolve_value(value: DatePerhapsTime, default_zone: Tz) -> Resolved {
    match value {
        DatePerhapsTime::Date(date) => Resolved {
            time: EventTime::Date(date),
            zone: default_zone,
            unknown_tzid: None,
        },
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => Resolved {
            time: EventTime::DateTime(dt.fixed_offset()),
            zone: Tz::UTC,
            unknown_tzid: None,
        },
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => Resolved {
            time: EventTime::DateTime(localize(&default_zone, naive)),
            zone: default_zone,
            unknown_tzid: None,
        },
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            match resolve_zone(&tzid) {
                Some(zone) => Resolved {
                    time: EventTime::DateTime(localize(&zone, date_time)),
                    zone,
                    unknown_tzid: None,
                },
                None => Resolved {
                    time: EventTime::DateTime(localize(&default_zone, date_time)),
                    zone: default_zone,
                    unknown_tzid: Some(tzid),
                },
            }
        }
    }
}

pub fn resolve_property(prop: &Property, default_zone: Tz) -> Option<Resolved> {
    DatePerhapsTime::try_from(prop)
        .ok()
        .map(|value| resolve_value(value, default_zone))
}

fn param<'a>(prop: &'a Property, key: &str) -> Option<&'a str> {
    prop.params
        .iter()
        .find(|p| p.key.as_ref().eq_ignore_ascii_case(key))
        .and_then(|p| p.val.as_ref().map(|v| v.as_ref()))
}

/// Parse a multi-valued date list (`EXDATE`, `RDATE`).
///
/// Handles `VALUE=DATE`, `TZID=`, UTC and floating values, comma-separated
/// lists, and `VALUE=PERIOD` (start of each period).
pub fn parse_date_list(prop: &Property, default_zone: Tz) -> Vec<EventTime> {
    let zone = param(prop, "TZID")
        .and_then(resolve_zone)
        .unwrap_or(default_zone);
    let is_date = param(prop, "VALUE").is_some_and(|v| v.eq_ignore_ascii_case("DATE"));

    prop.val
        .as_ref()
        .split(',')
        .filter_map(|raw| {
            let s = raw.trim().split('/').next().unwrap_or_default();
            if s.is_empty() {
                return None;
            }
            if is_date || s.len() == 8 {
                return NaiveDate::parse_from_str(s, "%Y%m%d")
                    .ok()
                    .map(EventTime::Date);
            }
            if let Some(utc) = s.strip_suffix('Z') {
                return NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
                    .ok()
                    .map(|dt| EventTime::DateTime(dt.and_utc().fixed_offset()));
            }
            NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
                .ok()
                .map(|dt| EventTime::DateTime(localize(&zone, dt)))
        })
        .collect()
}

/// Parse an RFC 5545 `DURATION` value. Negative durations are rejected.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.starts_with('-') {
        return None;
    }
    let std_duration: std::time::Duration = iso8601::duration(value.trim_start_matches('+'))
        .ok()?
        .into();
    Duration::from_std(std_duration).ok()
}

/// Shift an end value by `duration` from `start`, keeping the start's shape.
pub fn end_from_duration(start: &EventTime, duration: Duration) -> EventTime {
    match start {
        EventTime::Date(date) => {
            let days = duration.num_days().max(1);
            EventTime::Date(*date + Duration::days(days))
        }
        EventTime::DateTime(dt) => EventTime::DateTime(*dt + duration),
    }
}

/// Unescape an iCalendar TEXT value.
pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
