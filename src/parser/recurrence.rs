//! RRULE expansion.
//!
//! Produces the start of every occurrence a rule generates inside the
//! expansion window. Exclusions and overrides are applied by the caller.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;

use crate::domain::EventTime;
use crate::parser::time::{in_zone, localize};

/// Half-open expansion window anchored at fetch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn around(anchor: DateTime<Utc>, past_days: u32, future_days: u32) -> Self {
        Self {
            start: anchor
                .checked_sub_signed(Duration::days(i64::from(past_days)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            end: anchor
                .checked_add_signed(Duration::days(i64::from(future_days)))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Whether an occurrence `[start, end]` touches the window.
    pub fn overlaps(&self, start: &EventTime, end: &EventTime) -> bool {
        start.sort_instant() <= self.end && end.sort_instant() >= self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub starts: Vec<EventTime>,
    /// The occurrence limit cut the series short.
    pub truncated: bool,
}

/// Expand `rule` starting at `start`.
///
/// `span` is the length of one occurrence; series whose occurrences begin
/// before the window but still run into it are included.
pub fn expand(
    start: &EventTime,
    zone: Tz,
    rule: &str,
    window: &Window,
    span: Duration,
    limit: u16,
) -> Result<Expansion, String> {
    let source = build_rule_string(start, zone, rule);
    let set: RRuleSet = source.parse().map_err(|e| format!("invalid RRULE: {}", e))?;

    // after/before are exclusive; widen by a second on each side.
    let tz: rrule::Tz = Utc.into();
    let after = (window.start - span - Duration::seconds(1)).with_timezone(&tz);
    let before = (window.end + Duration::seconds(1)).with_timezone(&tz);

    let result = set.after(after).before(before).all(limit);

    let starts = result
        .dates
        .iter()
        .map(|occurrence| {
            let utc = occurrence.with_timezone(&Utc);
            match start {
                EventTime::Date(_) => EventTime::Date(utc.date_naive()),
                EventTime::DateTime(_) => EventTime::DateTime(in_zone(&zone, utc)),
            }
        })
        .collect();

    Ok(Expansion {
        starts,
        truncated: result.limited,
    })
}

/// Build an iCalendar-format DTSTART/RRULE pair for the rrule parser.
fn build_rule_string(start: &EventTime, zone: Tz, rule: &str) -> String {
    // All-day series run on midnight UTC; only the date is read back.
    let dtstart = match start {
        EventTime::Date(d) => format!("DTSTART:{}T000000Z", d.format("%Y%m%d")),
        EventTime::DateTime(dt) if zone == Tz::UTC => {
            format!("DTSTART:{}", dt.with_timezone(&Utc).format("%Y%m%dT%H%M%SZ"))
        }
        EventTime::DateTime(dt) => format!(
            "DTSTART;TZID={}:{}",
            zone.name(),
            dt.with_timezone(&zone).format("%Y%m%dT%H%M%S")
        ),
    };

    format!("{}\nRRULE:{}", dtstart, normalize_until(rule, start, zone))
}

/// Rewrite `UNTIL` as a UTC instant.
///
/// Date-only values include the whole day; floating values are read in the
/// series' zone.
fn normalize_until(rule: &str, start: &EventTime, zone: Tz) -> String {
    rule.trim()
        .split(';')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("UNTIL") => {
                match until_utc(value.trim(), start, zone) {
                    Some(until) => format!("UNTIL={}", until.format("%Y%m%dT%H%M%SZ")),
                    None => part.to_string(),
                }
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn until_utc(value: &str, start: &EventTime, zone: Tz) -> Option<DateTime<Utc>> {
    if let Some(utc) = value.strip_suffix('Z') {
        return chrono::NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
            .ok()
            .map(|dt| dt.and_utc());
    }
    if value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return Some(match start {
            EventTime::Date(_) => date.and_time(NaiveTime::MIN).and_utc(),
            EventTime::DateTime(_) => {
                let end_of_day = date.and_hms_opt(23, 59, 59)?;
                localize(&zone, end_of_day).with_timezone(&Utc)
            }
        });
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .ok()
        .map(|dt| localize(&zone, dt).with_timezone(&Utc))
}
