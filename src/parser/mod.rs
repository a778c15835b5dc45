pub mod recurrence;
pub mod time;

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use icalendar::parser::{read_calendar, unfold, Component};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{content_hash, EventTime, NormalizedEvent, RawFeedPayload, ShowAs};
use recurrence::Window;

/// Longest expansion horizon accepted on either side of the fetch time.
pub const MAX_WINDOW_DAYS: u32 = 36_500;

/// Configuration for feed parsing and recurrence expansion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Days before the fetch time that recurrences are expanded into (default: 30)
    pub past_days: u32,

    /// Days after the fetch time that recurrences are expanded into (default: 180)
    pub future_days: u32,

    /// Occurrences generated per recurring series at most (default: 1000)
    pub max_occurrences: u16,

    /// IANA zone for floating times when the feed declares none (default: "UTC")
    pub default_timezone: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            past_days: 30,
            future_days: 180,
            max_occurrences: 1000,
            default_timezone: "UTC".to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed feed: {0}")]
    Malformed(String),

    #[error("payload carries no content")]
    NoContent,
}

/// A component that was skipped or partially interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub uid: Option<String>,
    pub message: String,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{}: {}", uid, self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarMetadata {
    pub name: Option<String>,
    pub timezone: Option<String>,
    pub product_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParseResult {
    pub events: Vec<NormalizedEvent>,
    pub metadata: CalendarMetadata,
    pub warnings: Vec<ParseWarning>,
    /// False when the document was cut off or a component was skipped, so
    /// the events may not be the whole calendar.
    pub complete: bool,
}

/// Converts raw ICS payloads into normalized occurrences.
#[derive(Debug, Clone)]
pub struct FeedParser {
    config: ParserConfig,
    default_zone: Tz,
}

impl Default for FeedParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

impl FeedParser {
    pub fn new(config: ParserConfig) -> Self {
        let default_zone = config.default_timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(zone = %config.default_timezone, "unknown default zone, using UTC");
            Tz::UTC
        });
        Self {
            config,
            default_zone,
        }
    }

    pub fn parse(&self, payload: &RawFeedPayload) -> Result<ParseResult, ParseError> {
        let bytes = payload.bytes().ok_or(ParseError::NoContent)?;
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_start_matches('\u{feff}');
        let unfolded = unfold(text);
        let document = split_document(&unfolded)?;

        let calendar_zone = document
            .metadata
            .timezone
            .as_deref()
            .and_then(time::resolve_zone)
            .unwrap_or(self.default_zone);

        let mut warnings = Vec::new();
        if document.unterminated {
            warnings.push(ParseWarning {
                uid: None,
                message: "feed ends inside a component; trailing data ignored".into(),
            });
        }

        let mut complete = !document.unterminated;
        let mut parsed = Vec::new();
        for block in &document.events {
            match read_component(block, calendar_zone) {
                Ok((component, notes)) => {
                    warnings.extend(notes.into_iter().map(|message| ParseWarning {
                        uid: Some(component.uid.clone()),
                        message,
                    }));
                    parsed.push(component);
                }
                Err(message) => {
                    complete = false;
                    warnings.push(ParseWarning { uid: None, message });
                }
            }
        }

        let window = Window::around(
            payload.fetched_at,
            self.config.past_days,
            self.config.future_days,
        );
        let events = self.assemble(&payload.source_id, parsed, &window, &mut warnings);

        for warning in &warnings {
            warn!(source = %payload.source_id, "{}", warning);
        }
        debug!(
            source = %payload.source_id,
            events = events.len(),
            warnings = warnings.len(),
            "parsed feed"
        );

        Ok(ParseResult {
            events,
            metadata: document.metadata,
            warnings,
            complete,
        })
    }

    /// Expand series, apply exclusions and overrides, and build final rows.
    fn assemble(
        &self,
        source_id: &str,
        components: Vec<ParsedComponent>,
        window: &Window,
        warnings: &mut Vec<ParseWarning>,
    ) -> Vec<NormalizedEvent> {
        let mut masters = Vec::new();
        let mut overrides: HashMap<String, Vec<ParsedComponent>> = HashMap::new();
        for component in components {
            if component.recurrence_id.is_some() {
                overrides
                    .entry(component.uid.clone())
                    .or_default()
                    .push(component);
            } else {
                masters.push(component);
            }
        }

        let mut events = Vec::new();
        for master in &masters {
            let instances = overrides.remove(&master.uid).unwrap_or_default();
            if master.is_recurring() {
                self.expand_series(source_id, master, instances, window, warnings, &mut events);
            } else {
                let key = master.start.recurrence_key();
                let replaced = instances
                    .iter()
                    .any(|o| o.recurrence_id.is_some_and(|rid| rid.recurrence_key() == key));
                if !replaced {
                    events.push(master.occurrence(source_id, master.start, master.end, None));
                }
                events.extend(
                    instances
                        .iter()
                        .map(|o| o.occurrence(source_id, o.start, o.end, o.recurrence_id)),
                );
            }
        }

        // Overrides whose master is not in this feed stand on their own.
        for orphan in overrides.into_values().flatten() {
            events.push(orphan.occurrence(source_id, orphan.start, orphan.end, orphan.recurrence_id));
        }

        let mut seen = HashSet::new();
        events.retain(|event| {
            if seen.insert(event.stable_id.clone()) {
                true
            } else {
                warnings.push(ParseWarning {
                    uid: Some(event.uid.clone()),
                    message: format!("duplicate occurrence {} dropped", event.recurrence_key),
                });
                false
            }
        });

        events.sort_by(|a, b| {
            a.start
                .sort_instant()
                .cmp(&b.start.sort_instant())
                .then_with(|| a.stable_id.cmp(&b.stable_id))
        });
        events
    }

    fn expand_series(
        &self,
        source_id: &str,
        master: &ParsedComponent,
        instances: Vec<ParsedComponent>,
        window: &Window,
        warnings: &mut Vec<ParseWarning>,
        events: &mut Vec<NormalizedEvent>,
    ) {
        let span = master.span();

        let mut starts = match &master.rrule {
            Some(rule) => match recurrence::expand(
                &master.start,
                master.zone,
                rule,
                window,
                span,
                self.config.max_occurrences,
            ) {
                Ok(expansion) => {
                    if expansion.truncated {
                        warnings.push(ParseWarning {
                            uid: Some(master.uid.clone()),
                            message: format!(
                                "recurrence truncated at {} occurrences",
                                self.config.max_occurrences
                            ),
                        });
                    }
                    expansion.starts
                }
                Err(message) => {
                    warnings.push(ParseWarning {
                        uid: Some(master.uid.clone()),
                        message: format!("{}; keeping the first occurrence only", message),
                    });
                    vec![master.start]
                }
            },
            None => vec![master.start],
        };

        let mut keys: HashSet<String> = starts.iter().map(EventTime::recurrence_key).collect();
        for rdate in &master.rdates {
            if keys.insert(rdate.recurrence_key()) {
                starts.push(*rdate);
            }
        }

        let mut by_key: HashMap<String, ParsedComponent> = instances
            .into_iter()
            .filter_map(|o| o.recurrence_id.map(|rid| (rid.recurrence_key(), o)))
            .collect();

        for start in starts {
            if master.is_excluded(&start) {
                by_key.remove(&start.recurrence_key());
                continue;
            }
            let key = start.recurrence_key();
            if let Some(instance) = by_key.remove(&key) {
                if window.overlaps(&instance.start, &instance.end) {
                    events.push(instance.occurrence(
                        source_id,
                        instance.start,
                        instance.end,
                        instance.recurrence_id,
                    ));
                }
                continue;
            }
            let end = shift(&start, span);
            if window.overlaps(&start, &end) {
                events.push(master.occurrence(source_id, start, end, None));
            }
        }

        // Overrides for occurrences generated outside the window may have moved into it.
        for (_, instance) in by_key {
            let excluded = instance
                .recurrence_id
                .is_some_and(|rid| master.is_excluded(&rid));
            if !excluded && window.overlaps(&instance.start, &instance.end) {
                events.push(instance.occurrence(
                    source_id,
                    instance.start,
                    instance.end,
                    instance.recurrence_id,
                ));
            }
        }
    }
}

/// One VEVENT after property interpretation.
#[derive(Debug, Clone)]
struct ParsedComponent {
    uid: String,
    title: String,
    location: Option<String>,
    start: EventTime,
    end: EventTime,
    zone: Tz,
    rrule: Option<String>,
    rdates: Vec<EventTime>,
    exdates: Vec<EventTime>,
    recurrence_id: Option<EventTime>,
    cancelled: bool,
    show_as: ShowAs,
    last_modified: Option<DateTime<Utc>>,
}

impl ParsedComponent {
    fn is_recurring(&self) -> bool {
        self.rrule.is_some() || !self.rdates.is_empty()
    }

    fn span(&self) -> Duration {
        match (&self.start, &self.end) {
            (EventTime::Date(s), EventTime::Date(e)) => Duration::days((*e - *s).num_days().max(1)),
            _ => self.end.sort_instant() - self.start.sort_instant(),
        }
    }

    fn is_excluded(&self, start: &EventTime) -> bool {
        self.exdates.iter().any(|ex| match (start, ex) {
            (EventTime::Date(a), EventTime::Date(b)) => a == b,
            (EventTime::DateTime(a), EventTime::DateTime(b)) => a == b,
            (EventTime::DateTime(a), EventTime::Date(b)) => a.date_naive() == *b,
            (EventTime::Date(a), EventTime::DateTime(b)) => b.date_naive() == *a,
        })
    }

    fn occurrence(
        &self,
        source_id: &str,
        start: EventTime,
        end: EventTime,
        recurrence_id: Option<EventTime>,
    ) -> NormalizedEvent {
        let mut event = match recurrence_id {
            Some(rid) => NormalizedEvent::with_recurrence_key(
                source_id,
                &self.uid,
                &rid.recurrence_key(),
                start,
                end,
            ),
            None => NormalizedEvent::new(source_id, &self.uid, start, end),
        };
        event.title = self.title.clone();
        event.location = self.location.clone();
        event.cancelled = self.cancelled;
        event.show_as = self.show_as;
        event.last_modified = self.last_modified;
        event
    }
}

fn shift(start: &EventTime, span: Duration) -> EventTime {
    match start {
        EventTime::Date(d) => EventTime::Date(*d + Duration::days(span.num_days().max(1))),
        EventTime::DateTime(dt) => EventTime::DateTime(*dt + span),
    }
}

/// Calendar-level properties plus the raw text of each VEVENT.
struct Document {
    metadata: CalendarMetadata,
    events: Vec<String>,
    unterminated: bool,
}

/// Split an unfolded feed into top-level components so each one can be
/// parsed, and fail, on its own.
fn split_document(unfolded: &str) -> Result<Document, ParseError> {
    let mut lines = unfolded
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty());

    let opened = lines
        .by_ref()
        .any(|l| l.trim().eq_ignore_ascii_case("BEGIN:VCALENDAR"));
    if !opened {
        return Err(ParseError::Malformed("missing BEGIN:VCALENDAR".into()));
    }

    let mut document = Document {
        metadata: CalendarMetadata::default(),
        events: Vec::new(),
        unterminated: false,
    };
    let mut current: Option<(String, String)> = None;
    let mut depth = 0usize;
    let mut closed = false;

    for line in lines {
        let (name, value) = split_property(line);

        if let Some((kind, block)) = current.as_mut() {
            block.push_str(line);
            block.push_str("\r\n");
            if name.eq_ignore_ascii_case("BEGIN") {
                depth += 1;
            } else if name.eq_ignore_ascii_case("END") {
                depth -= 1;
                if depth == 0 {
                    if kind.eq_ignore_ascii_case("VEVENT") {
                        document.events.push(std::mem::take(block));
                    }
                    current = None;
                }
            }
            continue;
        }

        if name.eq_ignore_ascii_case("BEGIN") {
            depth = 1;
            current = Some((value.trim().to_string(), format!("{}\r\n", line)));
        } else if name.eq_ignore_ascii_case("END") {
            closed = true;
            break;
        } else if name.eq_ignore_ascii_case("X-WR-CALNAME") {
            document.metadata.name = Some(time::unescape_text(value.trim()));
        } else if name.eq_ignore_ascii_case("X-WR-TIMEZONE") {
            document.metadata.timezone = Some(value.trim().to_string());
        } else if name.eq_ignore_ascii_case("PRODID") {
            document.metadata.product_id = Some(value.trim().to_string());
        }
    }

    document.unterminated = current.is_some() || !closed;
    Ok(document)
}

/// Property name (without parameters) and raw value of a content line.
fn split_property(line: &str) -> (&str, &str) {
    let Some((head, value)) = line.split_once(':') else {
        return (line.trim(), "");
    };
    let name = head.split(';').next().unwrap_or(head).trim();
    (name, value)
}

fn find_event<'a>(components: &'a [Component<'a>]) -> Option<&'a Component<'a>> {
    components.iter().find_map(|c| {
        if c.name == "VEVENT" {
            Some(c)
        } else {
            find_event(&c.components)
        }
    })
}

/// Interpret one VEVENT block. Returns the component and any non-fatal notes.
fn read_component(block: &str, zone: Tz) -> Result<(ParsedComponent, Vec<String>), String> {
    let wrapped = format!("BEGIN:VCALENDAR\r\n{}END:VCALENDAR\r\n", block);
    let calendar = read_calendar(&wrapped).map_err(|e| format!("skipped VEVENT: {}", e))?;
    let vevent = find_event(&calendar.components)
        .ok_or_else(|| "skipped VEVENT: component could not be read".to_string())?;

    let mut notes = Vec::new();
    let text = |name: &str| {
        vevent
            .find_prop(name)
            .map(|p| time::unescape_text(p.val.as_ref()).trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let title = text("SUMMARY");
    let uid_value = text("UID");

    let dtstart = vevent
        .find_prop("DTSTART")
        .ok_or_else(|| skipped(uid_value.as_deref(), "missing DTSTART"))?;
    let start = time::resolve_property(dtstart, zone)
        .ok_or_else(|| skipped(uid_value.as_deref(), "invalid DTSTART"))?;
    if let Some(tzid) = &start.unknown_tzid {
        notes.push(format!("unknown TZID '{}', using {}", tzid, zone.name()));
    }

    let uid = match uid_value {
        Some(uid) => uid,
        None => {
            notes.push("missing UID; synthesized from DTSTART and SUMMARY".into());
            let seed = format!(
                "{}\u{1f}{}",
                dtstart.val.as_ref(),
                title.as_deref().unwrap_or_default()
            );
            format!("synthesized-{}", &content_hash(seed.as_bytes())[..16])
        }
    };

    let end = read_end(vevent, &start.time, zone, &mut notes);

    let status = text("STATUS").map(|s| s.to_ascii_uppercase());
    let show_as = read_show_as(vevent, status.as_deref());

    let last_modified = vevent
        .find_prop("LAST-MODIFIED")
        .and_then(|p| time::resolve_property(p, Tz::UTC))
        .and_then(|r| match r.time {
            EventTime::DateTime(dt) => Some(dt.with_timezone(&Utc)),
            EventTime::Date(_) => None,
        });

    let recurrence_id = vevent
        .find_prop("RECURRENCE-ID")
        .and_then(|p| time::resolve_property(p, start.zone))
        .map(|r| r.time);

    let dates = |name: &str| -> Vec<EventTime> {
        vevent
            .properties
            .iter()
            .filter(|p| p.name == name)
            .flat_map(|p| time::parse_date_list(p, start.zone))
            .collect()
    };

    Ok((
        ParsedComponent {
            uid,
            title: title.unwrap_or_else(|| "(No title)".to_string()),
            location: text("LOCATION"),
            start: start.time,
            end,
            zone: start.zone,
            rrule: vevent
                .find_prop("RRULE")
                .map(|p| p.val.as_ref().trim().to_string())
                .filter(|r| !r.is_empty()),
            rdates: dates("RDATE"),
            exdates: dates("EXDATE"),
            recurrence_id,
            cancelled: status.as_deref() == Some("CANCELLED"),
            show_as,
            last_modified,
        },
        notes,
    ))
}

fn skipped(uid: Option<&str>, reason: &str) -> String {
    match uid {
        Some(uid) => format!("skipped VEVENT {}: {}", uid, reason),
        None => format!("skipped VEVENT: {}", reason),
    }
}

/// DTEND, else DTSTART + DURATION, else one day (all-day) or zero length.
fn read_end(vevent: &Component, start: &EventTime, zone: Tz, notes: &mut Vec<String>) -> EventTime {
    let default_end = || match start {
        EventTime::Date(d) => EventTime::Date(*d + Duration::days(1)),
        EventTime::DateTime(_) => *start,
    };

    if let Some(prop) = vevent.find_prop("DTEND") {
        return match time::resolve_property(prop, zone).map(|r| r.time) {
            Some(end) if end.is_date() != start.is_date() => {
                notes.push("DTEND value type differs from DTSTART; ignored".into());
                default_end()
            }
            Some(end) if end.sort_instant() < start.sort_instant() => {
                notes.push("DTEND precedes DTSTART; ignored".into());
                default_end()
            }
            Some(end) => end,
            None => {
                notes.push("invalid DTEND; ignored".into());
                default_end()
            }
        };
    }

    if let Some(prop) = vevent.find_prop("DURATION") {
        return match time::parse_duration(prop.val.as_ref()) {
            Some(duration) => time::end_from_duration(start, duration),
            None => {
                notes.push(format!("invalid DURATION '{}'; ignored", prop.val.as_ref()));
                default_end()
            }
        };
    }

    default_end()
}

fn read_show_as(vevent: &Component, status: Option<&str>) -> ShowAs {
    if let Some(busy) = vevent.find_prop("X-MICROSOFT-CDO-BUSYSTATUS") {
        match busy.val.as_ref().trim().to_ascii_uppercase().as_str() {
            "FREE" => return ShowAs::Free,
            "TENTATIVE" => return ShowAs::Tentative,
            "OOF" => return ShowAs::OutOfOffice,
            "BUSY" | "WORKINGELSEWHERE" => return ShowAs::Busy,
            _ => {}
        }
    }
    let transparent = vevent
        .find_prop("TRANSP")
        .is_some_and(|p| p.val.as_ref().trim().eq_ignore_ascii_case("TRANSPARENT"));
    if transparent {
        return ShowAs::Free;
    }
    if status == Some("TENTATIVE") {
        return ShowAs::Tentative;
    }
    ShowAs::Busy
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Timelike};

    fn payload(body: &str, fetched_at: DateTime<Utc>) -> RawFeedPayload {
        let mut payload = RawFeedPayload::from_bytes("cal", body.as_bytes().to_vec(), None, None);
        payload.fetched_at = fetched_at;
        payload
    }

    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn parse(body: &str) -> ParseResult {
        FeedParser::default().parse(&payload(body, anchor())).unwrap()
    }

    fn calendar(events: &str) -> String {
        format!(
            "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//Almanac//EN\r\nX-WR-CALNAME:Team\\, Ops\r\n{}END:VCALENDAR\r\n",
            events
        )
    }

    const SINGLE: &str = "BEGIN:VEVENT\r\n\
UID:single-1\r\n\
DTSTART:20240116T090000Z\r\n\
DTEND:20240116T100000Z\r\n\
SUMMARY:Planning\\, Q1\r\n\
LOCATION:Room 4\r\n\
END:VEVENT\r\n";

    #[test]
    fn test_parse_single_event_and_metadata() {
        let result = parse(&calendar(SINGLE));
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        assert_eq!(result.metadata.name.as_deref(), Some("Team, Ops"));
        assert_eq!(result.metadata.product_id.as_deref(), Some("-//Test//Almanac//EN"));
        assert_eq!(result.events.len(), 1);

        let event = &result.events[0];
        assert_eq!(event.title, "Planning, Q1");
        assert_eq!(event.location.as_deref(), Some("Room 4"));
        assert_eq!(event.uid, "single-1");
        assert!(!event.all_day);
        assert_eq!(
            event.start.sort_instant(),
            Utc.with_ymd_and_hms(2024, 1, 16, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_stable_ids_survive_reparse() {
        let a = parse(&calendar(SINGLE));
        let b = parse(&calendar(SINGLE));
        assert_eq!(a.events[0].stable_id, b.events[0].stable_id);
    }

    #[test]
    fn test_not_modified_payload_has_no_content() {
        let payload = RawFeedPayload::unchanged("cal", &Default::default());
        assert_eq!(
            FeedParser::default().parse(&payload).unwrap_err(),
            ParseError::NoContent
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = FeedParser::default()
            .parse(&payload("<html>not a calendar</html>", anchor()))
            .unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_broken_component_is_isolated() {
        let broken = "BEGIN:VEVENT\r\nUID:broken\r\nSUMMARY:No start\r\nEND:VEVENT\r\n";
        let result = parse(&calendar(&format!("{}{}", broken, SINGLE)));
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].message.contains("missing DTSTART"));
    }

    #[test]
    fn test_cut_off_feed_is_incomplete() {
        assert!(parse(&calendar(SINGLE)).complete);

        let full = calendar(&format!("{}{}", SINGLE, SINGLE.replace("single-1", "single-2")));
        let cut = &full[..full.find("UID:single-2").unwrap()];
        let result = parse(cut);
        assert!(!result.complete);
        assert_eq!(result.events.len(), 1);

        let unclosed = full.replace("END:VCALENDAR\r\n", "");
        assert!(!parse(&unclosed).complete);
    }

    #[test]
    fn test_skipped_component_marks_result_incomplete() {
        let broken = "BEGIN:VEVENT\r\nUID:broken\r\nSUMMARY:No start\r\nEND:VEVENT\r\n";
        assert!(!parse(&calendar(broken)).complete);
    }

    #[test]
    fn test_override_replaces_single_occurrence() {
        let body = calendar(&format!(
            "{}BEGIN:VEVENT\r\n\
UID:single-1\r\n\
RECURRENCE-ID:20240116T090000Z\r\n\
DTSTART:20240116T140000Z\r\n\
DTEND:20240116T150000Z\r\n\
SUMMARY:Planning (moved)\r\n\
END:VEVENT\r\n",
            SINGLE
        ));
        let result = parse(&body);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].title, "Planning (moved)");
        assert_eq!(
            result.events[0].start.sort_instant(),
            Utc.with_ymd_and_hms(2024, 1, 16, 14, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_zoned_event_keeps_original_offset() {
        let body = calendar(
            "BEGIN:VEVENT\r\nUID:z\r\nDTSTART;TZID=/mozilla.org/20070129_1/Europe/Berlin:20240116T090000\r\nDTEND;TZID=Europe/Berlin:20240116T100000\r\nSUMMARY:Zoned\r\nEND:VEVENT\r\n",
        );
        let event = &parse(&body).events[0];
        assert_eq!(event.start.offset_seconds(), 3600);
        assert_eq!(event.start.sort_instant().hour(), 8);
    }

    #[test]
    fn test_floating_uses_calendar_zone() {
        let body = format!(
            "BEGIN:VCALENDAR\r\nX-WR-TIMEZONE:America/New_York\r\n{}END:VCALENDAR\r\n",
            "BEGIN:VEVENT\r\nUID:f\r\nDTSTART:20240116T090000\r\nSUMMARY:Floating\r\nEND:VEVENT\r\n"
        );
        let result = parse(&body);
        assert_eq!(result.metadata.timezone.as_deref(), Some("America/New_York"));
        let event = &result.events[0];
        assert_eq!(event.start.offset_seconds(), -5 * 3600);
        assert_eq!(event.start.sort_instant().hour(), 14);
        assert_eq!(event.end, event.start, "no DTEND or DURATION means zero length");
    }

    #[test]
    fn test_unknown_tzid_falls_back_with_warning() {
        let body = calendar(
            "BEGIN:VEVENT\r\nUID:u\r\nDTSTART;TZID=Mars/Olympus:20240116T090000\r\nSUMMARY:Far\r\nEND:VEVENT\r\n",
        );
        let result = parse(&body);
        assert_eq!(result.events.len(), 1);
        assert!(result.warnings[0].message.contains("unknown TZID"));
    }

    #[test]
    fn test_all_day_event_is_not_shifted() {
        let body = calendar(
            "BEGIN:VEVENT\r\nUID:holiday\r\nDTSTART;VALUE=DATE:20240120\r\nSUMMARY:Holiday\r\nEND:VEVENT\r\n",
        );
        let event = &parse(&body).events[0];
        assert!(event.all_day);
        assert_eq!(
            event.start,
            EventTime::Date(NaiveDate::from_ymd_opt(2024, 1, 20).unwrap())
        );
        assert_eq!(
            event.end,
            EventTime::Date(NaiveDate::from_ymd_opt(2024, 1, 21).unwrap())
        );
    }

    #[test]
    fn test_duration_sets_end() {
        let body = calendar(
            "BEGIN:VEVENT\r\nUID:d\r\nDTSTART:20240116T090000Z\r\nDURATION:PT45M\r\nSUMMARY:Sync\r\nEND:VEVENT\r\n",
        );
        let event = &parse(&body).events[0];
        assert_eq!(
            event.end.sort_instant() - event.start.sort_instant(),
            Duration::minutes(45)
        );
    }

    #[test]
    fn test_missing_uid_and_summary() {
        let body = calendar("BEGIN:VEVENT\r\nDTSTART:20240116T090000Z\r\nEND:VEVENT\r\n");
        let first = parse(&body);
        let second = parse(&body);
        assert_eq!(first.events[0].title, "(No title)");
        assert!(first.events[0].uid.starts_with("synthesized-"));
        assert_eq!(first.events[0].stable_id, second.events[0].stable_id);
        assert!(first.warnings[0].message.contains("missing UID"));
    }

    #[test]
    fn test_show_as_and_cancelled() {
        let body = calendar(
            "BEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240116T090000Z\r\nTRANSP:TRANSPARENT\r\nEND:VEVENT\r\n\
BEGIN:VEVENT\r\nUID:b\r\nDTSTART:20240116T100000Z\r\nSTATUS:TENTATIVE\r\nEND:VEVENT\r\n\
BEGIN:VEVENT\r\nUID:c\r\nDTSTART:20240116T110000Z\r\nX-MICROSOFT-CDO-BUSYSTATUS:OOF\r\nEND:VEVENT\r\n\
BEGIN:VEVENT\r\nUID:d\r\nDTSTART:20240116T120000Z\r\nSTATUS:CANCELLED\r\nEND:VEVENT\r\n",
        );
        let events = parse(&body).events;
        let by_uid = |uid: &str| events.iter().find(|e| e.uid == uid).unwrap().clone();
        assert_eq!(by_uid("a").show_as, ShowAs::Free);
        assert_eq!(by_uid("b").show_as, ShowAs::Tentative);
        assert_eq!(by_uid("c").show_as, ShowAs::OutOfOffice);
        assert!(by_uid("d").cancelled);
        assert_eq!(by_uid("d").show_as, ShowAs::Busy);
    }

    #[test]
    fn test_daily_series_with_exdate_and_override() {
        let body = calendar(
            "BEGIN:VEVENT\r\n\
UID:daily\r\n\
DTSTART:20240110T090000Z\r\n\
DTEND:20240110T093000Z\r\n\
RRULE:FREQ=DAILY;COUNT=10\r\n\
EXDATE:20240112T090000Z\r\n\
SUMMARY:Standup\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:daily\r\n\
RECURRENCE-ID:20240115T090000Z\r\n\
DTSTART:20240115T140000Z\r\n\
DTEND:20240115T143000Z\r\n\
SUMMARY:Standup (moved)\r\n\
END:VEVENT\r\n",
        );
        let result = parse(&body);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        assert_eq!(result.events.len(), 9);

        let excluded = Utc.with_ymd_and_hms(2024, 1, 12, 9, 0, 0).unwrap();
        assert!(result.events.iter().all(|e| e.start.sort_instant() != excluded));

        let original = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let moved = Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap();
        assert!(result.events.iter().all(|e| e.start.sort_instant() != original));
        let override_event = result
            .events
            .iter()
            .find(|e| e.start.sort_instant() == moved)
            .expect("override at its new time");
        assert_eq!(override_event.title, "Standup (moved)");
        assert_eq!(override_event.recurrence_key, "20240115T090000Z");
    }

    #[test]
    fn test_rdate_adds_occurrence() {
        let body = calendar(
            "BEGIN:VEVENT\r\nUID:r\r\nDTSTART:20240110T090000Z\r\nRRULE:FREQ=WEEKLY;COUNT=2\r\nRDATE:20240111T090000Z\r\nSUMMARY:Review\r\nEND:VEVENT\r\n",
        );
        assert_eq!(parse(&body).events.len(), 3);
    }

    #[test]
    fn test_invalid_rule_keeps_master() {
        let body = calendar(
            "BEGIN:VEVENT\r\nUID:bad\r\nDTSTART:20240110T090000Z\r\nRRULE:FREQ=SOMETIMES\r\nSUMMARY:Odd\r\nEND:VEVENT\r\n",
        );
        let result = parse(&body);
        assert_eq!(result.events.len(), 1);
        assert!(result.warnings[0].message.contains("RRULE"));
    }

    #[test]
    fn test_orphan_override_kept() {
        let body = calendar(
            "BEGIN:VEVENT\r\nUID:orphan\r\nRECURRENCE-ID:20240117T090000Z\r\nDTSTART:20240117T100000Z\r\nSUMMARY:Lonely\r\nEND:VEVENT\r\n",
        );
        let events = parse(&body).events;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].recurrence_key, "20240117T090000Z");
    }

    #[test]
    fn test_expansion_window_anchored_at_fetch_time() {
        let body = calendar(
            "BEGIN:VEVENT\r\nUID:w\r\nDTSTART:20200101T090000Z\r\nRRULE:FREQ=DAILY\r\nSUMMARY:Forever\r\nEND:VEVENT\r\n",
        );
        let parser = FeedParser::new(ParserConfig {
            past_days: 1,
            future_days: 2,
            ..ParserConfig::default()
        });
        let events = parser.parse(&payload(&body, anchor())).unwrap().events;
        let days: Vec<u32> = events
            .iter()
            .map(|e| e.start.sort_instant().date_naive().format("%d").to_string().parse().unwrap())
            .collect();
        assert_eq!(days, vec![15, 16, 17]);
    }

    #[test]
    fn test_folded_lines_are_unfolded() {
        let body = calendar(
            "BEGIN:VEVENT\r\nUID:fold\r\nDTSTART:20240116T090000Z\r\nSUMMARY:A very long\r\n  title\r\nEND:VEVENT\r\n",
        );
        assert_eq!(parse(&body).events[0].title, "A very long title");
    }
}
