use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Start or end of an occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EventTime {
    /// All-day value. Carries no time of day.
    Date(NaiveDate),
    /// Absolute instant, kept in the offset the feed expressed it in.
    DateTime(DateTime<FixedOffset>),
}

impl EventTime {
    pub fn is_date(&self) -> bool {
        matches!(self, EventTime::Date(_))
    }

    /// Instant used for ordering and range queries.
    ///
    /// All-day values sort at midnight UTC of their date.
    pub fn sort_instant(&self) -> DateTime<Utc> {
        match self {
            EventTime::Date(d) => d.and_time(NaiveTime::MIN).and_utc(),
            EventTime::DateTime(dt) => dt.with_timezone(&Utc),
        }
    }

    /// Offset from UTC in seconds; zero for all-day values.
    pub fn offset_seconds(&self) -> i32 {
        match self {
            EventTime::Date(_) => 0,
            EventTime::DateTime(dt) => dt.offset().local_minus_utc(),
        }
    }

    /// Key identifying an occurrence within a series: `YYYYMMDD` for dates,
    /// `YYYYMMDDTHHMMSSZ` (UTC) for instants.
    pub fn recurrence_key(&self) -> String {
        match self {
            EventTime::Date(d) => d.format("%Y%m%d").to_string(),
            EventTime::DateTime(dt) => dt.with_timezone(&Utc).format("%Y%m%dT%H%M%SZ").to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowAs {
    #[default]
    Busy,
    Free,
    Tentative,
    OutOfOffice,
}

impl ShowAs {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShowAs::Busy => "busy",
            ShowAs::Free => "free",
            ShowAs::Tentative => "tentative",
            ShowAs::OutOfOffice => "out_of_office",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "busy" => Some(ShowAs::Busy),
            "free" => Some(ShowAs::Free),
            "tentative" => Some(ShowAs::Tentative),
            "out_of_office" => Some(ShowAs::OutOfOffice),
            _ => None,
        }
    }
}

/// One concrete occurrence of a calendar event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub stable_id: String,
    pub source_id: String,
    pub uid: String,
    pub recurrence_key: String,
    pub title: String,
    pub start: EventTime,
    pub end: EventTime,
    pub location: Option<String>,
    pub all_day: bool,
    pub cancelled: bool,
    pub show_as: ShowAs,
    pub last_modified: Option<DateTime<Utc>>,
}

impl NormalizedEvent {
    /// Build an occurrence keyed by its own start time.
    pub fn new(source_id: &str, uid: &str, start: EventTime, end: EventTime) -> Self {
        let recurrence_key = start.recurrence_key();
        Self::with_recurrence_key(source_id, uid, &recurrence_key, start, end)
    }

    /// Build an occurrence keyed by an explicit recurrence key (RECURRENCE-ID).
    pub fn with_recurrence_key(
        source_id: &str,
        uid: &str,
        recurrence_key: &str,
        start: EventTime,
        end: EventTime,
    ) -> Self {
        Self {
            stable_id: Self::generate_id(source_id, uid, recurrence_key),
            source_id: source_id.to_string(),
            uid: uid.to_string(),
            recurrence_key: recurrence_key.to_string(),
            title: String::new(),
            start,
            end,
            location: None,
            all_day: start.is_date(),
            cancelled: false,
            show_as: ShowAs::default(),
            last_modified: None,
        }
    }

    /// Deterministic dedup key from source, UID and recurrence key.
    pub fn generate_id(source_id: &str, uid: &str, recurrence_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(uid.as_bytes());
        hasher.update([0x1f]);
        hasher.update(recurrence_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            "(No title)"
        } else {
            &self.title
        }
    }
}

/// A persisted event row together with its cache metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub event: NormalizedEvent,
    pub batch_id: String,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
