//! Scripted fetcher double for coordinator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{RawFeedPayload, SourceConfig, SourceKind, Validators};
use crate::fetcher::{FetchError, Fetcher};

#[derive(Debug, Clone)]
pub enum Reply {
    Body(String),
    NotModified,
    Fail(FetchError),
}

/// Plays back replies per source. The last reply for a source repeats once
/// the script runs out.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    delay: Duration,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, source_id: &str, replies: Vec<Reply>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(source_id.to_string(), replies.into());
        }
        self
    }

    pub fn calls(&self, source_id: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.get(source_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, source_id: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .get_mut(source_id)
            .unwrap_or_else(|| panic!("no script for {}", source_id));
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        source: &SourceConfig,
        previous: &Validators,
    ) -> Result<RawFeedPayload, FetchError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(source.id.clone())
            .or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.next_reply(&source.id) {
            Reply::Body(body) => Ok(RawFeedPayload::from_bytes(
                &source.id,
                body.into_bytes(),
                Some("\"v1\"".into()),
                None,
            )),
            Reply::NotModified => Ok(RawFeedPayload::unchanged(&source.id, previous)),
            Reply::Fail(e) => Err(e),
        }
    }
}

pub fn source(id: &str) -> SourceConfig {
    SourceConfig::new(
        id,
        SourceKind::Ics {
            url: format!("https://calendar.test/{}.ics", id),
        },
    )
}

/// A feed of `count` hour-long events, one per day starting tomorrow.
pub fn feed(prefix: &str, count: usize) -> String {
    let tomorrow = Utc::now().date_naive() + chrono::Duration::days(1);
    let mut body = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\n");
    for i in 0..count {
        let day = tomorrow + chrono::Duration::days(i as i64);
        body.push_str(&format!(
            "BEGIN:VEVENT\r\nUID:{prefix}-{i}\r\nDTSTART:{d}T090000Z\r\nDTEND:{d}T100000Z\r\nSUMMARY:{prefix} {i}\r\nEND:VEVENT\r\n",
            d = day.format("%Y%m%d"),
        ));
    }
    body.push_str("END:VCALENDAR\r\n");
    body
}

/// Range wide enough to cover every event built by [`feed`].
pub fn horizon() -> (DateTime<Utc>, DateTime<Utc>) {
    let now = Utc::now();
    (now - chrono::Duration::days(1), now + chrono::Duration::days(60))
}
