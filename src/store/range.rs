//! Lazy, restartable range reads.
//!
//! Rows are fetched a page at a time with keyset pagination on
//! `(start_utc, stable_id)`, so a long range never materializes at once and
//! iteration can be restarted from the beginning at any point.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::domain::NormalizedEvent;
use crate::store::{Store, StoreError};

pub const DEFAULT_PAGE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub include_cancelled: bool,
}

/// Position after the last row returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub start_utc: i64,
    pub stable_id: String,
}

impl Cursor {
    pub fn after(event: &NormalizedEvent) -> Self {
        Self {
            start_utc: event.start.sort_instant().timestamp(),
            stable_id: event.stable_id.clone(),
        }
    }
}

/// A finite, ordered view over events overlapping a range.
pub struct EventRange<'a, S: Store> {
    store: &'a S,
    query: RangeQuery,
    page_size: usize,
}

impl<'a, S: Store> EventRange<'a, S> {
    pub fn new(store: &'a S, query: RangeQuery) -> Self {
        Self {
            store,
            query,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn query(&self) -> &RangeQuery {
        &self.query
    }

    /// Start a fresh pass over the range.
    pub fn iter(&self) -> EventRangeIter<'a, S> {
        EventRangeIter {
            store: self.store,
            query: self.query,
            page_size: self.page_size,
            cursor: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn collect_all(&self) -> Result<Vec<NormalizedEvent>, StoreError> {
        self.iter().collect()
    }
}

impl<'a, S: Store> IntoIterator for &EventRange<'a, S> {
    type Item = Result<NormalizedEvent, StoreError>;
    type IntoIter = EventRangeIter<'a, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct EventRangeIter<'a, S: Store> {
    store: &'a S,
    query: RangeQuery,
    page_size: usize,
    cursor: Option<Cursor>,
    buffer: VecDeque<NormalizedEvent>,
    done: bool,
}

impl<S: Store> Iterator for EventRangeIter<'_, S> {
    type Item = Result<NormalizedEvent, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            match self
                .store
                .events_page(&self.query, self.cursor.as_ref(), self.page_size)
            {
                Ok(page) => {
                    self.done = page.len() < self.page_size;
                    if let Some(last) = page.last() {
                        self.cursor = Some(Cursor::after(last));
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
