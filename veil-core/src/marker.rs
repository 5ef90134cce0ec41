//! Run-scoped deduplication marker for timestamped feeds

use chrono::{DateTime, Utc};

/// Timestamp of the newest item scored during the current run.
///
/// Lives only as long as the monitoring loop that owns it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastProcessedMarker(Option<DateTime<Utc>>);

impl LastProcessedMarker {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self(Some(timestamp))
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    /// Whether an item with this timestamp has not been seen yet
    pub fn is_new(&self, timestamp: DateTime<Utc>) -> bool {
        match self.0 {
            Some(last) => timestamp > last,
            None => true,
        }
    }

    /// Keep only unseen items
    pub fn filter_new<T, F>(&self, items: Vec<T>, timestamp_of: F) -> Vec<T>
    where
        F: Fn(&T) -> DateTime<Utc>,
    {
        items
            .into_iter()
            .filter(|item| self.is_new(timestamp_of(item)))
            .collect()
    }

    /// Move forward to the newest of `timestamps`. Never moves backwards.
    pub fn advance<I>(&mut self, timestamps: I)
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        if let Some(newest) = timestamps.into_iter().max() {
            if self.is_new(newest) {
                self.0 = Some(newest);
            }
        }
    }
}
