//! Harvested items and the records persisted for them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::TEXT_SAMPLE_CHARS;

/// Coarse category assigned to a text by a topic detector.
///
/// Only used as part of the calibration state key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicLabel(String);

impl TopicLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Label used when nothing more specific matches
    pub fn general() -> Self {
        Self("general".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicLabel {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A page's normalized text together with its base classifier score.
///
/// Built once classification succeeds and never changed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedItem {
    /// Source URL
    pub url: String,
    /// When the page was fetched (or the feed item was published)
    pub fetched_at: DateTime<Utc>,
    /// Full normalized text
    pub text: String,
    /// Score from the base classifier, before refinement and calibration
    pub base_score: f64,
}

impl ScrapedItem {
    pub fn new(url: &str, fetched_at: DateTime<Utc>, text: String, base_score: f64) -> Self {
        Self {
            url: url.to_string(),
            fetched_at,
            text,
            base_score,
        }
    }

    /// Bounded text sample kept in storage
    pub fn sample(&self) -> String {
        truncate_sample(&self.text)
    }
}

/// Final, persisted result for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    /// Truncated text sample, never the full page
    pub text: String,
    /// Final score in [0, 10], 2 decimals
    pub score: f64,
    pub topic: TopicLabel,
    pub base_score: f64,
}

impl ScoreRecord {
    pub fn new(item: &ScrapedItem, topic: TopicLabel, final_score: f64) -> Self {
        Self {
            url: item.url.clone(),
            timestamp: item.fetched_at,
            text: item.sample(),
            score: crate::normalize_score(final_score),
            topic,
            base_score: item.base_score,
        }
    }

    /// Stable document id: SHA-256 of url and timestamp.
    ///
    /// Stores keyed on it absorb duplicate appends.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url.as_bytes());
        hasher.update(b"|");
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// `timestamp | text_sample | score`
    pub fn log_line(&self) -> String {
        // The sample is whitespace-collapsed already; '|' is the only separator to escape
        let sample = self.text.replace('|', "/");
        format!(
            "{} | {} | {:.2}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            sample,
            self.score
        )
    }
}

/// Truncate text to the stored sample length on a char boundary
pub fn truncate_sample(text: &str) -> String {
    text.chars().take(TEXT_SAMPLE_CHARS).collect()
}
