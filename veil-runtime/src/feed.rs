//! Upstream feeds of pre-timestamped items

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Errors polling a feed
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Failed to read feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One observed item: where it came from, when, and its raw body (markup or text)
#[derive(Debug, Clone, Deserialize)]
pub struct FeedItem {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
}

/// Source of newly observed items
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Everything currently visible; the monitor filters what it has seen
    async fn poll(&self) -> Result<Vec<FeedItem>, FeedError>;
}

/// JSON Lines file of feed items, re-read on every poll
pub struct JsonlFeed {
    path: PathBuf,
}

impl JsonlFeed {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl FeedSource for JsonlFeed {
    async fn poll(&self) -> Result<Vec<FeedItem>, FeedError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(FeedError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut items = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FeedItem>(line) {
                Ok(item) => items.push(item),
                Err(e) => warn!(
                    "Skipping malformed feed line {} in {}: {}",
                    lineno + 1,
                    self.path.display(),
                    e
                ),
            }
        }

        Ok(items)
    }
}
