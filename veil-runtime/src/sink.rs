//! Persistence sinks
//!
//! Every scored record is appended to one or more sinks: a plain log
//! file, a JSON Lines document store, an Elasticsearch index. Appends are
//! serialized per sink; duplicate appends are harmless.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use veil_core::ScoreRecord;

/// Errors writing a record. Logged loudly, never fatal to the loop.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Search index request failed: {0}")]
    Http(String),

    #[error("Search index rejected write (status {status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Append-only destination for score records
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn append(&self, record: &ScoreRecord) -> Result<(), PersistenceError>;

    fn name(&self) -> &str;
}

/// Thread-safe reference to a sink
pub type SharedSink = Arc<dyn PersistenceSink>;

/// Structured document form of a record
#[derive(Debug, Serialize)]
pub struct StoredDocument<'a> {
    pub id: String,
    pub url: &'a str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub text: &'a str,
    pub score: f64,
    pub topic: &'a str,
    pub base_score: f64,
}

impl<'a> From<&'a ScoreRecord> for StoredDocument<'a> {
    fn from(record: &'a ScoreRecord) -> Self {
        Self {
            id: record.fingerprint(),
            url: &record.url,
            timestamp: record.timestamp,
            text: &record.text,
            score: record.score,
            topic: record.topic.as_str(),
            base_score: record.base_score,
        }
    }
}

/// Appends one line per record to a file, holding a lock per write
struct LineFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LineFile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    async fn append_line(&self, line: &str) -> Result<(), PersistenceError> {
        let io_err = |source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;

        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(io_err)?;
        file.flush().await.map_err(io_err)
    }
}

/// `timestamp | text_sample | score` lines
pub struct LogFileSink {
    file: LineFile,
}

impl LogFileSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            file: LineFile::new(path.as_ref()),
        }
    }
}

#[async_trait]
impl PersistenceSink for LogFileSink {
    async fn append(&self, record: &ScoreRecord) -> Result<(), PersistenceError> {
        self.file.append_line(&record.log_line()).await
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// One JSON document per line
pub struct JsonlSink {
    file: LineFile,
}

impl JsonlSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            file: LineFile::new(path.as_ref()),
        }
    }
}

#[async_trait]
impl PersistenceSink for JsonlSink {
    async fn append(&self, record: &ScoreRecord) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(&StoredDocument::from(record))?;
        self.file.append_line(&line).await
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

/// Elasticsearch index, documents keyed by record fingerprint
pub struct ElasticsearchSink {
    client: Client,
    base_url: String,
    index: String,
}

impl ElasticsearchSink {
    pub fn new(base_url: &str, index: &str) -> Result<Self, PersistenceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| PersistenceError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
        })
    }

    /// Create the index with an explicit mapping unless it exists
    pub async fn ensure_index(&self) -> Result<(), PersistenceError> {
        let url = format!("{}/{}", self.base_url, self.index);

        let exists = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| PersistenceError::Http(e.to_string()))?;
        if exists.status().is_success() {
            debug!("Index {} already exists", self.index);
            return Ok(());
        }

        let mapping = serde_json::json!({
            "mappings": {
                "properties": {
                    "id": {"type": "keyword"},
                    "url": {"type": "keyword"},
                    "timestamp": {"type": "date"},
                    "text": {"type": "text"},
                    "score": {"type": "float"},
                    "base_score": {"type": "float"},
                    "topic": {"type": "keyword"}
                }
            }
        });

        let response = self
            .client
            .put(&url)
            .json(&mapping)
            .send()
            .await
            .map_err(|e| PersistenceError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PersistenceError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        info!("Created index: {}", self.index);
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for ElasticsearchSink {
    async fn append(&self, record: &ScoreRecord) -> Result<(), PersistenceError> {
        let document = StoredDocument::from(record);
        let url = format!("{}/{}/_doc/{}", self.base_url, self.index, document.id);

        let response = self
            .client
            .put(&url)
            .json(&document)
            .send()
            .await
            .map_err(|e| PersistenceError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PersistenceError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        debug!("Indexed {} into {}", record.url, self.index);
        Ok(())
    }

    fn name(&self) -> &str {
        "elasticsearch"
    }
}

/// Writes to every child sink; reports the first failure after trying all
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl PersistenceSink for FanoutSink {
    async fn append(&self, record: &ScoreRecord) -> Result<(), PersistenceError> {
        let mut first_error = None;

        for sink in &self.sinks {
            if let Err(e) = sink.append(record).await {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    tracing::error!("Sink {} failed: {}", sink.name(), e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "fanout"
    }
}
