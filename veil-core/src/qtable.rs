//! Discretized calibration state and the persisted Q-table
//!
//! The table maps `"{bucket}_{topic}"` keys to one value per action
//! (decrease, hold, increase). It is stored as a single JSON object.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::{TopicLabel, MAX_SCORE};

/// Number of calibration actions
pub const NUM_ACTIONS: usize = 3;

/// Action values for one state
pub type ActionValues = [f64; NUM_ACTIONS];

/// Errors loading or saving the Q-table
#[derive(Debug, Error)]
pub enum CalibrationStorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt table in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Discretized (score bucket, topic) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QState {
    pub bucket: usize,
    pub topic: TopicLabel,
}

impl fmt::Display for QState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.bucket, self.topic)
    }
}

/// Bucket index of a score for `bins` equal-width bins over [0, 10]
pub fn score_bucket(score: f64, bins: usize) -> usize {
    let bins = bins.max(1);
    if score.is_nan() || score <= 0.0 {
        return 0;
    }
    let width = MAX_SCORE / bins as f64;
    ((score / width).floor() as usize).min(bins - 1)
}

/// Derive the state key for a score and topic
pub fn state_key(score: f64, topic: &TopicLabel, bins: usize) -> QState {
    QState {
        bucket: score_bucket(score, bins),
        topic: topic.clone(),
    }
}

/// State -> action values. Keys are only ever added.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QTable {
    entries: BTreeMap<String, ActionValues>,
}

impl QTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, state: &QState) -> bool {
        self.entries.contains_key(&state.to_string())
    }

    /// Values for a state, zeros if unseen (does not insert)
    pub fn values(&self, state: &QState) -> ActionValues {
        self.entries
            .get(&state.to_string())
            .copied()
            .unwrap_or([0.0; NUM_ACTIONS])
    }

    /// Values for a state, inserting zeros if unseen
    pub fn entry(&mut self, state: &QState) -> &mut ActionValues {
        self.entries
            .entry(state.to_string())
            .or_insert([0.0; NUM_ACTIONS])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ActionValues)> {
        self.entries.iter()
    }
}

/// JSON file backing a Q-table
#[derive(Debug, Clone)]
pub struct QTableStore {
    path: PathBuf,
}

impl QTableStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the table. A missing file is an empty table.
    pub fn load(&self) -> Result<QTable, CalibrationStorageError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No Q-table at {}, starting empty", self.path.display());
                return Ok(QTable::new());
            }
            Err(source) => {
                return Err(CalibrationStorageError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| CalibrationStorageError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the whole table, replacing the file atomically
    pub fn save(&self, table: &QTable) -> Result<(), CalibrationStorageError> {
        let io_err = |source| CalibrationStorageError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let json = serde_json::to_string(table).map_err(|source| {
            CalibrationStorageError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}
