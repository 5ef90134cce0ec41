//! Per-item scoring chain
//!
//! acquire -> classify -> [refine] -> calibrate -> persist, in that order.
//! Refinement and calibration never fail an item; the other stages do.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

use veil_agents::{ClassificationError, Refiner, SharedClassifier, SharedTopicDetector};
use veil_core::{Calibrator, ScoreRecord, ScrapedItem};
use veil_tor::{Acquire, AcquisitionError, Page};

use crate::{PersistenceError, SharedSink};

/// Why an item dropped out of the chain
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Calibration task failed: {0}")]
    Calibration(String),
}

/// The scoring stages wired together
pub struct Pipeline {
    acquirer: Arc<dyn Acquire>,
    classifier: SharedClassifier,
    topics: SharedTopicDetector,
    refiner: Option<Refiner>,
    calibrator: Arc<Calibrator>,
    sink: SharedSink,
}

impl Pipeline {
    pub fn new(
        acquirer: Arc<dyn Acquire>,
        classifier: SharedClassifier,
        topics: SharedTopicDetector,
        calibrator: Arc<Calibrator>,
        sink: SharedSink,
    ) -> Self {
        Self {
            acquirer,
            classifier,
            topics,
            refiner: None,
            calibrator,
            sink,
        }
    }

    pub fn with_refiner(mut self, refiner: Refiner) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn calibrator(&self) -> &Arc<Calibrator> {
        &self.calibrator
    }

    pub async fn acquire(&self, url: &str) -> Result<Page, PipelineError> {
        Ok(self.acquirer.acquire(url).await?)
    }

    /// Classify, refine and calibrate one text
    pub async fn score(
        &self,
        source: &str,
        fetched_at: DateTime<Utc>,
        text: String,
    ) -> Result<ScoreRecord, PipelineError> {
        let base = self.classifier.score(&text).await?;
        let item = ScrapedItem::new(source, fetched_at, text, base);
        let topic = self.topics.detect(&item.text);

        let refined = match &self.refiner {
            Some(refiner) => refiner.refine(&item.text, base).await,
            None => base,
        };

        // Table writes are blocking file I/O
        let calibrator = self.calibrator.clone();
        let url = item.url.clone();
        let state_topic = topic.clone();
        let adjustment =
            tokio::task::spawn_blocking(move || calibrator.adjust(&url, refined, &state_topic))
                .await
                .map_err(|e| PipelineError::Calibration(e.to_string()))?;

        debug!(
            "Scored {}: base {} -> refined {} -> final {} ({})",
            source, base, refined, adjustment.adjusted, topic
        );

        Ok(ScoreRecord::new(&item, topic, adjustment.adjusted))
    }

    /// Append a record, logging failures at error level
    pub async fn persist(&self, record: &ScoreRecord) -> Result<(), PipelineError> {
        if let Err(e) = self.sink.append(record).await {
            error!("Lost score record for {} ({}): {}", record.url, self.sink.name(), e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Run the whole chain for one URL
    pub async fn process_url(&self, url: &str) -> Result<ScoreRecord, PipelineError> {
        let page = self.acquire(url).await?;
        let record = self.score(url, page.fetched_at, page.text).await?;
        self.persist(&record).await?;
        Ok(record)
    }
}
