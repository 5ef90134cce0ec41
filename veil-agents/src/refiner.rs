//! Score Refinement Stage
//!
//! Borderline and high-severity items get a second opinion from a
//! reasoning service. At most one call per item, and any failure falls
//! back to the base score.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use veil_core::normalize_score;

use crate::{ReasoningError, ReasoningRequest, SharedBackend};

/// System prompt for threat re-scoring
const REFINER_SYSTEM_PROMPT: &str = r#"
You are a threat assessment analyst at a security operations center that monitors dark web sources on behalf of its clients. You review text that an automated classifier has already scored.

Scores run from 0 (benign) to 10 (imminent, severe harm). Weigh coded slang, euphemisms, and context the classifier may have missed.

Respond with the revised score only, as a single number such as 7.8. No words, no units.
"#;

/// Errors from a refinement attempt. Never escapes [`Refiner::refine`].
#[derive(Debug, Error)]
pub enum RefinementError {
    #[error("Reasoning service failed: {0}")]
    Service(#[from] ReasoningError),

    #[error("Unparseable score reply: {0:?}")]
    Unparseable(String),

    #[error("Reasoning service timed out after {0}s")]
    Timeout(u64),
}

/// Refinement settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefinerConfig {
    /// Base scores at or above this are refined
    pub threshold: f64,
    /// Longest text excerpt sent to the service
    pub max_prompt_chars: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            threshold: 6.0,
            max_prompt_chars: 4000,
            max_tokens: 10,
            temperature: 0.2,
            timeout_secs: 30,
        }
    }
}

/// Parse a reply that should be a bare number
pub fn parse_score_reply(reply: &str) -> Result<f64, RefinementError> {
    let trimmed = reply.trim();
    match trimmed.parse::<f64>() {
        Ok(score) if score.is_finite() => Ok(normalize_score(score)),
        _ => Err(RefinementError::Unparseable(trimmed.to_string())),
    }
}

/// Conditional LLM re-scoring
pub struct Refiner {
    backend: SharedBackend,
    config: RefinerConfig,
}

impl Refiner {
    pub fn new(backend: SharedBackend, config: RefinerConfig) -> Self {
        Self { backend, config }
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn should_refine(&self, base_score: f64) -> bool {
        base_score >= self.config.threshold
    }

    fn build_prompt(&self, text: &str, base_score: f64) -> String {
        let excerpt: String = text.chars().take(self.config.max_prompt_chars).collect();
        format!(
            "Text:\n\"\"\"\n{}\n\"\"\"\n\nCurrent predicted threat score: {} (range 0-10).\nRe-evaluate and reply with the new score.",
            excerpt, base_score
        )
    }

    /// One call to the reasoning service, surfacing every failure
    pub async fn try_refine(&self, text: &str, base_score: f64) -> Result<f64, RefinementError> {
        let prompt = self.build_prompt(text, base_score);
        let request = ReasoningRequest {
            system: REFINER_SYSTEM_PROMPT,
            prompt: &prompt,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let reply = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.backend.complete(&request),
        )
        .await
        .map_err(|_| RefinementError::Timeout(self.config.timeout_secs))??;

        parse_score_reply(&reply)
    }

    /// Refined score, or `base_score` unchanged if below threshold or on any failure
    pub async fn refine(&self, text: &str, base_score: f64) -> f64 {
        if !self.should_refine(base_score) {
            return base_score;
        }

        match self.try_refine(text, base_score).await {
            Ok(score) => {
                debug!("Refined {} -> {} via {}", base_score, score, self.model_name());
                score
            }
            Err(e) => {
                warn!("Refinement failed, keeping base score {}: {}", base_score, e);
                base_score
            }
        }
    }
}
