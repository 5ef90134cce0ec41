//! Base threat classifiers
//!
//! The pipeline only sees [`ThreatClassifier`]; the model behind it is a
//! black box. Two implementations ship here: a weighted lexicon that runs
//! in-process and a client for a remote model-serving endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use veil_core::normalize_score;

use crate::text::tokenize;

/// Errors from the base classifier. The item is skipped, the loop goes on.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed classifier response: {0}")]
    MalformedResponse(String),

    #[error("Failed to load lexicon {path}: {message}")]
    Lexicon { path: String, message: String },
}

/// Maps normalized text to an initial score in [0, 10]
#[async_trait]
pub trait ThreatClassifier: Send + Sync {
    /// Score a text. Same input and weights always give the same score.
    async fn score(&self, text: &str) -> Result<f64, ClassificationError>;

    fn name(&self) -> &str;
}

/// Thread-safe reference to a classifier
pub type SharedClassifier = Arc<dyn ThreatClassifier>;

/// One weighted lexicon entry
#[derive(Debug, Clone, Deserialize)]
pub struct LexiconTerm {
    /// Word or phrase
    pub term: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Word that must immediately precede the term
    #[serde(default)]
    pub context: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct LexiconFile {
    #[serde(default, rename = "term")]
    terms: Vec<LexiconTerm>,
}

struct CompiledTerm {
    tokens: Vec<String>,
    context: Option<String>,
    weight: f64,
}

/// Sums the weights of every lexicon hit, capped at 10
pub struct LexiconClassifier {
    terms: Vec<CompiledTerm>,
}

impl LexiconClassifier {
    pub fn new(terms: Vec<LexiconTerm>) -> Self {
        let terms = terms
            .into_iter()
            .filter_map(|t| {
                let tokens = tokenize(&t.term);
                if tokens.is_empty() {
                    return None;
                }
                Some(CompiledTerm {
                    tokens,
                    context: t.context.map(|c| c.to_lowercase()),
                    weight: t.weight,
                })
            })
            .collect();

        Self { terms }
    }

    /// The lexicon shipped with the crate
    pub fn with_defaults() -> Self {
        Self::from_toml(include_str!("../lexicon/default.toml")).expect("bundled lexicon")
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let file: LexiconFile = toml::from_str(content)?;
        Ok(Self::new(file.terms))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ClassificationError> {
        let path = path.as_ref();
        let lexicon_err = |message: String| ClassificationError::Lexicon {
            path: path.display().to_string(),
            message,
        };

        let content = std::fs::read_to_string(path).map_err(|e| lexicon_err(e.to_string()))?;
        Self::from_toml(&content).map_err(|e| lexicon_err(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Raw weight sum before capping
    pub fn raw_score(&self, text: &str) -> f64 {
        let words = tokenize(text);
        let mut total = 0.0;

        for (i, _) in words.iter().enumerate() {
            for term in &self.terms {
                let end = i + term.tokens.len();
                if end > words.len() || words[i..end] != term.tokens[..] {
                    continue;
                }
                let context_ok = match &term.context {
                    Some(ctx) => i > 0 && &words[i - 1] == ctx,
                    None => true,
                };
                if context_ok {
                    total += term.weight;
                }
            }
        }

        total
    }
}

#[async_trait]
impl ThreatClassifier for LexiconClassifier {
    async fn score(&self, text: &str) -> Result<f64, ClassificationError> {
        if text.trim().is_empty() {
            return Err(ClassificationError::InvalidInput("empty text".to_string()));
        }
        Ok(normalize_score(self.raw_score(text)))
    }

    fn name(&self) -> &str {
        "lexicon"
    }
}

/// Remote model-serving endpoint settings
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteClassifierConfig {
    /// URL accepting `POST {"text": ...}` and answering `{"score": n}`
    pub endpoint: String,
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

fn default_remote_timeout() -> u64 {
    30
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    score: f64,
}

/// Classifier served over HTTP
pub struct RemoteClassifier {
    client: Client,
    endpoint: String,
}

impl RemoteClassifier {
    pub fn new(config: RemoteClassifierConfig) -> Result<Self, ClassificationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClassificationError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
        })
    }
}

#[async_trait]
impl ThreatClassifier for RemoteClassifier {
    async fn score(&self, text: &str) -> Result<f64, ClassificationError> {
        if text.trim().is_empty() {
            return Err(ClassificationError::InvalidInput("empty text".to_string()));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&ScoreRequest { text })
            .send()
            .await
            .map_err(|e| ClassificationError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassificationError::Unavailable(format!(
                "model server returned {}",
                status
            )));
        }

        let body: ScoreResponse = response
            .json()
            .await
            .map_err(|e| ClassificationError::MalformedResponse(e.to_string()))?;

        if !body.score.is_finite() {
            return Err(ClassificationError::MalformedResponse(format!(
                "non-finite score {}",
                body.score
            )));
        }

        debug!("Remote classifier scored {} chars: {}", text.len(), body.score);
        Ok(normalize_score(body.score))
    }

    fn name(&self) -> &str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lexicon() -> LexiconClassifier {
        LexiconClassifier::from_toml(
            r#"
            [[term]]
            term = "ransomware"
            weight = 3.0

            [[term]]
            term = "dumps"
            context = "card"
            weight = 2.0

            [[term]]
            term = "credit card"
            weight = 1.5
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_lexicon_scores_hits() {
        let clf = lexicon();
        assert_eq!(clf.score("New ransomware kit for sale").await.unwrap(), 3.0);
        assert_eq!(clf.score("Fresh card dumps and credit card data").await.unwrap(), 3.5);
    }

    #[tokio::test]
    async fn test_lexicon_context_required() {
        let clf = lexicon();
        assert_eq!(clf.score("Database dumps available").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_lexicon_caps_at_ten() {
        let clf = lexicon();
        let text = "ransomware ".repeat(10);
        assert_eq!(clf.score(&text).await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn test_lexicon_is_deterministic() {
        let clf = LexiconClassifier::with_defaults();
        let text = "Selling fullz, cvv and fresh card dumps. Escrow only.";
        let first = clf.score(text).await.unwrap();
        assert_eq!(first, clf.score(text).await.unwrap());
        assert!(first > 0.0);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let clf = LexiconClassifier::with_defaults();
        assert!(matches!(
            clf.score("   ").await,
            Err(ClassificationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_default_lexicon_loads() {
        assert!(LexiconClassifier::with_defaults().len() > 20);
    }

    #[tokio::test]
    async fn test_remote_unreachable() {
        let clf = RemoteClassifier::new(RemoteClassifierConfig {
            endpoint: "http://127.0.0.1:1/score".to_string(),
            timeout_secs: 2,
        })
        .unwrap();
        assert!(matches!(
            clf.score("some text").await,
            Err(ClassificationError::Unavailable(_))
        ));
    }
}
