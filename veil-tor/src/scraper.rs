//! Content acquisition for dark web pages
//!
//! Fetches a URL through a Tor session and extracts readable text. Pages
//! that extract to almost nothing are retried once through the browser
//! renderer, if one is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::node::Node;
use scraper::Html;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{PageRenderer, SessionProvider};

/// Extracts shorter than this are treated as blocked or empty pages
pub const MIN_TEXT_CHARS: usize = 50;

/// Elements whose text never counts as content
const EXCLUDED_ELEMENTS: &[&str] = &["script", "style", "noscript", "iframe", "template"];

/// Errors acquiring a page. All of them mean "skip until next cycle".
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Timed out after {secs}s fetching {url}")]
    Timeout { url: String, secs: u64 },

    #[error("Only {chars} characters extracted from {url}")]
    TooShort { url: String, chars: usize },

    #[error("Render fallback failed for {url}: {message}")]
    Render { url: String, message: String },
}

/// A fetched page reduced to text
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    /// Normalized text
    pub text: String,
    /// Whether the text came from the browser renderer
    pub rendered: bool,
}

impl Page {
    fn from_html(url: &str, html: &str, rendered: bool) -> Self {
        Self {
            url: url.to_string(),
            fetched_at: Utc::now(),
            text: extract_text(html),
            rendered,
        }
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// Anything that turns a URL into page text
#[async_trait]
pub trait Acquire: Send + Sync {
    async fn acquire(&self, url: &str) -> Result<Page, AcquisitionError>;
}

/// Tor-backed acquirer with an optional rendering fallback
pub struct Acquirer {
    sessions: Arc<SessionProvider>,
    renderer: Option<Arc<dyn PageRenderer>>,
    min_chars: usize,
}

impl Acquirer {
    pub fn new(sessions: Arc<SessionProvider>) -> Self {
        Self {
            sessions,
            renderer: None,
            min_chars: MIN_TEXT_CHARS,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_min_chars(mut self, min_chars: usize) -> Self {
        self.min_chars = min_chars;
        self
    }

    /// Fetch a page, logging and swallowing any failure
    pub async fn fetch(&self, url: &str) -> Option<Page> {
        match self.acquire(url).await {
            Ok(page) => Some(page),
            Err(e) => {
                warn!("Skipping {}: {}", url, e);
                None
            }
        }
    }

    async fn fetch_direct(&self, url: &str) -> Result<Page, AcquisitionError> {
        let session = self.sessions.open_session().await;
        let timeout_secs = self.sessions.config().timeout_secs;

        let transport = |e: reqwest::Error| {
            if e.is_timeout() {
                AcquisitionError::Timeout {
                    url: url.to_string(),
                    secs: timeout_secs,
                }
            } else {
                AcquisitionError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        };

        debug!("Fetching: {}", url);
        let response = session.client().get(url).send().await.map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AcquisitionError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let html = response.text().await.map_err(transport)?;
        Ok(Page::from_html(url, &html, false))
    }
}

#[async_trait]
impl Acquire for Acquirer {
    async fn acquire(&self, url: &str) -> Result<Page, AcquisitionError> {
        let page = self.fetch_direct(url).await?;
        if page.char_count() >= self.min_chars {
            debug!("Extracted {} chars from {}", page.char_count(), url);
            return Ok(page);
        }

        let Some(renderer) = &self.renderer else {
            return Err(AcquisitionError::TooShort {
                url: url.to_string(),
                chars: page.char_count(),
            });
        };

        debug!(
            "Only {} chars from {}, falling back to browser render",
            page.char_count(),
            url
        );
        let html = renderer.render(url).await?;
        let rendered = Page::from_html(url, &html, true);

        if rendered.char_count() >= self.min_chars {
            Ok(rendered)
        } else {
            Err(AcquisitionError::TooShort {
                url: url.to_string(),
                chars: rendered.char_count(),
            })
        }
    }
}

/// Extract readable text from markup.
///
/// Drops script, style, embedded-frame and no-script content, joins the
/// remaining text nodes with single spaces and collapses whitespace.
/// Punctuation and case are preserved.
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut text_parts = Vec::new();

    for node_ref in document.root_element().descendants() {
        if let Node::Text(text_node) = node_ref.value() {
            let in_excluded = node_ref.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .map(|el| EXCLUDED_ELEMENTS.contains(&el.name()))
                    .unwrap_or(false)
            });

            if !in_excluded {
                let trimmed = text_node.trim();
                if !trimmed.is_empty() {
                    text_parts.push(trimmed);
                }
            }
        }
    }

    normalize_whitespace(&text_parts.join(" "))
}

/// Normalize whitespace in text
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
