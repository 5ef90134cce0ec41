//! Browser-rendered fallback fetch
//!
//! Script-heavy pages extract to almost nothing over plain HTTP. The
//! renderer asks a headless browser service (Browserless `/content`
//! API) for the post-JavaScript DOM instead.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::{AcquisitionError, TorError};

/// Something that can return fully rendered HTML for a URL
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<String, AcquisitionError>;
}

/// Browserless connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    /// Base URL of the browser service, e.g. http://127.0.0.1:3000
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Proxy handed to the browser at launch so rendering also goes through Tor
    #[serde(default = "default_browser_proxy")]
    pub browser_proxy: Option<String>,
    #[serde(default = "default_render_timeout")]
    pub timeout_secs: u64,
}

impl RenderConfig {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            token: None,
            browser_proxy: default_browser_proxy(),
            timeout_secs: default_render_timeout(),
        }
    }
}

fn default_browser_proxy() -> Option<String> {
    Some("socks5://127.0.0.1:9050".to_string())
}

fn default_render_timeout() -> u64 {
    60
}

/// Renderer backed by a Browserless instance
pub struct BrowserlessRenderer {
    client: Client,
    config: RenderConfig,
}

impl BrowserlessRenderer {
    pub fn new(mut config: RenderConfig) -> Result<Self, TorError> {
        config.endpoint = config.endpoint.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TorError::ClientBuild(e.to_string()))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl PageRenderer for BrowserlessRenderer {
    async fn render(&self, url: &str) -> Result<String, AcquisitionError> {
        let render_err = |message: String| AcquisitionError::Render {
            url: url.to_string(),
            message,
        };

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(token) = &self.config.token {
            query.push(("token", token.clone()));
        }
        if let Some(proxy) = &self.config.browser_proxy {
            query.push(("--proxy-server", proxy.clone()));
        }

        let body = serde_json::json!({
            "url": url,
            "gotoOptions": { "waitUntil": "networkidle2" }
        });

        let response = self
            .client
            .post(format!("{}/content", self.config.endpoint))
            .query(&query)
            .json(&body)
            .send()
            .await
            .map_err(|e| render_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(render_err(format!("status {}: {}", status.as_u16(), message)));
        }

        response.text().await.map_err(|e| render_err(e.to_string()))
    }
}
