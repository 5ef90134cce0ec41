//! Tor SOCKS5h session provider
//!
//! Creates HTTP clients that route through Tor and hands them out as
//! sessions. Identity renewal waits for every open session to finish,
//! then rotates the circuit and rebuilds the client.

use reqwest::{Client, Proxy};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{info, warn};

use crate::control::signal_newnym;

/// Tor proxy configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    /// SOCKS5 proxy URL (default: socks5h://127.0.0.1:9050). Empty disables proxying.
    pub socks_addr: String,
    /// Control port address used for identity renewal
    pub control_addr: String,
    /// Control port password (null authentication when unset)
    pub control_password: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            socks_addr: "socks5h://127.0.0.1:9050".to_string(),
            control_addr: "127.0.0.1:9051".to_string(),
            control_password: None,
            timeout_secs: 30,
        }
    }
}

impl TorConfig {
    /// No proxy at all, for talking to local services
    pub fn direct() -> Self {
        Self {
            socks_addr: String::new(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Errors from Tor networking
#[derive(Debug, Error)]
pub enum TorError {
    #[error("Failed to build Tor client: {0}")]
    ClientBuild(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Control port I/O error: {0}")]
    ControlIo(#[from] std::io::Error),

    #[error("Control port rejected {command}: {reply}")]
    ControlRejected { command: String, reply: String },

    #[error("Timeout after {0} seconds")]
    Timeout(u64),
}

/// User agents for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:137.0) Gecko/20100101 Firefox/137.0",
    "Mozilla/5.0 (Windows NT 10.0; rv:128.0) Gecko/20100101 Firefox/128.0",
];

/// Get a random user agent
pub fn random_user_agent() -> &'static str {
    use rand::Rng;
    let idx = rand::thread_rng().gen_range(0..USER_AGENTS.len());
    USER_AGENTS[idx]
}

/// Create a Tor-enabled HTTP client
pub fn create_tor_client(config: &TorConfig) -> Result<Client, TorError> {
    let builder = Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(random_user_agent())
        .danger_accept_invalid_certs(true); // Many .onion sites have self-signed certs

    let builder = if config.socks_addr.is_empty() {
        builder.no_proxy()
    } else {
        let proxy = Proxy::all(&config.socks_addr)
            .map_err(|e| TorError::ClientBuild(e.to_string()))?;
        builder.proxy(proxy)
    };

    builder
        .build()
        .map_err(|e| TorError::ClientBuild(e.to_string()))
}

/// Check if Tor proxy is reachable
pub async fn check_tor_connection(config: &TorConfig) -> Result<bool, TorError> {
    let client = create_tor_client(config)?;

    // Tor Project's onion service
    let result = client
        .get("http://2gzyxa5ihm7nsggfxnu52rck2vv4rvmdlkiu3ber7fzs2xqxczfebsid.onion/")
        .send()
        .await;

    match result {
        Ok(resp) => Ok(resp.status().is_success() || resp.status().is_redirection()),
        Err(_) => Ok(false),
    }
}

/// A client checked out from the provider.
///
/// Identity renewal cannot start while any session is alive.
pub struct Session {
    client: OwnedRwLockReadGuard<Client>,
    identity: u64,
}

impl Session {
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Renewal generation this session was opened under
    pub fn identity(&self) -> u64 {
        self.identity
    }
}

/// Hands out Tor-routed sessions and rotates the egress identity
pub struct SessionProvider {
    config: TorConfig,
    client: Arc<RwLock<Client>>,
    identity: AtomicU64,
}

impl SessionProvider {
    pub fn new(config: TorConfig) -> Result<Self, TorError> {
        let client = create_tor_client(&config)?;
        Ok(Self {
            config,
            client: Arc::new(RwLock::new(client)),
            identity: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &TorConfig {
        &self.config
    }

    /// Renewal generation, bumped after every successful renewal
    pub fn identity(&self) -> u64 {
        self.identity.load(Ordering::SeqCst)
    }

    /// Check out a session routed through the proxy
    pub async fn open_session(&self) -> Session {
        let client = self.client.clone().read_owned().await;
        Session {
            client,
            identity: self.identity(),
        }
    }

    /// Ask Tor for a fresh circuit. Best effort: failures are logged and
    /// the current identity stays in use.
    pub async fn renew_identity(&self) -> bool {
        let mut client = self.client.write().await;

        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let signalled = tokio::time::timeout(
            timeout,
            signal_newnym(&self.config.control_addr, self.config.control_password.as_deref()),
        )
        .await
        .unwrap_or(Err(TorError::Timeout(timeout.as_secs())));

        if let Err(e) = signalled {
            warn!("Identity renewal failed, keeping current circuit: {}", e);
            return false;
        }

        // Drop pooled connections so nothing reuses the old circuit
        match create_tor_client(&self.config) {
            Ok(fresh) => *client = fresh,
            Err(e) => warn!("Could not rebuild client after renewal: {}", e),
        }

        let identity = self.identity.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Tor identity renewed (generation {})", identity);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TorConfig::default();
        assert!(config.socks_addr.contains("9050"));
        assert!(config.control_addr.ends_with("9051"));
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn test_random_user_agent() {
        let ua = random_user_agent();
        assert!(ua.contains("Mozilla"));
    }

    #[test]
    fn test_config_fills_defaults() {
        let config: TorConfig = serde_json::from_str(r#"{"timeout_secs": 5}"#).unwrap();
        assert_eq!(config.timeout_secs, 5);
        assert!(config.socks_addr.starts_with("socks5h://"));
    }

    #[tokio::test]
    async fn test_renewal_failure_is_swallowed() {
        // Nothing listens on port 1
        let config = TorConfig {
            control_addr: "127.0.0.1:1".to_string(),
            timeout_secs: 2,
            ..TorConfig::direct()
        };
        let provider = SessionProvider::new(config).unwrap();

        assert!(!provider.renew_identity().await);
        assert_eq!(provider.identity(), 0);

        // Sessions still open on the stale identity
        let session = provider.open_session().await;
        assert_eq!(session.identity(), 0);
    }
}
