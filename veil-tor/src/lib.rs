//! Veilwatch Tor Layer
//!
//! Provides Tor-based networking for content acquisition:
//! - SOCKS5h session provider with control-port identity renewal
//! - Page fetching and text extraction
//! - Browser-rendered fallback for script-heavy pages
//! - Target list normalization

pub mod proxy;
pub mod control;
pub mod render;
pub mod scraper;
pub mod targets;

pub use proxy::*;
pub use render::*;
pub use scraper::*;
pub use targets::*;
