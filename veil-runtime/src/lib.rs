//! Veilwatch Runtime
//!
//! Wires the scoring stages into a per-item pipeline and drives it:
//! - Settings file and pipeline assembly
//! - Persistence sinks (log file, JSON Lines, Elasticsearch)
//! - Timestamped feed sources
//! - The monitoring loop with dedup, renewal cadence and cooperative shutdown

pub mod config;
pub mod sink;
pub mod feed;
pub mod pipeline;
pub mod monitor;

pub use config::*;
pub use sink::*;
pub use feed::*;
pub use pipeline::*;
pub use monitor::*;
