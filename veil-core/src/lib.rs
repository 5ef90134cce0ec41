//! Veilwatch Core - Score records and calibration state
//!
//! This crate provides the foundational primitives:
//! - Harvested items and the score records persisted for them
//! - Score arithmetic shared by every stage (clamp, rounding)
//! - The tabular Q-learning calibrator and its persisted Q-table
//! - Pluggable reward sources feeding the calibrator

pub mod score;
pub mod items;
pub mod marker;
pub mod qtable;
pub mod reward;
pub mod calibration;

pub use score::*;
pub use items::*;
pub use marker::*;
pub use qtable::*;
pub use reward::*;
pub use calibration::*;

/// Lowest possible threat score
pub const MIN_SCORE: f64 = 0.0;

/// Highest possible threat score
pub const MAX_SCORE: f64 = 10.0;

/// Characters of extracted text retained in a persisted record
pub const TEXT_SAMPLE_CHARS: usize = 500;

/// Default number of equal-width score bins used for Q-states
pub const DEFAULT_BINS: usize = 20;
