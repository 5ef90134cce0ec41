//! Veilwatch Agents
//!
//! Scoring stages that sit behind narrow interfaces:
//! - **Classifier**: initial threat score from normalized text
//! - **Topics**: coarse category used in the calibration state
//! - **Reasoning**: LLM backends (OpenAI-compatible, Anthropic)
//! - **Refiner**: conditional LLM re-scoring with soft failure

pub mod text;
pub mod classifier;
pub mod topics;
pub mod reasoning;
pub mod refiner;

pub use classifier::*;
pub use topics::*;
pub use reasoning::*;
pub use refiner::*;
