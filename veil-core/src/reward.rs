//! Reward sources for the calibrator
//!
//! The calibrator learns from whatever signal is plugged in here. The
//! random source reproduces the reference behaviour; deployments should
//! feed analyst verdicts through [`FeedbackReward`].

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;

use crate::{CalibrationStorageError, TopicLabel};

/// What the calibrator just did, handed to the reward source
#[derive(Debug, Clone)]
pub struct RewardContext<'a> {
    pub source: &'a str,
    pub topic: &'a TopicLabel,
    pub previous_score: f64,
    pub adjusted_score: f64,
}

/// Produces the reward for one calibration step
pub trait RewardSource: Send + Sync {
    fn reward(&self, ctx: &RewardContext<'_>) -> f64;

    fn name(&self) -> &str;
}

/// Uniform draw from {+1, 0, -1}
pub struct RandomReward {
    rng: Mutex<StdRng>,
}

impl RandomReward {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomReward {
    fn default() -> Self {
        Self::new()
    }
}

impl RewardSource for RandomReward {
    fn reward(&self, _ctx: &RewardContext<'_>) -> f64 {
        const CHOICES: [f64; 3] = [1.0, 0.0, -1.0];
        CHOICES[self.rng.lock().gen_range(0..CHOICES.len())]
    }

    fn name(&self) -> &str {
        "random"
    }
}

/// Constant reward
pub struct FixedReward(pub f64);

impl FixedReward {
    pub fn neutral() -> Self {
        Self(0.0)
    }
}

impl RewardSource for FixedReward {
    fn reward(&self, _ctx: &RewardContext<'_>) -> f64 {
        self.0
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// Rewards adjustments that move toward an analyst's verdict.
///
/// Verdicts map a source URL to the score an analyst assigned it.
/// +1 when the adjustment closed the gap, -1 when it widened it, 0 otherwise.
#[derive(Debug, Default)]
pub struct FeedbackReward {
    verdicts: HashMap<String, f64>,
}

impl FeedbackReward {
    pub fn new(verdicts: HashMap<String, f64>) -> Self {
        Self { verdicts }
    }

    /// Load verdicts from a JSON object of `url -> score`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationStorageError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| CalibrationStorageError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let verdicts =
            serde_json::from_str(&content).map_err(|source| CalibrationStorageError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { verdicts })
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }
}

impl RewardSource for FeedbackReward {
    fn reward(&self, ctx: &RewardContext<'_>) -> f64 {
        let Some(&verdict) = self.verdicts.get(ctx.source) else {
            return 0.0;
        };

        let before = (verdict - ctx.previous_score).abs();
        let after = (verdict - ctx.adjusted_score).abs();

        if after < before {
            1.0
        } else if after > before {
            -1.0
        } else {
            0.0
        }
    }

    fn name(&self) -> &str {
        "feedback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(topic: &'a TopicLabel, prev: f64, adjusted: f64) -> RewardContext<'a> {
        RewardContext {
            source: "http://a.onion/",
            topic,
            previous_score: prev,
            adjusted_score: adjusted,
        }
    }

    #[test]
    fn test_random_reward_range() {
        let source = RandomReward::seeded(7);
        let topic = TopicLabel::general();
        for _ in 0..100 {
            let r = source.reward(&ctx(&topic, 5.0, 5.5));
            assert!(r == 1.0 || r == 0.0 || r == -1.0);
        }
    }

    #[test]
    fn test_feedback_reward_direction() {
        let mut verdicts = HashMap::new();
        verdicts.insert("http://a.onion/".to_string(), 8.0);
        let source = FeedbackReward::new(verdicts);
        let topic = TopicLabel::general();

        assert_eq!(source.reward(&ctx(&topic, 7.0, 7.5)), 1.0);
        assert_eq!(source.reward(&ctx(&topic, 7.0, 6.5)), -1.0);
        assert_eq!(source.reward(&ctx(&topic, 7.0, 7.0)), 0.0);
    }

    #[test]
    fn test_feedback_reward_unknown_source() {
        let source = FeedbackReward::default();
        let topic = TopicLabel::general();
        assert_eq!(source.reward(&ctx(&topic, 7.0, 7.5)), 0.0);
    }
}
