//! Reinforcement-learning score calibration
//!
//! One-step tabular Q-learning over (score bucket, topic) states. Each
//! adjustment nudges the score by one of three deltas, learns from the
//! reward source, and writes the whole table through to storage.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    clamp_score, normalize_score, state_key, ActionValues, QState, QTable, QTableStore,
    RewardContext, RewardSource, TopicLabel, DEFAULT_BINS, NUM_ACTIONS,
};

/// Rejected calibration parameters
#[derive(Debug, Error)]
#[error("Invalid calibration parameter: {0}")]
pub struct InvalidParams(pub String);

/// Q-learning hyperparameters
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationParams {
    /// Learning rate
    pub alpha: f64,
    /// Discount factor
    pub gamma: f64,
    /// Exploration rate
    pub epsilon: f64,
    /// Score bins over [0, 10]
    pub bins: usize,
    /// Additive deltas: decrease, hold, increase
    pub actions: ActionValues,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            gamma: 0.9,
            epsilon: 0.1,
            bins: DEFAULT_BINS,
            actions: [-0.5, 0.0, 0.5],
        }
    }
}

impl CalibrationParams {
    pub fn validate(&self) -> Result<(), InvalidParams> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(InvalidParams(format!("alpha {} outside [0, 1]", self.alpha)));
        }
        if !(0.0..1.0).contains(&self.gamma) {
            return Err(InvalidParams(format!("gamma {} outside [0, 1)", self.gamma)));
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(InvalidParams(format!("epsilon {} outside [0, 1]", self.epsilon)));
        }
        if self.bins == 0 {
            return Err(InvalidParams("bins must be at least 1".to_string()));
        }
        if self.actions.iter().any(|a| !a.is_finite()) {
            return Err(InvalidParams("action deltas must be finite".to_string()));
        }
        Ok(())
    }
}

/// Index of the first maximum value
pub fn argmax(values: &ActionValues) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Epsilon-greedy action choice
pub fn select_action<R: Rng>(values: &ActionValues, epsilon: f64, rng: &mut R) -> usize {
    if rng.gen::<f64>() < epsilon {
        rng.gen_range(0..NUM_ACTIONS)
    } else {
        argmax(values)
    }
}

/// `reward + gamma * max(next)`
pub fn q_target(reward: f64, gamma: f64, next: &ActionValues) -> f64 {
    let next_max = next.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    reward + gamma * next_max
}

/// Move `current` a step of size `alpha` toward `target`
pub fn q_update(current: f64, target: f64, alpha: f64) -> f64 {
    current + alpha * (target - current)
}

/// Outcome of one calibration step
#[derive(Debug, Clone)]
pub struct Adjustment {
    pub state: QState,
    pub next_state: QState,
    pub action: usize,
    pub delta: f64,
    pub previous: f64,
    pub adjusted: f64,
    pub reward: f64,
    /// Whether the table reached storage after this step
    pub persisted: bool,
}

struct CalibratorState {
    table: QTable,
    store: Option<QTableStore>,
    rng: StdRng,
}

impl CalibratorState {
    fn persist(&mut self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        match store.save(&self.table) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}; continuing with an in-memory Q-table", e);
                self.store = None;
                false
            }
        }
    }
}

/// Q-learning score adjuster.
///
/// All table access goes through one lock, so concurrent items mapping
/// to the same state never lose updates.
pub struct Calibrator {
    params: CalibrationParams,
    reward: Arc<dyn RewardSource>,
    inner: Mutex<CalibratorState>,
}

impl Calibrator {
    /// Open a calibrator backed by a table file.
    ///
    /// Missing or unreadable tables start empty.
    pub fn open(params: CalibrationParams, reward: Arc<dyn RewardSource>, store: QTableStore) -> Self {
        let table = match store.load() {
            Ok(table) => {
                info!(
                    "Loaded Q-table with {} states from {}",
                    table.len(),
                    store.path().display()
                );
                table
            }
            Err(e) => {
                warn!("{}; starting with an empty Q-table", e);
                QTable::new()
            }
        };

        Self::build(params, reward, table, Some(store))
    }

    /// Calibrator that never touches storage
    pub fn in_memory(params: CalibrationParams, reward: Arc<dyn RewardSource>) -> Self {
        Self::build(params, reward, QTable::new(), None)
    }

    fn build(
        params: CalibrationParams,
        reward: Arc<dyn RewardSource>,
        table: QTable,
        store: Option<QTableStore>,
    ) -> Self {
        Self {
            params,
            reward,
            inner: Mutex::new(CalibratorState {
                table,
                store,
                rng: StdRng::from_entropy(),
            }),
        }
    }

    /// Fix the exploration RNG (for reproducible runs)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.inner.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.params
    }

    pub fn reward_source(&self) -> &str {
        self.reward.name()
    }

    /// Whether updates are still written through to storage
    pub fn is_persistent(&self) -> bool {
        self.inner.lock().store.is_some()
    }

    /// Copy of the current table
    pub fn table(&self) -> QTable {
        self.inner.lock().table.clone()
    }

    /// Adjust a score, learn from the reward, and persist the table
    pub fn adjust(&self, source: &str, score: f64, topic: &TopicLabel) -> Adjustment {
        let params = &self.params;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let previous = clamp_score(score);
        let state = state_key(previous, topic, params.bins);

        let action = select_action(&inner.table.values(&state), params.epsilon, &mut inner.rng);
        let delta = params.actions[action];
        let adjusted = normalize_score(previous + delta);

        let reward = self.reward.reward(&RewardContext {
            source,
            topic,
            previous_score: previous,
            adjusted_score: adjusted,
        });

        let next_state = state_key(adjusted, topic, params.bins);
        inner.table.entry(&state);
        let next_values = *inner.table.entry(&next_state);

        let target = q_target(reward, params.gamma, &next_values);
        let slot = &mut inner.table.entry(&state)[action];
        *slot = q_update(*slot, target, params.alpha);

        let persisted = inner.persist();

        debug!(
            "Calibration {} -> action {:+} -> {} (reward {}, next {})",
            state, delta, adjusted, reward, next_state
        );

        Adjustment {
            state,
            next_state,
            action,
            delta,
            previous,
            adjusted,
            reward,
            persisted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FixedReward;
    use std::path::PathBuf;

    fn greedy() -> CalibrationParams {
        CalibrationParams {
            epsilon: 0.0,
            ..Default::default()
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("veil-calib-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_argmax_first_max() {
        assert_eq!(argmax(&[0.0, 0.0, 0.0]), 0);
        assert_eq!(argmax(&[0.1, 0.3, 0.3]), 1);
        assert_eq!(argmax(&[-1.0, -2.0, 0.5]), 2);
    }

    #[test]
    fn test_select_action_exploits_when_epsilon_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert_eq!(select_action(&[0.0, 0.0, 1.0], 0.0, &mut rng), 2);
        }
    }

    #[test]
    fn test_select_action_explores_when_epsilon_one() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut seen = [false; 3];
        for _ in 0..200 {
            seen[select_action(&[0.0, 0.0, 1.0], 1.0, &mut rng)] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_q_update_contracts_toward_target() {
        for &(old, target) in &[(0.0, 1.0), (2.0, -1.0), (-0.5, 0.9), (0.3, 0.31)] {
            for &alpha in &[0.01, 0.1, 0.5, 0.99] {
                let new = q_update(old, target, alpha);
                assert!((new - target).abs() < (old - target).abs());
            }
        }
    }

    #[test]
    fn test_adjust_updates_one_value() {
        let calibrator = Calibrator::in_memory(greedy(), Arc::new(FixedReward(1.0)));
        let topic = TopicLabel::new("drugs");

        let adj = calibrator.adjust("http://a.onion/", 8.0, &topic);

        // All-zero values tie, first max is "decrease"
        assert_eq!(adj.action, 0);
        assert_eq!(adj.adjusted, 7.5);
        assert_eq!(adj.state.to_string(), "16_drugs");
        assert_eq!(adj.next_state.to_string(), "15_drugs");
        assert!(!adj.persisted);

        let table = calibrator.table();
        assert_eq!(table.values(&adj.state), [0.1, 0.0, 0.0]);
        assert_eq!(table.values(&adj.next_state), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_concurrent_adjusts_lose_no_updates() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;

        let shared = Arc::new(Calibrator::in_memory(greedy(), Arc::new(FixedReward(1.0))));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let calibrator = shared.clone();
                std::thread::spawn(move || {
                    let topic = TopicLabel::new("weapons");
                    for _ in 0..PER_THREAD {
                        calibrator.adjust(&format!("src-{i}"), 5.0, &topic);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let serial = Calibrator::in_memory(greedy(), Arc::new(FixedReward(1.0)));
        let topic = TopicLabel::new("weapons");
        for _ in 0..THREADS * PER_THREAD {
            serial.adjust("src", 5.0, &topic);
        }

        assert_eq!(shared.table(), serial.table());
    }

    #[test]
    fn test_adjust_stays_in_range() {
        let params = CalibrationParams {
            epsilon: 1.0,
            ..Default::default()
        };
        let calibrator = Calibrator::in_memory(params, Arc::new(FixedReward(0.0))).with_seed(3);
        let topic = TopicLabel::general();

        for score in [0.0, 0.2, 5.0, 9.9, 10.0] {
            for _ in 0..20 {
                let adj = calibrator.adjust("src", score, &topic);
                assert!((0.0..=10.0).contains(&adj.adjusted));
            }
        }
    }

    #[test]
    fn test_every_vector_has_three_values() {
        let calibrator = Calibrator::in_memory(CalibrationParams::default(), Arc::new(FixedReward(1.0)))
            .with_seed(11);
        for i in 0..40 {
            calibrator.adjust("src", i as f64 / 4.0, &TopicLabel::general());
        }
        let table = calibrator.table();
        assert!(!table.is_empty());
        assert!(table.iter().all(|(_, v)| v.len() == 3));
    }

    #[test]
    fn test_write_through() {
        let path = temp_path("write-through");
        let _ = std::fs::remove_file(&path);
        let calibrator = Calibrator::open(greedy(), Arc::new(FixedReward(1.0)), QTableStore::new(&path));

        let adj = calibrator.adjust("src", 3.0, &TopicLabel::general());
        assert!(adj.persisted);

        let reloaded = QTableStore::new(&path).load().unwrap();
        assert_eq!(reloaded, calibrator.table());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_table_starts_empty() {
        let path = temp_path("corrupt-start");
        std::fs::write(&path, "[[[").unwrap();

        let calibrator = Calibrator::open(greedy(), Arc::new(FixedReward(0.0)), QTableStore::new(&path));
        assert!(calibrator.table().is_empty());
        assert!(calibrator.is_persistent());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_save_failure_degrades_to_memory() {
        let blocker = temp_path("blocker");
        std::fs::write(&blocker, "file, not a directory").unwrap();
        let store = QTableStore::new(blocker.join("q_table.json"));

        let calibrator = Calibrator::open(greedy(), Arc::new(FixedReward(1.0)), store);
        let adj = calibrator.adjust("src", 6.0, &TopicLabel::general());

        assert!(!adj.persisted);
        assert!(!calibrator.is_persistent());
        assert_eq!(calibrator.table().len(), 2);
        let _ = std::fs::remove_file(&blocker);
    }

    #[test]
    fn test_params_validation() {
        assert!(CalibrationParams::default().validate().is_ok());
        let bad = CalibrationParams {
            gamma: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = CalibrationParams {
            bins: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
