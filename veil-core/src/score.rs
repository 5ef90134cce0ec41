//! Score arithmetic shared by every scoring stage

use crate::{MAX_SCORE, MIN_SCORE};

/// Clamp a score into [0, 10]. NaN collapses to the minimum.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return MIN_SCORE;
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Round to 2 decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Clamp then round, the form every stage hands to the next one
pub fn normalize_score(score: f64) -> f64 {
    round2(clamp_score(score))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_boundaries() {
        assert_eq!(clamp_score(0.0 - 0.5), 0.0);
        assert_eq!(clamp_score(10.0 + 0.5), 10.0);
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(f64::INFINITY), 10.0);
    }

    #[test]
    fn test_clamped_steps_stay_in_range() {
        let mut s = 0.0;
        while s <= 10.0 {
            for delta in [-0.5, 0.0, 0.5] {
                let out = normalize_score(s + delta);
                assert!((0.0..=10.0).contains(&out), "{} + {} -> {}", s, delta, out);
            }
            s += 0.25;
        }
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(7.456), 7.46);
        assert_eq!(round2(3.0), 3.0);
        assert_eq!(normalize_score(12.345), 10.0);
    }
}
