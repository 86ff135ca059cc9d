//! Rolling percentile baselines with explicit warm-up.
//!
//! Each [`BaselineEstimator`] holds a bounded population of interval samples (oldest evicted)
//! and moves forward through [`BaselinePhase::WarmingUp`] -> [`BaselinePhase::Ready`] once the
//! population reaches `warmup_min_samples`. It never regresses to warming up.

use crate::{config::PercentileTargets, window::WindowSnapshot};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Warm-up state of a [`BaselineEstimator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum BaselinePhase {
    WarmingUp,
    Ready,
}

/// Read-only baseline snapshot. Thresholds are `None` while warming up.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Baseline {
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub sample_count: usize,
    pub ready: bool,
}

impl Baseline {
    pub const fn unready(sample_count: usize) -> Self {
        Self {
            p90: None,
            p95: None,
            sample_count,
            ready: false,
        }
    }
}

/// One observation keyed by its sampling interval. Re-observing a key is a no-op.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineSample {
    pub key: i64,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct BaselineEstimator {
    population: VecDeque<f64>,
    capacity: usize,
    warmup_min_samples: usize,
    targets: PercentileTargets,
    phase: BaselinePhase,
    last_key: Option<i64>,
}

impl BaselineEstimator {
    pub fn new(capacity: usize, warmup_min_samples: usize, targets: PercentileTargets) -> Self {
        Self {
            population: VecDeque::with_capacity(capacity),
            capacity,
            warmup_min_samples,
            targets,
            phase: BaselinePhase::WarmingUp,
            last_key: None,
        }
    }

    pub fn phase(&self) -> BaselinePhase {
        self.phase
    }

    pub fn sample_count(&self) -> usize {
        self.population.len()
    }

    /// Append a sample, returning `false` if it was a re-observation or non-finite.
    pub fn observe(&mut self, sample: BaselineSample) -> bool {
        if self.last_key.is_some_and(|last| sample.key <= last) || !sample.value.is_finite() {
            return false;
        }
        self.last_key = Some(sample.key);

        if self.population.len() >= self.capacity {
            self.population.pop_front();
        }
        self.population.push_back(sample.value);

        if self.phase == BaselinePhase::WarmingUp && self.population.len() >= self.warmup_min_samples {
            self.phase = BaselinePhase::Ready;
        }
        true
    }

    pub fn current(&self) -> Baseline {
        if self.phase == BaselinePhase::WarmingUp {
            return Baseline::unready(self.population.len());
        }

        let sorted = self
            .population
            .iter()
            .copied()
            .sorted_by(|a, b| a.total_cmp(b))
            .collect::<Vec<_>>();

        Baseline {
            p90: percentile(&sorted, self.targets.p90),
            p95: percentile(&sorted, self.targets.p95),
            sample_count: sorted.len(),
            ready: true,
        }
    }
}

/// Percentile of an ascending slice using linear interpolation between adjacent ranks.
pub fn percentile(sorted: &[f64], quantile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }

    let rank = quantile.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

/// Baselines for every metric the promotion conditions compare against.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Baselines {
    pub trade_count: Baseline,
    pub volume: Baseline,
    pub book_updates: Baseline,
}

impl Baselines {
    pub fn ready(&self) -> bool {
        self.trade_count.ready && self.volume.ready && self.book_updates.ready
    }
}

/// Per-symbol set of [`BaselineEstimator`]s fed from closed window snapshots.
#[derive(Debug, Clone)]
pub struct BaselineSet {
    trade_count: BaselineEstimator,
    volume: BaselineEstimator,
    book_updates: BaselineEstimator,
}

impl BaselineSet {
    pub fn new(capacity: usize, warmup_min_samples: usize, targets: PercentileTargets) -> Self {
        let estimator = BaselineEstimator::new(capacity, warmup_min_samples, targets);
        Self {
            trade_count: estimator.clone(),
            volume: estimator.clone(),
            book_updates: estimator,
        }
    }

    pub fn observe(&mut self, key: i64, window: &WindowSnapshot) {
        self.trade_count.observe(BaselineSample {
            key,
            value: window.trade_count as f64,
        });
        self.volume.observe(BaselineSample {
            key,
            value: window.total_volume,
        });
        self.book_updates.observe(BaselineSample {
            key,
            value: window.book_update_count as f64,
        });
    }

    pub fn current(&self) -> Baselines {
        Baselines {
            trade_count: self.trade_count.current(),
            volume: self.volume.current(),
            book_updates: self.book_updates.current(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.trade_count.sample_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator(capacity: usize, warmup: usize) -> BaselineEstimator {
        BaselineEstimator::new(capacity, warmup, PercentileTargets::default())
    }

    #[test]
    fn test_percentile_linear_interpolation() {
        struct TestCase {
            input: (Vec<f64>, f64),
            expected: Option<f64>,
        }

        let tests = vec![
            TestCase {
                // TC0: empty population
                input: (vec![], 0.9),
                expected: None,
            },
            TestCase {
                // TC1: single sample
                input: (vec![7.0], 0.95),
                expected: Some(7.0),
            },
            TestCase {
                // TC2: 1..=10, rank 8.1 -> 9 + 0.1 * (10 - 9)
                input: ((1..=10).map(f64::from).collect(), 0.9),
                expected: Some(9.1),
            },
            TestCase {
                // TC3: 1..=10, rank 8.55
                input: ((1..=10).map(f64::from).collect(), 0.95),
                expected: Some(9.55),
            },
            TestCase {
                // TC4: constant population
                input: (vec![50.0; 30], 0.9),
                expected: Some(50.0),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let (sorted, quantile) = test.input;
            let actual = percentile(&sorted, quantile);
            match (actual, test.expected) {
                (Some(actual), Some(expected)) => {
                    assert!((actual - expected).abs() < 1e-9, "TC{} failed: {actual}", index)
                }
                (actual, expected) => assert_eq!(actual, expected, "TC{} failed", index),
            }
        }
    }

    #[test]
    fn test_unready_until_warmup_reached() {
        let mut estimator = estimator(100, 3);

        for key in 0..2 {
            assert!(estimator.observe(BaselineSample { key, value: 10.0 }));
            let baseline = estimator.current();
            assert!(!baseline.ready);
            assert_eq!(baseline.p90, None);
            assert_eq!(baseline.p95, None);
        }
        assert_eq!(estimator.phase(), BaselinePhase::WarmingUp);

        estimator.observe(BaselineSample { key: 2, value: 10.0 });
        let baseline = estimator.current();
        assert!(baseline.ready);
        assert_eq!(baseline.sample_count, 3);
        assert_eq!(baseline.p90, Some(10.0));
        assert_eq!(estimator.phase(), BaselinePhase::Ready);
    }

    #[test]
    fn test_reobservation_is_idempotent() {
        let mut estimator = estimator(100, 1);
        assert!(estimator.observe(BaselineSample { key: 5, value: 1.0 }));
        assert!(!estimator.observe(BaselineSample { key: 5, value: 1.0 }));
        assert!(!estimator.observe(BaselineSample { key: 4, value: 100.0 }));
        assert_eq!(estimator.sample_count(), 1);
    }

    #[test]
    fn test_non_finite_sample_rejected() {
        let mut estimator = estimator(100, 1);
        assert!(!estimator.observe(BaselineSample {
            key: 0,
            value: f64::NAN
        }));
        assert_eq!(estimator.sample_count(), 0);
    }

    #[test]
    fn test_bounded_population_never_regresses() {
        let mut estimator = estimator(5, 3);
        for key in 0..20 {
            estimator.observe(BaselineSample {
                key,
                value: key as f64,
            });
            if key >= 2 {
                assert_eq!(estimator.phase(), BaselinePhase::Ready);
            }
        }
        assert_eq!(estimator.sample_count(), 5);
        // population is 15..=19
        let p90 = estimator.current().p90.unwrap();
        assert!((p90 - 18.6).abs() < 1e-9);
    }

    #[test]
    fn test_identical_sequences_identical_thresholds() {
        let values = [3.0, 9.5, 1.25, 7.0, 7.0, 2.5, 11.0, 4.75];
        let run = || {
            let mut estimator = estimator(64, 4);
            for (key, value) in values.iter().enumerate() {
                estimator.observe(BaselineSample {
                    key: key as i64,
                    value: *value,
                });
            }
            estimator.current()
        };
        assert_eq!(run(), run());
    }
}
