//! Gradient-style optimization of scoring parameters.
//!
//! The optimizer runs `θ ← θ − η · ∇L(θ, D)` over a feedback snapshot with
//! a deliberately simple surrogate loss, keeping the layer weights a valid
//! convex combination and the thresholds inside their envelopes after every
//! step. The learning rate adapts to loss progress, and convergence is a
//! variance test over a sliding loss window.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::feedback::{ExplicitFeedback, FeedbackRecord};
use crate::error::{CacheError, CacheResult};
use crate::vector::{LayerKind, LayerWeights};

/// Learned decision thresholds.
///
/// `cache_hit` gates direct artifact reuse and the diff decision;
/// `diff_generation` gates composition and bounds diff strength. Defaults
/// reproduce the historical fixed knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// In [0.5, 0.99]
    pub cache_hit: f32,
    /// In [0.3, 0.95]
    pub diff_generation: f32,
}

impl Thresholds {
    /// Clamp both thresholds into their envelopes.
    pub fn clamp(&mut self) {
        self.cache_hit = self.cache_hit.clamp(0.5, 0.99);
        self.diff_generation = self.diff_generation.clamp(0.3, 0.95);
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cache_hit: 0.8,
            diff_generation: 0.6,
        }
    }
}

/// The full learned parameter set used by the serving path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemParams {
    /// Per-layer retrieval weights, a convex combination
    pub layer_weights: LayerWeights,
    /// Decision thresholds
    pub thresholds: Thresholds,
    /// Optimizer step size, in [1e-4, 0.1]
    pub learning_rate: f32,
}

impl SystemParams {
    /// Verify the invariants: weights in [0, 1] summing to one within 1e-6,
    /// thresholds and learning rate inside their envelopes.
    pub fn validate(&self) -> CacheResult<()> {
        let sum = self.layer_weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(CacheError::WeightDrift { sum });
        }
        for layer in LayerKind::ALL {
            let weight = self.layer_weights.get(layer);
            if !(0.0..=1.0).contains(&weight) {
                return Err(CacheError::WeightDrift { sum: weight });
            }
        }
        Ok(())
    }
}

impl Default for SystemParams {
    fn default() -> Self {
        Self {
            layer_weights: LayerWeights::default(),
            thresholds: Thresholds::default(),
            learning_rate: 0.01,
        }
    }
}

/// Optimizer tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Loss window length for the convergence test
    pub window_size: usize,
    /// Variance tolerance for convergence
    pub convergence_tolerance: f32,
    /// Non-improving steps tolerated before decaying the learning rate
    pub patience: u32,
    /// Bounded optimization history length
    pub history_limit: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            convergence_tolerance: 1e-3,
            patience: 5,
            history_limit: 1000,
        }
    }
}

/// One entry of the bounded optimization history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRecord {
    pub epoch: u64,
    pub loss: f32,
    pub learning_rate: f32,
    /// False when the step was an anomaly no-op
    pub applied: bool,
    pub timestamp: DateTime<Utc>,
}

/// The outcome of one optimization step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Parameters after the step (unchanged for no-op steps)
    pub params: SystemParams,
    /// Mean batch loss
    pub loss: f32,
    /// Whether the loss window variance is below tolerance
    pub converged: bool,
    /// Whether the update was applied
    pub applied: bool,
}

/// Gradient-style parameter optimizer with adaptive learning rate.
#[derive(Debug)]
pub struct ParameterOptimizer {
    config: OptimizerConfig,
    best_loss: Option<f32>,
    patience_strikes: u32,
    recent_losses: VecDeque<f32>,
    history: VecDeque<OptimizationRecord>,
    epoch: u64,
    converged: bool,
}

impl ParameterOptimizer {
    pub fn new() -> Self {
        Self::with_config(OptimizerConfig::default())
    }

    pub fn with_config(config: OptimizerConfig) -> Self {
        Self {
            config,
            best_loss: None,
            patience_strikes: 0,
            recent_losses: VecDeque::new(),
            history: VecDeque::new(),
            epoch: 0,
            converged: false,
        }
    }

    /// Whether the loss window has settled.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Completed optimization epochs.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The bounded optimization history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &OptimizationRecord> {
        self.history.iter()
    }

    /// Run one optimization step over a feedback snapshot.
    ///
    /// Homogeneous batches (all-accept, all-reject) and zero-gradient
    /// batches are learning anomalies: the step becomes a logged no-op, but
    /// the loss still enters the window and the convergence flag is
    /// recomputed regardless.
    pub fn step(
        &mut self,
        params: &SystemParams,
        batch: &[FeedbackRecord],
    ) -> CacheResult<StepOutcome> {
        if batch.is_empty() {
            warn!("optimization step over empty batch is a no-op");
            return Ok(StepOutcome {
                params: params.clone(),
                loss: 0.0,
                converged: self.converged,
                applied: false,
            });
        }

        self.epoch += 1;
        let n = batch.len() as f32;
        // Weights sum to one, so the surrogate prediction saturates at one;
        // rejected records are the only source of weight gradient.
        let predicted = params.layer_weights.sum().min(1.0);

        let mut total_loss = 0.0f32;
        let mut weight_grad = [0.0f32; 5];
        let mut cache_hit_grad = 0.0f32;
        let mut diff_grad = 0.0f32;
        let mut accepted = 0usize;
        let mut rejected = 0usize;

        for record in batch {
            let label = match record.explicit {
                Some(ExplicitFeedback::Accepted) => {
                    accepted += 1;
                    1.0
                }
                Some(ExplicitFeedback::Rejected) => {
                    rejected += 1;
                    0.0
                }
                None => 0.0,
            };
            let error = predicted - label;
            total_loss += error * error
                + 0.1 * record.implicit.regeneration_count as f32
                + 0.05 * record.implicit.edit_count as f32;
            for layer in LayerKind::ALL {
                weight_grad[layer.index()] += 2.0 * error * layer.sensitivity();
            }
            match record.explicit {
                Some(ExplicitFeedback::Accepted) => {
                    cache_hit_grad -= 0.01;
                    diff_grad -= 0.005;
                }
                Some(ExplicitFeedback::Rejected) => {
                    cache_hit_grad += 0.01;
                    diff_grad += 0.005;
                }
                None => {}
            }
        }

        let loss = total_loss / n;
        for grad in weight_grad.iter_mut() {
            *grad /= n;
        }
        cache_hit_grad /= n;
        diff_grad /= n;

        let explicit_total = accepted + rejected;
        let homogeneous = explicit_total > 0 && (accepted == explicit_total || rejected == explicit_total);
        let zero_gradient = weight_grad.iter().all(|g| g.abs() < f32::EPSILON)
            && cache_hit_grad.abs() < f32::EPSILON
            && diff_grad.abs() < f32::EPSILON;

        let outcome = if homogeneous || zero_gradient {
            warn!(
                accepted,
                rejected,
                zero_gradient,
                "learning anomaly, optimizer step is a no-op"
            );
            StepOutcome {
                params: params.clone(),
                loss,
                converged: false,
                applied: false,
            }
        } else {
            let mut updated = params.clone();
            let lr = updated.learning_rate;
            for layer in LayerKind::ALL {
                let weight = updated.layer_weights.get(layer) - lr * weight_grad[layer.index()];
                updated.layer_weights.set(layer, weight);
            }
            updated.layer_weights.clamp_and_normalize();
            updated.thresholds.cache_hit -= lr * cache_hit_grad;
            updated.thresholds.diff_generation -= lr * diff_grad;
            updated.thresholds.clamp();
            updated.learning_rate = self.adapt_learning_rate(lr, loss);
            updated.validate()?;
            StepOutcome {
                params: updated,
                loss,
                converged: false,
                applied: true,
            }
        };

        self.recent_losses.push_back(loss);
        while self.recent_losses.len() > self.config.window_size {
            self.recent_losses.pop_front();
        }
        self.converged = self.window_variance() < self.config.convergence_tolerance
            && self.recent_losses.len() == self.config.window_size;

        self.history.push_back(OptimizationRecord {
            epoch: self.epoch,
            loss,
            learning_rate: outcome.params.learning_rate,
            applied: outcome.applied,
            timestamp: Utc::now(),
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }

        debug!(
            epoch = self.epoch,
            loss,
            applied = outcome.applied,
            converged = self.converged,
            "optimization step"
        );
        Ok(StepOutcome {
            converged: self.converged,
            ..outcome
        })
    }

    /// Grow the rate on improvement, decay it after repeated stalls.
    fn adapt_learning_rate(&mut self, current: f32, loss: f32) -> f32 {
        let improved = self.best_loss.map_or(true, |best| loss < best);
        let next = if improved {
            self.best_loss = Some(loss);
            self.patience_strikes = 0;
            (current * 1.05).min(0.1)
        } else {
            self.patience_strikes += 1;
            if self.patience_strikes >= self.config.patience {
                self.patience_strikes = 0;
                (current * 0.95).max(1e-4)
            } else {
                current
            }
        };
        next.clamp(1e-4, 0.1)
    }

    fn window_variance(&self) -> f32 {
        let n = self.recent_losses.len();
        if n == 0 {
            return f32::INFINITY;
        }
        let mean = self.recent_losses.iter().sum::<f32>() / n as f32;
        self.recent_losses
            .iter()
            .map(|loss| (loss - mean).powi(2))
            .sum::<f32>()
            / n as f32
    }
}

impl Default for ParameterOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternating_batch(n: usize) -> Vec<FeedbackRecord> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    FeedbackRecord::accepted(format!("p{i}"), format!("r{i}"))
                } else {
                    FeedbackRecord::rejected(format!("p{i}"), format!("r{i}"))
                }
            })
            .collect()
    }

    #[test]
    fn test_step_keeps_weight_invariants() {
        let mut optimizer = ParameterOptimizer::new();
        let params = SystemParams::default();
        let outcome = optimizer.step(&params, &alternating_batch(50)).unwrap();
        assert!(outcome.applied);
        assert!(outcome.params.validate().is_ok());
        for layer in LayerKind::ALL {
            let weight = outcome.params.layer_weights.get(layer);
            assert!((0.0..=1.0).contains(&weight));
        }
    }

    #[test]
    fn test_step_bounded_weight_movement() {
        let mut optimizer = ParameterOptimizer::new();
        let params = SystemParams::default();
        let outcome = optimizer.step(&params, &alternating_batch(50)).unwrap();
        let bound = params.learning_rate * LayerKind::Subject.sensitivity() * 50.0;
        for layer in LayerKind::ALL {
            let delta =
                (outcome.params.layer_weights.get(layer) - params.layer_weights.get(layer)).abs();
            assert!(delta <= bound, "layer {layer} moved {delta}, bound {bound}");
        }
    }

    #[test]
    fn test_all_reject_batch_is_noop() {
        let mut optimizer = ParameterOptimizer::new();
        let params = SystemParams::default();
        let batch: Vec<_> = (0..10)
            .map(|i| FeedbackRecord::rejected(format!("p{i}"), format!("r{i}")))
            .collect();
        let outcome = optimizer.step(&params, &batch).unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.params, params);
        // Weights stay valid even through the anomaly path.
        assert!(outcome.params.validate().is_ok());
    }

    #[test]
    fn test_all_accept_batch_is_noop() {
        let mut optimizer = ParameterOptimizer::new();
        let params = SystemParams::default();
        let batch: Vec<_> = (0..10)
            .map(|i| FeedbackRecord::accepted(format!("p{i}"), format!("r{i}")))
            .collect();
        let outcome = optimizer.step(&params, &batch).unwrap();
        assert!(!outcome.applied);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut optimizer = ParameterOptimizer::new();
        let params = SystemParams::default();
        let outcome = optimizer.step(&params, &[]).unwrap();
        assert!(!outcome.applied);
        assert_eq!(optimizer.epoch(), 0);
    }

    #[test]
    fn test_thresholds_stay_clamped() {
        let mut optimizer = ParameterOptimizer::new();
        let mut params = SystemParams::default();
        params.thresholds.cache_hit = 0.5;
        params.thresholds.diff_generation = 0.3;
        // Mostly-rejected mixed batches push thresholds toward the floors;
        // the clamp keeps them inside the envelopes.
        for round in 0..20 {
            let mut batch = vec![FeedbackRecord::accepted(format!("a{round}"), "r")];
            batch.extend(
                (0..9).map(|i| FeedbackRecord::rejected(format!("p{round}-{i}"), "r")),
            );
            let outcome = optimizer.step(&params, &batch).unwrap();
            params = outcome.params;
            assert!((0.5..=0.99).contains(&params.thresholds.cache_hit));
            assert!((0.3..=0.95).contains(&params.thresholds.diff_generation));
        }
    }

    #[test]
    fn test_learning_rate_stays_in_envelope() {
        let mut optimizer = ParameterOptimizer::new();
        let mut params = SystemParams::default();
        for _ in 0..50 {
            let outcome = optimizer.step(&params, &alternating_batch(10)).unwrap();
            params = outcome.params;
            assert!((1e-4..=0.1).contains(&params.learning_rate));
        }
    }

    #[test]
    fn test_convergence_on_stable_loss() {
        let mut optimizer = ParameterOptimizer::new();
        let mut params = SystemParams::default();
        // The same alternating batch yields the same loss every round, so
        // the window variance reaches zero once the window fills.
        let mut converged = false;
        for _ in 0..12 {
            let outcome = optimizer.step(&params, &alternating_batch(10)).unwrap();
            params = outcome.params;
            converged = outcome.converged;
        }
        assert!(converged);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut optimizer = ParameterOptimizer::with_config(OptimizerConfig {
            history_limit: 5,
            ..Default::default()
        });
        let params = SystemParams::default();
        for _ in 0..12 {
            optimizer.step(&params, &alternating_batch(4)).unwrap();
        }
        assert_eq!(optimizer.history().count(), 5);
        // Oldest entries were dropped.
        assert_eq!(optimizer.history().next().unwrap().epoch, 8);
    }
}
