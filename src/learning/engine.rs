//! The self-learning engine: scheduling for the feedback → optimize →
//! adjust loop.
//!
//! Every durably appended feedback event runs one synchronous post-commit
//! step: maybe optimize the parameters over a snapshot of the whole log,
//! decide whether a vector-space adjustment epoch is due, and recompute the
//! performance metrics. Folding the three checks into one step means no
//! reader can observe a half-applied learning pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::adjuster::VectorSpaceAdjuster;
use super::feedback::{CrossUserPattern, FeedbackCollector, FeedbackRecord};
use super::optimizer::{ParameterOptimizer, SystemParams};
use crate::error::CacheResult;
use crate::vector::MultiLayerVector;

/// Scheduling thresholds for the learning loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Feedback events between optimization passes
    pub optimization_interval: u64,
    /// Minimum total feedback before the first optimization
    pub min_feedback_for_optimization: u64,
    /// Feedback events between adjustment epochs
    pub adjustment_interval: u64,
    /// Minimum total feedback before the first adjustment
    pub min_feedback_for_adjustment: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            optimization_interval: 50,
            min_feedback_for_optimization: 20,
            adjustment_interval: 100,
            min_feedback_for_adjustment: 50,
        }
    }
}

/// Health snapshot of the learning loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub acceptance_rate: f32,
    pub average_regeneration_count: f32,
    /// Whether the optimizer's loss window has settled
    pub parameter_convergence: bool,
    /// `1 − mean(confusion_rate)`; 1.0 with no observed confusion
    pub vector_space_quality: f32,
    pub last_updated: DateTime<Utc>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            acceptance_rate: 0.0,
            average_regeneration_count: 0.0,
            parameter_convergence: false,
            vector_space_quality: 1.0,
            last_updated: Utc::now(),
        }
    }
}

/// What one post-commit step did.
#[derive(Debug, Clone, Copy)]
pub struct LearningOutcome {
    /// The event was appended (false: discarded after session end)
    pub recorded: bool,
    /// An optimization pass ran
    pub optimized: bool,
    /// A vector-space adjustment epoch is due; the store owner must train
    /// and apply it
    pub adjustment_due: bool,
}

/// Ties feedback collection, parameter optimization, and vector-space
/// adjustment to the serving path.
#[derive(Debug)]
pub struct SelfLearningEngine {
    config: LearningConfig,
    collector: FeedbackCollector,
    optimizer: ParameterOptimizer,
    adjuster: VectorSpaceAdjuster,
    params: SystemParams,
    total_feedback: u64,
    last_optimization: u64,
    last_adjustment: u64,
    metrics: PerformanceMetrics,
}

impl SelfLearningEngine {
    pub fn new() -> Self {
        Self::with_config(LearningConfig::default())
    }

    pub fn with_config(config: LearningConfig) -> Self {
        Self {
            config,
            collector: FeedbackCollector::new(),
            optimizer: ParameterOptimizer::new(),
            adjuster: VectorSpaceAdjuster::new(),
            params: SystemParams::default(),
            total_feedback: 0,
            last_optimization: 0,
            last_adjustment: 0,
            metrics: PerformanceMetrics::default(),
        }
    }

    /// The current learned parameters.
    pub fn params(&self) -> &SystemParams {
        &self.params
    }

    /// The latest performance metrics.
    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Total feedback events appended.
    pub fn total_feedback(&self) -> u64 {
        self.total_feedback
    }

    /// Read access to the feedback log.
    pub fn collector(&self) -> &FeedbackCollector {
        &self.collector
    }

    /// Mutable access for session lifecycle events.
    pub fn collector_mut(&mut self) -> &mut FeedbackCollector {
        &mut self.collector
    }

    /// The current space transforms.
    pub fn adjuster(&self) -> &VectorSpaceAdjuster {
        &self.adjuster
    }

    /// Restore the space transforms to identity/zero.
    pub fn reset_adjuster(&mut self) {
        self.adjuster.reset();
    }

    /// Append one feedback event and run the post-commit step.
    ///
    /// Optimization observes a snapshot of the whole log at trigger time;
    /// events arriving later are seen by the next trigger. The adjustment
    /// itself is not run here; the store owner resolves the confusion
    /// patterns to vectors and calls [`train_adjustment`], then swaps the
    /// stores under its writer lock.
    ///
    /// [`train_adjustment`]: SelfLearningEngine::train_adjustment
    pub fn record_feedback(&mut self, record: FeedbackRecord) -> CacheResult<LearningOutcome> {
        if !self.collector.record(record) {
            return Ok(LearningOutcome {
                recorded: false,
                optimized: false,
                adjustment_due: false,
            });
        }
        self.total_feedback += 1;

        let mut optimized = false;
        if self.should_optimize() {
            let snapshot = self.collector.records().to_vec();
            let outcome = self.optimizer.step(&self.params, &snapshot)?;
            self.params = outcome.params;
            self.last_optimization = self.total_feedback;
            optimized = true;
            info!(
                total_feedback = self.total_feedback,
                loss = outcome.loss,
                applied = outcome.applied,
                converged = outcome.converged,
                "parameter optimization pass"
            );
        }

        let adjustment_due = self.should_adjust();
        self.update_metrics();
        Ok(LearningOutcome {
            recorded: true,
            optimized,
            adjustment_due,
        })
    }

    /// The confusion patterns currently observable in the log.
    pub fn confusion_patterns(&self) -> Vec<CrossUserPattern> {
        self.collector.cross_user_patterns()
    }

    /// Train one adjustment epoch from resolved confusion patterns and
    /// return the adjuster for the caller to transform its stores with.
    pub fn train_adjustment(
        &mut self,
        patterns: &[(MultiLayerVector, MultiLayerVector, f32)],
    ) -> &VectorSpaceAdjuster {
        self.adjuster.absorb_patterns(patterns);
        self.last_adjustment = self.total_feedback;
        &self.adjuster
    }

    /// Recompute the performance metrics from the current log.
    pub fn update_metrics(&mut self) {
        let summary = self.collector.aggregate();
        let patterns = self.collector.cross_user_patterns();
        let vector_space_quality = if patterns.is_empty() {
            1.0
        } else {
            let mean: f32 = patterns.iter().map(|p| p.confusion_rate).sum::<f32>()
                / patterns.len() as f32;
            (1.0 - mean).clamp(0.0, 1.0)
        };
        self.metrics = PerformanceMetrics {
            acceptance_rate: summary.acceptance_rate,
            average_regeneration_count: summary.average_regeneration_count,
            parameter_convergence: self.optimizer.converged(),
            vector_space_quality,
            last_updated: Utc::now(),
        };
        debug!(
            acceptance = self.metrics.acceptance_rate,
            quality = self.metrics.vector_space_quality,
            "metrics updated"
        );
    }

    fn should_optimize(&self) -> bool {
        self.total_feedback - self.last_optimization >= self.config.optimization_interval
            && self.total_feedback >= self.config.min_feedback_for_optimization
    }

    fn should_adjust(&self) -> bool {
        self.total_feedback - self.last_adjustment >= self.config.adjustment_interval
            && self.total_feedback >= self.config.min_feedback_for_adjustment
    }
}

impl Default for SelfLearningEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternating(i: usize) -> FeedbackRecord {
        if i % 2 == 0 {
            FeedbackRecord::accepted(format!("p{i}"), format!("r{i}"))
        } else {
            FeedbackRecord::rejected(format!("p{i}"), format!("r{i}"))
        }
    }

    #[test]
    fn test_optimization_fires_at_interval() {
        let mut engine = SelfLearningEngine::new();
        let mut optimizations = 0;
        for i in 0..50 {
            let outcome = engine.record_feedback(alternating(i)).unwrap();
            if outcome.optimized {
                optimizations += 1;
                assert_eq!(engine.total_feedback(), 50);
            }
        }
        assert_eq!(optimizations, 1, "exactly one pass in the first 50 events");
        assert!(engine.params().validate().is_ok());
    }

    #[test]
    fn test_adjustment_due_at_interval() {
        let mut engine = SelfLearningEngine::new();
        let mut due_at = None;
        for i in 0..100 {
            let outcome = engine.record_feedback(alternating(i)).unwrap();
            if outcome.adjustment_due && due_at.is_none() {
                due_at = Some(engine.total_feedback());
            }
        }
        assert_eq!(due_at, Some(100));
    }

    #[test]
    fn test_train_adjustment_resets_due_flag() {
        let mut engine = SelfLearningEngine::new();
        for i in 0..100 {
            engine.record_feedback(alternating(i)).unwrap();
        }
        assert!(engine.should_adjust());
        engine.train_adjustment(&[]);
        assert!(!engine.should_adjust());
    }

    #[test]
    fn test_discarded_feedback_does_not_count() {
        let mut engine = SelfLearningEngine::new();
        engine.collector_mut().start_session("alice");
        engine.collector_mut().end_session("alice");
        let outcome = engine
            .record_feedback(FeedbackRecord::accepted("p", "r").with_user("alice"))
            .unwrap();
        assert!(!outcome.recorded);
        assert_eq!(engine.total_feedback(), 0);
    }

    #[test]
    fn test_metrics_track_acceptance() {
        let mut engine = SelfLearningEngine::new();
        engine
            .record_feedback(FeedbackRecord::accepted("p1", "r1"))
            .unwrap();
        engine
            .record_feedback(FeedbackRecord::accepted("p2", "r2"))
            .unwrap();
        engine
            .record_feedback(FeedbackRecord::rejected("p3", "r3"))
            .unwrap();
        let metrics = engine.metrics();
        assert!((metrics.acceptance_rate - 2.0 / 3.0).abs() < 1e-6);
        assert!((metrics.vector_space_quality - 1.0).abs() < 1e-6);
    }
}
