//! The self-learning loop: feedback collection, parameter optimization, and
//! contrastive vector-space adjustment.

mod adjuster;
mod engine;
mod feedback;
mod optimizer;

pub use adjuster::{AdjusterConfig, AdjustmentRecord, VectorSpaceAdjuster};
pub use engine::{LearningConfig, LearningOutcome, PerformanceMetrics, SelfLearningEngine};
pub use feedback::{
    CrossUserPattern, ExplicitFeedback, FeedbackCollector, FeedbackPatterns, FeedbackRecord,
    FeedbackSummary, ImplicitSignals, SessionState,
};
pub use optimizer::{
    OptimizationRecord, OptimizerConfig, ParameterOptimizer, StepOutcome, SystemParams, Thresholds,
};
