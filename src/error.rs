/// Error types for Pentimento operations.
///
/// This module provides the error hierarchy covering every failure mode in
/// the cache. All errors are well-typed and can be pattern-matched for
/// precise handling by callers.
use thiserror::Error;

use crate::input::ValidationIssue;
use crate::vector::LayerKind;

/// The main error type for Pentimento operations.
///
/// All fallible operations in Pentimento return `Result<T, CacheError>`.
/// Input-validation failures carry the full structured issue list so callers
/// can surface per-field codes without string matching.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A layer vector had the wrong number of components.
    ///
    /// Dimension mismatches are invariant violations and fail the current
    /// request immediately.
    #[error("Layer '{layer}' expects {expected} components, got {actual}")]
    DimensionMismatch {
        /// The layer whose dimensions did not match
        layer: LayerKind,
        /// The fixed dimension for the layer
        expected: usize,
        /// The dimension that was supplied
        actual: usize,
    },

    /// A shard id resolved outside the configured shard set.
    #[error("Shard {shard_id} does not exist (configured shards: {num_shards})")]
    MissingShard {
        /// The shard id that was requested
        shard_id: u32,
        /// How many shards are configured
        num_shards: u32,
    },

    /// Layer weights drifted away from summing to one after renormalization.
    #[error("Layer weights sum to {sum}, expected 1.0 within 1e-6")]
    WeightDrift {
        /// The observed weight sum
        sum: f32,
    },

    /// The request input was rejected by the validator.
    #[error("Input validation failed with {} issue(s)", issues.len())]
    InvalidInput {
        /// Structured issues with per-field codes
        issues: Vec<ValidationIssue>,
    },

    /// The generative back-end failed.
    ///
    /// Surfaced verbatim to the caller; no automatic retry. State mutations
    /// performed before the failure (e.g. recorded feedback) are preserved.
    #[error("Generator error: {0}")]
    Generation(String),

    /// The segmenter back-end failed.
    #[error("Segmenter error: {0}")]
    Segmentation(String),

    /// A referenced image part is not in the index.
    #[error("Part '{id}' not found in index")]
    PartNotFound {
        /// The part id that was requested
        id: String,
    },

    /// A strategy could not be dispatched with the available candidates.
    #[error("Strategy dispatch failed: {reason}")]
    StrategyUnavailable {
        /// Why the strategy could not run
        reason: String,
    },

    /// Serialization error when converting data to/from JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The export document had an unknown or incompatible version.
    #[error("Unsupported export document version '{version}'")]
    UnsupportedVersion {
        /// The version string found in the document
        version: String,
    },

    /// The request was cancelled cooperatively.
    #[error("Request cancelled")]
    Cancelled,
}

/// Result type alias for Pentimento operations.
pub type CacheResult<T> = Result<T, CacheError>;
