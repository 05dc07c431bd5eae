//! # Pentimento - the layered semantic cache
//!
//! *Pentimento: the visible trace of an earlier image beneath the final
//! layer of paint.*
//!
//! Pentimento is a multi-layer semantic cache for generative image
//! requests. A prompt is projected into five fixed-dimension feature layers
//! plus a cross-layer relation matrix; that fingerprint drives:
//!
//! - **Sharded similarity lookup** - hash-routed shards with
//!   centroid-guided pre-selection and weighted-cosine retrieval
//! - **An adaptive strategy selector** - return a cached artifact,
//!   synthesize one from indexed parts, re-render a close base with a small
//!   delta, or fall through to a full generation
//! - **An online learning loop** - user feedback reshapes the scoring
//!   parameters and, through contrastive transforms, the embedding space
//!   itself
//!
//! ## Quick start
//!
//! ```ignore
//! use pentimento::{FeedbackRecord, MultiModalInput, Pentimento, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Start the cache (zero configuration, in-memory back-ends)
//!     let cache = Pentimento::start().await?;
//!
//!     // Serve a request
//!     let result = cache
//!         .request(
//!             MultiModalInput::text("a red cat, watercolor, serene"),
//!             RequestOptions::default(),
//!         )
//!         .await?;
//!     println!("strategy: {}, {} bytes", result.strategy, result.artifact.len());
//!
//!     // Close the loop with feedback
//!     cache
//!         .submit_feedback(FeedbackRecord::accepted("prompt-1", result.id.clone()))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Pentimento is built from four subsystems:
//!
//! 1. **Vectorization** ([`vector`]) - deterministic content-addressable
//!    word embeddings, per-layer means, and the 5×5 relation matrix
//! 2. **Retrieval** ([`index`]) - the part index and the sharded item store
//! 3. **Strategy** ([`strategy`]) - composer, diff generator, and the
//!    selector that chooses among them
//! 4. **Learning** ([`learning`]) - feedback collection, gradient-style
//!    parameter optimization, and contrastive vector-space adjustment
//!
//! The external world enters through two pinned contracts ([`backend`]):
//! a blob-producing generator and a segmenter. Deterministic in-memory
//! implementations of both ship in the crate.
//!
//! ## Thread safety
//!
//! The core is single-writer by design: all mutable state sits behind one
//! async mutex, and serving and learning serialize on that queue. The
//! handle clones cheaply and can be shared across tasks; vectorization is
//! pure and runs without the lock.

mod core;
mod error;
mod types;

pub mod backend;
pub mod index;
pub mod input;
pub mod learning;
pub mod persistence;
pub mod strategy;
pub mod vector;

// Public API exports
pub use crate::core::{CacheStats, CoreConfig, Pentimento, RequestOptions};
pub use error::{CacheError, CacheResult};
pub use types::{
    BoundingBox, CacheItem, CancelToken, GenerationOverrides, GenerationParams, GenerationResult,
    ImagePart, PartMetadata, PartType, Strategy,
};

// Input contract exports
pub use input::{InputValidator, IssueCode, MultiModalInput, ValidationIssue, ValidatorConfig};

// Vectorization exports
pub use vector::{
    LayerKind, LayerWeights, MultiLayerVector, RelationMatrix, Similarity, Vectorizer,
    VectorizerConfig,
};

// Retrieval exports
pub use index::{PartIndex, PartSearchOptions, ShardConfig, ShardManager, ShardSearchOptions};

// Learning exports
pub use learning::{
    CrossUserPattern, ExplicitFeedback, FeedbackRecord, ImplicitSignals, LearningConfig,
    LearningOutcome, PerformanceMetrics, SystemParams, Thresholds,
};

// Backend contract exports
pub use backend::{Generator, MockGenerator, MockSegmenter, RenderRequest, Segmenter};

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use pentimento::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{CacheStats, CoreConfig, Pentimento, RequestOptions};
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::input::{MultiModalInput, ValidationIssue};
    pub use crate::learning::{ExplicitFeedback, FeedbackRecord, SystemParams};
    pub use crate::types::{GenerationParams, GenerationResult, ImagePart, PartType, Strategy};
    pub use crate::vector::{LayerKind, MultiLayerVector, Vectorizer};
    pub use chrono::{DateTime, Utc};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// This should be called once at application startup. It configures the
/// tracing subscriber with an environment filter.
///
/// The log level can be controlled via the `PENTIMENTO_LOG` environment
/// variable:
/// - `PENTIMENTO_LOG=error` - Only errors
/// - `PENTIMENTO_LOG=warn` - Errors and warnings
/// - `PENTIMENTO_LOG=info` - General information (default)
/// - `PENTIMENTO_LOG=debug` - Debug information
/// - `PENTIMENTO_LOG=trace` - Verbose tracing
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env("PENTIMENTO_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
