//! The Pentimento cache engine.
//!
//! This module ties the subsystems together behind one handle: validate the
//! input, project it into a fingerprint, probe the shard store for a direct
//! hit, otherwise select and dispatch a generation strategy, record the
//! finished artifact, and feed user feedback back into the learning loop.
//!
//! # Concurrency
//!
//! The core is single-writer by contract: all mutable state lives behind
//! one async mutex, so serving and learning serialize on the same queue.
//! Vectorization is pure and the external back-ends are the only suspension
//! points. `Pentimento` clones cheaply (`Arc` internally) and can be shared
//! across tasks.
//!
//! # Example
//!
//! ```ignore
//! use pentimento::{MultiModalInput, Pentimento, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = Pentimento::start().await?;
//!     let result = cache
//!         .request(MultiModalInput::text("a red cat, watercolor"), RequestOptions::default())
//!         .await?;
//!     println!("strategy: {}", result.strategy);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::{Generator, MockGenerator, MockSegmenter, Segmenter};
use crate::error::{CacheError, CacheResult};
use crate::index::{PartIndex, ShardConfig, ShardManager, ShardSearchOptions, ShardStats};
use crate::input::{InputValidator, MultiModalInput, ValidatorConfig};
use crate::learning::{
    FeedbackRecord, LearningConfig, LearningOutcome, PerformanceMetrics, SelfLearningEngine,
    SystemParams,
};
use crate::persistence::{self, ExportedConfig};
use crate::strategy::{
    Composer, ComposerConfig, DiffConfig, DiffGenerator, DispatchContext, SelectorConfig,
    StrategySelector,
};
use crate::types::{
    CacheItem, CancelToken, GenerationOverrides, GenerationParams, GenerationResult, ImagePart,
    Strategy,
};
use crate::vector::{MultiLayerVector, Vectorizer, VectorizerConfig};

/// Top-level configuration, one nested config per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub vectorizer: VectorizerConfig,
    pub shards: ShardConfig,
    pub selector: SelectorConfig,
    pub composer: ComposerConfig,
    pub diff: DiffConfig,
    pub learning: LearningConfig,
    pub validator: ValidatorConfig,
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Skip automatic selection and force one strategy
    pub forced_strategy: Option<Strategy>,
    /// Generation parameter overrides
    pub overrides: Option<GenerationOverrides>,
    /// Cooperative cancellation token
    pub cancel: Option<CancelToken>,
}

/// Occupancy and learning snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Cached generation records
    pub items: usize,
    /// Indexed image parts
    pub parts: usize,
    /// Shard occupancy
    pub shards: ShardStats,
    /// Feedback events observed
    pub total_feedback: u64,
    /// Memoized word embeddings
    pub embedding_cache_entries: usize,
}

/// Mutable core state, owned by the single writer.
struct CoreState {
    vectorizer: Vectorizer,
    parts: PartIndex,
    shards: ShardManager,
    selector: StrategySelector,
    learning: SelfLearningEngine,
}

/// The Pentimento cache handle.
#[derive(Clone)]
pub struct Pentimento {
    validator: Arc<InputValidator>,
    state: Arc<Mutex<CoreState>>,
    generator: Arc<dyn Generator>,
    segmenter: Arc<dyn Segmenter>,
}

impl std::fmt::Debug for Pentimento {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pentimento").finish_non_exhaustive()
    }
}

impl Pentimento {
    /// Start with default configuration and the deterministic in-memory
    /// back-ends. Zero configuration required.
    pub async fn start() -> CacheResult<Self> {
        Self::start_with_config(CoreConfig::default()).await
    }

    /// Start with explicit configuration and the in-memory back-ends.
    pub async fn start_with_config(config: CoreConfig) -> CacheResult<Self> {
        Self::start_with_backends(
            config,
            Arc::new(MockGenerator::new()),
            Arc::new(MockSegmenter::new()),
        )
        .await
    }

    /// Start against real generator and segmenter back-ends.
    pub async fn start_with_backends(
        config: CoreConfig,
        generator: Arc<dyn Generator>,
        segmenter: Arc<dyn Segmenter>,
    ) -> CacheResult<Self> {
        let state = CoreState {
            vectorizer: Vectorizer::with_config(config.vectorizer),
            parts: PartIndex::new(),
            shards: ShardManager::new(config.shards),
            selector: StrategySelector::new(
                config.selector,
                Composer::with_config(config.composer),
                DiffGenerator::with_config(config.diff),
            ),
            learning: SelfLearningEngine::with_config(config.learning),
        };
        info!("pentimento cache started");
        Ok(Self {
            validator: Arc::new(InputValidator::with_config(config.validator)),
            state: Arc::new(Mutex::new(state)),
            generator,
            segmenter,
        })
    }

    /// Serve one generation request.
    ///
    /// Validates the input, fingerprints the prompt, probes the shard store
    /// for a direct hit at the learned cache-hit threshold, and otherwise
    /// dispatches the selected strategy. The finished artifact is recorded
    /// as a cache item before returning; a cancelled request records
    /// nothing.
    pub async fn request(
        &self,
        input: MultiModalInput,
        options: RequestOptions,
    ) -> CacheResult<GenerationResult> {
        let issues = self.validator.validate(&input);
        if !issues.is_empty() {
            return Err(CacheError::InvalidInput { issues });
        }
        if let Some(token) = &options.cancel {
            if token.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
        }

        let prompt = input.text.clone();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let vector = state
            .vectorizer
            .vectorize(prompt.as_deref().unwrap_or_default());
        let params = GenerationParams::resolve(options.overrides.as_ref());
        let system = state.learning.params().clone();

        // Direct-hit probe against finalized generations.
        if options.forced_strategy.is_none() || options.forced_strategy == Some(Strategy::Cache) {
            let hits = state.shards.search_similar(
                &vector,
                &system.layer_weights,
                &ShardSearchOptions::new()
                    .threshold(system.thresholds.cache_hit)
                    .max_results(1),
            );
            if let Some(hit) = hits.into_iter().next() {
                state.shards.bump_hit(&hit.item.id);
                debug!(item = %hit.item.id, score = hit.score, "cache hit");
                return Ok(GenerationResult {
                    id: hit.item.id.clone(),
                    strategy: Strategy::Cache,
                    artifact: hit.item.artifact.clone(),
                    used_parts: Vec::new(),
                    base_part: None,
                    denoising_strength: None,
                    params,
                    vector,
                });
            }
        }

        // A forced cache probe that missed falls back to automatic choice.
        let forced = options
            .forced_strategy
            .filter(|strategy| *strategy != Strategy::Cache);
        let result = state
            .selector
            .run(
                DispatchContext {
                    query: &vector,
                    prompt: prompt.as_deref(),
                    weights: &system.layer_weights,
                    thresholds: &system.thresholds,
                    index: &state.parts,
                    generator: self.generator.as_ref(),
                    segmenter: self.segmenter.as_ref(),
                    params,
                    cancel: options.cancel.as_ref(),
                },
                forced,
            )
            .await?;

        if let Some(token) = &options.cancel {
            if token.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
        }

        state.shards.insert(CacheItem {
            id: result.id.clone(),
            vector: result.vector.clone(),
            artifact: result.artifact.clone(),
            created_at: chrono::Utc::now(),
            hit_count: 0,
        })?;
        Ok(result)
    }

    /// Generate `count` variations of a base fingerprint.
    ///
    /// Each variation adds uniform noise in `[-sigma, sigma]` (zero noise
    /// is a no-op) and is dispatched through the diff strategy. Finished
    /// variations are recorded like any other generation.
    pub async fn generate_variations(
        &self,
        base: &MultiLayerVector,
        count: usize,
        sigma: f32,
        overrides: Option<GenerationOverrides>,
    ) -> CacheResult<Vec<GenerationResult>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let system = state.learning.params().clone();
        let variations = state.selector.variations(base, count, sigma)?;

        let mut results = Vec::with_capacity(variations.len());
        for variation in variations {
            let params = GenerationParams::resolve(overrides.as_ref());
            let result = state
                .selector
                .run(
                    DispatchContext {
                        query: &variation,
                        prompt: None,
                        weights: &system.layer_weights,
                        thresholds: &system.thresholds,
                        index: &state.parts,
                        generator: self.generator.as_ref(),
                        segmenter: self.segmenter.as_ref(),
                        params,
                        cancel: None,
                    },
                    Some(Strategy::Diff),
                )
                .await?;
            state.shards.insert(CacheItem {
                id: result.id.clone(),
                vector: result.vector.clone(),
                artifact: result.artifact.clone(),
                created_at: chrono::Utc::now(),
                hit_count: 0,
            })?;
            results.push(result);
        }
        Ok(results)
    }

    /// Submit one feedback event and run the post-commit learning step.
    ///
    /// When enough feedback accumulates, this optimizes the system
    /// parameters and, on the adjustment interval, retrains the space
    /// transforms and atomically swaps the vector stores.
    pub async fn submit_feedback(&self, record: FeedbackRecord) -> CacheResult<LearningOutcome> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let outcome = state.learning.record_feedback(record)?;
        if outcome.adjustment_due {
            run_adjustment(state)?;
        }
        Ok(outcome)
    }

    /// Start a feedback session for a user.
    pub async fn start_session(&self, user_id: &str) -> String {
        self.state
            .lock()
            .await
            .learning
            .collector_mut()
            .start_session(user_id)
    }

    /// End a user's feedback session.
    pub async fn end_session(&self, user_id: &str) -> bool {
        self.state
            .lock()
            .await
            .learning
            .collector_mut()
            .end_session(user_id)
    }

    /// Ingest segmented parts. Idempotent on part id.
    pub async fn index_parts(&self, parts: Vec<ImagePart>) -> usize {
        self.state.lock().await.parts.index_parts(parts)
    }

    /// Remove one part from the index.
    pub async fn remove_part(&self, id: &str) -> CacheResult<ImagePart> {
        self.state
            .lock()
            .await
            .parts
            .remove_part(id)
            .ok_or_else(|| CacheError::PartNotFound { id: id.to_string() })
    }

    /// Drop every indexed part.
    pub async fn clear_parts(&self) {
        self.state.lock().await.parts.clear();
    }

    /// Fingerprint a text without serving a request.
    pub async fn vectorize(&self, text: &str) -> MultiLayerVector {
        self.state.lock().await.vectorizer.vectorize(text)
    }

    /// Export the part index and component configs as a versioned JSON
    /// document.
    pub async fn export(&self) -> CacheResult<String> {
        let state = self.state.lock().await;
        let config = ExportedConfig::new(
            state.vectorizer.config().clone(),
            state.selector.composer().config().clone(),
            state.selector.diff().config().clone(),
            state.selector.config().clone(),
        );
        persistence::export_to_json(&state.parts, &config)
    }

    /// Import a document: clear the index, re-ingest its parts, and reapply
    /// its component configs. Returns the number of parts ingested.
    pub async fn import(&self, json: &str) -> CacheResult<usize> {
        let document = persistence::import_from_json(json)?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let config = persistence::apply_import(&mut state.parts, document);
        state.vectorizer = Vectorizer::with_config(config.vectorizer);
        state.selector = StrategySelector::new(
            config.selector,
            Composer::with_config(config.composer),
            DiffGenerator::with_config(config.diff),
        );
        Ok(state.parts.len())
    }

    /// The current learned parameters.
    pub async fn params(&self) -> SystemParams {
        self.state.lock().await.learning.params().clone()
    }

    /// The latest learning metrics.
    pub async fn metrics(&self) -> PerformanceMetrics {
        self.state.lock().await.learning.metrics().clone()
    }

    /// Restore the vector-space transforms to identity.
    pub async fn reset_vector_space(&self) {
        self.state.lock().await.learning.reset_adjuster();
    }

    /// Occupancy and learning snapshot.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            items: state.shards.len(),
            parts: state.parts.len(),
            shards: state.shards.stats(),
            total_feedback: state.learning.total_feedback(),
            embedding_cache_entries: crate::vector::embedding_cache_len(),
        }
    }
}

/// One vector-space adjustment epoch over the whole store.
///
/// Resolves the current confusion patterns to fingerprints, trains the
/// transforms, rewrites every cache item and indexed part, and rebuilds the
/// shard store (routing hashes change with the vectors). Runs under the
/// caller's writer lock, so readers see the old store or the new one, never
/// a mix.
fn run_adjustment(state: &mut CoreState) -> CacheResult<()> {
    let patterns = state.learning.confusion_patterns();
    let resolved: Vec<(MultiLayerVector, MultiLayerVector, f32)> = patterns
        .iter()
        .filter_map(|pattern| {
            let collector = state.learning.collector();
            let first = collector
                .result_for_prompt(&pattern.prompt_pair.0)
                .and_then(|result_id| state.shards.get(result_id))
                .map(|item| item.vector.clone())?;
            let second = collector
                .result_for_prompt(&pattern.prompt_pair.1)
                .and_then(|result_id| state.shards.get(result_id))
                .map(|item| item.vector.clone())?;
            Some((first, second, pattern.confusion_rate))
        })
        .collect();

    info!(
        patterns = patterns.len(),
        resolved = resolved.len(),
        "running vector space adjustment epoch"
    );
    state.learning.train_adjustment(&resolved);

    let adjusted_items: Vec<CacheItem> = {
        let adjuster = state.learning.adjuster();
        state
            .shards
            .items()
            .map(|item| {
                Ok(CacheItem {
                    id: item.id.clone(),
                    vector: adjuster.apply(&item.vector)?,
                    artifact: item.artifact.clone(),
                    created_at: item.created_at,
                    hit_count: item.hit_count,
                })
            })
            .collect::<CacheResult<_>>()?
    };
    state.shards.rebuild(adjusted_items);

    let learning = &state.learning;
    state
        .parts
        .transform_vectors(|vector| learning.adjuster().apply(vector))?;

    state.learning.update_metrics();
    Ok(())
}
