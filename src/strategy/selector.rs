//! Strategy selection and dispatch.
//!
//! Given a query fingerprint and the current part index, the selector
//! decides among re-rendering a similar base (`diff`), blending indexed
//! parts (`composition`), the compose-then-diff `hybrid` path (explicit
//! request only), or falling through to a full generation (`new`). Direct
//! cache hits are resolved against the shard store before dispatch reaches
//! this module.
//!
//! The decision thresholds are the learned system thresholds: their
//! defaults reproduce the fixed knobs (0.8 / 0.6), and parameter
//! optimization moves them over time.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::composer::Composer;
use super::diff::DiffGenerator;
use crate::backend::{Generator, RenderRequest, Segmenter};
use crate::error::{CacheError, CacheResult};
use crate::index::{PartIndex, PartMatch, PartSearchOptions};
use crate::learning::Thresholds;
use crate::types::{CancelToken, GenerationParams, GenerationResult, Strategy};
use crate::vector::{l2_normalize, LayerWeights, MultiLayerVector};

/// Strategy selector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// How many part candidates to consider
    pub top_k: usize,
    /// Candidate similarity floor for the part query
    pub min_similarity: f32,
    /// Minimum candidate count for a composition
    pub min_composition_results: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.6,
            min_composition_results: 3,
        }
    }
}

/// Everything a dispatch needs, borrowed from the serving path.
pub struct DispatchContext<'a> {
    pub query: &'a MultiLayerVector,
    pub prompt: Option<&'a str>,
    pub weights: &'a LayerWeights,
    pub thresholds: &'a Thresholds,
    pub index: &'a PartIndex,
    pub generator: &'a dyn Generator,
    pub segmenter: &'a dyn Segmenter,
    pub params: GenerationParams,
    pub cancel: Option<&'a CancelToken>,
}

impl DispatchContext<'_> {
    fn check_cancelled(&self) -> CacheResult<()> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(CacheError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Chooses and runs the generation strategy.
#[derive(Debug, Clone, Default)]
pub struct StrategySelector {
    config: SelectorConfig,
    composer: Composer,
    diff: DiffGenerator,
}

impl StrategySelector {
    pub fn new(config: SelectorConfig, composer: Composer, diff: DiffGenerator) -> Self {
        Self {
            config,
            composer,
            diff,
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn diff(&self) -> &DiffGenerator {
        &self.diff
    }

    /// Pick a strategy from the ranked part candidates.
    ///
    /// `Hybrid` is never chosen automatically; it runs only when forced by
    /// the request.
    pub fn choose(
        &self,
        matches: &[PartMatch],
        index_empty: bool,
        thresholds: &Thresholds,
    ) -> Strategy {
        if index_empty || matches.is_empty() {
            return Strategy::New;
        }
        let top = matches[0].similarity;
        if top > thresholds.cache_hit {
            Strategy::Diff
        } else if matches.len() >= self.config.min_composition_results
            && top > thresholds.diff_generation
        {
            Strategy::Composition
        } else {
            Strategy::New
        }
    }

    /// Query candidates, choose (or honor the forced) strategy, and run it.
    pub async fn run(
        &self,
        ctx: DispatchContext<'_>,
        forced: Option<Strategy>,
    ) -> CacheResult<GenerationResult> {
        ctx.check_cancelled()?;

        let matches = ctx.index.search(
            ctx.query,
            ctx.weights,
            &PartSearchOptions::new()
                .top_k(self.config.top_k)
                .min_similarity(self.config.min_similarity),
        );
        let strategy = forced.unwrap_or_else(|| {
            self.choose(&matches, ctx.index.is_empty(), ctx.thresholds)
        });
        debug!(%strategy, candidates = matches.len(), "dispatching");

        match strategy {
            Strategy::Cache => Err(CacheError::StrategyUnavailable {
                reason: "cache hits are resolved against the shard store before dispatch"
                    .to_string(),
            }),
            Strategy::Diff => self.run_diff(&ctx, &matches).await,
            Strategy::Composition => self.run_composition(&ctx).await,
            Strategy::Hybrid => self.run_hybrid(&ctx).await,
            Strategy::New => self.run_new(&ctx).await,
        }
    }

    /// Perturb a base fingerprint into `count` variation fingerprints.
    ///
    /// Uniform noise in `[-sigma, sigma]` is added to every component of
    /// every non-zero layer, which is then re-normalized; the relation
    /// matrix is untouched. With `sigma == 0` the bases are returned
    /// bit-identical, and zero layers always stay zero.
    pub fn variations(
        &self,
        base: &MultiLayerVector,
        count: usize,
        sigma: f32,
    ) -> CacheResult<Vec<MultiLayerVector>> {
        if sigma == 0.0 {
            return Ok(vec![base.clone(); count]);
        }
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| {
                base.map_layers(|_, layer| {
                    if layer.iter().all(|&x| x == 0.0) {
                        return layer.to_vec();
                    }
                    let noisy = layer
                        .iter()
                        .map(|&x| x + rng.gen_range(-sigma..=sigma))
                        .collect();
                    l2_normalize(noisy)
                })
            })
            .collect()
    }

    async fn run_diff(
        &self,
        ctx: &DispatchContext<'_>,
        matches: &[PartMatch],
    ) -> CacheResult<GenerationResult> {
        let best = matches.first().ok_or_else(|| CacheError::StrategyUnavailable {
            reason: "diff requires at least one part candidate".to_string(),
        })?;
        let outcome = self
            .diff
            .render(
                &best.part,
                best.similarity,
                ctx.thresholds.diff_generation,
                ctx.generator,
                &ctx.params,
                ctx.prompt,
            )
            .await?;
        ctx.check_cancelled()?;
        Ok(assemble(
            Strategy::Diff,
            outcome.artifact,
            Vec::new(),
            Some(outcome.base_part),
            Some(outcome.strength),
            ctx,
        ))
    }

    async fn run_composition(&self, ctx: &DispatchContext<'_>) -> CacheResult<GenerationResult> {
        let outcome = self
            .composer
            .compose(
                ctx.query,
                ctx.weights,
                ctx.index,
                ctx.generator,
                &ctx.params,
                ctx.prompt,
            )
            .await?;
        ctx.check_cancelled()?;
        Ok(assemble(
            Strategy::Composition,
            outcome.artifact,
            outcome.used_parts,
            None,
            None,
            ctx,
        ))
    }

    /// Compose, re-segment the composite, then diff on the most confident
    /// segment.
    async fn run_hybrid(&self, ctx: &DispatchContext<'_>) -> CacheResult<GenerationResult> {
        let composed = self
            .composer
            .compose(
                ctx.query,
                ctx.weights,
                ctx.index,
                ctx.generator,
                &ctx.params,
                ctx.prompt,
            )
            .await?;
        ctx.check_cancelled()?;

        let segments = ctx.segmenter.segment(&composed.artifact, ctx.query).await?;
        ctx.check_cancelled()?;
        let base = segments
            .into_iter()
            .max_by(|a, b| {
                a.metadata
                    .confidence
                    .partial_cmp(&b.metadata.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| CacheError::StrategyUnavailable {
                reason: "segmenter produced no parts for the composite".to_string(),
            })?;

        let similarity = ctx.query.weighted_cosine(&base.vector, ctx.weights);
        let outcome = self
            .diff
            .render(
                &base,
                similarity,
                ctx.thresholds.diff_generation,
                ctx.generator,
                &ctx.params,
                ctx.prompt,
            )
            .await?;
        ctx.check_cancelled()?;
        Ok(assemble(
            Strategy::Hybrid,
            outcome.artifact,
            composed.used_parts,
            Some(outcome.base_part),
            Some(outcome.strength),
            ctx,
        ))
    }

    async fn run_new(&self, ctx: &DispatchContext<'_>) -> CacheResult<GenerationResult> {
        let request = RenderRequest {
            params: ctx.params.clone(),
            prompt: ctx.prompt.map(str::to_string),
            base_image: None,
            strength: None,
        };
        let artifact = ctx.generator.generate(&request).await?;
        ctx.check_cancelled()?;
        Ok(assemble(Strategy::New, artifact, Vec::new(), None, None, ctx))
    }
}

fn assemble(
    strategy: Strategy,
    artifact: Vec<u8>,
    used_parts: Vec<String>,
    base_part: Option<String>,
    denoising_strength: Option<f32>,
    ctx: &DispatchContext<'_>,
) -> GenerationResult {
    GenerationResult {
        id: uuid::Uuid::new_v4().to_string(),
        strategy,
        artifact: artifact.into_boxed_slice().into(),
        used_parts,
        base_part,
        denoising_strength,
        params: ctx.params.clone(),
        vector: ctx.query.clone(),
    }
}
