//! Part-based composition.
//!
//! The composer picks the best-scoring part per region role and renders the
//! composite through the generator, using the strongest base-capable part
//! as the base image.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Generator, RenderRequest};
use crate::error::{CacheError, CacheResult};
use crate::index::{PartIndex, PartMatch, PartSearchOptions};
use crate::types::{GenerationParams, PartType};
use crate::vector::{LayerWeights, MultiLayerVector};

/// Composer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposerConfig {
    /// Minimum score for a part to participate in a composition
    pub min_part_similarity: f32,
    /// Denoising strength used to fuse the selected parts
    pub base_strength: f32,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            min_part_similarity: 0.5,
            base_strength: 0.5,
        }
    }
}

/// A finished composition.
#[derive(Debug, Clone)]
pub struct CompositionOutcome {
    /// Composite artifact bytes
    pub artifact: Vec<u8>,
    /// Ids of the parts blended in, role priority order
    pub used_parts: Vec<String>,
}

/// Blends indexed parts into a candidate artifact.
#[derive(Debug, Clone, Default)]
pub struct Composer {
    config: ComposerConfig,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ComposerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Best-scoring part per region role, role priority order.
    pub fn select_parts(
        &self,
        query: &MultiLayerVector,
        weights: &LayerWeights,
        index: &PartIndex,
    ) -> Vec<PartMatch> {
        PartType::ALL
            .iter()
            .filter_map(|&part_type| {
                index
                    .search(
                        query,
                        weights,
                        &PartSearchOptions::new()
                            .top_k(1)
                            .min_similarity(self.config.min_part_similarity)
                            .part_type(part_type),
                    )
                    .into_iter()
                    .next()
            })
            .collect()
    }

    /// Select parts and render the composite.
    ///
    /// Fails with [`CacheError::StrategyUnavailable`] when no part clears
    /// the similarity floor for any role.
    pub async fn compose(
        &self,
        query: &MultiLayerVector,
        weights: &LayerWeights,
        index: &PartIndex,
        generator: &dyn Generator,
        params: &GenerationParams,
        prompt: Option<&str>,
    ) -> CacheResult<CompositionOutcome> {
        let selected = self.select_parts(query, weights, index);
        if selected.is_empty() {
            return Err(CacheError::StrategyUnavailable {
                reason: "no indexed part clears the composition similarity floor".to_string(),
            });
        }

        // select_parts returns role priority order, so the first entry is
        // the strongest base-capable part.
        let base = &selected[0].part;
        debug!(
            base = %base.id,
            roles = selected.len(),
            "composing from indexed parts"
        );

        let request = RenderRequest {
            params: params.clone(),
            prompt: prompt.map(str::to_string),
            base_image: Some(base.blob.clone()),
            strength: Some(self.config.base_strength),
        };
        let artifact = generator.generate(&request).await?;

        Ok(CompositionOutcome {
            artifact,
            used_parts: selected.into_iter().map(|m| m.part.id).collect(),
        })
    }
}
