//! Small-delta re-rendering.
//!
//! The diff generator takes the single best base part and asks the back-end
//! for a low-strength re-render: the more similar the base, the less noise
//! is applied.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Generator, RenderRequest};
use crate::error::CacheResult;
use crate::types::{GenerationParams, ImagePart};

/// Diff generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Floor for the denoising strength
    pub min_strength: f32,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self { min_strength: 0.1 }
    }
}

/// A finished diff render.
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    /// Re-rendered artifact bytes
    pub artifact: Vec<u8>,
    /// Id of the base part
    pub base_part: String,
    /// Denoising strength that was applied
    pub strength: f32,
}

/// Requests low-strength re-renders on top of similar bases.
#[derive(Debug, Clone, Default)]
pub struct DiffGenerator {
    config: DiffConfig,
}

impl DiffGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DiffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// Denoising strength for a base of the given similarity.
    ///
    /// Inverse to similarity, clamped into the envelope between the
    /// configured floor and the learned diff-generation threshold.
    pub fn strength_for(&self, similarity: f32, diff_threshold: f32) -> f32 {
        let ceiling = diff_threshold.max(self.config.min_strength);
        (1.0 - similarity).clamp(self.config.min_strength, ceiling)
    }

    /// Re-render on top of a base part.
    pub async fn render(
        &self,
        base: &ImagePart,
        similarity: f32,
        diff_threshold: f32,
        generator: &dyn Generator,
        params: &GenerationParams,
        prompt: Option<&str>,
    ) -> CacheResult<DiffOutcome> {
        // A request-level override wins over the computed strength.
        let strength = params
            .denoising_strength
            .unwrap_or_else(|| self.strength_for(similarity, diff_threshold));
        debug!(base = %base.id, similarity, strength, "diff re-render");

        let mut effective = params.clone();
        effective.denoising_strength = Some(strength);
        let request = RenderRequest {
            params: effective,
            prompt: prompt.map(str::to_string),
            base_image: Some(base.blob.clone()),
            strength: Some(strength),
        };
        let artifact = generator.generate(&request).await?;

        Ok(DiffOutcome {
            artifact,
            base_part: base.id.clone(),
            strength,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockGenerator;
    use crate::types::{PartMetadata, PartType};
    use crate::vector::Vectorizer;

    #[test]
    fn test_strength_inverse_to_similarity() {
        let diff = DiffGenerator::new();
        let close = diff.strength_for(0.95, 0.6);
        let far = diff.strength_for(0.65, 0.6);
        assert!(close < far);
        assert!((0.1..=0.6).contains(&close));
        assert!((0.1..=0.6).contains(&far));
    }

    #[test]
    fn test_strength_clamped_to_envelope() {
        let diff = DiffGenerator::new();
        // Very dissimilar base would want strength 0.9; the threshold caps it.
        assert!((diff.strength_for(0.1, 0.6) - 0.6).abs() < 1e-6);
        // Near-identical base floors at min_strength.
        assert!((diff.strength_for(1.0, 0.6) - 0.1).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_render_reports_base_and_strength() {
        let base = ImagePart::new(
            PartType::Global,
            Vectorizer::new().vectorize("a red cat"),
            vec![7u8; 8],
            PartMetadata::new(0.9, "test"),
        );
        let diff = DiffGenerator::new();
        let outcome = diff
            .render(
                &base,
                0.85,
                0.6,
                &MockGenerator::new(),
                &GenerationParams::resolve(None),
                Some("a red cat"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.base_part, base.id);
        assert!((outcome.strength - 0.15).abs() < 1e-6);
        assert!(!outcome.artifact.is_empty());
    }

    #[tokio::test]
    async fn test_render_honors_override() {
        let base = ImagePart::new(
            PartType::Global,
            Vectorizer::new().vectorize("a red cat"),
            vec![7u8; 8],
            PartMetadata::new(0.9, "test"),
        );
        let diff = DiffGenerator::new();
        let mut params = GenerationParams::resolve(None);
        params.denoising_strength = Some(0.42);
        let outcome = diff
            .render(&base, 0.85, 0.6, &MockGenerator::new(), &params, None)
            .await
            .unwrap();
        assert!((outcome.strength - 0.42).abs() < 1e-6);
    }
}
