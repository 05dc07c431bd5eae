//! External back-end contracts: the generator and the segmenter.
//!
//! These traits pin exactly what the core depends on. The generator is a
//! single blob-producing operation with no retry and no streaming;
//! failures surface verbatim to the caller. The segmenter turns an artifact into
//! typed image parts.
//!
//! Deterministic in-memory implementations ship alongside the traits so the
//! zero-configuration start and the test suite work without any external
//! service.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::CacheResult;
use crate::types::{GenerationParams, ImagePart, PartMetadata, PartType};
use crate::vector::MultiLayerVector;

/// One render request handed to the generator back-end.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Effective generation parameters
    pub params: GenerationParams,
    /// Prompt text, when the request carried one
    pub prompt: Option<String>,
    /// Base image for re-renders
    pub base_image: Option<Arc<[u8]>>,
    /// Denoising strength for re-renders
    pub strength: Option<f32>,
}

/// The generative back-end.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce artifact bytes for a request.
    async fn generate(&self, request: &RenderRequest) -> CacheResult<Vec<u8>>;
}

/// The segmentation back-end.
#[async_trait]
pub trait Segmenter: Send + Sync {
    /// Split an artifact into typed parts, reusing the artifact fingerprint
    /// for each part's vector.
    async fn segment(
        &self,
        blob: &[u8],
        fingerprint: &MultiLayerVector,
    ) -> CacheResult<Vec<ImagePart>>;
}

/// Deterministic in-memory generator.
///
/// Emits a PNG-tagged byte stream derived purely from the request, so
/// repeated renders of the same request produce identical artifacts.
#[derive(Debug, Clone, Default)]
pub struct MockGenerator;

impl MockGenerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, request: &RenderRequest) -> CacheResult<Vec<u8>> {
        let mut artifact = Vec::with_capacity(64);
        artifact.extend_from_slice(&[0x89, 0x50, 0x4E, 0x47]);
        artifact.extend_from_slice(&request.params.seed.to_be_bytes());
        artifact.extend_from_slice(&request.params.steps.to_be_bytes());
        artifact.extend_from_slice(&request.params.cfg_scale.to_be_bytes());
        if let Some(strength) = request.strength {
            artifact.extend_from_slice(&strength.to_be_bytes());
        }
        if let Some(base) = &request.base_image {
            // Re-renders keep a trace of the base so distinct bases yield
            // distinct artifacts.
            let digest = base
                .iter()
                .fold(0u32, |acc, &b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
            artifact.extend_from_slice(&digest.to_be_bytes());
        }
        if let Some(prompt) = &request.prompt {
            let digest = prompt
                .bytes()
                .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
            artifact.extend_from_slice(&digest.to_be_bytes());
        }
        Ok(artifact)
    }
}

/// Deterministic in-memory segmenter.
///
/// Splits the artifact bytes into up to four slices, one per region role in
/// composition priority order, with descending confidence.
#[derive(Debug, Clone, Default)]
pub struct MockSegmenter;

impl MockSegmenter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Segmenter for MockSegmenter {
    async fn segment(
        &self,
        blob: &[u8],
        fingerprint: &MultiLayerVector,
    ) -> CacheResult<Vec<ImagePart>> {
        if blob.is_empty() {
            return Ok(Vec::new());
        }
        let slice_len = (blob.len() / PartType::ALL.len()).max(1);
        let parts = PartType::ALL
            .iter()
            .enumerate()
            .filter_map(|(index, &part_type)| {
                let start = index * slice_len;
                if start >= blob.len() {
                    return None;
                }
                let end = ((index + 1) * slice_len).min(blob.len());
                Some(ImagePart::new(
                    part_type,
                    fingerprint.clone(),
                    blob[start..end].to_vec(),
                    PartMetadata::new(0.9 - 0.1 * index as f32, "mock-segmenter"),
                ))
            })
            .collect();
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Vectorizer;

    fn request() -> RenderRequest {
        RenderRequest {
            params: GenerationParams {
                model: "stable-diffusion-v1".into(),
                seed: 42,
                steps: 30,
                cfg_scale: 7.5,
                denoising_strength: None,
            },
            prompt: Some("a red cat".into()),
            base_image: None,
            strength: None,
        }
    }

    #[tokio::test]
    async fn test_mock_generator_deterministic() {
        let generator = MockGenerator::new();
        let a = generator.generate(&request()).await.unwrap();
        let b = generator.generate(&request()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..4], &[0x89, 0x50, 0x4E, 0x47]);
    }

    #[tokio::test]
    async fn test_mock_generator_varies_with_seed() {
        let generator = MockGenerator::new();
        let a = generator.generate(&request()).await.unwrap();
        let mut other = request();
        other.params.seed = 43;
        let b = generator.generate(&other).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_mock_segmenter_produces_typed_parts() {
        let segmenter = MockSegmenter::new();
        let fingerprint = Vectorizer::new().vectorize("a red cat");
        let parts = segmenter.segment(&[1u8; 32], &fingerprint).await.unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].part_type, PartType::Global);
        assert!(parts[0].metadata.confidence > parts[3].metadata.confidence);
    }

    #[tokio::test]
    async fn test_mock_segmenter_empty_blob() {
        let segmenter = MockSegmenter::new();
        let fingerprint = Vectorizer::new().vectorize("a red cat");
        let parts = segmenter.segment(&[], &fingerprint).await.unwrap();
        assert!(parts.is_empty());
    }
}
