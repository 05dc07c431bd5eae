/// Common types used throughout Pentimento.
///
/// This module defines the core data structures of the cache's data model.
/// These types are designed to be simple, immutable after construction, and
/// cheap to share: blobs and layer arrays are `Arc`-wrapped so clones never
/// copy pixel data.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::vector::MultiLayerVector;

/// Serde adapter for `Arc<[u8]>` blob payloads.
mod arc_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::sync::Arc;

    pub fn serialize<S: Serializer>(blob: &Arc<[u8]>, serializer: S) -> Result<S::Ok, S::Error> {
        blob.as_ref().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<[u8]>, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Ok(Arc::from(bytes.into_boxed_slice()))
    }
}

/// The region role an image part plays inside a composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartType {
    /// Primary subject region
    Foreground,
    /// Backdrop region
    Background,
    /// Localized detail patch
    Detail,
    /// Whole-frame part usable as a composition base
    Global,
}

impl PartType {
    /// All part types, in composition priority order.
    pub const ALL: [PartType; 4] = [
        PartType::Global,
        PartType::Background,
        PartType::Foreground,
        PartType::Detail,
    ];
}

impl std::fmt::Display for PartType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PartType::Foreground => "foreground",
            PartType::Background => "background",
            PartType::Detail => "detail",
            PartType::Global => "global",
        };
        write!(f, "{name}")
    }
}

/// Pixel-space rectangle attached to a segmented part.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Metadata attached to an image part by the segmenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartMetadata {
    /// Segmenter confidence in [0, 1]
    pub confidence: f32,
    /// Region rectangle, when the segmenter localized the part
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    /// Where the part came from (source artifact id, segmenter name, ...)
    pub provenance: String,
}

impl PartMetadata {
    /// Create metadata with a clamped confidence.
    pub fn new(confidence: f32, provenance: impl Into<String>) -> Self {
        Self {
            confidence: confidence.clamp(0.0, 1.0),
            bounding_box: None,
            provenance: provenance.into(),
        }
    }

    /// Attach a bounding box.
    pub fn with_bounding_box(mut self, bbox: BoundingBox) -> Self {
        self.bounding_box = Some(bbox);
        self
    }
}

/// A reusable fragment of a previously generated image.
///
/// Parts are created by the (external) segmenter, owned exclusively by the
/// part index, and destroyed only via `remove_part` or `clear_parts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePart {
    /// Unique part id
    pub id: String,
    /// Region role
    pub part_type: PartType,
    /// Multi-layer fingerprint of the part content
    pub vector: MultiLayerVector,
    /// Encoded pixel data
    #[serde(with = "arc_bytes")]
    pub blob: Arc<[u8]>,
    /// Segmenter metadata
    pub metadata: PartMetadata,
}

impl ImagePart {
    /// Create a part with a fresh uuid.
    pub fn new(
        part_type: PartType,
        vector: MultiLayerVector,
        blob: Vec<u8>,
        metadata: PartMetadata,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            part_type,
            vector,
            blob: Arc::from(blob.into_boxed_slice()),
            metadata,
        }
    }
}

/// A finalized generation record owned by the shard manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheItem {
    /// Unique item id
    pub id: String,
    /// Fingerprint the artifact was generated for
    pub vector: MultiLayerVector,
    /// The generated artifact bytes
    #[serde(with = "arc_bytes")]
    pub artifact: Arc<[u8]>,
    /// When the artifact was generated
    pub created_at: DateTime<Utc>,
    /// How many times this item served a cache hit
    pub hit_count: u64,
}

impl CacheItem {
    /// Create a cache item with a fresh uuid and zero hits.
    pub fn new(vector: MultiLayerVector, artifact: Arc<[u8]>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            vector,
            artifact,
            created_at: Utc::now(),
            hit_count: 0,
        }
    }
}

/// The discrete output of the strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Return a cached artifact directly
    Cache,
    /// Blend indexed parts into a candidate artifact
    Composition,
    /// Low-strength re-render on top of a similar base part
    Diff,
    /// Compose, re-segment, then diff on the best segment
    Hybrid,
    /// Fall through to a full generation
    New,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Cache => "cache",
            Strategy::Composition => "composition",
            Strategy::Diff => "diff",
            Strategy::Hybrid => "hybrid",
            Strategy::New => "new",
        };
        write!(f, "{name}")
    }
}

/// Effective parameters handed to the generator back-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Back-end model identifier
    pub model: String,
    /// Generation seed
    pub seed: u32,
    /// Sampler steps
    pub steps: u32,
    /// Classifier-free guidance scale
    pub cfg_scale: f32,
    /// Denoising strength for diff renders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denoising_strength: Option<f32>,
}

impl GenerationParams {
    /// Resolve effective parameters from optional per-request overrides.
    ///
    /// Unspecified fields take the documented defaults; the seed falls back
    /// to a random u32.
    pub fn resolve(overrides: Option<&GenerationOverrides>) -> Self {
        use rand::Rng;
        let o = overrides.cloned().unwrap_or_default();
        Self {
            model: o
                .model
                .unwrap_or_else(|| "stable-diffusion-v1".to_string()),
            seed: o.seed.unwrap_or_else(|| rand::thread_rng().gen()),
            steps: o.steps.unwrap_or(30),
            cfg_scale: o.cfg_scale.unwrap_or(7.5),
            denoising_strength: o.denoising_strength,
        }
    }
}

/// Per-request overrides for generation parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denoising_strength: Option<f32>,
}

/// The outcome of a served request.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Id of the cache item backing this result
    pub id: String,
    /// Which strategy produced the artifact
    pub strategy: Strategy,
    /// The artifact bytes
    pub artifact: Arc<[u8]>,
    /// Parts blended into a composition (empty for other strategies)
    pub used_parts: Vec<String>,
    /// Base part id for diff renders
    pub base_part: Option<String>,
    /// Denoising strength used (diff only)
    pub denoising_strength: Option<f32>,
    /// The effective generation parameters
    pub params: GenerationParams,
    /// Fingerprint of the request
    pub vector: MultiLayerVector,
}

/// Cooperative cancellation token for the serving path.
///
/// Cancellation is observed at the next suspension point (generator or
/// segmenter boundary); no partial mutations escape a cancelled request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a live token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
