//! Semantic feature layers and the dense math shared by every scorer.
//!
//! A fingerprint is split into five fixed-dimension subspaces. Each layer
//! captures one facet of a prompt (what is depicted, how it looks, how it is
//! framed, what it evokes), and every similarity in the crate reduces to
//! per-layer cosines combined with layer weights.

use serde::{Deserialize, Serialize};

/// One of the five semantic feature subspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// What is depicted (128 dims)
    Subject,
    /// Qualities of the subject: colors, sizes, materials (96 dims)
    Attribute,
    /// Rendering style (64 dims)
    Style,
    /// Framing and spatial arrangement (48 dims)
    Composition,
    /// Mood and atmosphere (32 dims)
    Emotion,
}

impl LayerKind {
    /// All layers, in canonical order.
    pub const ALL: [LayerKind; 5] = [
        LayerKind::Subject,
        LayerKind::Attribute,
        LayerKind::Style,
        LayerKind::Composition,
        LayerKind::Emotion,
    ];

    /// Fixed dimension of the layer's subspace.
    pub const fn dim(self) -> usize {
        match self {
            LayerKind::Subject => 128,
            LayerKind::Attribute => 96,
            LayerKind::Style => 64,
            LayerKind::Composition => 48,
            LayerKind::Emotion => 32,
        }
    }

    /// Position in canonical order.
    pub const fn index(self) -> usize {
        match self {
            LayerKind::Subject => 0,
            LayerKind::Attribute => 1,
            LayerKind::Style => 2,
            LayerKind::Composition => 3,
            LayerKind::Emotion => 4,
        }
    }

    /// Stable lower-case name, used for layer-pair keys and wire formats.
    pub const fn name(self) -> &'static str {
        match self {
            LayerKind::Subject => "subject",
            LayerKind::Attribute => "attribute",
            LayerKind::Style => "style",
            LayerKind::Composition => "composition",
            LayerKind::Emotion => "emotion",
        }
    }

    /// Default retrieval weight of the layer.
    pub const fn default_weight(self) -> f32 {
        match self {
            LayerKind::Subject => 0.30,
            LayerKind::Attribute => 0.25,
            LayerKind::Style => 0.20,
            LayerKind::Composition => 0.15,
            LayerKind::Emotion => 0.10,
        }
    }

    /// Sensitivity of the surrogate loss to the layer's weight.
    pub(crate) const fn sensitivity(self) -> f32 {
        match self {
            LayerKind::Subject => 0.10,
            LayerKind::Attribute => 0.08,
            LayerKind::Style => 0.06,
            LayerKind::Composition => 0.04,
            LayerKind::Emotion => 0.02,
        }
    }

    /// Total number of components across all layers.
    pub const fn total_dims() -> usize {
        let mut total = 0;
        let mut i = 0;
        while i < Self::ALL.len() {
            total += Self::ALL[i].dim();
            i += 1;
        }
        total
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Per-layer convex weights used by the weighted cosine.
///
/// Defaults come from the fixed retrieval weighting; the serving path
/// substitutes the learned weights from the current system parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerWeights {
    pub subject: f32,
    pub attribute: f32,
    pub style: f32,
    pub composition: f32,
    pub emotion: f32,
}

impl LayerWeights {
    /// Read the weight for a layer.
    pub fn get(&self, layer: LayerKind) -> f32 {
        match layer {
            LayerKind::Subject => self.subject,
            LayerKind::Attribute => self.attribute,
            LayerKind::Style => self.style,
            LayerKind::Composition => self.composition,
            LayerKind::Emotion => self.emotion,
        }
    }

    /// Write the weight for a layer.
    pub fn set(&mut self, layer: LayerKind, value: f32) {
        match layer {
            LayerKind::Subject => self.subject = value,
            LayerKind::Attribute => self.attribute = value,
            LayerKind::Style => self.style = value,
            LayerKind::Composition => self.composition = value,
            LayerKind::Emotion => self.emotion = value,
        }
    }

    /// Sum of all weights.
    pub fn sum(&self) -> f32 {
        LayerKind::ALL.iter().map(|&l| self.get(l)).sum()
    }

    /// Clamp each weight to [0, 1], then rescale so the sum is exactly one.
    ///
    /// A degenerate all-zero vector falls back to the defaults rather than
    /// dividing by zero.
    pub fn clamp_and_normalize(&mut self) {
        for layer in LayerKind::ALL {
            self.set(layer, self.get(layer).clamp(0.0, 1.0));
        }
        let sum = self.sum();
        if sum <= f32::EPSILON {
            *self = Self::default();
            return;
        }
        for layer in LayerKind::ALL {
            self.set(layer, self.get(layer) / sum);
        }
    }
}

impl Default for LayerWeights {
    fn default() -> Self {
        Self {
            subject: LayerKind::Subject.default_weight(),
            attribute: LayerKind::Attribute.default_weight(),
            style: LayerKind::Style.default_weight(),
            composition: LayerKind::Composition.default_weight(),
            emotion: LayerKind::Emotion.default_weight(),
        }
    }
}

/// L2 norm of a dense vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|&x| x * x).sum::<f32>().sqrt()
}

/// L2-normalize in place; the zero vector stays zero.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = l2_norm(&v);
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

/// Cosine similarity of two equal-length vectors.
///
/// A zero vector on either side yields 0.0 (undefined angle treated as
/// orthogonal).
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Cosine similarity over the overlapping prefix of two vectors.
///
/// Cross-layer couplings compare subspaces of unequal dimension; only the
/// first `min(len_a, len_b)` components participate.
pub fn prefix_cosine(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    cosine(&a[..n], &b[..n])
}

/// Euclidean distance of two equal-length vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}
