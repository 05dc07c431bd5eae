//! The vectorization engine: text in, fingerprint out.
//!
//! `vectorize` is pure: no locks, no shared mutable state beyond the
//! append-only embedding cache. It may run in parallel over distinct
//! inputs.

use serde::{Deserialize, Serialize};

use super::encoder::{in_vocabulary, word_embedding};
use super::layer::{cosine, l2_normalize, LayerKind};
use super::multi::MultiLayerVector;
use super::relation::{compute_relation, RelationConfig};

/// Configuration for the vectorization engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorizerConfig {
    /// Relation matrix construction options.
    pub relation: RelationConfig,
}

/// Similarity breakdown between two fingerprints.
///
/// Per-layer scores are cosines remapped to [0, 1]; `overall` combines them
/// with the relation-matrix agreement and is clamped into [0, 1]. The
/// computation is symmetric in its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    /// Combined score in [0, 1]
    pub overall: f32,
    /// Remapped per-layer cosines, canonical layer order
    pub per_layer: [f32; 5],
    /// Mean absolute entrywise difference of the relation matrices
    pub relation_delta: f32,
}

impl Similarity {
    /// Read the remapped cosine for one layer.
    pub fn layer_score(&self, layer: LayerKind) -> f32 {
        self.per_layer[layer.index()]
    }
}

/// Deterministic text → fingerprint projection.
#[derive(Debug, Clone, Default)]
pub struct Vectorizer {
    config: VectorizerConfig,
}

impl Vectorizer {
    /// Create a vectorizer with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a vectorizer with explicit configuration.
    pub fn with_config(config: VectorizerConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &VectorizerConfig {
        &self.config
    }

    /// Project a text into its multi-layer fingerprint.
    ///
    /// Empty text (or text with no vocabulary tokens) yields the all-zero
    /// fingerprint; this is not an error.
    pub fn vectorize(&self, text: &str) -> MultiLayerVector {
        let tokens = tokenize(text);

        let mut token_counts = [0usize; 5];
        let layers = LayerKind::ALL.map(|layer| {
            let members: Vec<_> = tokens
                .iter()
                .filter(|token| in_vocabulary(layer, token))
                .map(|token| word_embedding(layer, token))
                .collect();
            token_counts[layer.index()] = members.len();

            if members.is_empty() {
                return vec![0.0; layer.dim()];
            }
            let mut mean = vec![0.0f32; layer.dim()];
            for embedding in &members {
                for (slot, &component) in mean.iter_mut().zip(embedding.iter()) {
                    *slot += component;
                }
            }
            let count = members.len() as f32;
            for slot in mean.iter_mut() {
                *slot /= count;
            }
            l2_normalize(mean)
        });

        let relation = compute_relation(&layers, &token_counts, &self.config.relation);
        MultiLayerVector::try_new(layers, relation)
            .unwrap_or_else(|_| unreachable!("layers are built with canonical dims"))
    }

    /// Compare two fingerprints.
    ///
    /// `overall = clamp(0.7 · mean(per_layer) + 0.3 · (1 − relation_delta))`
    /// where per-layer scores are `(cos + 1) / 2`. Dimension agreement is
    /// guaranteed by construction of [`MultiLayerVector`], which rejects
    /// non-canonical layer dimensions up front.
    pub fn compute_similarity(&self, a: &MultiLayerVector, b: &MultiLayerVector) -> Similarity {
        let mut per_layer = [0.0f32; 5];
        for layer in LayerKind::ALL {
            let raw = cosine(a.layer(layer), b.layer(layer));
            per_layer[layer.index()] = (raw + 1.0) / 2.0;
        }
        let layer_mean = per_layer.iter().sum::<f32>() / per_layer.len() as f32;
        let relation_delta = a.relation().mean_abs_diff(b.relation());
        let overall = (0.7 * layer_mean + 0.3 * (1.0 - relation_delta)).clamp(0.0, 1.0);
        Similarity {
            overall,
            per_layer,
            relation_delta,
        }
    }
}

/// Split a prompt into lookup tokens.
///
/// Tokens are separated by whitespace, commas, and semicolons, and
/// lower-cased for vocabulary lookup.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::RelationMatrix;

    #[test]
    fn test_tokenize_splits_and_lowercases() {
        let tokens = tokenize("A Red,Cat;  watercolor\tdreamy");
        assert_eq!(tokens, vec!["a", "red", "cat", "watercolor", "dreamy"]);
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("").is_empty());
        assert!(tokenize(" ,; ").is_empty());
    }

    #[test]
    fn test_vectorize_layers_unit_or_zero() {
        let vectorizer = Vectorizer::new();
        let v = vectorizer.vectorize("a red cat in a watercolor style, dreamy");
        assert!(v.layers_normalized(1e-6));
        assert!(!v.is_zero());
    }

    #[test]
    fn test_vectorize_empty_text_is_zero() {
        let vectorizer = Vectorizer::new();
        let v = vectorizer.vectorize("");
        assert!(v.is_zero());
        assert_eq!(*v.relation(), RelationMatrix::zero());
    }

    #[test]
    fn test_vectorize_unknown_words_only_is_zero() {
        let vectorizer = Vectorizer::new();
        let v = vectorizer.vectorize("zxqv frobnicate");
        assert!(v.is_zero());
    }

    #[test]
    fn test_vectorize_deterministic() {
        let vectorizer = Vectorizer::new();
        let a = vectorizer.vectorize("a red cat");
        let b = vectorizer.vectorize("a red cat");
        for (kind, layer) in a.layers() {
            assert_eq!(layer, b.layer(kind), "layer {kind} differs");
        }
        assert_eq!(a.relation(), b.relation());
    }

    #[test]
    fn test_similarity_identical_is_high() {
        let vectorizer = Vectorizer::new();
        let v = vectorizer.vectorize("a red cat");
        let sim = vectorizer.compute_similarity(&v, &v);
        assert!(sim.overall > 0.9);
        assert_eq!(sim.relation_delta, 0.0);
    }

    #[test]
    fn test_similarity_symmetric() {
        let vectorizer = Vectorizer::new();
        let a = vectorizer.vectorize("a red cat");
        let b = vectorizer.vectorize("a blue dog, anime");
        let ab = vectorizer.compute_similarity(&a, &b);
        let ba = vectorizer.compute_similarity(&b, &a);
        assert!((ab.overall - ba.overall).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_in_unit_interval() {
        let vectorizer = Vectorizer::new();
        let a = vectorizer.vectorize("a red cat");
        let zero = MultiLayerVector::zero();
        let sim = vectorizer.compute_similarity(&a, &zero);
        assert!((0.0..=1.0).contains(&sim.overall));
    }

    #[test]
    fn test_per_layer_scores_remapped() {
        let vectorizer = Vectorizer::new();
        let a = vectorizer.vectorize("cat");
        let sim = vectorizer.compute_similarity(&a, &a);
        // Identical non-zero subject layer: cosine 1 remaps to 1.
        assert!((sim.layer_score(LayerKind::Subject) - 1.0).abs() < 1e-6);
        // Zero layers: cosine 0 remaps to 0.5.
        assert!((sim.layer_score(LayerKind::Emotion) - 0.5).abs() < 1e-6);
    }
}
