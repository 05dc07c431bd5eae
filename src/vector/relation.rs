//! Cross-layer relation matrix construction.
//!
//! The relation matrix couples the five layers of a single fingerprint:
//! entry `(i, j)` starts as the cosine between the two layer vectors over
//! their overlapping prefix, optionally adjusted by token co-occurrence in
//! the source text, reweighted per layer pair, and symmetrized.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::layer::{prefix_cosine, LayerKind};
use super::multi::RelationMatrix;

/// Configuration for relation matrix construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationConfig {
    /// Adjust couplings by token co-occurrence counts from the source text.
    pub use_cooccurrence_analysis: bool,
    /// Replace the matrix with its symmetric part after construction.
    pub symmetrize: bool,
    /// Saturation weight of the co-occurrence contribution.
    pub cooccurrence_weight: f32,
    /// Multiplicative overrides keyed by layer pair, e.g. `"subject-style"`.
    #[serde(default)]
    pub relation_weights: HashMap<String, f32>,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            use_cooccurrence_analysis: true,
            symmetrize: true,
            cooccurrence_weight: 0.2,
            relation_weights: HashMap::new(),
        }
    }
}

/// Build the relation matrix for one fingerprint.
///
/// `token_counts` holds, per layer in canonical order, how many tokens of
/// the source text belong to that layer's vocabulary. The co-occurrence
/// contribution for a pair `(i, j)` saturates as the cross-pair count grows:
/// `w · n / (1 + n)` with `n = count_i · count_j`: always positive,
/// symmetric, and clamped into [-1, 1] with the rest of the entry.
pub fn compute_relation(
    layers: &[Vec<f32>; 5],
    token_counts: &[usize; 5],
    config: &RelationConfig,
) -> RelationMatrix {
    let mut matrix = RelationMatrix::zero();

    for a in LayerKind::ALL {
        for b in LayerKind::ALL {
            let mut entry = prefix_cosine(&layers[a.index()], &layers[b.index()]);

            if config.use_cooccurrence_analysis && a != b {
                entry += cooccurrence_contribution(
                    token_counts[a.index()],
                    token_counts[b.index()],
                    config.cooccurrence_weight,
                );
            }

            if let Some(multiplier) = pair_weight(&config.relation_weights, a, b) {
                entry *= multiplier;
            }

            matrix.set(a, b, entry);
        }
    }

    if config.symmetrize {
        matrix.symmetrize();
    }

    matrix
}

fn cooccurrence_contribution(count_a: usize, count_b: usize, weight: f32) -> f32 {
    if count_a == 0 || count_b == 0 {
        return 0.0;
    }
    let pairs = (count_a * count_b) as f32;
    weight * pairs / (1.0 + pairs)
}

/// Look up a pair multiplier, accepting either key order.
fn pair_weight(weights: &HashMap<String, f32>, a: LayerKind, b: LayerKind) -> Option<f32> {
    if weights.is_empty() {
        return None;
    }
    weights
        .get(&format!("{}-{}", a.name(), b.name()))
        .or_else(|| weights.get(&format!("{}-{}", b.name(), a.name())))
        .copied()
}
