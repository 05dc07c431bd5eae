//! Contrastive vector-space adjustment.
//!
//! Confusion patterns mark prompt pairs users distinguish but the vector
//! space does not. The adjuster accumulates, per layer, an affine transform
//! that stretches the space along the difference direction of each confused
//! pair, so future fingerprints of the pair land further apart. Transforms
//! apply as `v' = normalize(W·v + b)`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CacheResult;
use crate::vector::{l2_normalize, LayerKind, MultiLayerVector};

/// Adjuster tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjusterConfig {
    /// Update step size, clamped to [1e-4, 0.1]
    pub learning_rate: f32,
    /// Weight decay per absorbed pattern, clamped to [0, 0.01]
    pub reg_strength: f32,
    /// Bounded adjustment history length
    pub history_limit: usize,
}

impl AdjusterConfig {
    fn clamped(mut self) -> Self {
        self.learning_rate = self.learning_rate.clamp(1e-4, 0.1);
        self.reg_strength = self.reg_strength.clamp(0.0, 0.01);
        self
    }
}

impl Default for AdjusterConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            reg_strength: 1e-3,
            history_limit: 100,
        }
    }
}

/// One entry of the bounded adjustment history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    pub epoch: u64,
    /// Confusion pairs absorbed in the epoch
    pub pairs: usize,
    pub timestamp: DateTime<Utc>,
}

/// Per-layer affine transform `(W, b)`, row-major weight storage.
#[derive(Debug, Clone)]
struct LayerTransform {
    dim: usize,
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl LayerTransform {
    fn identity(dim: usize) -> Self {
        let mut weight = vec![0.0; dim * dim];
        for i in 0..dim {
            weight[i * dim + i] = 1.0;
        }
        Self {
            dim,
            weight,
            bias: vec![0.0; dim],
        }
    }

    /// `W += rate · η · (d · dᵀ)`, then decay, then `b += η · rate · d · 0.1`.
    fn absorb(&mut self, difference: &[f32], rate: f32, learning_rate: f32, reg_strength: f32) {
        let scale = rate * learning_rate;
        for row in 0..self.dim {
            let row_offset = row * self.dim;
            let d_row = difference[row];
            for col in 0..self.dim {
                self.weight[row_offset + col] += scale * d_row * difference[col];
            }
        }
        let decay = 1.0 - reg_strength;
        for w in self.weight.iter_mut() {
            *w *= decay;
        }
        for (b, &d) in self.bias.iter_mut().zip(difference.iter()) {
            *b += learning_rate * rate * d * 0.1;
        }
    }

    fn apply(&self, input: &[f32]) -> Vec<f32> {
        let mut output = self.bias.clone();
        for row in 0..self.dim {
            let row_offset = row * self.dim;
            let mut acc = 0.0f32;
            for col in 0..self.dim {
                acc += self.weight[row_offset + col] * input[col];
            }
            output[row] += acc;
        }
        output
    }
}

/// Accumulates and applies per-layer contrastive transforms.
#[derive(Debug)]
pub struct VectorSpaceAdjuster {
    config: AdjusterConfig,
    transforms: Vec<LayerTransform>,
    epoch: u64,
    history: VecDeque<AdjustmentRecord>,
}

impl VectorSpaceAdjuster {
    pub fn new() -> Self {
        Self::with_config(AdjusterConfig::default())
    }

    pub fn with_config(config: AdjusterConfig) -> Self {
        Self {
            config: config.clamped(),
            transforms: LayerKind::ALL
                .iter()
                .map(|kind| LayerTransform::identity(kind.dim()))
                .collect(),
            epoch: 0,
            history: VecDeque::new(),
        }
    }

    /// The active (clamped) configuration.
    pub fn config(&self) -> &AdjusterConfig {
        &self.config
    }

    /// Completed adjustment epochs.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The bounded adjustment history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &AdjustmentRecord> {
        self.history.iter()
    }

    /// Absorb one epoch of confusion patterns.
    ///
    /// Each entry carries the two confused fingerprints and the pattern's
    /// confusion rate; every layer's transform stretches along the pair's
    /// per-layer difference direction, scaled by rate and learning rate.
    pub fn absorb_patterns(&mut self, patterns: &[(MultiLayerVector, MultiLayerVector, f32)]) {
        for (first, second, rate) in patterns {
            for kind in LayerKind::ALL {
                let difference: Vec<f32> = first
                    .layer(kind)
                    .iter()
                    .zip(second.layer(kind).iter())
                    .map(|(a, b)| a - b)
                    .collect();
                self.transforms[kind.index()].absorb(
                    &difference,
                    rate.clamp(0.0, 1.0),
                    self.config.learning_rate,
                    self.config.reg_strength,
                );
            }
        }
        self.epoch += 1;
        self.history.push_back(AdjustmentRecord {
            epoch: self.epoch,
            pairs: patterns.len(),
            timestamp: Utc::now(),
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
        info!(epoch = self.epoch, pairs = patterns.len(), "vector space adjusted");
    }

    /// Transform a fingerprint: per layer `v' = normalize(W·v + b)`.
    ///
    /// Produces a new vector; the input stays valid for in-flight readers.
    pub fn apply(&self, vector: &MultiLayerVector) -> CacheResult<MultiLayerVector> {
        vector.map_layers(|kind, layer| {
            l2_normalize(self.transforms[kind.index()].apply(layer))
        })
    }

    /// Restore every transform to identity/zero and clear the history.
    pub fn reset(&mut self) {
        self.transforms = LayerKind::ALL
            .iter()
            .map(|kind| LayerTransform::identity(kind.dim()))
            .collect();
        self.epoch = 0;
        self.history.clear();
        debug!("vector space transforms reset to identity");
    }
}

impl Default for VectorSpaceAdjuster {
    fn default() -> Self {
        Self::new()
    }
}
