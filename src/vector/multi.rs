//! The multi-layer fingerprint value object.
//!
//! A [`MultiLayerVector`] carries five dense layers plus the 5×5 relation
//! matrix coupling them. Layers are `Arc`-shared and logically immutable
//! after construction; transformations always produce new vectors, so old
//! fingerprints referenced by in-flight requests stay valid across an
//! adjustment epoch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::layer::{cosine, l2_norm, LayerKind, LayerWeights};
use crate::error::{CacheError, CacheResult};

/// A 5×5 matrix of cross-layer couplings, values in [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelationMatrix(pub(crate) [[f32; 5]; 5]);

impl RelationMatrix {
    /// The all-zero matrix (the relation of an empty fingerprint).
    pub fn zero() -> Self {
        Self([[0.0; 5]; 5])
    }

    /// Read the coupling between two layers.
    pub fn get(&self, a: LayerKind, b: LayerKind) -> f32 {
        self.0[a.index()][b.index()]
    }

    /// Write the coupling between two layers, clamped to [-1, 1].
    pub fn set(&mut self, a: LayerKind, b: LayerKind, value: f32) {
        self.0[a.index()][b.index()] = value.clamp(-1.0, 1.0);
    }

    /// Replace the matrix with its symmetric part: `(M + Mᵀ) / 2`.
    pub fn symmetrize(&mut self) {
        for i in 0..5 {
            for j in (i + 1)..5 {
                let mean = (self.0[i][j] + self.0[j][i]) / 2.0;
                self.0[i][j] = mean;
                self.0[j][i] = mean;
            }
        }
    }

    /// Whether `M[i][j] == M[j][i]` for every pair, within tolerance.
    pub fn is_symmetric(&self, tolerance: f32) -> bool {
        for i in 0..5 {
            for j in (i + 1)..5 {
                if (self.0[i][j] - self.0[j][i]).abs() > tolerance {
                    return false;
                }
            }
        }
        true
    }

    /// Mean absolute entrywise difference with another matrix.
    pub fn mean_abs_diff(&self, other: &RelationMatrix) -> f32 {
        let mut total = 0.0;
        for i in 0..5 {
            for j in 0..5 {
                total += (self.0[i][j] - other.0[i][j]).abs();
            }
        }
        total / 25.0
    }

    /// Entrywise mean of a set of matrices; zero when the set is empty.
    pub fn mean_of<'a>(matrices: impl Iterator<Item = &'a RelationMatrix>) -> Self {
        let mut acc = [[0.0f64; 5]; 5];
        let mut count = 0u32;
        for m in matrices {
            for i in 0..5 {
                for j in 0..5 {
                    acc[i][j] += f64::from(m.0[i][j]);
                }
            }
            count += 1;
        }
        if count == 0 {
            return Self::zero();
        }
        let mut out = [[0.0f32; 5]; 5];
        for i in 0..5 {
            for j in 0..5 {
                out[i][j] = (acc[i][j] / f64::from(count)) as f32;
            }
        }
        Self(out)
    }
}

/// Wire shape for [`MultiLayerVector`]: one named array per layer, the
/// relation matrix as nested arrays, plus the creation timestamp.
#[derive(Serialize, Deserialize)]
struct MultiLayerVectorWire {
    subject: Vec<f32>,
    attribute: Vec<f32>,
    style: Vec<f32>,
    composition: Vec<f32>,
    emotion: Vec<f32>,
    relation_matrix: RelationMatrix,
    created_at: DateTime<Utc>,
}

/// A fingerprint: five fixed-dimension layers plus their relation matrix.
///
/// Every layer produced by the vectorizer is L2-normalized (unit length or
/// zero). Shard centroids reuse this type with mean (non-unit) layers; the
/// unit-norm invariant belongs to vectorizer output, not the container.
///
/// Equality compares layers and relation matrix only; two fingerprints of
/// the same content are equal regardless of when they were created.
#[derive(Debug, Clone)]
pub struct MultiLayerVector {
    layers: [Arc<[f32]>; 5],
    relation: RelationMatrix,
    created_at: DateTime<Utc>,
}

impl MultiLayerVector {
    /// Build a fingerprint from per-layer arrays, validating dimensions.
    pub fn try_new(layers: [Vec<f32>; 5], relation: RelationMatrix) -> CacheResult<Self> {
        for (kind, layer) in LayerKind::ALL.iter().zip(layers.iter()) {
            if layer.len() != kind.dim() {
                return Err(CacheError::DimensionMismatch {
                    layer: *kind,
                    expected: kind.dim(),
                    actual: layer.len(),
                });
            }
        }
        let [subject, attribute, style, composition, emotion] = layers;
        Ok(Self {
            layers: [
                Arc::from(subject.into_boxed_slice()),
                Arc::from(attribute.into_boxed_slice()),
                Arc::from(style.into_boxed_slice()),
                Arc::from(composition.into_boxed_slice()),
                Arc::from(emotion.into_boxed_slice()),
            ],
            relation,
            created_at: Utc::now(),
        })
    }

    /// The all-zero fingerprint (empty text vectorizes to this).
    pub fn zero() -> Self {
        let layers = LayerKind::ALL.map(|kind| vec![0.0; kind.dim()]);
        Self::try_new(layers, RelationMatrix::zero())
            .unwrap_or_else(|_| unreachable!("zero layers always have canonical dims"))
    }

    /// Read one layer's components.
    pub fn layer(&self, kind: LayerKind) -> &[f32] {
        &self.layers[kind.index()]
    }

    /// Iterate layers in canonical order.
    pub fn layers(&self) -> impl Iterator<Item = (LayerKind, &[f32])> {
        LayerKind::ALL
            .iter()
            .map(move |&kind| (kind, self.layer(kind)))
    }

    /// The cross-layer relation matrix.
    pub fn relation(&self) -> &RelationMatrix {
        &self.relation
    }

    /// When this fingerprint was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether every layer is all-zero.
    pub fn is_zero(&self) -> bool {
        self.layers
            .iter()
            .all(|layer| layer.iter().all(|&x| x == 0.0))
    }

    /// Whether every layer has unit norm or is zero, within tolerance.
    pub fn layers_normalized(&self, tolerance: f32) -> bool {
        self.layers.iter().all(|layer| {
            let norm = l2_norm(layer);
            norm == 0.0 || (norm - 1.0).abs() <= tolerance
        })
    }

    /// The weighted cosine: `Σ w_layer · cos(self_layer, other_layer)`.
    ///
    /// This is the score used everywhere candidates are compared: part
    /// search, shard pre-selection, and item retrieval.
    pub fn weighted_cosine(&self, other: &MultiLayerVector, weights: &LayerWeights) -> f32 {
        LayerKind::ALL
            .iter()
            .map(|&kind| weights.get(kind) * cosine(self.layer(kind), other.layer(kind)))
            .sum()
    }

    /// Produce a new fingerprint by mapping every layer, keeping the
    /// relation matrix.
    ///
    /// Used by the vector-space adjuster and variation noise; the mapped
    /// arrays must preserve each layer's dimension.
    pub fn map_layers(
        &self,
        mut f: impl FnMut(LayerKind, &[f32]) -> Vec<f32>,
    ) -> CacheResult<Self> {
        let layers = LayerKind::ALL.map(|kind| f(kind, self.layer(kind)));
        Self::try_new(layers, self.relation)
    }

    /// Serialize to a standalone JSON document.
    pub fn to_json(&self) -> CacheResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a fingerprint from its JSON document, validating dimensions.
    pub fn from_json(json: &str) -> CacheResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl PartialEq for MultiLayerVector {
    fn eq(&self, other: &Self) -> bool {
        self.layers == other.layers && self.relation == other.relation
    }
}

impl Serialize for MultiLayerVector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = MultiLayerVectorWire {
            subject: self.layer(LayerKind::Subject).to_vec(),
            attribute: self.layer(LayerKind::Attribute).to_vec(),
            style: self.layer(LayerKind::Style).to_vec(),
            composition: self.layer(LayerKind::Composition).to_vec(),
            emotion: self.layer(LayerKind::Emotion).to_vec(),
            relation_matrix: self.relation,
            created_at: self.created_at,
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MultiLayerVector {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = MultiLayerVectorWire::deserialize(deserializer)?;
        let mut vector = MultiLayerVector::try_new(
            [
                wire.subject,
                wire.attribute,
                wire.style,
                wire.composition,
                wire.emotion,
            ],
            wire.relation_matrix,
        )
        .map_err(serde::de::Error::custom)?;
        vector.created_at = wire.created_at;
        Ok(vector)
    }
}

impl std::fmt::Display for MultiLayerVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active: Vec<&str> = self
            .layers()
            .filter(|(_, layer)| layer.iter().any(|&x| x != 0.0))
            .map(|(kind, _)| kind.name())
            .collect();
        write!(f, "MultiLayerVector(active=[{}])", active.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_on(kind: LayerKind, component: usize) -> MultiLayerVector {
        let layers = LayerKind::ALL.map(|k| {
            let mut v = vec![0.0; k.dim()];
            if k == kind {
                v[component] = 1.0;
            }
            v
        });
        MultiLayerVector::try_new(layers, RelationMatrix::zero()).unwrap()
    }

    #[test]
    fn test_try_new_rejects_wrong_dims() {
        let mut layers = LayerKind::ALL.map(|k| vec![0.0; k.dim()]);
        layers[2] = vec![0.0; 10];
        let err = MultiLayerVector::try_new(layers, RelationMatrix::zero()).unwrap_err();
        match err {
            crate::error::CacheError::DimensionMismatch {
                layer,
                expected,
                actual,
            } => {
                assert_eq!(layer, LayerKind::Style);
                assert_eq!(expected, 64);
                assert_eq!(actual, 10);
            }
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_vector_is_zero() {
        let v = MultiLayerVector::zero();
        assert!(v.is_zero());
        assert!(v.layers_normalized(1e-6));
    }

    #[test]
    fn test_weighted_cosine_identical() {
        let v = unit_on(LayerKind::Subject, 0);
        let score = v.weighted_cosine(&v, &LayerWeights::default());
        // Only the subject layer is non-zero, so only its weight contributes.
        assert!((score - 0.30).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_cosine_orthogonal_subjects() {
        let a = unit_on(LayerKind::Subject, 0);
        let b = unit_on(LayerKind::Subject, 1);
        assert!(a.weighted_cosine(&b, &LayerWeights::default()).abs() < 1e-6);
    }

    #[test]
    fn test_relation_symmetrize() {
        let mut m = RelationMatrix::zero();
        m.set(LayerKind::Subject, LayerKind::Style, 0.8);
        m.set(LayerKind::Style, LayerKind::Subject, 0.2);
        assert!(!m.is_symmetric(1e-6));
        m.symmetrize();
        assert!(m.is_symmetric(1e-6));
        assert!((m.get(LayerKind::Subject, LayerKind::Style) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_relation_set_clamps() {
        let mut m = RelationMatrix::zero();
        m.set(LayerKind::Subject, LayerKind::Emotion, 3.0);
        assert_eq!(m.get(LayerKind::Subject, LayerKind::Emotion), 1.0);
        m.set(LayerKind::Subject, LayerKind::Emotion, -3.0);
        assert_eq!(m.get(LayerKind::Subject, LayerKind::Emotion), -1.0);
    }

    #[test]
    fn test_relation_mean_abs_diff_self_is_zero() {
        let mut m = RelationMatrix::zero();
        m.set(LayerKind::Subject, LayerKind::Style, 0.4);
        assert_eq!(m.mean_abs_diff(&m), 0.0);
    }

    #[test]
    fn test_json_roundtrip_within_tolerance() {
        let v = unit_on(LayerKind::Attribute, 3);
        let json = v.to_json().unwrap();
        let back = MultiLayerVector::from_json(&json).unwrap();
        for (kind, layer) in v.layers() {
            for (a, b) in layer.iter().zip(back.layer(kind).iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
        assert_eq!(v, back);
    }

    #[test]
    fn test_json_rejects_truncated_layer() {
        let v = unit_on(LayerKind::Subject, 0);
        let mut doc: serde_json::Value = serde_json::from_str(&v.to_json().unwrap()).unwrap();
        doc["style"] = serde_json::json!([0.0, 1.0]);
        let err = MultiLayerVector::from_json(&doc.to_string());
        assert!(err.is_err());
    }

    #[test]
    fn test_map_layers_keeps_relation() {
        let mut m = RelationMatrix::zero();
        m.set(LayerKind::Subject, LayerKind::Style, 0.5);
        let layers = LayerKind::ALL.map(|k| vec![0.0; k.dim()]);
        let v = MultiLayerVector::try_new(layers, m).unwrap();
        let mapped = v.map_layers(|_, layer| layer.to_vec()).unwrap();
        assert_eq!(mapped.relation().get(LayerKind::Subject, LayerKind::Style), 0.5);
    }
}
