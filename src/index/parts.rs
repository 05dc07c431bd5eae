//! In-memory index of reusable image parts.
//!
//! The index keeps three parallel views over the same ownership: an id map
//! for O(1) lookup, per-type buckets for role-filtered queries, and a scan
//! order list for linear similarity search. All three are kept consistent
//! by every mutation; the single-writer contract (one task queue owns all
//! mutation) makes the multi-view update atomic from any observer's
//! perspective.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheResult;
use crate::types::{ImagePart, PartType};
use crate::vector::{LayerWeights, MultiLayerVector};

/// Options for part similarity search.
#[derive(Debug, Clone)]
pub struct PartSearchOptions {
    /// Number of results to return
    pub top_k: usize,
    /// Minimum weighted-cosine score
    pub min_similarity: f32,
    /// Restrict the scan to one region role
    pub part_type: Option<PartType>,
}

impl PartSearchOptions {
    /// Defaults: top 5 above 0.6, all roles.
    pub fn new() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.6,
            part_type: None,
        }
    }

    /// Set the number of results to return.
    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    /// Set the minimum similarity threshold.
    pub fn min_similarity(mut self, threshold: f32) -> Self {
        self.min_similarity = threshold;
        self
    }

    /// Restrict to a region role.
    pub fn part_type(mut self, part_type: PartType) -> Self {
        self.part_type = Some(part_type);
        self
    }
}

impl Default for PartSearchOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A part together with its score against the query.
#[derive(Debug, Clone)]
pub struct PartMatch {
    /// The matched part (cheap clone; blob and layers are shared)
    pub part: ImagePart,
    /// Weighted-cosine score against the query
    pub similarity: f32,
}

/// Snapshot of index occupancy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartIndexStats {
    /// Total parts indexed
    pub total: usize,
    /// Parts per region role
    pub by_type: HashMap<PartType, usize>,
}

/// The part index: id map, type buckets, and scan order.
#[derive(Debug, Default)]
pub struct PartIndex {
    by_id: HashMap<String, ImagePart>,
    by_type: HashMap<PartType, Vec<String>>,
    order: Vec<String>,
}

impl PartIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a batch of parts. Idempotent on id: re-indexing an id
    /// replaces the stored part without duplicating any view.
    pub fn index_parts(&mut self, parts: Vec<ImagePart>) -> usize {
        let mut added = 0;
        for part in parts {
            if let Some(existing) = self.by_id.get(&part.id) {
                // Replacement may change the role; move the bucket entry.
                if existing.part_type != part.part_type {
                    let old_type = existing.part_type;
                    self.remove_from_bucket(old_type, &part.id);
                    self.by_type
                        .entry(part.part_type)
                        .or_default()
                        .push(part.id.clone());
                }
                self.by_id.insert(part.id.clone(), part);
                continue;
            }
            self.by_type
                .entry(part.part_type)
                .or_default()
                .push(part.id.clone());
            self.order.push(part.id.clone());
            self.by_id.insert(part.id.clone(), part);
            added += 1;
        }
        debug!(added, total = self.by_id.len(), "indexed parts");
        added
    }

    /// Remove a part, purging all three views.
    pub fn remove_part(&mut self, id: &str) -> Option<ImagePart> {
        let part = self.by_id.remove(id)?;
        self.remove_from_bucket(part.part_type, id);
        self.order.retain(|candidate| candidate != id);
        Some(part)
    }

    /// Drop every part.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_type.clear();
        self.order.clear();
    }

    /// Look up a part by id.
    pub fn get(&self, id: &str) -> Option<&ImagePart> {
        self.by_id.get(id)
    }

    /// Number of indexed parts.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the index holds no parts.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Iterate parts in scan order.
    pub fn parts(&self) -> impl Iterator<Item = &ImagePart> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    /// Linear similarity search over the (type-filtered) candidate set.
    ///
    /// Scores every candidate with the shared weighted cosine and returns
    /// the top `top_k` at or above `min_similarity`, sorted descending.
    pub fn search(
        &self,
        query: &MultiLayerVector,
        weights: &LayerWeights,
        options: &PartSearchOptions,
    ) -> Vec<PartMatch> {
        let candidates: Vec<&String> = match options.part_type {
            Some(part_type) => self
                .by_type
                .get(&part_type)
                .map(|bucket| bucket.iter().collect())
                .unwrap_or_default(),
            None => self.order.iter().collect(),
        };

        let mut matches: Vec<PartMatch> = candidates
            .into_iter()
            .filter_map(|id| self.by_id.get(id))
            .filter_map(|part| {
                let similarity = query.weighted_cosine(&part.vector, weights);
                (similarity >= options.min_similarity).then(|| PartMatch {
                    part: part.clone(),
                    similarity,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(options.top_k);
        matches
    }

    /// Replace every part's fingerprint via the supplied transform.
    ///
    /// Used by vector-space adjustment epochs; fails atomically: if any
    /// transform errors, the index is left untouched.
    pub fn transform_vectors(
        &mut self,
        transform: impl Fn(&MultiLayerVector) -> CacheResult<MultiLayerVector>,
    ) -> CacheResult<()> {
        let mut replacements = Vec::with_capacity(self.by_id.len());
        for part in self.by_id.values() {
            replacements.push((part.id.clone(), transform(&part.vector)?));
        }
        for (id, vector) in replacements {
            if let Some(part) = self.by_id.get_mut(&id) {
                part.vector = vector;
            }
        }
        Ok(())
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> PartIndexStats {
        PartIndexStats {
            total: self.by_id.len(),
            by_type: self
                .by_type
                .iter()
                .map(|(part_type, bucket)| (*part_type, bucket.len()))
                .collect(),
        }
    }

    fn remove_from_bucket(&mut self, part_type: PartType, id: &str) {
        if let Some(bucket) = self.by_type.get_mut(&part_type) {
            bucket.retain(|candidate| candidate != id);
            if bucket.is_empty() {
                self.by_type.remove(&part_type);
            }
        }
    }
}
