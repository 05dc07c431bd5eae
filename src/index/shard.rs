//! Sharded store of finalized generations.
//!
//! Items are routed to shards by a deterministic fold of the primary layer,
//! and retrieval pre-selects shards by scoring their centroids before the
//! linear within-shard scan. Search inside a shard is deliberately linear:
//! shard pre-selection bounds the scan, and no ANN structure is kept.
//!
//! Centroids are per-layer arithmetic means and are NOT re-normalized, so
//! centroid magnitude carries shard density information into the shard
//! scoring step.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CacheError, CacheResult};
use crate::types::CacheItem;
use crate::vector::{LayerKind, LayerWeights, MultiLayerVector, RelationMatrix};

/// Shard store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Fixed number of shards created at startup
    pub num_shards: u32,
    /// Layer whose components drive routing
    pub primary_layer: LayerKind,
    /// Maximum tolerated spread between the fullest and emptiest shard
    pub rebalance_threshold: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            num_shards: 8,
            primary_layer: LayerKind::Subject,
            rebalance_threshold: 100,
        }
    }
}

/// Options for sharded similarity retrieval.
#[derive(Debug, Clone)]
pub struct ShardSearchOptions {
    /// How many of the best-scoring shards to scan (None = all)
    pub max_shards: Option<usize>,
    /// Minimum item score to retain
    pub threshold: f32,
    /// Global result cap
    pub max_results: usize,
}

impl ShardSearchOptions {
    /// Defaults: scan all shards, no threshold, top 10.
    pub fn new() -> Self {
        Self {
            max_shards: None,
            threshold: 0.0,
            max_results: 10,
        }
    }

    /// Limit the scan to the best-scoring shards.
    pub fn max_shards(mut self, n: usize) -> Self {
        self.max_shards = Some(n);
        self
    }

    /// Set the minimum item score.
    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the global result cap.
    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }
}

impl Default for ShardSearchOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// An item together with its retrieval score.
#[derive(Debug, Clone)]
pub struct ItemMatch {
    /// The matched item (cheap clone; artifact and layers are shared)
    pub item: CacheItem,
    /// Weighted-cosine score against the query
    pub score: f32,
}

/// Snapshot of shard occupancy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStats {
    pub num_shards: u32,
    pub total_items: usize,
    pub max_count: usize,
    pub min_count: usize,
    pub rebalances: u64,
}

/// One shard: an item map plus the density-carrying centroid.
#[derive(Debug)]
struct Shard {
    id: u32,
    items: HashMap<String, CacheItem>,
    centroid: Option<MultiLayerVector>,
}

impl Shard {
    fn new(id: u32) -> Self {
        Self {
            id,
            items: HashMap::new(),
            centroid: None,
        }
    }

    fn count(&self) -> usize {
        self.items.len()
    }

    /// Recompute the per-layer arithmetic mean of member vectors.
    ///
    /// Deliberately not re-normalized; relation matrices are averaged
    /// entrywise. Empty shards have no centroid.
    fn recompute_centroid(&mut self) {
        if self.items.is_empty() {
            self.centroid = None;
            return;
        }
        let count = self.items.len() as f64;
        let layers = LayerKind::ALL.map(|kind| {
            let mut acc = vec![0.0f64; kind.dim()];
            for item in self.items.values() {
                for (slot, &component) in acc.iter_mut().zip(item.vector.layer(kind).iter()) {
                    *slot += f64::from(component);
                }
            }
            acc.into_iter().map(|x| (x / count) as f32).collect()
        });
        let relation = RelationMatrix::mean_of(self.items.values().map(|item| item.vector.relation()));
        self.centroid = MultiLayerVector::try_new(layers, relation).ok();
    }
}

/// Hash-routed shard store with centroid-guided retrieval.
#[derive(Debug)]
pub struct ShardManager {
    config: ShardConfig,
    shards: Vec<Shard>,
    rebalances: u64,
}

impl ShardManager {
    /// Create the fixed shard set.
    pub fn new(config: ShardConfig) -> Self {
        let num_shards = config.num_shards.max(1);
        let shards = (0..num_shards).map(Shard::new).collect();
        Self {
            config: ShardConfig {
                num_shards,
                ..config
            },
            shards,
            rebalances: 0,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    /// Deterministic shard id for a fingerprint.
    ///
    /// Folds the primary layer as
    /// `h = (h · 31 + floor(component · 1000)) mod 2³²`, then takes the
    /// fold modulo the shard count.
    pub fn shard_id_for(&self, vector: &MultiLayerVector) -> u32 {
        let mut h: u32 = 0;
        for &component in vector.layer(self.config.primary_layer) {
            let quantized = (f64::from(component) * 1000.0).floor() as i64 as u32;
            h = h.wrapping_mul(31).wrapping_add(quantized);
        }
        h % self.config.num_shards
    }

    /// Insert an item, maintain the shard centroid, and rebalance when the
    /// occupancy spread exceeds the threshold. Returns the shard id the
    /// item initially routed to.
    pub fn insert(&mut self, item: CacheItem) -> CacheResult<u32> {
        let shard_id = self.shard_id_for(&item.vector);
        let shard = self.shard_mut(shard_id)?;
        shard.items.insert(item.id.clone(), item);
        shard.recompute_centroid();

        if self.spread() > self.config.rebalance_threshold {
            self.rebalance();
        }
        Ok(shard_id)
    }

    /// Remove an item from whichever shard holds it.
    pub fn remove(&mut self, id: &str) -> Option<CacheItem> {
        for shard in &mut self.shards {
            if let Some(item) = shard.items.remove(id) {
                shard.recompute_centroid();
                return Some(item);
            }
        }
        None
    }

    /// Look up an item by id.
    pub fn get(&self, id: &str) -> Option<&CacheItem> {
        self.shards.iter().find_map(|shard| shard.items.get(id))
    }

    /// Record a cache hit against an item.
    pub fn bump_hit(&mut self, id: &str) -> Option<u64> {
        for shard in &mut self.shards {
            if let Some(item) = shard.items.get_mut(id) {
                item.hit_count += 1;
                return Some(item.hit_count);
            }
        }
        None
    }

    /// Total items across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::count).sum()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.items.is_empty())
    }

    /// Per-shard occupancy, shard order.
    pub fn counts(&self) -> Vec<usize> {
        self.shards.iter().map(Shard::count).collect()
    }

    /// Iterate every stored item.
    pub fn items(&self) -> impl Iterator<Item = &CacheItem> {
        self.shards.iter().flat_map(|shard| shard.items.values())
    }

    /// Centroid-guided similarity retrieval.
    ///
    /// Non-empty shards are scored by the weighted cosine between the query
    /// and their centroids; the best `max_shards` are scanned linearly, and
    /// items scoring at or above the threshold compete for the global top
    /// `max_results`, sorted descending. An empty store returns no matches.
    pub fn search_similar(
        &self,
        query: &MultiLayerVector,
        weights: &LayerWeights,
        options: &ShardSearchOptions,
    ) -> Vec<ItemMatch> {
        let mut shard_scores: Vec<(usize, f32)> = self
            .shards
            .iter()
            .enumerate()
            .filter_map(|(index, shard)| {
                shard
                    .centroid
                    .as_ref()
                    .map(|centroid| (index, query.weighted_cosine(centroid, weights)))
            })
            .collect();
        shard_scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let scan = options.max_shards.unwrap_or(shard_scores.len());
        shard_scores.truncate(scan);

        let mut matches: Vec<ItemMatch> = shard_scores
            .iter()
            .flat_map(|&(index, _)| self.shards[index].items.values())
            .filter_map(|item| {
                let score = query.weighted_cosine(&item.vector, weights);
                (score >= options.threshold).then(|| ItemMatch {
                    item: item.clone(),
                    score,
                })
            })
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(options.max_results);
        matches
    }

    /// Drain every shard, re-route every item, then level residual overflow
    /// so the occupancy spread is within the threshold.
    ///
    /// Re-routing alone cannot reduce the spread when many vectors share a
    /// routing hash, so after the re-insert pass items move from the
    /// fullest shard to the emptiest until the invariant holds. Retrieval
    /// is centroid-guided, so moved items remain discoverable.
    pub fn rebalance(&mut self) {
        let drained: Vec<CacheItem> = self
            .shards
            .iter_mut()
            .flat_map(|shard| shard.items.drain().map(|(_, item)| item))
            .collect();

        for item in drained {
            let shard_id = self.shard_id_for(&item.vector) as usize;
            self.shards[shard_id].items.insert(item.id.clone(), item);
        }

        self.level_overflow();

        for shard in &mut self.shards {
            shard.recompute_centroid();
        }
        self.rebalances += 1;
        info!(
            counts = ?self.counts(),
            rebalances = self.rebalances,
            "shard store rebalanced"
        );
    }

    /// Replace the whole store with a new item set in one pass.
    ///
    /// Used by vector-space adjustment epochs: routing hashes change with
    /// the vectors, so the store is rebuilt rather than patched.
    pub fn rebuild(&mut self, items: Vec<CacheItem>) {
        for shard in &mut self.shards {
            shard.items.clear();
        }
        for item in items {
            let shard_id = self.shard_id_for(&item.vector) as usize;
            self.shards[shard_id].items.insert(item.id.clone(), item);
        }
        self.level_overflow();
        for shard in &mut self.shards {
            shard.recompute_centroid();
        }
        debug!(total = self.len(), "shard store rebuilt");
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> ShardStats {
        let counts = self.counts();
        ShardStats {
            num_shards: self.config.num_shards,
            total_items: counts.iter().sum(),
            max_count: counts.iter().copied().max().unwrap_or(0),
            min_count: counts.iter().copied().min().unwrap_or(0),
            rebalances: self.rebalances,
        }
    }

    fn spread(&self) -> usize {
        let counts = self.counts();
        let max = counts.iter().copied().max().unwrap_or(0);
        let min = counts.iter().copied().min().unwrap_or(0);
        max - min
    }

    fn level_overflow(&mut self) {
        while self.spread() > self.config.rebalance_threshold {
            let fullest = self
                .shards
                .iter()
                .enumerate()
                .max_by_key(|(_, shard)| shard.count())
                .map(|(index, _)| index);
            let emptiest = self
                .shards
                .iter()
                .enumerate()
                .min_by_key(|(_, shard)| shard.count())
                .map(|(index, _)| index);
            let (Some(from), Some(to)) = (fullest, emptiest) else {
                break;
            };
            if from == to {
                break;
            }
            let moved_id = match self.shards[from].items.keys().next() {
                Some(id) => id.clone(),
                None => break,
            };
            debug!(
                from = self.shards[from].id,
                to = self.shards[to].id,
                "leveling overflow item across shards"
            );
            if let Some(item) = self.shards[from].items.remove(&moved_id) {
                self.shards[to].items.insert(moved_id, item);
            }
        }
    }

    fn shard_mut(&mut self, shard_id: u32) -> CacheResult<&mut Shard> {
        let num_shards = self.config.num_shards;
        self.shards
            .get_mut(shard_id as usize)
            .ok_or(CacheError::MissingShard {
                shard_id,
                num_shards,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Vectorizer;
    use std::sync::Arc;

    fn item_for(text: &str) -> CacheItem {
        CacheItem::new(Vectorizer::new().vectorize(text), Arc::from(vec![0u8; 8]))
    }

    #[test]
    fn test_routing_deterministic() {
        let manager = ShardManager::new(ShardConfig::default());
        let v = Vectorizer::new().vectorize("a red cat");
        assert_eq!(manager.shard_id_for(&v), manager.shard_id_for(&v));
        assert!(manager.shard_id_for(&v) < 8);
    }

    #[test]
    fn test_insert_and_count_invariant() {
        let mut manager = ShardManager::new(ShardConfig::default());
        for text in ["a red cat", "a blue dog", "watercolor forest"] {
            manager.insert(item_for(text)).unwrap();
        }
        assert_eq!(manager.counts().iter().sum::<usize>(), manager.len());
        assert_eq!(manager.len(), 3);
    }

    #[test]
    fn test_identical_vectors_route_together() {
        let mut manager = ShardManager::new(ShardConfig {
            rebalance_threshold: 100,
            ..Default::default()
        });
        for _ in 0..5 {
            manager.insert(item_for("a red cat")).unwrap();
        }
        assert_eq!(manager.counts().iter().copied().max().unwrap(), 5);
    }

    #[test]
    fn test_rebalance_restores_spread() {
        let mut manager = ShardManager::new(ShardConfig {
            num_shards: 4,
            rebalance_threshold: 2,
            ..Default::default()
        });
        for _ in 0..10 {
            manager.insert(item_for("a red cat")).unwrap();
        }
        let counts = manager.counts();
        let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
        assert!(spread <= 2, "spread {spread} after rebalance, counts {counts:?}");
        assert_eq!(manager.len(), 10);
    }

    #[test]
    fn test_remove_updates_centroid_and_count() {
        let mut manager = ShardManager::new(ShardConfig::default());
        let item = item_for("a red cat");
        let id = item.id.clone();
        manager.insert(item).unwrap();
        assert!(manager.remove(&id).is_some());
        assert!(manager.is_empty());
        assert!(manager.remove(&id).is_none());
    }

    #[test]
    fn test_search_empty_store() {
        let manager = ShardManager::new(ShardConfig::default());
        let query = Vectorizer::new().vectorize("a red cat");
        let results =
            manager.search_similar(&query, &LayerWeights::default(), &ShardSearchOptions::new());
        assert!(results.is_empty());
    }

    #[test]
    fn test_search_ranks_and_thresholds() {
        let mut manager = ShardManager::new(ShardConfig::default());
        let close = item_for("a red cat");
        let close_id = close.id.clone();
        manager.insert(close).unwrap();
        manager.insert(item_for("gloomy charcoal city")).unwrap();

        let query = Vectorizer::new().vectorize("a red cat");
        let results = manager.search_similar(
            &query,
            &LayerWeights::default(),
            &ShardSearchOptions::new().threshold(0.3),
        );
        assert_eq!(results[0].item.id, close_id);
        assert!(results.iter().all(|m| m.score >= 0.3));
    }

    #[test]
    fn test_bump_hit() {
        let mut manager = ShardManager::new(ShardConfig::default());
        let item = item_for("a red cat");
        let id = item.id.clone();
        manager.insert(item).unwrap();
        assert_eq!(manager.bump_hit(&id), Some(1));
        assert_eq!(manager.bump_hit(&id), Some(2));
        assert_eq!(manager.get(&id).unwrap().hit_count, 2);
    }

    #[test]
    fn test_rebuild_preserves_items() {
        let mut manager = ShardManager::new(ShardConfig::default());
        manager.insert(item_for("a red cat")).unwrap();
        manager.insert(item_for("a blue dog")).unwrap();
        let items: Vec<CacheItem> = manager.items().cloned().collect();
        manager.rebuild(items);
        assert_eq!(manager.len(), 2);
        let query = Vectorizer::new().vectorize("a red cat");
        let results =
            manager.search_similar(&query, &LayerWeights::default(), &ShardSearchOptions::new());
        assert_eq!(results.len(), 2);
    }
}
