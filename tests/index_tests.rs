//! Integration tests for the part index and the sharded store.

use std::sync::Arc;

use pentimento::index::{PartSearchOptions, ShardSearchOptions};
use pentimento::vector::{l2_normalize, LayerKind, LayerWeights, MultiLayerVector, RelationMatrix};
use pentimento::{
    CacheItem, ImagePart, PartIndex, PartMetadata, PartType, ShardConfig, ShardManager,
};

/// A unit fingerprint whose subject layer is fully specified and whose
/// other layers are zero.
fn subject_fingerprint(first: f32, second: f32) -> MultiLayerVector {
    let layers = LayerKind::ALL.map(|kind| {
        let mut layer = vec![0.0; kind.dim()];
        if kind == LayerKind::Subject {
            layer[0] = first;
            layer[1] = second;
            layer = l2_normalize(layer);
        }
        layer
    });
    MultiLayerVector::try_new(layers, RelationMatrix::zero()).unwrap()
}

fn item_with(vector: MultiLayerVector) -> CacheItem {
    CacheItem::new(vector, Arc::from(vec![0u8; 4]))
}

/// Constant subject vectors route to a single shard; once the occupancy
/// spread exceeds the threshold, rebalancing restores it, including after
/// perturbed vectors land elsewhere.
#[test]
fn test_skewed_inserts_stay_within_rebalance_threshold() {
    let mut manager = ShardManager::new(ShardConfig {
        num_shards: 4,
        rebalance_threshold: 2,
        ..Default::default()
    });

    for _ in 0..10 {
        manager.insert(item_with(subject_fingerprint(1.0, 0.0))).unwrap();
    }
    for i in 0..3 {
        let wobble = 0.6 + 0.1 * i as f32;
        manager
            .insert(item_with(subject_fingerprint(wobble, 1.0 - wobble)))
            .unwrap();
    }

    let counts = manager.counts();
    let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
    assert!(spread <= 2, "spread {spread}, counts {counts:?}");
    assert_eq!(counts.iter().sum::<usize>(), 13);
    assert_eq!(manager.len(), 13);
}

/// The per-shard counts always sum to the store size through inserts,
/// removals, and rebalances.
#[test]
fn test_count_conservation() {
    let mut manager = ShardManager::new(ShardConfig {
        num_shards: 4,
        rebalance_threshold: 3,
        ..Default::default()
    });

    let mut ids = Vec::new();
    for i in 0..20 {
        let item = item_with(subject_fingerprint(1.0, i as f32 * 0.05));
        ids.push(item.id.clone());
        manager.insert(item).unwrap();
        assert_eq!(manager.counts().iter().sum::<usize>(), manager.len());
    }
    for id in ids.iter().take(7) {
        assert!(manager.remove(id).is_some());
        assert_eq!(manager.counts().iter().sum::<usize>(), manager.len());
    }
    assert_eq!(manager.len(), 13);
}

/// Retrieval through the centroid pre-filter still finds items that the
/// leveling pass moved off their home shard.
#[test]
fn test_leveled_items_remain_discoverable() {
    let mut manager = ShardManager::new(ShardConfig {
        num_shards: 4,
        rebalance_threshold: 1,
        ..Default::default()
    });
    let fingerprint = subject_fingerprint(1.0, 0.0);
    let mut ids = Vec::new();
    for _ in 0..8 {
        let item = item_with(fingerprint.clone());
        ids.push(item.id.clone());
        manager.insert(item).unwrap();
    }

    let results = manager.search_similar(
        &fingerprint,
        &LayerWeights::default(),
        &ShardSearchOptions::new().max_results(10),
    );
    assert_eq!(results.len(), 8, "every identical item is retrievable");
    for id in &ids {
        assert!(manager.get(id).is_some());
    }
}

/// Restricting the scan to the best shard still returns the best item when
/// query and items share a shard-defining subject.
#[test]
fn test_max_shards_prefilter() {
    let mut manager = ShardManager::new(ShardConfig::default());
    let close = item_with(subject_fingerprint(1.0, 0.0));
    let close_id = close.id.clone();
    manager.insert(close).unwrap();
    manager.insert(item_with(subject_fingerprint(0.0, 1.0))).unwrap();

    let results = manager.search_similar(
        &subject_fingerprint(1.0, 0.0),
        &LayerWeights::default(),
        &ShardSearchOptions::new().max_shards(1).threshold(0.2),
    );
    assert!(!results.is_empty());
    assert_eq!(results[0].item.id, close_id);
}

fn part_with(vector: MultiLayerVector, part_type: PartType) -> ImagePart {
    ImagePart::new(part_type, vector, vec![0u8; 4], PartMetadata::new(0.9, "test"))
}

/// Index, clear, and re-index the same parts: search results are identical
/// to a once-built index for any query.
#[test]
fn test_index_rebuild_idempotent() {
    let parts = vec![
        part_with(subject_fingerprint(1.0, 0.0), PartType::Foreground),
        part_with(subject_fingerprint(0.9, 0.1), PartType::Background),
        part_with(subject_fingerprint(0.0, 1.0), PartType::Global),
    ];

    let mut once = PartIndex::new();
    once.index_parts(parts.clone());

    let mut rebuilt = PartIndex::new();
    rebuilt.index_parts(parts.clone());
    rebuilt.clear();
    rebuilt.index_parts(parts);

    for query in [
        subject_fingerprint(1.0, 0.0),
        subject_fingerprint(0.5, 0.5),
    ] {
        let options = PartSearchOptions::new().top_k(10).min_similarity(0.0);
        let weights = LayerWeights::default();
        let a: Vec<_> = once
            .search(&query, &weights, &options)
            .into_iter()
            .map(|m| (m.part.id, m.similarity.to_bits()))
            .collect();
        let b: Vec<_> = rebuilt
            .search(&query, &weights, &options)
            .into_iter()
            .map(|m| (m.part.id, m.similarity.to_bits()))
            .collect();
        assert_eq!(a, b);
    }
}
