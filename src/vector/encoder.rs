//! Deterministic word embeddings.
//!
//! Embedding construction is content-addressable: the vector for a
//! `(word, layer)` pair is a pure function of the word's bytes, so the same
//! pair always produces the same components in every process. No system RNG
//! is involved anywhere in this module.
//!
//! The construction, pinned for cross-process reproducibility:
//! 1. Fold the word bytes into a 32-bit seed with
//!    `h = ((h << 5) - h) + byte` in wrapping 32-bit arithmetic; the seed is
//!    the absolute value of the wrap.
//! 2. Draw uniforms by advancing a counter from the seed:
//!    `u_k = fract(sin(seed + k) * 10000.0)`.
//! 3. Fill each component from two draws through a Box–Muller transform,
//!    scale by 0.1, then L2-normalize the whole vector.
//!
//! Each layer owns a fixed seed vocabulary; `vectorize` only counts tokens
//! that belong to a layer's vocabulary, while [`word_embedding`] works for
//! any word (generated on first reference and memoized in the process-wide
//! cache).

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Arc;

use super::layer::{l2_normalize, LayerKind};

/// Process-wide `(layer, word) → unit vector` cache.
///
/// Lazily initialized and append-only: once a word is written its entry is
/// never mutated, so reads are safe without further coordination.
static EMBEDDING_CACHE: Lazy<DashMap<(LayerKind, String), Arc<[f32]>>> = Lazy::new(DashMap::new);

/// Drop every memoized embedding. Intended for tests.
pub fn clear_embedding_cache() {
    EMBEDDING_CACHE.clear();
}

/// Number of memoized `(layer, word)` embeddings.
pub fn embedding_cache_len() -> usize {
    EMBEDDING_CACHE.len()
}

/// Fold a word into its 32-bit seed.
///
/// The fold runs in wrapping signed 32-bit arithmetic and the seed is the
/// absolute value of the result, matching the pinned construction exactly.
pub(crate) fn fold_seed(word: &str) -> u32 {
    let mut h: i32 = 0;
    for &byte in word.as_bytes() {
        h = h
            .wrapping_shl(5)
            .wrapping_sub(h)
            .wrapping_add(i32::from(byte));
    }
    i64::from(h).unsigned_abs() as u32
}

/// Seeded uniform draw sequence: `u_k = fract(sin(seed + k) * 10000.0)`.
struct DrawSequence {
    state: f64,
}

impl DrawSequence {
    fn new(seed: u32) -> Self {
        Self {
            state: f64::from(seed),
        }
    }

    fn next(&mut self) -> f64 {
        let raw = self.state.sin() * 10000.0;
        self.state += 1.0;
        raw - raw.floor()
    }
}

/// Build the deterministic unit vector for a seed and dimension.
fn seeded_unit_vector(seed: u32, dim: usize) -> Vec<f32> {
    let mut draws = DrawSequence::new(seed);
    let mut components = Vec::with_capacity(dim);
    for _ in 0..dim {
        // u1 floored away from zero so ln stays finite.
        let u1 = draws.next().max(1e-12);
        let u2 = draws.next();
        let gaussian = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        components.push((gaussian * 0.1) as f32);
    }
    l2_normalize(components)
}

/// The memoized embedding for a `(word, layer)` pair.
///
/// Works for any word, vocabulary member or not; unknown words are generated
/// on first reference.
pub fn word_embedding(layer: LayerKind, word: &str) -> Arc<[f32]> {
    let key = (layer, word.to_string());
    if let Some(cached) = EMBEDDING_CACHE.get(&key) {
        return Arc::clone(cached.value());
    }
    let vector: Arc<[f32]> = Arc::from(
        seeded_unit_vector(fold_seed(word), layer.dim()).into_boxed_slice(),
    );
    EMBEDDING_CACHE
        .entry(key)
        .or_insert_with(|| Arc::clone(&vector));
    vector
}

/// Whether a (lower-cased) token belongs to a layer's seed vocabulary.
pub fn in_vocabulary(layer: LayerKind, token: &str) -> bool {
    vocabulary_set(layer).contains(token)
}

fn vocabulary_set(layer: LayerKind) -> &'static HashSet<&'static str> {
    static SUBJECT: Lazy<HashSet<&'static str>> =
        Lazy::new(|| SUBJECT_VOCABULARY.iter().copied().collect());
    static ATTRIBUTE: Lazy<HashSet<&'static str>> =
        Lazy::new(|| ATTRIBUTE_VOCABULARY.iter().copied().collect());
    static STYLE: Lazy<HashSet<&'static str>> =
        Lazy::new(|| STYLE_VOCABULARY.iter().copied().collect());
    static COMPOSITION: Lazy<HashSet<&'static str>> =
        Lazy::new(|| COMPOSITION_VOCABULARY.iter().copied().collect());
    static EMOTION: Lazy<HashSet<&'static str>> =
        Lazy::new(|| EMOTION_VOCABULARY.iter().copied().collect());
    match layer {
        LayerKind::Subject => &SUBJECT,
        LayerKind::Attribute => &ATTRIBUTE,
        LayerKind::Style => &STYLE,
        LayerKind::Composition => &COMPOSITION,
        LayerKind::Emotion => &EMOTION,
    }
}

/// The seed vocabulary for a layer.
pub fn vocabulary(layer: LayerKind) -> &'static [&'static str] {
    match layer {
        LayerKind::Subject => SUBJECT_VOCABULARY,
        LayerKind::Attribute => ATTRIBUTE_VOCABULARY,
        LayerKind::Style => STYLE_VOCABULARY,
        LayerKind::Composition => COMPOSITION_VOCABULARY,
        LayerKind::Emotion => EMOTION_VOCABULARY,
    }
}

const SUBJECT_VOCABULARY: &[&str] = &[
    "person", "man", "woman", "child", "girl", "boy", "cat", "dog", "bird", "horse", "fish",
    "dragon", "robot", "tree", "forest", "flower", "mountain", "river", "lake", "ocean", "beach",
    "city", "street", "building", "house", "castle", "bridge", "car", "train", "ship", "airplane",
    "moon", "sun", "star", "sky", "cloud", "garden", "field", "desert", "island", "wolf", "fox",
    "bear", "lion", "tiger", "rabbit", "deer", "butterfly", "knight", "wizard", "warrior", "angel",
    "mermaid", "samurai", "astronaut", "pirate",
];

const ATTRIBUTE_VOCABULARY: &[&str] = &[
    "red", "blue", "green", "yellow", "orange", "purple", "pink", "black", "white", "gray",
    "golden", "silver", "brown", "crimson", "azure", "emerald", "turquoise", "violet", "large",
    "small", "tiny", "huge", "giant", "old", "young", "ancient", "modern", "wooden", "metallic",
    "glass", "stone", "marble", "furry", "feathered", "scaly", "glowing", "transparent", "shiny",
    "rusty", "broken", "wet", "dry", "tall", "short", "bright", "pale", "vivid", "iridescent",
];

const STYLE_VOCABULARY: &[&str] = &[
    "realistic", "photorealistic", "abstract", "anime", "manga", "cartoon", "sketch",
    "watercolor", "oil", "acrylic", "pastel", "charcoal", "pixel", "voxel", "lowpoly",
    "cyberpunk", "steampunk", "baroque", "impressionist", "surrealist", "minimalist", "vintage",
    "retro", "noir", "cinematic", "painterly", "ukiyo-e", "gothic", "psychedelic", "graffiti",
    "mosaic", "origami", "claymation", "render", "illustration", "concept", "digital",
    "traditional", "isometric", "photographic",
];

const COMPOSITION_VOCABULARY: &[&str] = &[
    "centered", "symmetrical", "asymmetrical", "portrait", "landscape", "closeup", "macro",
    "wide", "panoramic", "aerial", "overhead", "profile", "silhouette", "foreground",
    "background", "left", "right", "top", "bottom", "diagonal", "thirds", "framed", "cropped",
    "fullbody", "headshot", "low-angle", "high-angle", "tilted", "layered", "minimal", "sparse",
    "dense", "vertical", "horizontal", "offset", "balanced",
];

const EMOTION_VOCABULARY: &[&str] = &[
    "happy", "joyful", "cheerful", "sad", "melancholic", "somber", "gloomy", "dark", "moody",
    "dramatic", "tense", "peaceful", "calm", "serene", "tranquil", "dreamy", "nostalgic",
    "romantic", "mysterious", "eerie", "ominous", "whimsical", "playful", "energetic", "epic",
    "majestic", "hopeful", "lonely", "cozy", "warm", "cold", "ethereal",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::layer::l2_norm;

    #[test]
    fn test_fold_seed_stable() {
        // The fold is a pure function of the bytes.
        assert_eq!(fold_seed("cat"), fold_seed("cat"));
        assert_ne!(fold_seed("cat"), fold_seed("dog"));
        assert_eq!(fold_seed(""), 0);
    }

    #[test]
    fn test_fold_seed_known_value() {
        // h("a") = 0*31 + 97 under the shift-sub fold.
        assert_eq!(fold_seed("a"), 97);
    }

    #[test]
    fn test_embedding_deterministic_within_process() {
        clear_embedding_cache();
        let first = word_embedding(LayerKind::Subject, "cat");
        let second = word_embedding(LayerKind::Subject, "cat");
        assert_eq!(first.as_ref(), second.as_ref());
    }

    #[test]
    fn test_embedding_deterministic_after_cache_clear() {
        // Regenerating from scratch must reproduce the exact components:
        // the construction is content-addressable, not cache-addressable.
        let first = word_embedding(LayerKind::Subject, "lighthouse").to_vec();
        clear_embedding_cache();
        let second = word_embedding(LayerKind::Subject, "lighthouse");
        assert_eq!(first.as_slice(), second.as_ref());
    }

    #[test]
    fn test_embedding_unit_norm_and_dim() {
        for layer in LayerKind::ALL {
            let v = word_embedding(layer, "cat");
            assert_eq!(v.len(), layer.dim());
            assert!((l2_norm(&v) - 1.0).abs() < 1e-6, "layer {layer} not unit");
        }
    }

    #[test]
    fn test_distinct_words_distinct_vectors() {
        let a = word_embedding(LayerKind::Subject, "cat");
        let b = word_embedding(LayerKind::Subject, "dog");
        assert_ne!(a.as_ref(), b.as_ref());
    }

    #[test]
    fn test_vocabulary_membership() {
        assert!(in_vocabulary(LayerKind::Subject, "cat"));
        assert!(in_vocabulary(LayerKind::Attribute, "red"));
        assert!(in_vocabulary(LayerKind::Style, "watercolor"));
        assert!(in_vocabulary(LayerKind::Composition, "centered"));
        assert!(in_vocabulary(LayerKind::Emotion, "serene"));
        assert!(!in_vocabulary(LayerKind::Subject, "red"));
        assert!(!in_vocabulary(LayerKind::Emotion, "cat"));
    }

    #[test]
    fn test_unknown_word_memoized() {
        clear_embedding_cache();
        let _ = word_embedding(LayerKind::Style, "xylograph");
        let before = embedding_cache_len();
        let _ = word_embedding(LayerKind::Style, "xylograph");
        assert_eq!(embedding_cache_len(), before);
    }

    #[test]
    fn test_draw_sequence_in_unit_interval() {
        let mut draws = DrawSequence::new(fold_seed("cat"));
        for _ in 0..256 {
            let u = draws.next();
            assert!((0.0..1.0).contains(&u));
        }
    }
}
