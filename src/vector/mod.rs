//! Multi-layer vectorization: deterministic encoders, the fingerprint value
//! object, relation matrix construction, and similarity scoring.

mod encoder;
mod engine;
mod layer;
mod multi;
mod relation;

pub use encoder::{
    clear_embedding_cache, embedding_cache_len, in_vocabulary, vocabulary, word_embedding,
};
pub use engine::{tokenize, Similarity, Vectorizer, VectorizerConfig};
pub use layer::{
    cosine, euclidean_distance, l2_norm, l2_normalize, prefix_cosine, LayerKind, LayerWeights,
};
pub use multi::{MultiLayerVector, RelationMatrix};
pub use relation::{compute_relation, RelationConfig};
