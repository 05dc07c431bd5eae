//! Self-describing export/import of the part index and strategy configs.
//!
//! The document is versioned JSON: layer arrays serialize as arrays of
//! 32-bit reals and the relation matrix as nested arrays, so a round trip
//! reproduces every fingerprint within float tolerance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CacheError, CacheResult};
use crate::index::{PartIndex, PartIndexStats};
use crate::strategy::{ComposerConfig, DiffConfig, SelectorConfig};
use crate::types::ImagePart;
use crate::vector::VectorizerConfig;

/// The supported document version.
pub const EXPORT_VERSION: &str = "1.0.0";

/// Nested component configuration carried by the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportedConfig {
    pub vectorizer: VectorizerConfig,
    pub composer: ComposerConfig,
    pub diff: DiffConfig,
    pub selector: SelectorConfig,
}

impl ExportedConfig {
    pub fn new(
        vectorizer: VectorizerConfig,
        composer: ComposerConfig,
        diff: DiffConfig,
        selector: SelectorConfig,
    ) -> Self {
        Self {
            vectorizer,
            composer,
            diff,
            selector,
        }
    }
}

/// The versioned export document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    /// Document format version
    pub version: String,
    /// When the export was produced
    pub timestamp: DateTime<Utc>,
    /// Index occupancy at export time
    pub stats: PartIndexStats,
    /// Every part across all type buckets
    pub parts: Vec<ImagePart>,
    /// Nested component configs
    pub config: ExportedConfig,
}

/// Serialize the part index and configs into a JSON document.
pub fn export_to_json(index: &PartIndex, config: &ExportedConfig) -> CacheResult<String> {
    let document = ExportDocument {
        version: EXPORT_VERSION.to_string(),
        timestamp: Utc::now(),
        stats: index.stats(),
        parts: index.parts().cloned().collect(),
        config: config.clone(),
    };
    let json = serde_json::to_string(&document)?;
    info!(parts = document.parts.len(), "exported part index");
    Ok(json)
}

/// Parse a JSON document, rejecting unknown versions.
pub fn import_from_json(json: &str) -> CacheResult<ExportDocument> {
    let document: ExportDocument = serde_json::from_str(json)?;
    if document.version != EXPORT_VERSION {
        return Err(CacheError::UnsupportedVersion {
            version: document.version,
        });
    }
    info!(parts = document.parts.len(), "parsed export document");
    Ok(document)
}

/// Apply an import: clear the index and re-ingest the document's parts.
///
/// Returns the configuration to reapply to the strategy components.
pub fn apply_import(index: &mut PartIndex, document: ExportDocument) -> ExportedConfig {
    index.clear();
    index.index_parts(document.parts);
    document.config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PartMetadata, PartType};
    use crate::vector::Vectorizer;

    fn populated_index() -> PartIndex {
        let vectorizer = Vectorizer::new();
        let mut index = PartIndex::new();
        index.index_parts(vec![
            ImagePart::new(
                PartType::Foreground,
                vectorizer.vectorize("a red cat"),
                vec![1, 2, 3],
                PartMetadata::new(0.9, "segmenter"),
            ),
            ImagePart::new(
                PartType::Background,
                vectorizer.vectorize("serene watercolor forest"),
                vec![4, 5, 6],
                PartMetadata::new(0.7, "segmenter"),
            ),
        ]);
        index
    }

    #[test]
    fn test_export_document_shape() {
        let index = populated_index();
        let json = export_to_json(&index, &ExportedConfig::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], EXPORT_VERSION);
        assert!(value["timestamp"].is_string());
        assert_eq!(value["stats"]["total"], 2);
        assert_eq!(value["parts"].as_array().unwrap().len(), 2);
        assert!(value["config"]["composer"].is_object());
        // Layer arrays are plain number arrays on the wire.
        assert!(value["parts"][0]["vector"]["subject"].is_array());
        assert!(value["parts"][0]["vector"]["relation_matrix"].is_array());
    }

    #[test]
    fn test_roundtrip_preserves_parts() {
        let index = populated_index();
        let original: Vec<ImagePart> = index.parts().cloned().collect();
        let json = export_to_json(&index, &ExportedConfig::default()).unwrap();

        let mut restored = PartIndex::new();
        let document = import_from_json(&json).unwrap();
        apply_import(&mut restored, document);

        assert_eq!(restored.len(), original.len());
        for part in &original {
            let back = restored.get(&part.id).expect("part survives the round trip");
            assert_eq!(back.part_type, part.part_type);
            assert_eq!(back.blob, part.blob);
            for (kind, layer) in part.vector.layers() {
                for (a, b) in layer.iter().zip(back.vector.layer(kind).iter()) {
                    assert!((a - b).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_import_clears_existing_index() {
        let source = populated_index();
        let json = export_to_json(&source, &ExportedConfig::default()).unwrap();

        let mut target = populated_index();
        let stale = ImagePart::new(
            PartType::Detail,
            Vectorizer::new().vectorize("gloomy charcoal city"),
            vec![9],
            PartMetadata::new(0.5, "segmenter"),
        );
        let stale_id = stale.id.clone();
        target.index_parts(vec![stale]);

        let document = import_from_json(&json).unwrap();
        apply_import(&mut target, document);
        assert_eq!(target.len(), 2);
        assert!(target.get(&stale_id).is_none());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let index = populated_index();
        let json = export_to_json(&index, &ExportedConfig::default()).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["version"] = serde_json::json!("9.9.9");
        let err = import_from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_config_survives_roundtrip() {
        let index = PartIndex::new();
        let mut config = ExportedConfig::default();
        config.composer.base_strength = 0.7;
        config.selector.top_k = 9;
        let json = export_to_json(&index, &config).unwrap();
        let document = import_from_json(&json).unwrap();
        assert!((document.config.composer.base_strength - 0.7).abs() < 1e-6);
        assert_eq!(document.config.selector.top_k, 9);
    }
}
